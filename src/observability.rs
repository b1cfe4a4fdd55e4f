use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub charge_attempts: u64,
    pub charged_free: u64,
    pub charged_balance: u64,
    pub replayed: u64,
    pub unauthorized: u64,
    pub rate_limited: u64,
    pub tier_limited: u64,
    pub declined: u64,
    pub internal_errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub degraded_authorizations: u64,
    pub usage_dropped: u64,
}

/// Process-wide counters shared by the cache and the coordinator.
#[derive(Debug, Default)]
pub struct Observability {
    charge_attempts: AtomicU64,
    charged_free: AtomicU64,
    charged_balance: AtomicU64,
    replayed: AtomicU64,
    unauthorized: AtomicU64,
    rate_limited: AtomicU64,
    tier_limited: AtomicU64,
    declined: AtomicU64,
    internal_errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    degraded_authorizations: AtomicU64,
    usage_dropped: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Observability {
    pub fn record_charge_attempt(&self) {
        bump(&self.charge_attempts);
    }

    pub fn record_charged(&self, used_free: bool) {
        if used_free {
            bump(&self.charged_free);
        } else {
            bump(&self.charged_balance);
        }
    }

    pub fn record_replayed(&self) {
        bump(&self.replayed);
    }

    pub fn record_unauthorized(&self) {
        bump(&self.unauthorized);
    }

    pub fn record_rate_limited(&self) {
        bump(&self.rate_limited);
    }

    pub fn record_tier_limited(&self) {
        bump(&self.tier_limited);
    }

    pub fn record_declined(&self) {
        bump(&self.declined);
    }

    pub fn record_internal_error(&self) {
        bump(&self.internal_errors);
    }

    pub fn record_cache_hit(&self) {
        bump(&self.cache_hits);
    }

    pub fn record_cache_miss(&self) {
        bump(&self.cache_misses);
    }

    pub fn record_degraded_authorization(&self) {
        bump(&self.degraded_authorizations);
    }

    pub fn record_usage_dropped(&self) {
        bump(&self.usage_dropped);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ObservabilitySnapshot {
            charge_attempts: load(&self.charge_attempts),
            charged_free: load(&self.charged_free),
            charged_balance: load(&self.charged_balance),
            replayed: load(&self.replayed),
            unauthorized: load(&self.unauthorized),
            rate_limited: load(&self.rate_limited),
            tier_limited: load(&self.tier_limited),
            declined: load(&self.declined),
            internal_errors: load(&self.internal_errors),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            degraded_authorizations: load(&self.degraded_authorizations),
            usage_dropped: load(&self.usage_dropped),
        }
    }
}
