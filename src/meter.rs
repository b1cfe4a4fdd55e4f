//! Charge coordinator: the single entry point that decides whether an
//! operation may run and records that it did.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cache::{KeyValidation, KeyValidationCache, UnauthorizedReason, key_fingerprint};
use crate::clock::{Clock, SystemClock};
use crate::config::{FailurePolicy, MeterConfig};
use crate::error::{MeterError, StoreError};
use crate::ledger::{Ledger, LedgerDecision};
use crate::limits::{InMemoryRateLimiter, RateLimitDecision, RateLimiter};
use crate::money::UsdMicros;
use crate::observability::{Observability, ObservabilitySnapshot};
use crate::store::{ChargeReceipt, CredentialStore, MeterStore};
use crate::types::{Account, ApiKeyRecord, Permissions, Tier};
use crate::usage::UsageAggregator;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub api_key: String,
    pub operation: String,
    /// Client-chosen token; a retry with the same token replays the first
    /// successful charge instead of charging again.
    #[serde(default)]
    pub idempotency_token: Option<String>,
}

impl ChargeRequest {
    pub fn new(api_key: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            operation: operation.into(),
            idempotency_token: None,
        }
    }

    pub fn with_idempotency_token(mut self, token: impl Into<String>) -> Self {
        self.idempotency_token = Some(token.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    InsufficientFunds,
}

/// Result of a charge attempt. Only [`ChargeOutcome::Charged`] lets the
/// caller run the operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChargeOutcome {
    Charged(ChargeReceipt),
    Unauthorized(UnauthorizedReason),
    RateLimited(RateLimitDecision),
    TierLimitExceeded {
        tier: Tier,
        limit: u64,
        used: u64,
    },
    Declined {
        reason: DeclineReason,
        balance: UsdMicros,
        free_remaining: u32,
    },
    InternalError,
}

impl ChargeOutcome {
    pub fn is_charged(&self) -> bool {
        matches!(self, ChargeOutcome::Charged(_))
    }
}

const DEADLINE_GRACE: Duration = Duration::from_secs(1);

fn operation_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-z][a-z0-9_-]{0,63}$").ok())
        .as_ref()
}

fn is_well_formed_operation(operation: &str) -> bool {
    operation_name_pattern().is_some_and(|pattern| pattern.is_match(operation))
}

pub struct MeterBuilder<S> {
    store: Arc<S>,
    config: MeterConfig,
    clock: Option<Arc<dyn Clock>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
}

impl<S: MeterStore> MeterBuilder<S> {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Looks keys up somewhere other than the ledger store.
    pub fn credential_store(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn build(self) -> Meter<S> {
        let config = Arc::new(self.config);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let observability = Arc::new(Observability::default());
        let credentials = self
            .credentials
            .unwrap_or_else(|| self.store.clone() as Arc<dyn CredentialStore>);
        let cache = KeyValidationCache::new(credentials, clock.clone(), config.cache.clone())
            .with_system_key(config.system_key.clone())
            .with_observability(observability.clone());
        let rate_limiter = self
            .rate_limiter
            .unwrap_or_else(|| Arc::new(InMemoryRateLimiter::new(config.tiers.clone())));
        let usage = UsageAggregator::new(self.store.clone(), clock.clone())
            .with_observability(observability.clone());
        let ledger = Ledger::new(self.store.clone(), clock.clone(), config.clone());

        Meter {
            store: self.store,
            config,
            clock,
            cache: Arc::new(cache),
            rate_limiter,
            usage,
            ledger,
            observability,
        }
    }
}

pub struct Meter<S> {
    store: Arc<S>,
    config: Arc<MeterConfig>,
    clock: Arc<dyn Clock>,
    cache: Arc<KeyValidationCache>,
    rate_limiter: Arc<dyn RateLimiter>,
    usage: UsageAggregator,
    ledger: Ledger<S>,
    observability: Arc<Observability>,
}

impl<S: MeterStore> Meter<S> {
    pub fn builder(store: Arc<S>, config: MeterConfig) -> MeterBuilder<S> {
        MeterBuilder {
            store,
            config,
            clock: None,
            credentials: None,
            rate_limiter: None,
        }
    }

    pub fn new(store: Arc<S>, config: MeterConfig) -> Self {
        Self::builder(store, config).build()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<KeyValidationCache> {
        &self.cache
    }

    pub fn usage(&self) -> &UsageAggregator {
        &self.usage
    }

    /// Well-formed and on the configured allow-list.
    pub fn is_meterable(&self, operation: &str) -> bool {
        is_well_formed_operation(operation) && self.config.is_known_operation(operation)
    }

    pub fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    pub async fn charge_operation(&self, api_key: &str, operation: &str) -> ChargeOutcome {
        self.charge(ChargeRequest::new(api_key, operation)).await
    }

    /// Validates, rate limits and charges, in that order. The ledger checks
    /// the tier ceiling in the same unit of work as the charge. Infrastructure failures are logged here and reported as
    /// [`ChargeOutcome::InternalError`].
    pub async fn charge(&self, request: ChargeRequest) -> ChargeOutcome {
        self.observability.record_charge_attempt();
        let outcome = match self.try_charge(&request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    key = %key_fingerprint(&request.api_key),
                    operation = %request.operation,
                    error = %err,
                    "charge failed"
                );
                ChargeOutcome::InternalError
            }
        };
        self.record_outcome(&outcome);
        outcome
    }

    async fn try_charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, MeterError> {
        let operation = request.operation.trim();
        if !self.is_meterable(operation) {
            return Ok(ChargeOutcome::Unauthorized(
                UnauthorizedReason::UnknownOperation {
                    operation: operation.to_string(),
                },
            ));
        }

        let authorized = match self.cache.validate(&request.api_key, operation).await? {
            KeyValidation::Authorized(authorized) => authorized,
            KeyValidation::Unauthorized(reason) => return Ok(ChargeOutcome::Unauthorized(reason)),
            KeyValidation::Expired => {
                return Ok(ChargeOutcome::Unauthorized(UnauthorizedReason::Expired));
            }
        };

        let now = self.clock.now_millis();
        match self
            .rate_limiter
            .allow(&request.api_key, authorized.tier, now)
            .await
        {
            Ok(decision) if !decision.allowed => return Ok(ChargeOutcome::RateLimited(decision)),
            Ok(_) => {}
            Err(err) => match self.config.rate_limit_failure_policy {
                FailurePolicy::FailClosed => return Err(err.into()),
                FailurePolicy::FailOpen => {
                    warn!(
                        account_id = %authorized.account_id,
                        error = %err,
                        "rate limiter unavailable, allowing request"
                    );
                }
            },
        }

        let timeout = self.config.charge_timeout();
        let terms = self
            .ledger
            .terms(
                &authorized.account_id,
                authorized.tier,
                operation,
                request.idempotency_token.clone(),
            )
            .with_deadline(Instant::now() + timeout);
        // The store enforces the deadline itself; this only bounds a store
        // that stops answering.
        let decision = tokio::time::timeout(timeout + DEADLINE_GRACE, self.ledger.charge(terms))
            .await
            .map_err(|_| MeterError::Timeout {
                millis: self.config.charge_timeout_ms,
            })?
            .map_err(|err| match err {
                StoreError::DeadlineExceeded => MeterError::Timeout {
                    millis: self.config.charge_timeout_ms,
                },
                err => MeterError::Store(err),
            })?;

        match decision {
            LedgerDecision::Charged(receipt) => {
                if !receipt.replayed {
                    self.usage
                        .record_best_effort(&receipt.account_id, &receipt.operation, receipt.charged_at_ms)
                        .await;
                }
                Ok(ChargeOutcome::Charged(receipt))
            }
            LedgerDecision::Declined {
                balance,
                free_remaining,
            } => Ok(ChargeOutcome::Declined {
                reason: DeclineReason::InsufficientFunds,
                balance,
                free_remaining,
            }),
            LedgerDecision::TierLimitExceeded { limit, used } => {
                Ok(ChargeOutcome::TierLimitExceeded {
                    tier: authorized.tier,
                    limit,
                    used,
                })
            }
        }
    }

    fn record_outcome(&self, outcome: &ChargeOutcome) {
        match outcome {
            ChargeOutcome::Charged(receipt) => {
                if receipt.replayed {
                    self.observability.record_replayed();
                } else {
                    self.observability.record_charged(receipt.used_free);
                }
                debug!(
                    account_id = %receipt.account_id,
                    operation = %receipt.operation,
                    used_free = receipt.used_free,
                    free_remaining = receipt.free_remaining,
                    balance = %receipt.balance,
                    replayed = receipt.replayed,
                    "charged"
                );
            }
            ChargeOutcome::Unauthorized(reason) => {
                self.observability.record_unauthorized();
                debug!(reason = reason.code(), "charge unauthorized");
            }
            ChargeOutcome::RateLimited(_) => self.observability.record_rate_limited(),
            ChargeOutcome::TierLimitExceeded { tier, limit, used } => {
                self.observability.record_tier_limited();
                info!(%tier, limit, used, "monthly tier ceiling reached");
            }
            ChargeOutcome::Declined { balance, .. } => {
                self.observability.record_declined();
                debug!(balance = %balance, "charge declined");
            }
            ChargeOutcome::InternalError => self.observability.record_internal_error(),
        }
    }

    pub async fn create_account(&self, account_id: &str, tier: Tier) -> Result<Account, MeterError> {
        let account = Account::new(account_id, tier, self.clock.now_millis());
        self.store.create_account(&account).await?;
        info!(account_id, %tier, "account created");
        Ok(account)
    }

    /// Issues a fresh `sk_` key for an existing account.
    pub async fn issue_api_key(
        &self,
        account_id: &str,
        name: Option<String>,
        permissions: Permissions,
        expires_at_ms: Option<u64>,
    ) -> Result<ApiKeyRecord, MeterError> {
        let record = ApiKeyRecord {
            key: generate_api_key()?,
            account_id: account_id.to_string(),
            name,
            permissions,
            expires_at_ms,
            revoked_at_ms: None,
            last_used_at_ms: None,
            created_at_ms: self.clock.now_millis(),
        };
        self.store.insert_api_key(&record).await?;
        info!(account_id, key = %key_fingerprint(&record.key), "api key issued");
        Ok(record)
    }

    /// Revokes `key` in the store and drops it from this instance's cache.
    pub async fn revoke_api_key(&self, key: &str) -> Result<bool, MeterError> {
        let revoked = self
            .store
            .revoke_api_key(key, self.clock.now_millis())
            .await?;
        self.cache.invalidate(key);
        if revoked {
            info!(key = %key_fingerprint(key), "api key revoked");
        }
        Ok(revoked)
    }
}

fn generate_api_key() -> Result<String, MeterError> {
    let mut bytes = [0u8; 24];
    getrandom::fill(&mut bytes).map_err(|err| MeterError::Entropy(err.to_string()))?;
    let mut out = String::with_capacity(3 + bytes.len() * 2);
    out.push_str("sk_");
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{TierLimits, TierTable};
    use crate::error::RateLimitError;
    use crate::store::{AccountStore, MemoryStore};

    const NOW: u64 = 1_747_216_800_000; // 2025-05-14 10:00 UTC

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        meter: Meter<MemoryStore>,
        key: String,
    }

    async fn harness(config: MeterConfig, tier: Tier, balance: &str) -> Harness {
        harness_with_limiter(config, tier, balance, None).await
    }

    async fn harness_with_limiter(
        config: MeterConfig,
        tier: Tier,
        balance: &str,
        limiter: Option<Arc<dyn RateLimiter>>,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let mut builder = Meter::builder(store.clone(), config).clock(clock.clone());
        if let Some(limiter) = limiter {
            builder = builder.rate_limiter(limiter);
        }
        let meter = builder.build();

        meter.create_account("acct", tier).await.expect("account");
        let amount: UsdMicros = balance.parse().expect("balance");
        if amount.is_positive() {
            meter
                .ledger()
                .credit("acct", amount, None, None)
                .await
                .expect("credit");
        }
        let key = meter
            .issue_api_key("acct", None, Permissions::All, None)
            .await
            .expect("key")
            .key;
        Harness {
            store,
            clock,
            meter,
            key,
        }
    }

    fn unlimited(free_monthly_quota: u32) -> MeterConfig {
        MeterConfig {
            free_monthly_quota,
            tiers: TierTable::unlimited(),
            ..MeterConfig::default()
        }
    }

    #[tokio::test]
    async fn free_then_paid_then_declined() {
        let h = harness(unlimited(1), Tier::Free, "0.01").await;

        let first = h.meter.charge_operation(&h.key, "compress").await;
        assert!(matches!(&first, ChargeOutcome::Charged(r) if r.used_free));
        for _ in 0..2 {
            let paid = h.meter.charge_operation(&h.key, "compress").await;
            assert!(matches!(&paid, ChargeOutcome::Charged(r) if !r.used_free));
        }
        assert_eq!(
            h.meter.charge_operation(&h.key, "compress").await,
            ChargeOutcome::Declined {
                reason: DeclineReason::InsufficientFunds,
                balance: UsdMicros::ZERO,
                free_remaining: 0,
            }
        );

        let usage = h.meter.usage().total_this_month("acct").await.unwrap();
        assert_eq!(usage, 3);
        let stats = h.meter.observability();
        assert_eq!(stats.charged_free, 1);
        assert_eq!(stats.charged_balance, 2);
        assert_eq!(stats.declined, 1);
    }

    #[tokio::test]
    async fn unknown_and_malformed_operations_are_refused() {
        let h = harness(unlimited(10), Tier::Free, "0").await;
        for operation in ["mine-bitcoin", "Compress", "", "rm -rf"] {
            assert!(matches!(
                h.meter.charge_operation(&h.key, operation).await,
                ChargeOutcome::Unauthorized(UnauthorizedReason::UnknownOperation { .. })
            ));
        }
    }

    #[tokio::test]
    async fn bad_keys_are_unauthorized() {
        let h = harness(unlimited(10), Tier::Free, "0").await;
        assert_eq!(
            h.meter.charge_operation("sk_nope", "merge").await,
            ChargeOutcome::Unauthorized(UnauthorizedReason::UnknownKey)
        );
        assert_eq!(
            h.meter.charge_operation("", "merge").await,
            ChargeOutcome::Unauthorized(UnauthorizedReason::MissingKey)
        );

        let expiring = h
            .meter
            .issue_api_key("acct", None, Permissions::All, Some(NOW + 1_000))
            .await
            .unwrap();
        h.clock.advance_secs(2);
        assert_eq!(
            h.meter.charge_operation(&expiring.key, "merge").await,
            ChargeOutcome::Unauthorized(UnauthorizedReason::Expired)
        );

        assert!(h.meter.revoke_api_key(&h.key).await.unwrap());
        assert_eq!(
            h.meter.charge_operation(&h.key, "merge").await,
            ChargeOutcome::Unauthorized(UnauthorizedReason::Revoked)
        );
    }

    #[tokio::test]
    async fn rate_limit_refuses_before_charging() {
        let mut config = unlimited(10);
        config.tiers.free = TierLimits::new(Some(2), None);
        let h = harness(config, Tier::Free, "0").await;

        assert!(h.meter.charge_operation(&h.key, "merge").await.is_charged());
        assert!(h.meter.charge_operation(&h.key, "merge").await.is_charged());
        assert!(matches!(
            h.meter.charge_operation(&h.key, "merge").await,
            ChargeOutcome::RateLimited(decision) if !decision.allowed
        ));
        let account = h.store.get_account("acct").await.unwrap().unwrap();
        assert_eq!(account.free_operations_used, 2);
    }

    #[tokio::test]
    async fn tier_ceiling_applies_to_free_and_paid_operations() {
        let mut config = unlimited(1);
        config.tiers.basic = TierLimits::new(None, Some(2));
        let h = harness(config, Tier::Basic, "1").await;

        assert!(h.meter.charge_operation(&h.key, "ocr").await.is_charged());
        assert!(h.meter.charge_operation(&h.key, "ocr").await.is_charged());
        assert_eq!(
            h.meter.charge_operation(&h.key, "ocr").await,
            ChargeOutcome::TierLimitExceeded {
                tier: Tier::Basic,
                limit: 2,
                used: 2
            }
        );
        let account = h.store.get_account("acct").await.unwrap().unwrap();
        assert_eq!(account.balance, "0.995".parse().unwrap());
    }

    #[tokio::test]
    async fn tier_ceiling_does_not_depend_on_usage_records() {
        let mut config = unlimited(5);
        config.tiers.free = TierLimits::new(None, Some(2));
        let h = harness(config, Tier::Free, "0").await;
        h.store.set_usage_unavailable(true);

        assert!(h.meter.charge_operation(&h.key, "merge").await.is_charged());
        assert!(h.meter.charge_operation(&h.key, "merge").await.is_charged());
        assert_eq!(
            h.meter.charge_operation(&h.key, "merge").await,
            ChargeOutcome::TierLimitExceeded {
                tier: Tier::Free,
                limit: 2,
                used: 2
            }
        );
        assert_eq!(h.meter.observability().tier_limited, 1);
    }

    struct BrokenLimiter;

    #[async_trait]
    impl RateLimiter for BrokenLimiter {
        async fn allow(
            &self,
            _api_key: &str,
            _tier: Tier,
            _now_ms: u64,
        ) -> Result<RateLimitDecision, RateLimitError> {
            Err(RateLimitError::Backend("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn limiter_failure_follows_policy() {
        let closed = harness_with_limiter(
            unlimited(5),
            Tier::Free,
            "0",
            Some(Arc::new(BrokenLimiter)),
        )
        .await;
        assert_eq!(
            closed.meter.charge_operation(&closed.key, "merge").await,
            ChargeOutcome::InternalError
        );

        let mut config = unlimited(5);
        config.rate_limit_failure_policy = FailurePolicy::FailOpen;
        let open =
            harness_with_limiter(config, Tier::Free, "0", Some(Arc::new(BrokenLimiter))).await;
        assert!(open.meter.charge_operation(&open.key, "merge").await.is_charged());
    }

    #[tokio::test]
    async fn store_outage_is_an_internal_error_and_charges_nothing() {
        let h = harness(unlimited(5), Tier::Free, "0").await;
        h.store.set_unavailable(true);
        assert_eq!(
            h.meter.charge_operation(&h.key, "merge").await,
            ChargeOutcome::InternalError
        );
        h.store.set_unavailable(false);
        let account = h.store.get_account("acct").await.unwrap().unwrap();
        assert_eq!(account.free_operations_used, 0);
        assert_eq!(h.meter.observability().internal_errors, 1);
    }

    #[tokio::test]
    async fn usage_failure_does_not_undo_charge() {
        let h = harness(unlimited(5), Tier::Free, "0").await;
        h.store.set_usage_unavailable(true);
        let outcome = h.meter.charge_operation(&h.key, "merge").await;
        assert!(outcome.is_charged());
        let account = h.store.get_account("acct").await.unwrap().unwrap();
        assert_eq!(account.free_operations_used, 1);
        assert_eq!(h.meter.observability().usage_dropped, 1);
    }

    #[tokio::test]
    async fn replayed_charge_is_not_recorded_twice() {
        let h = harness(unlimited(0), Tier::Free, "1").await;
        let request = ChargeRequest::new(h.key.clone(), "merge").with_idempotency_token("job-1");

        let first = h.meter.charge(request.clone()).await;
        let second = h.meter.charge(request).await;
        let (ChargeOutcome::Charged(first), ChargeOutcome::Charged(second)) = (first, second)
        else {
            panic!("expected two charged outcomes");
        };
        assert!(second.replayed);
        assert_eq!(first.balance, second.balance);
        assert_eq!(h.meter.usage().total_this_month("acct").await.unwrap(), 1);
        assert_eq!(h.meter.observability().replayed, 1);
    }

    #[tokio::test]
    async fn system_key_authorizes_when_credentials_are_down() {
        let credentials = MemoryStore::new();
        credentials.set_unavailable(true);
        let store = Arc::new(MemoryStore::new());
        let mut config = unlimited(5);
        config.system_key = Some(crate::config::SystemKeyConfig {
            key: "sk_system".to_string(),
            account_id: "ops".to_string(),
            tier: Tier::Enterprise,
        });
        let meter = Meter::builder(store, config)
            .clock(Arc::new(ManualClock::new(NOW)))
            .credential_store(Arc::new(credentials))
            .build();
        meter.create_account("ops", Tier::Enterprise).await.unwrap();

        assert!(meter.charge_operation("sk_system", "merge").await.is_charged());
        assert_eq!(meter.observability().degraded_authorizations, 1);
        assert_eq!(
            meter.charge_operation("sk_other", "merge").await,
            ChargeOutcome::InternalError
        );
    }

    #[test]
    fn generated_keys_are_prefixed_and_unique() {
        let a = generate_api_key().unwrap();
        let b = generate_api_key().unwrap();
        assert!(a.starts_with("sk_"));
        assert_eq!(a.len(), 3 + 48);
        assert_ne!(a, b);
    }
}
