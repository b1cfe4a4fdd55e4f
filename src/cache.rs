//! TTL cache in front of the credential store.
//!
//! Entries are served for `ttl_seconds` after they were fetched. A key revoked
//! in the store keeps validating from a warm entry until that entry ages out,
//! so revocation takes effect on this instance within `ttl + one lookup`.
//! Expiry timestamps are evaluated on every call and are never stale.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{KeyCacheConfig, SystemKeyConfig};
use crate::error::StoreError;
use crate::observability::Observability;
use crate::store::CredentialStore;
use crate::types::{KeyLookup, Permissions, Tier};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizedKey {
    pub account_id: String,
    pub tier: Tier,
    pub permissions: Permissions,
    /// Authorized by the configured system key while the store was down.
    pub degraded: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnauthorizedReason {
    MissingKey,
    UnknownKey,
    Revoked,
    Expired,
    PermissionDenied { operation: String },
    UnknownOperation { operation: String },
}

impl UnauthorizedReason {
    pub fn code(&self) -> &'static str {
        match self {
            UnauthorizedReason::MissingKey => "missing_api_key",
            UnauthorizedReason::UnknownKey => "invalid_api_key",
            UnauthorizedReason::Revoked => "revoked_api_key",
            UnauthorizedReason::Expired => "expired_api_key",
            UnauthorizedReason::PermissionDenied { .. } => "permission_denied",
            UnauthorizedReason::UnknownOperation { .. } => "unknown_operation",
        }
    }

    pub fn message(&self) -> String {
        match self {
            UnauthorizedReason::MissingKey => "api key is required".to_string(),
            UnauthorizedReason::UnknownKey => "api key is not valid".to_string(),
            UnauthorizedReason::Revoked => "api key has been revoked".to_string(),
            UnauthorizedReason::Expired => "api key has expired".to_string(),
            UnauthorizedReason::PermissionDenied { operation } => {
                format!("api key is not allowed to run {operation}")
            }
            UnauthorizedReason::UnknownOperation { operation } => {
                format!("unknown operation {operation}")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyValidation {
    Authorized(AuthorizedKey),
    Unauthorized(UnauthorizedReason),
    Expired,
}

#[derive(Clone, Debug)]
enum CachedKey {
    Found(KeyLookup),
    Missing,
}

#[derive(Clone, Debug)]
struct CacheEntry {
    key: CachedKey,
    cached_at_ms: u64,
}

pub struct KeyValidationCache {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    config: KeyCacheConfig,
    system_key: Option<SystemKeyConfig>,
    observability: Arc<Observability>,
    state: Mutex<CacheState>,
}

/// Entries plus their insertion order, oldest first, for eviction once
/// `max_entries` is reached.
#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

impl CacheState {
    fn remove(&mut self, key: &str) -> bool {
        let existed = self.entries.remove(key).is_some();
        if existed {
            self.order.retain(|candidate| candidate != key);
        }
        existed
    }
}

impl std::fmt::Debug for KeyValidationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValidationCache")
            .field("config", &self.config)
            .field("system_key", &self.system_key)
            .field("entries", &self.len())
            .finish()
    }
}

impl KeyValidationCache {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        config: KeyCacheConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            system_key: None,
            observability: Arc::new(Observability::default()),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn with_system_key(mut self, system_key: Option<SystemKeyConfig>) -> Self {
        self.system_key = system_key;
        self
    }

    pub fn with_observability(mut self, observability: Arc<Observability>) -> Self {
        self.observability = observability;
        self
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Authenticates `key` and checks that it may run `operation`.
    ///
    /// Only infrastructure failures are errors; every refusal is a
    /// [`KeyValidation`] value.
    pub async fn validate(&self, key: &str, operation: &str) -> Result<KeyValidation, StoreError> {
        self.resolve(key, Some(operation)).await
    }

    /// Like [`validate`](Self::validate) without a permission check, for
    /// endpoints that are not tied to an operation.
    pub async fn authenticate(&self, key: &str) -> Result<KeyValidation, StoreError> {
        self.resolve(key, None).await
    }

    async fn resolve(&self, key: &str, operation: Option<&str>) -> Result<KeyValidation, StoreError> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(KeyValidation::Unauthorized(UnauthorizedReason::MissingKey));
        }
        let now = self.clock.now_millis();

        if let Some(cached) = self.fresh_entry(key, now) {
            self.observability.record_cache_hit();
            return Ok(match cached {
                CachedKey::Found(lookup) => evaluate(&lookup, operation, now),
                CachedKey::Missing => KeyValidation::Unauthorized(UnauthorizedReason::UnknownKey),
            });
        }
        self.observability.record_cache_miss();

        match self.store.lookup(key).await {
            Ok(Some(lookup)) => {
                let validation = evaluate(&lookup, operation, now);
                if matches!(validation, KeyValidation::Authorized(_)) {
                    self.touch_in_background(key, now);
                }
                self.insert(key, CachedKey::Found(lookup), now);
                Ok(validation)
            }
            Ok(None) => {
                if self.config.negative_caching {
                    self.insert(key, CachedKey::Missing, now);
                }
                Ok(KeyValidation::Unauthorized(UnauthorizedReason::UnknownKey))
            }
            Err(err) if err.is_unavailable() => match self.system_key_authorization(key) {
                Some(authorized) => {
                    self.observability.record_degraded_authorization();
                    warn!(
                        degraded = true,
                        account_id = %authorized.account_id,
                        key = %key_fingerprint(key),
                        error = %err,
                        "credential store unavailable, authorized with system key"
                    );
                    Ok(KeyValidation::Authorized(authorized))
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Drops the local entry for `key`. Other instances keep theirs until
    /// their TTL runs out.
    pub fn invalidate(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Evicts entries that can no longer be served. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let ttl_ms = self.ttl_millis();
        let mut state = self.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| now.saturating_sub(entry.cached_at_ms) < ttl_ms);
        let CacheState { entries, order } = &mut *state;
        order.retain(|key| entries.contains_key(key));
        let evicted = before - entries.len();
        debug!(evicted, remaining = entries.len(), "key cache sweep");
        evicted
    }

    /// Spawns the periodic sweep. The task stops when the returned handle is
    /// stopped or dropped, or when the cache itself is dropped.
    pub fn start(self: &Arc<Self>) -> SweeperHandle {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = self.config.cleanup_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.sweep();
            }
        });
        SweeperHandle(task.abort_handle())
    }

    fn fresh_entry(&self, key: &str, now: u64) -> Option<CachedKey> {
        let state = self.lock();
        let entry = state.entries.get(key)?;
        if now.saturating_sub(entry.cached_at_ms) < self.ttl_millis() {
            Some(entry.key.clone())
        } else {
            None
        }
    }

    fn insert(&self, key: &str, cached: CachedKey, now: u64) {
        let max_entries = self.config.max_entries;
        if max_entries == 0 {
            return;
        }
        let entry = CacheEntry {
            key: cached,
            cached_at_ms: now,
        };
        let mut state = self.lock();
        if state.entries.insert(key.to_string(), entry).is_some() {
            state.order.retain(|candidate| candidate != key);
        }
        state.order.push_back(key.to_string());

        let mut evicted = 0usize;
        while state.entries.len() > max_entries {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, max_entries, "key cache full, evicted oldest entries");
        }
    }

    fn ttl_millis(&self) -> u64 {
        self.config.ttl_seconds.saturating_mul(1000)
    }

    fn system_key_authorization(&self, key: &str) -> Option<AuthorizedKey> {
        let system_key = self.system_key.as_ref()?;
        if system_key.key != key {
            return None;
        }
        Some(AuthorizedKey {
            account_id: system_key.account_id.clone(),
            tier: system_key.tier,
            permissions: Permissions::All,
            degraded: true,
        })
    }

    fn touch_in_background(&self, key: &str, now: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = key.to_string();
        runtime.spawn(async move {
            if let Err(err) = store.touch(&key, now).await {
                debug!(key = %key_fingerprint(&key), error = %err, "api key touch dropped");
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Stops the background sweep when stopped or dropped.
#[derive(Debug)]
pub struct SweeperHandle(tokio::task::AbortHandle);

impl SweeperHandle {
    pub fn stop(self) {
        self.0.abort();
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn evaluate(lookup: &KeyLookup, operation: Option<&str>, now: u64) -> KeyValidation {
    if lookup.revoked {
        return KeyValidation::Unauthorized(UnauthorizedReason::Revoked);
    }
    if lookup.expires_at_ms.is_some_and(|expires_at| expires_at <= now) {
        return KeyValidation::Expired;
    }
    if let Some(operation) = operation.filter(|operation| !lookup.permissions.allows(operation)) {
        return KeyValidation::Unauthorized(UnauthorizedReason::PermissionDenied {
            operation: operation.to_string(),
        });
    }
    KeyValidation::Authorized(AuthorizedKey {
        account_id: lookup.account_id.clone(),
        tier: lookup.tier,
        permissions: lookup.permissions.clone(),
        degraded: false,
    })
}

/// Short stable identifier for logs. The key itself is never logged.
pub fn key_fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest[..8].iter().map(|byte| format!("{byte:02x}")).collect()
}
