//! Persistence seams for the metering core.
//!
//! Reads and writes that must be atomic per account go through
//! [`LedgerStore::unit_of_work`]: the closure receives a transactional
//! handle and everything it does either commits together or not at all.

pub mod memory;
#[cfg(feature = "store-sqlite")]
pub mod sqlite;

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::money::UsdMicros;
use crate::types::{
    Account, ApiKeyRecord, KeyLookup, NewTransaction, TransactionRecord, UsageRecord,
};

pub use memory::MemoryStore;
#[cfg(feature = "store-sqlite")]
pub use sqlite::SqliteStore;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<Option<KeyLookup>, StoreError>;

    /// Best-effort last-used bookkeeping.
    async fn touch(&self, key: &str, at_ms: u64) -> Result<(), StoreError>;
}

/// Result of a charge that already committed, keyed by a caller-supplied
/// idempotency token so a retried request replays it instead of charging again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub account_id: String,
    pub operation: String,
    pub used_free: bool,
    pub free_remaining: u32,
    pub balance: UsdMicros,
    pub cost: UsdMicros,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_token: Option<String>,
    pub charged_at_ms: u64,
    #[serde(default)]
    pub replayed: bool,
}

/// Monthly counters of one account, always written together.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleState {
    pub free_operations_used: u32,
    pub operations: u64,
    pub reset_at_ms: u64,
}

/// Transactional handle handed to a unit of work.
pub trait LedgerTx {
    fn load_account(&mut self, account_id: &str) -> Result<Option<Account>, StoreError>;

    fn save_cycle(&mut self, account_id: &str, cycle: CycleState) -> Result<(), StoreError>;

    fn save_balance(&mut self, account_id: &str, balance: UsdMicros) -> Result<(), StoreError>;

    fn append_transaction(
        &mut self,
        transaction: NewTransaction,
    ) -> Result<TransactionRecord, StoreError>;

    fn find_receipt(
        &mut self,
        account_id: &str,
        token: &str,
    ) -> Result<Option<ChargeReceipt>, StoreError>;

    fn put_receipt(&mut self, token: &str, receipt: &ChargeReceipt) -> Result<(), StoreError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Runs `work` with serializable isolation for the accounts it touches.
    /// An `Err` from `work` rolls back every write it made.
    ///
    /// With a `deadline`, the unit either commits before it or fails with
    /// [`StoreError::DeadlineExceeded`] having written nothing, including
    /// when it is still waiting for the write lock.
    async fn unit_of_work_until<T, F>(
        &self,
        deadline: Option<Instant>,
        work: F,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, StoreError> + Send + 'static;

    async fn unit_of_work<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, StoreError> + Send + 'static,
    {
        self.unit_of_work_until(None, work).await
    }
}

/// Fails once `deadline` has passed.
pub(crate) fn check_deadline(deadline: Option<Instant>) -> Result<(), StoreError> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(StoreError::DeadlineExceeded),
        _ => Ok(()),
    }
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Insert-or-increment of the (account, operation, day) counter.
    async fn increment_usage(
        &self,
        account_id: &str,
        operation: &str,
        day_start_ms: u64,
        now_ms: u64,
    ) -> Result<(), StoreError>;

    /// Usage rows with `day_start_ms >= since_ms`, for one account or all.
    async fn usage_since(
        &self,
        account_id: Option<&str>,
        since_ms: u64,
    ) -> Result<Vec<UsageRecord>, StoreError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn create_account(&self, account: &Account) -> Result<(), StoreError>;

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError>;

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError>;

    async fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<(), StoreError>;

    /// Returns `false` when the key does not exist.
    async fn revoke_api_key(&self, key: &str, at_ms: u64) -> Result<bool, StoreError>;

    async fn list_api_keys(&self, account_id: &str) -> Result<Vec<ApiKeyRecord>, StoreError>;

    /// Newest first.
    async fn list_transactions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, StoreError>;
}

/// Everything the charge coordinator needs from one backing store.
pub trait MeterStore:
    CredentialStore + LedgerStore + UsageStore + AccountStore + 'static
{
}

impl<T> MeterStore for T where
    T: CredentialStore + LedgerStore + UsageStore + AccountStore + 'static
{
}
