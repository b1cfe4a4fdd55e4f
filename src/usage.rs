use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::{self, Clock, MILLIS_PER_DAY};
use crate::error::StoreError;
use crate::observability::Observability;
use crate::store::UsageStore;
use crate::types::{Account, Tier};

/// Outcome of a best-effort usage write. Dropped events are logged and
/// counted but never reach the caller as errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordStatus {
    Recorded,
    Dropped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub day: String,
    pub day_start_ms: u64,
    pub operations: u64,
    pub active_accounts: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub since_ms: u64,
    pub total_operations: u64,
    pub active_accounts: u64,
    pub daily: Vec<DailyUsage>,
    pub by_operation: BTreeMap<String, u64>,
    pub by_tier: BTreeMap<Tier, u64>,
}

#[derive(Clone)]
pub struct UsageAggregator {
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    observability: Arc<Observability>,
}

impl std::fmt::Debug for UsageAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageAggregator").finish_non_exhaustive()
    }
}

impl UsageAggregator {
    pub fn new(store: Arc<dyn UsageStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            observability: Arc::new(Observability::default()),
        }
    }

    pub fn with_observability(mut self, observability: Arc<Observability>) -> Self {
        self.observability = observability;
        self
    }

    /// Increments the (account, operation, day of `at_ms`) counter.
    pub async fn record(
        &self,
        account_id: &str,
        operation: &str,
        at_ms: u64,
    ) -> Result<(), StoreError> {
        self.store
            .increment_usage(
                account_id,
                operation,
                clock::day_start(at_ms),
                self.clock.now_millis(),
            )
            .await
    }

    /// [`record`](Self::record) for events whose charge already committed.
    pub async fn record_best_effort(
        &self,
        account_id: &str,
        operation: &str,
        at_ms: u64,
    ) -> RecordStatus {
        match self.record(account_id, operation, at_ms).await {
            Ok(()) => RecordStatus::Recorded,
            Err(err) => {
                self.observability.record_usage_dropped();
                warn!(
                    account_id,
                    operation,
                    error = %err,
                    "usage record dropped"
                );
                RecordStatus::Dropped
            }
        }
    }

    pub async fn total_for_cycle(&self, account_id: &str, since_ms: u64) -> Result<u64, StoreError> {
        let records = self.store.usage_since(Some(account_id), since_ms).await?;
        Ok(records
            .iter()
            .fold(0u64, |total, record| total.saturating_add(record.count)))
    }

    /// Operations run by the account in the current calendar month (UTC).
    pub async fn total_this_month(&self, account_id: &str) -> Result<u64, StoreError> {
        self.total_for_cycle(account_id, clock::month_start(self.clock.now_millis()))
            .await
    }

    pub async fn breakdown_by_operation(
        &self,
        account_id: &str,
        since_ms: u64,
    ) -> Result<BTreeMap<String, u64>, StoreError> {
        let records = self.store.usage_since(Some(account_id), since_ms).await?;
        let mut out = BTreeMap::<String, u64>::new();
        for record in records {
            let count = out.entry(record.operation).or_default();
            *count = count.saturating_add(record.count);
        }
        Ok(out)
    }

    /// Platform-wide report over the last `days` days, today included.
    /// Accounts missing from `accounts` are grouped under the free tier.
    pub async fn report(&self, days: u32, accounts: &[Account]) -> Result<UsageReport, StoreError> {
        let today = clock::day_start(self.clock.now_millis());
        let since_ms =
            today.saturating_sub(u64::from(days.max(1) - 1).saturating_mul(MILLIS_PER_DAY));
        let records = self.store.usage_since(None, since_ms).await?;
        let tiers: HashMap<&str, Tier> = accounts
            .iter()
            .map(|account| (account.id.as_str(), account.tier))
            .collect();

        let mut daily = BTreeMap::<u64, (u64, BTreeSet<String>)>::new();
        let mut all_accounts = BTreeSet::<String>::new();
        let mut report = UsageReport {
            since_ms,
            ..UsageReport::default()
        };
        for record in records {
            report.total_operations = report.total_operations.saturating_add(record.count);
            let by_op = report.by_operation.entry(record.operation.clone()).or_default();
            *by_op = by_op.saturating_add(record.count);
            let tier = tiers
                .get(record.account_id.as_str())
                .copied()
                .unwrap_or_default();
            let by_tier = report.by_tier.entry(tier).or_default();
            *by_tier = by_tier.saturating_add(record.count);

            let (operations, accounts) = daily.entry(record.day_start_ms).or_default();
            *operations = operations.saturating_add(record.count);
            accounts.insert(record.account_id.clone());
            all_accounts.insert(record.account_id);
        }

        report.active_accounts = all_accounts.len() as u64;
        report.daily = daily
            .into_iter()
            .map(|(day_start_ms, (operations, accounts))| DailyUsage {
                day: clock::format_day(day_start_ms),
                day_start_ms,
                operations,
                active_accounts: accounts.len() as u64,
            })
            .collect();
        Ok(report)
    }
}
