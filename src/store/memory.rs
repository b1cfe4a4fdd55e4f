use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;

use super::{
    AccountStore, ChargeReceipt, CredentialStore, CycleState, LedgerStore, LedgerTx, UsageStore,
    check_deadline,
};
use crate::error::StoreError;
use crate::money::UsdMicros;
use crate::types::{
    Account, ApiKeyRecord, KeyLookup, NewTransaction, TransactionRecord, TransactionStatus,
    UsageRecord,
};

/// Process-local store. Units of work run under one lock and stage their
/// writes, so a failing unit leaves no trace.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    unavailable: Arc<AtomicBool>,
    usage_unavailable: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct MemoryState {
    accounts: BTreeMap<String, Account>,
    keys: BTreeMap<String, ApiKeyRecord>,
    transactions: Vec<TransactionRecord>,
    usage: BTreeMap<(String, String, u64), UsageRecord>,
    receipts: BTreeMap<(String, String), ChargeReceipt>,
    next_transaction_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes only usage writes fail.
    pub fn set_usage_unavailable(&self, unavailable: bool) {
        self.usage_unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn transaction_count(&self) -> usize {
        self.lock().transactions.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

struct MemoryTx<'a> {
    state: &'a MemoryState,
    accounts: BTreeMap<String, Account>,
    transactions: Vec<TransactionRecord>,
    receipts: BTreeMap<(String, String), ChargeReceipt>,
}

impl MemoryTx<'_> {
    fn account_mut(&mut self, account_id: &str) -> Result<&mut Account, StoreError> {
        if !self.accounts.contains_key(account_id) {
            let account = self
                .state
                .accounts
                .get(account_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("account {account_id}")))?;
            self.accounts.insert(account_id.to_string(), account);
        }
        self.accounts
            .get_mut(account_id)
            .ok_or_else(|| StoreError::NotFound(format!("account {account_id}")))
    }
}

impl LedgerTx for MemoryTx<'_> {
    fn load_account(&mut self, account_id: &str) -> Result<Option<Account>, StoreError> {
        if let Some(staged) = self.accounts.get(account_id) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.state.accounts.get(account_id).cloned())
    }

    fn save_cycle(&mut self, account_id: &str, cycle: CycleState) -> Result<(), StoreError> {
        let account = self.account_mut(account_id)?;
        account.free_operations_used = cycle.free_operations_used;
        account.cycle_operations = cycle.operations;
        account.free_cycle_reset_at_ms = cycle.reset_at_ms;
        Ok(())
    }

    fn save_balance(&mut self, account_id: &str, balance: UsdMicros) -> Result<(), StoreError> {
        self.account_mut(account_id)?.balance = balance;
        Ok(())
    }

    fn append_transaction(
        &mut self,
        transaction: NewTransaction,
    ) -> Result<TransactionRecord, StoreError> {
        let id = self.state.next_transaction_id + 1 + self.transactions.len() as i64;
        let record = TransactionRecord {
            id,
            account_id: transaction.account_id,
            amount: transaction.amount,
            balance_after: transaction.balance_after,
            description: transaction.description,
            status: TransactionStatus::Completed,
            payment_ref: transaction.payment_ref,
            created_at_ms: transaction.created_at_ms,
        };
        self.transactions.push(record.clone());
        Ok(record)
    }

    fn find_receipt(
        &mut self,
        account_id: &str,
        token: &str,
    ) -> Result<Option<ChargeReceipt>, StoreError> {
        let key = (account_id.to_string(), token.to_string());
        if let Some(staged) = self.receipts.get(&key) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.state.receipts.get(&key).cloned())
    }

    fn put_receipt(&mut self, token: &str, receipt: &ChargeReceipt) -> Result<(), StoreError> {
        let key = (receipt.account_id.clone(), token.to_string());
        if self.state.receipts.contains_key(&key) || self.receipts.contains_key(&key) {
            return Err(StoreError::Conflict(format!("duplicate receipt {token}")));
        }
        self.receipts.insert(key, receipt.clone());
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn unit_of_work_until<T, F>(
        &self,
        deadline: Option<Instant>,
        work: F,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, StoreError> + Send + 'static,
    {
        self.check_available()?;
        check_deadline(deadline)?;
        let mut state = self.lock();
        let (result, accounts, transactions, receipts) = {
            let mut tx = MemoryTx {
                state: &state,
                accounts: BTreeMap::new(),
                transactions: Vec::new(),
                receipts: BTreeMap::new(),
            };
            let result = work(&mut tx)?;
            (result, tx.accounts, tx.transactions, tx.receipts)
        };
        check_deadline(deadline)?;

        state.next_transaction_id += transactions.len() as i64;
        state.accounts.extend(accounts);
        state.transactions.extend(transactions);
        state.receipts.extend(receipts);
        Ok(result)
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn lookup(&self, key: &str) -> Result<Option<KeyLookup>, StoreError> {
        self.check_available()?;
        let state = self.lock();
        let Some(record) = state.keys.get(key) else {
            return Ok(None);
        };
        let tier = state
            .accounts
            .get(&record.account_id)
            .map(|account| account.tier)
            .unwrap_or_default();
        Ok(Some(KeyLookup {
            account_id: record.account_id.clone(),
            permissions: record.permissions.clone(),
            tier,
            expires_at_ms: record.expires_at_ms,
            revoked: record.revoked_at_ms.is_some(),
        }))
    }

    async fn touch(&self, key: &str, at_ms: u64) -> Result<(), StoreError> {
        self.check_available()?;
        if let Some(record) = self.lock().keys.get_mut(key) {
            record.last_used_at_ms = Some(at_ms);
        }
        Ok(())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn increment_usage(
        &self,
        account_id: &str,
        operation: &str,
        day_start_ms: u64,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        if self.usage_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("usage table offline".to_string()));
        }
        let mut state = self.lock();
        let record = state
            .usage
            .entry((account_id.to_string(), operation.to_string(), day_start_ms))
            .or_insert_with(|| UsageRecord {
                account_id: account_id.to_string(),
                operation: operation.to_string(),
                day_start_ms,
                count: 0,
                updated_at_ms: now_ms,
            });
        record.count = record.count.saturating_add(1);
        record.updated_at_ms = now_ms;
        Ok(())
    }

    async fn usage_since(
        &self,
        account_id: Option<&str>,
        since_ms: u64,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        self.check_available()?;
        let state = self.lock();
        Ok(state
            .usage
            .values()
            .filter(|record| record.day_start_ms >= since_ms)
            .filter(|record| account_id.is_none_or(|id| record.account_id == id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn create_account(&self, account: &Account) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        if state.accounts.contains_key(&account.id) {
            return Err(StoreError::Conflict(format!("account {} exists", account.id)));
        }
        state.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        self.check_available()?;
        Ok(self.lock().accounts.get(account_id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        self.check_available()?;
        Ok(self.lock().accounts.values().cloned().collect())
    }

    async fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        if !state.accounts.contains_key(&record.account_id) {
            return Err(StoreError::NotFound(format!("account {}", record.account_id)));
        }
        if state.keys.contains_key(&record.key) {
            return Err(StoreError::Conflict("api key exists".to_string()));
        }
        state.keys.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn revoke_api_key(&self, key: &str, at_ms: u64) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        let Some(record) = state.keys.get_mut(key) else {
            return Ok(false);
        };
        if record.revoked_at_ms.is_none() {
            record.revoked_at_ms = Some(at_ms);
        }
        Ok(true)
    }

    async fn list_api_keys(&self, account_id: &str) -> Result<Vec<ApiKeyRecord>, StoreError> {
        self.check_available()?;
        Ok(self
            .lock()
            .keys
            .values()
            .filter(|record| record.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn list_transactions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        self.check_available()?;
        Ok(self
            .lock()
            .transactions
            .iter()
            .rev()
            .filter(|record| record.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tier;

    #[tokio::test]
    async fn failed_unit_of_work_discards_staged_writes() {
        let store = MemoryStore::new();
        store
            .create_account(&Account::new("acct", Tier::Free, 0))
            .await
            .expect("create");

        let result: Result<(), StoreError> = store
            .unit_of_work(|tx| {
                tx.save_balance("acct", UsdMicros::from_micros(42))?;
                tx.append_transaction(NewTransaction {
                    account_id: "acct".to_string(),
                    amount: UsdMicros::from_micros(42),
                    balance_after: UsdMicros::from_micros(42),
                    description: "deposit".to_string(),
                    payment_ref: None,
                    created_at_ms: 1,
                })?;
                Err(StoreError::Conflict("boom".to_string()))
            })
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        let account = store.get_account("acct").await.unwrap().unwrap();
        assert_eq!(account.balance, UsdMicros::ZERO);
        assert_eq!(store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn transaction_ids_keep_increasing_across_units() {
        let store = MemoryStore::new();
        store
            .create_account(&Account::new("acct", Tier::Free, 0))
            .await
            .expect("create");

        let mut ids = Vec::new();
        for n in 0..3 {
            let record = store
                .unit_of_work(move |tx| {
                    tx.append_transaction(NewTransaction {
                        account_id: "acct".to_string(),
                        amount: UsdMicros::from_micros(n),
                        balance_after: UsdMicros::from_micros(n),
                        description: format!("t{n}"),
                        payment_ref: None,
                        created_at_ms: n as u64,
                    })
                })
                .await
                .expect("unit");
            ids.push(record.id);
        }
        assert_eq!(ids, vec![1, 2, 3]);

        let listed = store.list_transactions("acct", 2).await.unwrap();
        assert_eq!(listed.iter().map(|t| t.id).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[tokio::test]
    async fn unit_finishing_after_its_deadline_writes_nothing() {
        let store = MemoryStore::new();
        store
            .create_account(&Account::new("acct", Tier::Free, 0))
            .await
            .expect("create");

        let deadline = Instant::now() + std::time::Duration::from_millis(20);
        let result = store
            .unit_of_work_until(Some(deadline), |tx| {
                tx.save_balance("acct", UsdMicros::from_micros(7))?;
                std::thread::sleep(std::time::Duration::from_millis(40));
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::DeadlineExceeded)));
        let account = store.get_account("acct").await.unwrap().unwrap();
        assert_eq!(account.balance, UsdMicros::ZERO);

        let expired = store
            .unit_of_work_until(Some(Instant::now()), |_tx| Ok(()))
            .await;
        assert!(matches!(expired, Err(StoreError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.lookup("k").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
