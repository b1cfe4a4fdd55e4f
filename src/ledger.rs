//! Free quota and balance accounting.
//!
//! [`apply_charge`] and [`apply_credit`] run inside one
//! [`LedgerStore::unit_of_work`]; whatever they return as `Err` leaves the
//! account and its transaction log untouched.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::clock::{self, Clock};
use crate::config::MeterConfig;
use crate::error::StoreError;
use crate::money::UsdMicros;
use crate::store::{AccountStore, ChargeReceipt, CycleState, LedgerStore, LedgerTx};
use crate::types::{Account, BalanceInfo, NewTransaction, Tier, TransactionRecord};

pub const RECENT_TRANSACTIONS: usize = 10;

/// Everything a charge needs, owned so it can move into a unit of work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChargeTerms {
    pub account_id: String,
    pub operation: String,
    pub unit_cost: UsdMicros,
    pub free_monthly_quota: u32,
    /// Tier ceiling on operations per cycle, `None` for no ceiling.
    pub monthly_operation_limit: Option<u64>,
    pub idempotency_token: Option<String>,
    pub now_ms: u64,
    /// Past this instant the charge must not commit.
    pub deadline: Option<Instant>,
}

impl ChargeTerms {
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LedgerDecision {
    Charged(ChargeReceipt),
    Declined {
        balance: UsdMicros,
        free_remaining: u32,
    },
    TierLimitExceeded {
        limit: u64,
        used: u64,
    },
}

/// Account counters after the lazy monthly rollover, not yet persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Cycle {
    used: u32,
    operations: u64,
    reset_at_ms: u64,
}

impl Cycle {
    fn state(self) -> CycleState {
        CycleState {
            free_operations_used: self.used,
            operations: self.operations,
            reset_at_ms: self.reset_at_ms,
        }
    }
}

fn current_cycle(account: &Account, now_ms: u64) -> Cycle {
    if now_ms >= account.free_cycle_reset_at_ms {
        Cycle {
            used: 0,
            operations: 0,
            reset_at_ms: clock::next_month_start(now_ms),
        }
    } else {
        Cycle {
            used: account.free_operations_used,
            operations: account.cycle_operations,
            reset_at_ms: account.free_cycle_reset_at_ms,
        }
    }
}

/// Decides and applies one charge: tier ceiling, then free quota, then the
/// balance. A refusal writes nothing, not even a pending cycle reset.
pub fn apply_charge(
    tx: &mut dyn LedgerTx,
    terms: &ChargeTerms,
) -> Result<LedgerDecision, StoreError> {
    if let Some(token) = terms.idempotency_token.as_deref() {
        if let Some(mut receipt) = tx.find_receipt(&terms.account_id, token)? {
            receipt.replayed = true;
            return Ok(LedgerDecision::Charged(receipt));
        }
    }

    let account = tx
        .load_account(&terms.account_id)?
        .ok_or_else(|| StoreError::NotFound(format!("account {}", terms.account_id)))?;
    let mut cycle = current_cycle(&account, terms.now_ms);
    if let Some(limit) = terms.monthly_operation_limit {
        if cycle.operations >= limit {
            return Ok(LedgerDecision::TierLimitExceeded {
                limit,
                used: cycle.operations,
            });
        }
    }
    cycle.operations = cycle.operations.saturating_add(1);
    let quota = terms.free_monthly_quota;

    let receipt = if cycle.used < quota {
        cycle.used += 1;
        tx.save_cycle(&account.id, cycle.state())?;
        ChargeReceipt {
            account_id: account.id.clone(),
            operation: terms.operation.clone(),
            used_free: true,
            free_remaining: quota - cycle.used,
            balance: account.balance,
            cost: UsdMicros::ZERO,
            transaction_id: None,
            idempotency_token: terms.idempotency_token.clone(),
            charged_at_ms: terms.now_ms,
            replayed: false,
        }
    } else {
        let Some(balance) = account
            .balance
            .checked_sub(terms.unit_cost)
            .filter(|balance| !balance.is_negative())
        else {
            return Ok(LedgerDecision::Declined {
                balance: account.balance,
                free_remaining: 0,
            });
        };

        tx.save_cycle(&account.id, cycle.state())?;
        let transaction_id = if terms.unit_cost.is_positive() {
            tx.save_balance(&account.id, balance)?;
            let record = tx.append_transaction(NewTransaction {
                account_id: account.id.clone(),
                amount: terms.unit_cost.neg(),
                balance_after: balance,
                description: format!("Operation: {}", terms.operation),
                payment_ref: None,
                created_at_ms: terms.now_ms,
            })?;
            Some(record.id)
        } else {
            None
        };
        ChargeReceipt {
            account_id: account.id.clone(),
            operation: terms.operation.clone(),
            used_free: false,
            free_remaining: 0,
            balance,
            cost: terms.unit_cost,
            transaction_id,
            idempotency_token: terms.idempotency_token.clone(),
            charged_at_ms: terms.now_ms,
            replayed: false,
        }
    };

    if let Some(token) = terms.idempotency_token.as_deref() {
        tx.put_receipt(token, &receipt)?;
    }
    Ok(LedgerDecision::Charged(receipt))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreditTerms {
    pub account_id: String,
    pub amount: UsdMicros,
    pub description: String,
    pub payment_ref: Option<String>,
    pub now_ms: u64,
}

/// Adds funds and logs a completed transaction with the new balance.
pub fn apply_credit(
    tx: &mut dyn LedgerTx,
    terms: &CreditTerms,
) -> Result<TransactionRecord, StoreError> {
    if !terms.amount.is_positive() {
        return Err(StoreError::Invalid(format!(
            "credit amount must be positive, got {}",
            terms.amount
        )));
    }
    let account = tx
        .load_account(&terms.account_id)?
        .ok_or_else(|| StoreError::NotFound(format!("account {}", terms.account_id)))?;
    let balance = account
        .balance
        .checked_add(terms.amount)
        .ok_or_else(|| StoreError::Invalid("balance overflow".to_string()))?;

    tx.save_balance(&account.id, balance)?;
    tx.append_transaction(NewTransaction {
        account_id: account.id,
        amount: terms.amount,
        balance_after: balance,
        description: terms.description.clone(),
        payment_ref: terms.payment_ref.clone(),
        created_at_ms: terms.now_ms,
    })
}

/// Read-only balance view. A cycle whose reset date has passed shows as a
/// fresh one; the reset itself is only persisted by the next charge.
pub fn balance_view(
    account: &Account,
    recent_transactions: Vec<TransactionRecord>,
    free_monthly_quota: u32,
    now_ms: u64,
) -> BalanceInfo {
    let cycle = current_cycle(account, now_ms);
    BalanceInfo {
        account_id: account.id.clone(),
        tier: account.tier,
        balance: account.balance,
        free_operations_used: cycle.used,
        free_operations_remaining: free_monthly_quota.saturating_sub(cycle.used),
        free_operations_reset_at_ms: cycle.reset_at_ms,
        operations_this_cycle: cycle.operations,
        recent_transactions,
    }
}

/// Whether an operation would be charged right now, without charging it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub account_id: String,
    pub operation: String,
    pub can_perform: bool,
    pub has_free_operations: bool,
    pub free_operations_remaining: u32,
    /// Balance covers `unit_cost`.
    pub has_balance: bool,
    pub balance: UsdMicros,
    pub unit_cost: UsdMicros,
    pub within_monthly_limit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_operation_limit: Option<u64>,
    pub operations_this_cycle: u64,
}

/// Read-only counterpart of [`apply_charge`]. A concurrent charge can still
/// change the answer before the real charge runs.
pub fn eligibility_view(
    account: &Account,
    operation: &str,
    unit_cost: UsdMicros,
    free_monthly_quota: u32,
    monthly_operation_limit: Option<u64>,
    now_ms: u64,
) -> Eligibility {
    let cycle = current_cycle(account, now_ms);
    let free_remaining = free_monthly_quota.saturating_sub(cycle.used);
    let has_balance = account.balance >= unit_cost;
    let within_monthly_limit = monthly_operation_limit.is_none_or(|limit| cycle.operations < limit);
    Eligibility {
        account_id: account.id.clone(),
        operation: operation.to_string(),
        can_perform: within_monthly_limit && (free_remaining > 0 || has_balance),
        has_free_operations: free_remaining > 0,
        free_operations_remaining: free_remaining,
        has_balance,
        balance: account.balance,
        unit_cost,
        within_monthly_limit,
        monthly_operation_limit,
        operations_this_cycle: cycle.operations,
    }
}

/// Store-bound ledger with pricing from [`MeterConfig`].
pub struct Ledger<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: Arc<MeterConfig>,
}

impl<S> Clone for Ledger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S> Ledger<S>
where
    S: LedgerStore + AccountStore + 'static,
{
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: Arc<MeterConfig>) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn terms(
        &self,
        account_id: &str,
        tier: Tier,
        operation: &str,
        idempotency_token: Option<String>,
    ) -> ChargeTerms {
        ChargeTerms {
            account_id: account_id.to_string(),
            operation: operation.to_string(),
            unit_cost: self.config.pricing.unit_cost(operation),
            free_monthly_quota: self.config.free_monthly_quota,
            monthly_operation_limit: self.config.tiers.get(tier).monthly_operations,
            idempotency_token,
            now_ms: self.clock.now_millis(),
            deadline: None,
        }
    }

    pub async fn charge(&self, terms: ChargeTerms) -> Result<LedgerDecision, StoreError> {
        let deadline = terms.deadline;
        self.store
            .unit_of_work_until(deadline, move |tx| apply_charge(tx, &terms))
            .await
    }

    pub async fn credit(
        &self,
        account_id: &str,
        amount: UsdMicros,
        description: Option<String>,
        payment_ref: Option<String>,
    ) -> Result<TransactionRecord, StoreError> {
        let terms = CreditTerms {
            account_id: account_id.to_string(),
            amount,
            description: description.unwrap_or_else(|| "Deposit".to_string()),
            payment_ref,
            now_ms: self.clock.now_millis(),
        };
        self.store
            .unit_of_work(move |tx| apply_credit(tx, &terms))
            .await
    }

    pub async fn balance_info(&self, account_id: &str) -> Result<Option<BalanceInfo>, StoreError> {
        let Some(account) = self.store.get_account(account_id).await? else {
            return Ok(None);
        };
        let recent = self
            .store
            .list_transactions(account_id, RECENT_TRANSACTIONS)
            .await?;
        Ok(Some(balance_view(
            &account,
            recent,
            self.config.free_monthly_quota,
            self.clock.now_millis(),
        )))
    }

    /// `None` when the account does not exist.
    pub async fn can_perform(
        &self,
        account_id: &str,
        operation: &str,
    ) -> Result<Option<Eligibility>, StoreError> {
        let Some(account) = self.store.get_account(account_id).await? else {
            return Ok(None);
        };
        Ok(Some(eligibility_view(
            &account,
            operation,
            self.config.pricing.unit_cost(operation),
            self.config.free_monthly_quota,
            self.config.tiers.get(account.tier).monthly_operations,
            self.clock.now_millis(),
        )))
    }
}
