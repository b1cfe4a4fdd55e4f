use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::money::UsdMicros;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Basic, Tier::Pro, Tier::Enterprise];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

pub const WILDCARD_PERMISSION: &str = "*";

/// Operations an API key may run. Persisted as a list of names where `"*"`
/// grants everything.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub enum Permissions {
    All,
    Only(BTreeSet<String>),
}

impl Permissions {
    pub fn allows(&self, operation: &str) -> bool {
        match self {
            Permissions::All => true,
            Permissions::Only(names) => names.contains(operation),
        }
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions::Only(BTreeSet::new())
    }
}

impl From<Vec<String>> for Permissions {
    fn from(names: Vec<String>) -> Self {
        if names.iter().any(|name| name == WILDCARD_PERMISSION) {
            return Permissions::All;
        }
        Permissions::Only(
            names
                .into_iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
        )
    }
}

impl From<Permissions> for Vec<String> {
    fn from(permissions: Permissions) -> Self {
        match permissions {
            Permissions::All => vec![WILDCARD_PERMISSION.to_string()],
            Permissions::Only(names) => names.into_iter().collect(),
        }
    }
}

/// Billable tenant. Balance and quota fields only change inside a ledger
/// unit of work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub balance: UsdMicros,
    #[serde(default)]
    pub free_operations_used: u32,
    #[serde(default)]
    pub free_cycle_reset_at_ms: u64,
    /// Operations charged in the cycle ending at `free_cycle_reset_at_ms`,
    /// free or paid. Checked against the tier's monthly ceiling.
    #[serde(default)]
    pub cycle_operations: u64,
    #[serde(default)]
    pub created_at_ms: u64,
}

impl Account {
    pub fn new(id: impl Into<String>, tier: Tier, now_ms: u64) -> Self {
        Self {
            id: id.into(),
            tier,
            balance: UsdMicros::ZERO,
            free_operations_used: 0,
            free_cycle_reset_at_ms: crate::clock::next_month_start(now_ms),
            cycle_operations: 0,
            created_at_ms: now_ms,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    pub account_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub permissions: Permissions,
    #[serde(default)]
    pub expires_at_ms: Option<u64>,
    #[serde(default)]
    pub revoked_at_ms: Option<u64>,
    #[serde(default)]
    pub last_used_at_ms: Option<u64>,
    pub created_at_ms: u64,
}

impl fmt::Debug for ApiKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyRecord")
            .field("key", &"<redacted>")
            .field("account_id", &self.account_id)
            .field("name", &self.name)
            .field("permissions", &self.permissions)
            .field("expires_at_ms", &self.expires_at_ms)
            .field("revoked_at_ms", &self.revoked_at_ms)
            .field("last_used_at_ms", &self.last_used_at_ms)
            .field("created_at_ms", &self.created_at_ms)
            .finish()
    }
}

/// What the credential store knows about a key, joined with the owning
/// account's tier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyLookup {
    pub account_id: String,
    pub permissions: Permissions,
    pub tier: Tier,
    pub expires_at_ms: Option<u64>,
    pub revoked: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    #[default]
    Completed,
    Pending,
    Failed,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Completed => "completed",
            TransactionStatus::Pending => "pending",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Refunded => "refunded",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => TransactionStatus::Pending,
            "failed" => TransactionStatus::Failed,
            "refunded" => TransactionStatus::Refunded,
            _ => TransactionStatus::Completed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTransaction {
    pub account_id: String,
    pub amount: UsdMicros,
    pub balance_after: UsdMicros,
    pub description: String,
    pub payment_ref: Option<String>,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub account_id: String,
    pub amount: UsdMicros,
    pub balance_after: UsdMicros,
    pub description: String,
    pub status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_ref: Option<String>,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub account_id: String,
    pub operation: String,
    pub day_start_ms: u64,
    pub count: u64,
    pub updated_at_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub account_id: String,
    pub tier: Tier,
    pub balance: UsdMicros,
    pub free_operations_used: u32,
    pub free_operations_remaining: u32,
    pub free_operations_reset_at_ms: u64,
    pub operations_this_cycle: u64,
    pub recent_transactions: Vec<TransactionRecord>,
}
