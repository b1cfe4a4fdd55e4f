//! Metering and billing core for a PDF processing service: API key
//! validation, per-tier rate limits, a free monthly quota, prepaid balance
//! charges, and usage aggregation.

pub mod cache;
pub mod clock;
pub mod config;
pub mod env;
mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod ledger;
pub mod limits;
pub mod meter;
pub mod money;
pub mod observability;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod usage;

pub use cache::{AuthorizedKey, KeyValidation, KeyValidationCache, UnauthorizedReason};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FailurePolicy, MeterConfig, TierLimits, TierTable};
pub use env::Env;
pub use error::{ConfigError, MeterError, RateLimitError, StoreError};
pub use ledger::{Eligibility, Ledger, LedgerDecision};
pub use limits::{InMemoryRateLimiter, RateLimitDecision, RateLimiter};
pub use meter::{ChargeOutcome, ChargeRequest, DeclineReason, Meter, MeterBuilder};
pub use money::UsdMicros;
pub use observability::{Observability, ObservabilitySnapshot};
pub use store::{ChargeReceipt, MemoryStore, MeterStore};
pub use types::{Account, ApiKeyRecord, BalanceInfo, Permissions, Tier, TransactionRecord};
pub use usage::{UsageAggregator, UsageReport};

#[cfg(feature = "store-redis")]
pub use limits::RedisRateLimiter;
#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;
