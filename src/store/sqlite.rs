use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior};

use super::{
    AccountStore, ChargeReceipt, CredentialStore, CycleState, LedgerStore, LedgerTx, UsageStore,
    check_deadline,
};
use crate::error::StoreError;
use crate::money::UsdMicros;
use crate::types::{
    Account, ApiKeyRecord, KeyLookup, NewTransaction, Permissions, Tier, TransactionRecord,
    TransactionStatus, UsageRecord,
};

/// SQLite-backed store. Every call opens its own connection on the blocking
/// pool; ledger units of work run under `BEGIN IMMEDIATE` so concurrent
/// charges against one database serialize on the write lock.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            f(&mut conn)
        })
        .await?
    }
}

struct SqliteLedgerTx<'a> {
    conn: &'a rusqlite::Connection,
}

impl LedgerTx for SqliteLedgerTx<'_> {
    fn load_account(&mut self, account_id: &str) -> Result<Option<Account>, StoreError> {
        select_account(self.conn, account_id)
    }

    fn save_cycle(&mut self, account_id: &str, cycle: CycleState) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE accounts
             SET free_operations_used = ?2,
                 cycle_operations = ?3,
                 free_cycle_reset_at_ms = ?4
             WHERE id = ?1",
            rusqlite::params![
                account_id,
                i64::from(cycle.free_operations_used),
                u64_to_i64(cycle.operations),
                u64_to_i64(cycle.reset_at_ms)
            ],
        )?;
        expect_one_row(updated, account_id)
    }

    fn save_balance(&mut self, account_id: &str, balance: UsdMicros) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE accounts SET balance_micros = ?2 WHERE id = ?1",
            rusqlite::params![account_id, balance.micros()],
        )?;
        expect_one_row(updated, account_id)
    }

    fn append_transaction(
        &mut self,
        transaction: NewTransaction,
    ) -> Result<TransactionRecord, StoreError> {
        let status = TransactionStatus::Completed;
        self.conn.execute(
            "INSERT INTO transactions
                (account_id, amount_micros, balance_after_micros, description, status, payment_ref, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                transaction.account_id,
                transaction.amount.micros(),
                transaction.balance_after.micros(),
                transaction.description,
                status.as_str(),
                transaction.payment_ref,
                u64_to_i64(transaction.created_at_ms),
            ],
        )?;
        Ok(TransactionRecord {
            id: self.conn.last_insert_rowid(),
            account_id: transaction.account_id,
            amount: transaction.amount,
            balance_after: transaction.balance_after,
            description: transaction.description,
            status,
            payment_ref: transaction.payment_ref,
            created_at_ms: transaction.created_at_ms,
        })
    }

    fn find_receipt(
        &mut self,
        account_id: &str,
        token: &str,
    ) -> Result<Option<ChargeReceipt>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT receipt_json FROM charge_receipts WHERE account_id = ?1 AND token = ?2",
                rusqlite::params![account_id, token],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    fn put_receipt(&mut self, token: &str, receipt: &ChargeReceipt) -> Result<(), StoreError> {
        let raw = serde_json::to_string(receipt)?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO charge_receipts (account_id, token, receipt_json, created_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                receipt.account_id,
                token,
                raw,
                u64_to_i64(receipt.charged_at_ms)
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!("duplicate receipt {token}")));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn unit_of_work_until<T, F>(
        &self,
        deadline: Option<Instant>,
        work: F,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, StoreError> + Send + 'static,
    {
        self.blocking(move |conn| {
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(StoreError::DeadlineExceeded);
                }
                // Rounded up: sqlite counts whole milliseconds.
                conn.busy_timeout(remaining + Duration::from_millis(1))?;
            }
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| {
                    if deadline.is_some() && is_busy(&err) {
                        StoreError::DeadlineExceeded
                    } else {
                        StoreError::from(err)
                    }
                })?;
            let result = {
                let mut ledger = SqliteLedgerTx { conn: &tx };
                work(&mut ledger)?
            };
            // Dropping `tx` rolls back.
            check_deadline(deadline)?;
            tx.commit()?;
            Ok(result)
        })
        .await
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn lookup(&self, key: &str) -> Result<Option<KeyLookup>, StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT k.account_id, k.permissions_json, k.expires_at_ms, k.revoked_at_ms, a.tier
                     FROM api_keys k
                     LEFT JOIN accounts a ON a.id = k.account_id
                     WHERE k.key = ?1",
                    rusqlite::params![key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<i64>>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                        ))
                    },
                )
                .optional()?;
            let Some((account_id, permissions_json, expires_at_ms, revoked_at_ms, tier)) = row
            else {
                return Ok(None);
            };
            let permissions: Permissions = serde_json::from_str(&permissions_json)?;
            let tier = match tier {
                Some(raw) => parse_tier(&raw)?,
                None => Tier::default(),
            };
            Ok(Some(KeyLookup {
                account_id,
                permissions,
                tier,
                expires_at_ms: expires_at_ms.map(i64_to_u64),
                revoked: revoked_at_ms.is_some(),
            }))
        })
        .await
    }

    async fn touch(&self, key: &str, at_ms: u64) -> Result<(), StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE api_keys SET last_used_at_ms = ?2 WHERE key = ?1",
                rusqlite::params![key, u64_to_i64(at_ms)],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn increment_usage(
        &self,
        account_id: &str,
        operation: &str,
        day_start_ms: u64,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let account_id = account_id.to_string();
        let operation = operation.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO usage_records (account_id, operation, day_start_ms, count, updated_at_ms)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(account_id, operation, day_start_ms)
                 DO UPDATE SET count = count + 1, updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![
                    account_id,
                    operation,
                    u64_to_i64(day_start_ms),
                    u64_to_i64(now_ms)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn usage_since(
        &self,
        account_id: Option<&str>,
        since_ms: u64,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let account_id = account_id.map(str::to_string);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT account_id, operation, day_start_ms, count, updated_at_ms
                 FROM usage_records
                 WHERE day_start_ms >= ?1 AND (?2 IS NULL OR account_id = ?2)
                 ORDER BY day_start_ms, account_id, operation",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![u64_to_i64(since_ms), account_id],
                |row| {
                    Ok(UsageRecord {
                        account_id: row.get(0)?,
                        operation: row.get(1)?,
                        day_start_ms: i64_to_u64(row.get(2)?),
                        count: i64_to_u64(row.get(3)?),
                        updated_at_ms: i64_to_u64(row.get(4)?),
                    })
                },
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl AccountStore for SqliteStore {
    async fn create_account(&self, account: &Account) -> Result<(), StoreError> {
        let account = account.clone();
        self.blocking(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO accounts
                    (id, tier, balance_micros, free_operations_used, free_cycle_reset_at_ms, cycle_operations, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    account.id,
                    account.tier.as_str(),
                    account.balance.micros(),
                    i64::from(account.free_operations_used),
                    u64_to_i64(account.free_cycle_reset_at_ms),
                    u64_to_i64(account.cycle_operations),
                    u64_to_i64(account.created_at_ms),
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("account {} exists", account.id)));
            }
            Ok(())
        })
        .await
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        let account_id = account_id.to_string();
        self.blocking(move |conn| select_account(conn, &account_id))
            .await
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(&format!("{ACCOUNT_COLUMNS} ORDER BY id"))?;
            let rows = stmt.query_map([], account_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row_to_account(row?)?);
            }
            Ok(out)
        })
        .await
    }

    async fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<(), StoreError> {
        let record = record.clone();
        let permissions_json = serde_json::to_string(&record.permissions)?;
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let exists: Option<String> = tx
                .query_row(
                    "SELECT id FROM accounts WHERE id = ?1",
                    rusqlite::params![record.account_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("account {}", record.account_id)));
            }
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO api_keys
                    (key, account_id, name, permissions_json, expires_at_ms, revoked_at_ms, last_used_at_ms, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    record.key,
                    record.account_id,
                    record.name,
                    permissions_json,
                    record.expires_at_ms.map(u64_to_i64),
                    record.revoked_at_ms.map(u64_to_i64),
                    record.last_used_at_ms.map(u64_to_i64),
                    u64_to_i64(record.created_at_ms),
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict("api key exists".to_string()));
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn revoke_api_key(&self, key: &str, at_ms: u64) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let found: Option<Option<i64>> = tx
                .query_row(
                    "SELECT revoked_at_ms FROM api_keys WHERE key = ?1",
                    rusqlite::params![key],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(revoked_at_ms) = found else {
                return Ok(false);
            };
            if revoked_at_ms.is_none() {
                tx.execute(
                    "UPDATE api_keys SET revoked_at_ms = ?2 WHERE key = ?1",
                    rusqlite::params![key, u64_to_i64(at_ms)],
                )?;
            }
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn list_api_keys(&self, account_id: &str) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let account_id = account_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, account_id, name, permissions_json, expires_at_ms, revoked_at_ms, last_used_at_ms, created_at_ms
                 FROM api_keys
                 WHERE account_id = ?1
                 ORDER BY created_at_ms, key",
            )?;
            let rows = stmt.query_map(rusqlite::params![account_id], |row| {
                Ok((
                    ApiKeyRecord {
                        key: row.get(0)?,
                        account_id: row.get(1)?,
                        name: row.get(2)?,
                        permissions: Permissions::default(),
                        expires_at_ms: row.get::<_, Option<i64>>(4)?.map(i64_to_u64),
                        revoked_at_ms: row.get::<_, Option<i64>>(5)?.map(i64_to_u64),
                        last_used_at_ms: row.get::<_, Option<i64>>(6)?.map(i64_to_u64),
                        created_at_ms: i64_to_u64(row.get(7)?),
                    },
                    row.get::<_, String>(3)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (mut record, permissions_json) = row?;
                record.permissions = serde_json::from_str(&permissions_json)?;
                out.push(record);
            }
            Ok(out)
        })
        .await
    }

    async fn list_transactions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let account_id = account_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, account_id, amount_micros, balance_after_micros, description, status, payment_ref, created_at_ms
                 FROM transactions
                 WHERE account_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![account_id, limit], |row| {
                Ok(TransactionRecord {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    amount: UsdMicros::from_micros(row.get(2)?),
                    balance_after: UsdMicros::from_micros(row.get(3)?),
                    description: row.get(4)?,
                    status: TransactionStatus::parse(&row.get::<_, String>(5)?),
                    payment_ref: row.get(6)?,
                    created_at_ms: i64_to_u64(row.get(7)?),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}

const ACCOUNT_COLUMNS: &str = "SELECT id, tier, balance_micros, free_operations_used, free_cycle_reset_at_ms, cycle_operations, created_at_ms
     FROM accounts";

type AccountRow = (String, String, i64, i64, i64, i64, i64);

fn account_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn row_to_account(row: AccountRow) -> Result<Account, StoreError> {
    let (id, tier, balance, used, reset_at, operations, created_at) = row;
    Ok(Account {
        id,
        tier: parse_tier(&tier)?,
        balance: UsdMicros::from_micros(balance),
        free_operations_used: u32::try_from(used.max(0)).unwrap_or(u32::MAX),
        free_cycle_reset_at_ms: i64_to_u64(reset_at),
        cycle_operations: i64_to_u64(operations),
        created_at_ms: i64_to_u64(created_at),
    })
}

fn select_account(
    conn: &rusqlite::Connection,
    account_id: &str,
) -> Result<Option<Account>, StoreError> {
    conn.query_row(
        &format!("{ACCOUNT_COLUMNS} WHERE id = ?1"),
        rusqlite::params![account_id],
        account_row,
    )
    .optional()?
    .map(row_to_account)
    .transpose()
}

fn parse_tier(raw: &str) -> Result<Tier, StoreError> {
    raw.parse().map_err(StoreError::Invalid)
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

fn expect_one_row(updated: usize, account_id: &str) -> Result<(), StoreError> {
    if updated == 0 {
        return Err(StoreError::NotFound(format!("account {account_id}")));
    }
    Ok(())
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY NOT NULL,
            tier TEXT NOT NULL,
            balance_micros INTEGER NOT NULL DEFAULT 0,
            free_operations_used INTEGER NOT NULL DEFAULT 0,
            free_cycle_reset_at_ms INTEGER NOT NULL,
            cycle_operations INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS api_keys (
            key TEXT PRIMARY KEY NOT NULL,
            account_id TEXT NOT NULL,
            name TEXT,
            permissions_json TEXT NOT NULL,
            expires_at_ms INTEGER,
            revoked_at_ms INTEGER,
            last_used_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_api_keys_account_id
            ON api_keys(account_id);

        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            amount_micros INTEGER NOT NULL,
            balance_after_micros INTEGER NOT NULL,
            description TEXT NOT NULL,
            status TEXT NOT NULL,
            payment_ref TEXT,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_transactions_account_id
            ON transactions(account_id, id);

        CREATE TABLE IF NOT EXISTS usage_records (
            account_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            day_start_ms INTEGER NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (account_id, operation, day_start_ms)
        );
        CREATE INDEX IF NOT EXISTS idx_usage_records_day
            ON usage_records(day_start_ms);

        CREATE TABLE IF NOT EXISTS charge_receipts (
            account_id TEXT NOT NULL,
            token TEXT NOT NULL,
            receipt_json TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            PRIMARY KEY (account_id, token)
        );",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store(dir: &tempfile::TempDir) -> SqliteStore {
        let store = SqliteStore::new(dir.path().join("meter.sqlite"));
        store.init().await.expect("init");
        store
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_accounts_and_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;

        let account = Account::new("acct-1", Tier::Pro, 1_000);
        store.create_account(&account).await.expect("create");
        assert!(matches!(
            store.create_account(&account).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.get_account("acct-1").await.expect("get"), Some(account));

        let record = ApiKeyRecord {
            key: "sk_live".to_string(),
            account_id: "acct-1".to_string(),
            name: Some("ci".to_string()),
            permissions: Permissions::from(vec!["compress".to_string()]),
            expires_at_ms: Some(9_000),
            revoked_at_ms: None,
            last_used_at_ms: None,
            created_at_ms: 1_000,
        };
        store.insert_api_key(&record).await.expect("insert key");

        let lookup = store.lookup("sk_live").await.expect("lookup").expect("found");
        assert_eq!(lookup.account_id, "acct-1");
        assert_eq!(lookup.tier, Tier::Pro);
        assert!(lookup.permissions.allows("compress"));
        assert!(!lookup.permissions.allows("ocr"));
        assert_eq!(lookup.expires_at_ms, Some(9_000));
        assert!(!lookup.revoked);

        store.touch("sk_live", 2_000).await.expect("touch");
        assert!(store.revoke_api_key("sk_live", 3_000).await.expect("revoke"));
        assert!(!store.revoke_api_key("missing", 3_000).await.expect("revoke"));
        assert!(store.lookup("sk_live").await.expect("lookup").expect("found").revoked);

        let keys = store.list_api_keys("acct-1").await.expect("list");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].last_used_at_ms, Some(2_000));
        assert_eq!(keys[0].revoked_at_ms, Some(3_000));

        assert!(store.lookup("unknown").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn sqlite_store_key_for_missing_account_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let record = ApiKeyRecord {
            key: "sk_orphan".to_string(),
            account_id: "ghost".to_string(),
            name: None,
            permissions: Permissions::All,
            expires_at_ms: None,
            revoked_at_ms: None,
            last_used_at_ms: None,
            created_at_ms: 0,
        };
        assert!(matches!(
            store.insert_api_key(&record).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn sqlite_store_unit_of_work_commits_or_rolls_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store
            .create_account(&Account::new("acct", Tier::Free, 0))
            .await
            .expect("create");

        let record = store
            .unit_of_work(|tx| {
                tx.save_balance("acct", UsdMicros::from_micros(1_000_000))?;
                tx.append_transaction(NewTransaction {
                    account_id: "acct".to_string(),
                    amount: UsdMicros::from_micros(1_000_000),
                    balance_after: UsdMicros::from_micros(1_000_000),
                    description: "Deposit".to_string(),
                    payment_ref: Some("pay_1".to_string()),
                    created_at_ms: 10,
                })
            })
            .await
            .expect("commit");
        assert_eq!(record.id, 1);

        let result: Result<(), StoreError> = store
            .unit_of_work(|tx| {
                tx.save_balance("acct", UsdMicros::ZERO)?;
                Err(StoreError::Invalid("abort".to_string()))
            })
            .await;
        assert!(result.is_err());

        let account = store.get_account("acct").await.expect("get").expect("found");
        assert_eq!(account.balance.micros(), 1_000_000);

        let transactions = store.list_transactions("acct", 10).await.expect("list");
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].payment_ref.as_deref(), Some("pay_1"));
        assert_eq!(transactions[0].status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn sqlite_store_gives_up_on_write_lock_at_deadline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store
            .create_account(&Account::new("acct", Tier::Free, 0))
            .await
            .expect("create");

        let holder = rusqlite::Connection::open(store.path()).expect("open");
        holder.execute_batch("BEGIN IMMEDIATE").expect("lock");

        let started = Instant::now();
        let result = store
            .unit_of_work_until(Some(started + Duration::from_millis(150)), |tx| {
                tx.save_balance("acct", UsdMicros::from_micros(9))
            })
            .await;
        assert!(matches!(result, Err(StoreError::DeadlineExceeded)), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(2));

        holder.execute_batch("COMMIT").expect("unlock");
        let account = store.get_account("acct").await.expect("get").expect("found");
        assert_eq!(account.balance, UsdMicros::ZERO);
    }

    #[tokio::test]
    async fn sqlite_store_rolls_back_work_that_overruns_deadline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store
            .create_account(&Account::new("acct", Tier::Free, 0))
            .await
            .expect("create");

        let deadline = Instant::now() + Duration::from_millis(50);
        let result = store
            .unit_of_work_until(Some(deadline), |tx| {
                tx.save_cycle(
                    "acct",
                    CycleState {
                        free_operations_used: 1,
                        operations: 1,
                        reset_at_ms: 10,
                    },
                )?;
                std::thread::sleep(Duration::from_millis(100));
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::DeadlineExceeded)));

        let account = store.get_account("acct").await.expect("get").expect("found");
        assert_eq!(account.free_operations_used, 0);
        assert_eq!(account.cycle_operations, 0);
    }

    #[tokio::test]
    async fn sqlite_store_receipts_are_unique_per_account_and_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let receipt = ChargeReceipt {
            account_id: "acct".to_string(),
            operation: "merge".to_string(),
            used_free: true,
            free_remaining: 499,
            balance: UsdMicros::ZERO,
            cost: UsdMicros::ZERO,
            transaction_id: None,
            idempotency_token: Some("req-1".to_string()),
            charged_at_ms: 5,
            replayed: false,
        };

        let stored = receipt.clone();
        store
            .unit_of_work(move |tx| tx.put_receipt("req-1", &stored))
            .await
            .expect("put");
        let found = store
            .unit_of_work(|tx| tx.find_receipt("acct", "req-1"))
            .await
            .expect("find");
        assert_eq!(found, Some(receipt.clone()));

        let duplicate = store
            .unit_of_work(move |tx| tx.put_receipt("req-1", &receipt))
            .await;
        assert!(matches!(duplicate, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn sqlite_store_usage_upserts_per_day() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir).await;

        for _ in 0..3 {
            store
                .increment_usage("acct", "ocr", 86_400_000, 86_400_500)
                .await
                .expect("increment");
        }
        store
            .increment_usage("acct", "ocr", 172_800_000, 172_800_100)
            .await
            .expect("increment");
        store
            .increment_usage("other", "merge", 172_800_000, 172_800_100)
            .await
            .expect("increment");

        let all = store.usage_since(None, 0).await.expect("all");
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].count, 3);

        let recent = store
            .usage_since(Some("acct"), 172_800_000)
            .await
            .expect("recent");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].count, 1);
    }
}
