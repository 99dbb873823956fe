use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::{
    config::{LockConfig, DEFAULT_LOCK_TABLE},
    dialect::{quote_ident, Lease, Locker},
    error::{Error, Result},
    executor::{Executor, Value},
};

/// Id of the single lease row.
const LEASE_ID: i64 = 1;

/// SQLite dialect.
///
/// SQLite has no advisory locks, so runs are serialized through a lease row
/// in a dedicated lock table. Callers poll until they manage to insert the row
/// or the timeout elapses. Leases carry an expiration so a crashed owner does
/// not block everyone forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteDialect {
    lock_table: Option<String>,
    lock: LockConfig,
}

impl Default for SqliteDialect {
    fn default() -> Self {
        Self {
            lock_table: Some(DEFAULT_LOCK_TABLE.to_owned()),
            lock: LockConfig::default(),
        }
    }
}

impl SqliteDialect {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dialect without cross-process locking, for databases only one process
    /// ever migrates.
    pub fn without_lock() -> Self {
        Self {
            lock_table: None,
            ..Self::default()
        }
    }

    pub fn with_lock_table(mut self, name: impl Into<String>) -> Self {
        self.lock_table = Some(name.into());
        self
    }

    pub fn lock_config(mut self, config: LockConfig) -> Self {
        self.lock = config;
        self
    }

    pub fn lock_table(&self) -> Option<&str> {
        self.lock_table.as_deref()
    }

    pub fn create_sql(&self, table: &str) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT NOT NULL PRIMARY KEY,
                checksum TEXT NOT NULL DEFAULT '',
                execution_time_in_millis INTEGER NOT NULL DEFAULT 0,
                applied_at DATETIME NOT NULL
            )
            "#
        )
    }

    pub fn insert_sql(&self, table: &str) -> String {
        format!(
            "INSERT INTO {table} (id, checksum, execution_time_in_millis, applied_at) VALUES (?, ?, ?, ?)"
        )
    }

    /// SQLite has no schemas, `schema` is ignored.
    pub fn quoted_table_name(&self, _schema: Option<&str>, table: &str) -> String {
        quote_ident(table, '"')
    }

    fn quoted_lock_table(&self) -> String {
        quote_ident(self.lock_table().unwrap_or(DEFAULT_LOCK_TABLE), '"')
    }
}

/// SQLITE_CONSTRAINT and its PRIMARYKEY / UNIQUE extended codes.
fn is_constraint_violation(err: &dyn sqlx::error::DatabaseError) -> bool {
    err.is_unique_violation() || matches!(err.code().as_deref(), Some("19" | "1555" | "2067"))
}

#[async_trait]
impl Locker for SqliteDialect {
    async fn lock(&self, db: &mut dyn Executor, table: &str) -> Result<Lease> {
        let lock_table = self.quoted_lock_table();

        db.execute(
            &format!(
                r#"
                CREATE TABLE IF NOT EXISTS {lock_table} (
                    id INTEGER PRIMARY KEY,
                    code TEXT NOT NULL,
                    expiration DATETIME NOT NULL
                )
                "#
            ),
            &[],
        )
        .await?;

        let sweep = format!("DELETE FROM {lock_table} WHERE julianday(expiration) < julianday(?)");
        let insert = format!("INSERT INTO {lock_table} (id, code, expiration) VALUES (?, ?, ?)");
        let deadline = Instant::now() + self.lock.timeout;

        loop {
            db.execute(&sweep, &[Value::Timestamp(Utc::now())]).await?;

            let owner = Uuid::new_v4().to_string();
            let expiration = chrono::Duration::from_std(self.lock.lease_duration)
                .ok()
                .and_then(|lease| Utc::now().checked_add_signed(lease))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);

            let res = db
                .execute(
                    &insert,
                    &[
                        Value::Int(LEASE_ID),
                        Value::Text(owner.to_owned()),
                        Value::Timestamp(expiration),
                    ],
                )
                .await;

            match res {
                Ok(()) => {
                    return Ok(Lease {
                        table: table.to_owned(),
                        owner,
                    })
                }
                Err(sqlx::Error::Database(err)) if is_constraint_violation(err.as_ref()) => {}
                Err(err) => return Err(err.into()),
            }

            if Instant::now() + self.lock.retry_interval > deadline {
                return Err(Error::LockTimeout("sqlite"));
            }

            sleep(self.lock.retry_interval).await;
        }
    }

    async fn unlock(&self, db: &mut dyn Executor, lease: Lease) -> Result<()> {
        // Matching on the owner keeps us from deleting a lease somebody else
        // took over after ours expired.
        db.execute(
            &format!(
                "DELETE FROM {} WHERE id = ? AND code = ?",
                self.quoted_lock_table()
            ),
            &[Value::Int(LEASE_ID), Value::Text(lease.owner)],
        )
        .await?;

        Ok(())
    }
}
