use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use crate::{
    config::LockConfig,
    dialect::{lock_key, quote_ident, Lease, Locker},
    error::{Error, Result},
    executor::Executor,
};

/// PostgreSQL dialect.
///
/// Runs are serialized with a session level advisory lock keyed by the
/// tracking table name. The lock is polled with `pg_try_advisory_lock` so
/// that waiting is bounded by [`LockConfig::timeout`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostgresDialect {
    lock: LockConfig,
}

impl PostgresDialect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_config(mut self, config: LockConfig) -> Self {
        self.lock = config;
        self
    }

    pub fn create_sql(&self, table: &str) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT NOT NULL PRIMARY KEY,
                checksum TEXT NOT NULL DEFAULT '',
                execution_time_in_millis BIGINT NOT NULL DEFAULT 0,
                applied_at TIMESTAMP WITH TIME ZONE NOT NULL
            )
            "#
        )
    }

    pub fn insert_sql(&self, table: &str) -> String {
        format!(
            "INSERT INTO {table} (id, checksum, execution_time_in_millis, applied_at) VALUES ($1, $2, $3, $4)"
        )
    }

    pub fn quoted_table_name(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(schema) if !schema.is_empty() => {
                format!("{}.{}", quote_ident(schema, '"'), quote_ident(table, '"'))
            }
            _ => quote_ident(table, '"'),
        }
    }

    pub fn lock_sql(&self, table: &str) -> String {
        format!("SELECT pg_try_advisory_lock({})", lock_key(table))
    }

    pub fn unlock_sql(&self, table: &str) -> String {
        format!("SELECT pg_advisory_unlock({})", lock_key(table))
    }
}

#[async_trait]
impl Locker for PostgresDialect {
    async fn lock(&self, db: &mut dyn Executor, table: &str) -> Result<Lease> {
        let sql = self.lock_sql(table);
        let deadline = Instant::now() + self.lock.timeout;

        loop {
            if db.fetch_flag(&sql).await? {
                return Ok(Lease {
                    table: table.to_owned(),
                    owner: lock_key(table).to_string(),
                });
            }

            if Instant::now() + self.lock.retry_interval > deadline {
                return Err(Error::LockTimeout("postgres"));
            }

            sleep(self.lock.retry_interval).await;
        }
    }

    async fn unlock(&self, db: &mut dyn Executor, lease: Lease) -> Result<()> {
        // pg_advisory_unlock only releases locks held by this session.
        db.execute(&self.unlock_sql(&lease.table), &[]).await?;

        Ok(())
    }
}
