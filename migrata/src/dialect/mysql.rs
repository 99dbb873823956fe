use async_trait::async_trait;

use crate::{
    config::LockConfig,
    dialect::{lock_key, quote_ident, Lease, Locker},
    error::{Error, Result},
    executor::Executor,
};

/// MySQL dialect.
///
/// Runs are serialized with a named lock (`GET_LOCK`), which waits server side
/// for at most [`LockConfig::timeout`]. MySQL commits implicitly around DDL,
/// so a failing script may leave part of its statements applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MySqlDialect {
    lock: LockConfig,
}

impl MySqlDialect {
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
                id VARCHAR(255) NOT NULL,
                checksum VARCHAR(64) NOT NULL DEFAULT '',
                execution_time_in_millis BIGINT NOT NULL DEFAULT 0,
                applied_at TIMESTAMP(6) NOT NULL,
                PRIMARY KEY (id)
            )
            "#
        )
    }

    pub fn insert_sql(&self, table: &str) -> String {
        format!(
            "INSERT INTO {table} (id, checksum, execution_time_in_millis, applied_at) VALUES (?, ?, ?, ?)"
        )
    }

    pub fn quoted_table_name(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(schema) if !schema.is_empty() => {
                format!("{}.{}", quote_ident(schema, '`'), quote_ident(table, '`'))
            }
            _ => quote_ident(table, '`'),
        }
    }

    pub fn lock_sql(&self, table: &str) -> String {
        // GET_LOCK takes whole seconds, round up so the wait is never shorter.
        let timeout = self.lock.timeout.as_secs()
            + u64::from(self.lock.timeout.subsec_nanos() > 0);

        format!("SELECT GET_LOCK('{}', {timeout})", lock_name(table))
    }

    pub fn unlock_sql(&self, table: &str) -> String {
        format!("SELECT RELEASE_LOCK('{}')", lock_name(table))
    }
}

fn lock_name(table: &str) -> String {
    format!("migrata_{:016x}", lock_key(table))
}

#[async_trait]
impl Locker for MySqlDialect {
    async fn lock(&self, db: &mut dyn Executor, table: &str) -> Result<Lease> {
        // A NULL answer comes back as a driver error, only 0 is a timeout.
        if !db.fetch_flag(&self.lock_sql(table)).await? {
            return Err(Error::LockTimeout("mysql"));
        }

        Ok(Lease {
            table: table.to_owned(),
            owner: lock_name(table),
        })
    }

    async fn unlock(&self, db: &mut dyn Executor, lease: Lease) -> Result<()> {
        // RELEASE_LOCK leaves locks held by other sessions untouched.
        db.execute(&self.unlock_sql(&lease.table), &[]).await?;

        Ok(())
    }
}
