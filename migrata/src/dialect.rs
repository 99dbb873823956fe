//! Database specific SQL and locking.
//!
//! A [`Dialect`] supplies the statements the migrator runs against the
//! tracking table, and optionally a [`Locker`] used to serialize concurrent
//! migration runs across processes:
//!
//! | dialect | lock |
//! |---------|------|
//! | [`PostgresDialect`] | session advisory lock (`pg_try_advisory_lock`) |
//! | [`MySqlDialect`] | named lock (`GET_LOCK`) |
//! | [`SqliteDialect`] | lease row in a lock table, polled client side |

use async_trait::async_trait;
use sha3::{Digest, Sha3_256};

use crate::{error::Result, executor::Executor};

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::*;
pub use postgres::*;
pub use sqlite::*;

/// Proof of lock ownership for one migration run.
///
/// Returned by [`Locker::lock`] and handed back to [`Locker::unlock`], so the
/// owner identity lives with the run and never inside a shared dialect value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Tracking table the lock was taken for.
    pub table: String,
    /// Token identifying the owner of the lock.
    pub owner: String,
}

/// Cross-process mutual exclusion for migration runs.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Blocks until the caller owns the migration lock of `table`, or fails
    /// with [`Error::LockTimeout`](crate::Error::LockTimeout) once the
    /// configured timeout elapsed. No lock is held after a failure.
    async fn lock(&self, db: &mut dyn Executor, table: &str) -> Result<Lease>;

    /// Releases the lock if `lease` still owns it.
    async fn unlock(&self, db: &mut dyn Executor, lease: Lease) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialect {
    Postgres(PostgresDialect),
    Sqlite(SqliteDialect),
    MySql(MySqlDialect),
}

impl Default for Dialect {
    fn default() -> Self {
        Self::postgres()
    }
}

impl Dialect {
    pub fn postgres() -> Self {
        Self::Postgres(PostgresDialect::default())
    }

    pub fn sqlite() -> Self {
        Self::Sqlite(SqliteDialect::default())
    }

    pub fn mysql() -> Self {
        Self::MySql(MySqlDialect::default())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Sqlite(_) => "sqlite",
            Self::MySql(_) => "mysql",
        }
    }

    /// Idempotent statement creating the tracking table.
    pub fn create_sql(&self, table: &str) -> String {
        match self {
            Self::Postgres(d) => d.create_sql(table),
            Self::Sqlite(d) => d.create_sql(table),
            Self::MySql(d) => d.create_sql(table),
        }
    }

    /// Insert of one tracking row. Binds id, checksum, execution time in
    /// milliseconds and applied-at, in that order.
    pub fn insert_sql(&self, table: &str) -> String {
        match self {
            Self::Postgres(d) => d.insert_sql(table),
            Self::Sqlite(d) => d.insert_sql(table),
            Self::MySql(d) => d.insert_sql(table),
        }
    }

    /// Select of every tracking row ordered by id.
    pub fn select_sql(&self, table: &str) -> String {
        format!(
            "SELECT id, checksum, execution_time_in_millis, applied_at FROM {table} ORDER BY id ASC"
        )
    }

    /// Quotes the tracking table name, dropping quote characters embedded in
    /// either part.
    pub fn quoted_table_name(&self, schema: Option<&str>, table: &str) -> String {
        match self {
            Self::Postgres(d) => d.quoted_table_name(schema, table),
            Self::Sqlite(d) => d.quoted_table_name(schema, table),
            Self::MySql(d) => d.quoted_table_name(schema, table),
        }
    }

    /// Lock statement for dialects whose lock is plain SQL.
    pub fn lock_sql(&self, table: &str) -> Option<String> {
        match self {
            Self::Postgres(d) => Some(d.lock_sql(table)),
            Self::MySql(d) => Some(d.lock_sql(table)),
            Self::Sqlite(_) => None,
        }
    }

    /// Unlock statement for dialects whose lock is plain SQL.
    pub fn unlock_sql(&self, table: &str) -> Option<String> {
        match self {
            Self::Postgres(d) => Some(d.unlock_sql(table)),
            Self::MySql(d) => Some(d.unlock_sql(table)),
            Self::Sqlite(_) => None,
        }
    }

    pub fn supports_locking(&self) -> bool {
        self.locker().is_some()
    }

    pub fn locker(&self) -> Option<&dyn Locker> {
        match self {
            Self::Postgres(d) => Some(d),
            Self::MySql(d) => Some(d),
            Self::Sqlite(d) if d.lock_table().is_some() => Some(d),
            Self::Sqlite(_) => None,
        }
    }
}

impl From<PostgresDialect> for Dialect {
    fn from(value: PostgresDialect) -> Self {
        Self::Postgres(value)
    }
}

impl From<SqliteDialect> for Dialect {
    fn from(value: SqliteDialect) -> Self {
        Self::Sqlite(value)
    }
}

impl From<MySqlDialect> for Dialect {
    fn from(value: MySqlDialect) -> Self {
        Self::MySql(value)
    }
}

/// Numeric lock key derived from a table name. Stable across processes and
/// builds.
pub(crate) fn lock_key(table: &str) -> i64 {
    let digest = Sha3_256::digest(table.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);

    i64::from_be_bytes(bytes)
}

pub(crate) fn quote_ident(ident: &str, quote: char) -> String {
    let stripped: String = ident.chars().filter(|c| *c != quote).collect();

    format!("{quote}{stripped}{quote}")
}
