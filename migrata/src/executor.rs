//! Database handle abstraction.
//!
//! The migrator never talks to a driver directly. It drives an [`Executor`],
//! which is implemented for the SQLx connection types of every enabled
//! backend:
//!
//! - `sqlx::SqliteConnection` (feature: `sqlite`)
//! - `sqlx::MySqlConnection` (feature: `mysql`)
//! - `sqlx::PgConnection` (feature: `postgres`)
//!
//! A whole migration run goes through a single connection, so acquire one
//! from your pool first:
//!
//! ```rust,ignore
//! let mut conn = pool.acquire().await?;
//! migrator.apply(Some(&mut *conn), &migrations).await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::migration::AppliedMigration;

/// A positional bind argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Int(i64),
    Timestamp(DateTime<Utc>),
}

/// Connection-level operations the migrator needs.
#[async_trait]
pub trait Executor: Send {
    /// Runs a statement. Without arguments the text is sent as a raw script,
    /// which may hold several statements.
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<(), sqlx::Error>;

    /// Runs a query returning one row with one boolean-like column.
    async fn fetch_flag(&mut self, sql: &str) -> Result<bool, sqlx::Error>;

    /// Runs the tracking table select.
    async fn fetch_applied(&mut self, sql: &str) -> Result<Vec<AppliedMigration>, sqlx::Error>;

    /// Opens a transaction on this connection.
    async fn begin<'a>(&'a mut self) -> Result<Box<dyn Transaction + 'a>, sqlx::Error>;
}

/// An open transaction. Dropping it without committing rolls it back.
#[async_trait]
pub trait Transaction: Send {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<(), sqlx::Error>;

    async fn commit(self: Box<Self>) -> Result<(), sqlx::Error>;

    async fn rollback(self: Box<Self>) -> Result<(), sqlx::Error>;
}

#[cfg(any(feature = "sqlite", feature = "mysql", feature = "postgres"))]
fn bind_values<'q, DB>(
    mut query: sqlx::query::Query<'q, DB, <DB as sqlx::Database>::Arguments<'q>>,
    args: &[Value],
) -> sqlx::query::Query<'q, DB, <DB as sqlx::Database>::Arguments<'q>>
where
    DB: sqlx::Database,
    String: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    i64: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    DateTime<Utc>: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
{
    for arg in args {
        query = match arg {
            Value::Text(value) => query.bind(value.to_owned()),
            Value::Int(value) => query.bind(*value),
            Value::Timestamp(value) => query.bind(*value),
        };
    }

    query
}

macro_rules! sqlx_executor {
    ($db:ty, $conn:ty, $flag:path) => {
        #[async_trait]
        impl Executor for $conn {
            async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<(), sqlx::Error> {
                if args.is_empty() {
                    sqlx::Executor::execute(&mut *self, sqlx::raw_sql(sql)).await?;
                } else {
                    bind_values(sqlx::query::<$db>(sql), args)
                        .execute(&mut *self)
                        .await?;
                }

                Ok(())
            }

            async fn fetch_flag(&mut self, sql: &str) -> Result<bool, sqlx::Error> {
                let row = sqlx::query::<$db>(sql).fetch_one(&mut *self).await?;

                $flag(&row)
            }

            async fn fetch_applied(
                &mut self,
                sql: &str,
            ) -> Result<Vec<AppliedMigration>, sqlx::Error> {
                sqlx::query_as::<$db, AppliedMigration>(sql)
                    .fetch_all(&mut *self)
                    .await
            }

            async fn begin<'a>(
                &'a mut self,
            ) -> Result<Box<dyn Transaction + 'a>, sqlx::Error> {
                let tx = sqlx::Connection::begin(self).await?;

                Ok(Box::new(tx))
            }
        }

        #[async_trait]
        impl<'c> Transaction for sqlx::Transaction<'c, $db> {
            async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<(), sqlx::Error> {
                if args.is_empty() {
                    sqlx::Executor::execute(&mut **self, sqlx::raw_sql(sql)).await?;
                } else {
                    bind_values(sqlx::query::<$db>(sql), args)
                        .execute(&mut **self)
                        .await?;
                }

                Ok(())
            }

            async fn commit(self: Box<Self>) -> Result<(), sqlx::Error> {
                sqlx::Transaction::commit(*self).await
            }

            async fn rollback(self: Box<Self>) -> Result<(), sqlx::Error> {
                sqlx::Transaction::rollback(*self).await
            }
        }
    };
}

#[cfg(feature = "sqlite")]
fn sqlite_flag(row: &sqlx::sqlite::SqliteRow) -> Result<bool, sqlx::Error> {
    use sqlx::Row;

    Ok(row.try_get::<i64, _>(0)? != 0)
}

#[cfg(feature = "sqlite")]
sqlx_executor!(sqlx::Sqlite, sqlx::SqliteConnection, sqlite_flag);

#[cfg(feature = "mysql")]
fn mysql_flag(row: &sqlx::mysql::MySqlRow) -> Result<bool, sqlx::Error> {
    use sqlx::Row;

    get_lock_acquired(row.try_get::<Option<i64>, _>(0)?)
}

/// `GET_LOCK` answers 1 once the lock is held, 0 on timeout and NULL when it
/// failed for another reason, e.g. the thread was killed.
#[cfg(feature = "mysql")]
fn get_lock_acquired(value: Option<i64>) -> Result<bool, sqlx::Error> {
    match value {
        Some(value) => Ok(value == 1),
        None => Err(sqlx::Error::Protocol("GET_LOCK returned NULL".to_owned())),
    }
}

#[cfg(feature = "mysql")]
sqlx_executor!(sqlx::MySql, sqlx::MySqlConnection, mysql_flag);

#[cfg(feature = "postgres")]
fn postgres_flag(row: &sqlx::postgres::PgRow) -> Result<bool, sqlx::Error> {
    use sqlx::Row;

    row.try_get::<bool, _>(0)
}

#[cfg(feature = "postgres")]
sqlx_executor!(sqlx::Postgres, sqlx::PgConnection, postgres_flag);
