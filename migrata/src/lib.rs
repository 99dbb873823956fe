#![forbid(unsafe_code)]

//! Applies ordered SQL migrations exactly once.
//!
//! Migrations run in ascending lexical order of their id, each inside its own
//! transaction together with the insert of its tracking row. Concurrent
//! callers are serialized by a database level lock, so a migration is never
//! executed twice even when several processes start at the same time.
//!
//! ```rust,ignore
//! use migrata::{Migration, Migrator, SqliteDialect};
//!
//! let migrations = vec![
//!     Migration::new("2024-01-01 001 Create users", "CREATE TABLE users (id INTEGER)"),
//!     Migration::new("2024-01-02 001 Seed users", "INSERT INTO users VALUES (1)"),
//! ];
//!
//! let mut conn = pool.acquire().await?;
//! Migrator::new()
//!     .dialect(SqliteDialect::new())
//!     .apply(Some(&mut *conn), &migrations)
//!     .await?;
//! ```

pub mod config;

mod dialect;
mod error;
mod executor;
mod migration;
mod migrator;

pub use dialect::*;
pub use error::*;
pub use executor::*;
pub use migration::*;
pub use migrator::*;
