//! Defaults and lock tuning.
//!
//! The constants below are what [`Migrator::new`](crate::Migrator::new) and the
//! built-in dialects use unless told otherwise. Lock behaviour can be adjusted
//! per dialect with a [`LockConfig`].

use std::time::Duration;

/// Name of the tracking table when none is given.
pub const DEFAULT_TABLE_NAME: &str = "schema_migrations";

/// Name of the SQLite lease table when none is given.
pub const DEFAULT_LOCK_TABLE: &str = "schema_lock";

/// How long a caller waits for the migration lock before giving up.
///
/// Losers of the lock race wait at most this long for the winner to finish
/// its run, so it should exceed the duration of the slowest expected run.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between two lock attempts while another caller holds the lock.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Lock acquisition settings shared by every dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Upper bound on the time spent acquiring the lock.
    pub timeout: Duration,

    /// Sleep between polling attempts.
    pub retry_interval: Duration,

    /// Lifetime of a lease row before other callers may sweep it.
    /// Only used by lease-table dialects.
    pub lease_duration: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LOCK_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            lease_duration: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl LockConfig {
    pub fn builder() -> LockConfigBuilder {
        LockConfigBuilder::new()
    }
}

/// Builder for [`LockConfig`].
#[derive(Debug)]
pub struct LockConfigBuilder {
    config: LockConfig,
    lease_duration: Option<Duration>,
}

impl LockConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: LockConfig::default(),
            lease_duration: None,
        }
    }

    /// Set the lock acquisition timeout. The lease duration follows it unless
    /// set explicitly.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    pub fn lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = Some(duration);
        self
    }

    pub fn build(self) -> LockConfig {
        LockConfig {
            lease_duration: self.lease_duration.unwrap_or(self.config.timeout),
            ..self.config
        }
    }
}

impl Default for LockConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
