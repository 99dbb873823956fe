use std::{any::Any, sync::Arc};

/// Failures raised while applying migrations.
///
/// The type is `Clone` so that a [`Migrator`](crate::Migrator) can hand the
/// same latched failure back on every later call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("no database handle provided")]
    NoDatabase,

    #[error("{0}: timeout requesting lock")]
    LockTimeout(&'static str),

    #[error("failed to begin transaction: {0}")]
    BeginFailed(#[source] Arc<sqlx::Error>),

    #[error("migrator already failed, operation skipped")]
    PriorFailure,

    #[error("migration `{id}` failed: {source}")]
    Script {
        id: String,
        source: Arc<sqlx::Error>,
    },

    #[error("{0}")]
    Panic(String),

    #[error("failed to read applied migrations: {0}")]
    Query(#[source] Arc<sqlx::Error>),

    #[error("duplicate migration id `{0}`")]
    DuplicateMigration(String),

    #[error("sqlx `{0}`")]
    Sqlx(#[source] Arc<sqlx::Error>),

    #[error("io `{0}`")]
    Io(#[source] Arc<std::io::Error>),
}

impl Error {
    pub(crate) fn begin(err: sqlx::Error) -> Self {
        Self::BeginFailed(Arc::new(err))
    }

    pub(crate) fn script(id: impl Into<String>, err: sqlx::Error) -> Self {
        Self::Script {
            id: id.into(),
            source: Arc::new(err),
        }
    }

    pub(crate) fn query(err: sqlx::Error) -> Self {
        Self::Query(Arc::new(err))
    }

    /// Converts a caught panic payload, keeping its message verbatim.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        if let Some(msg) = payload.downcast_ref::<&'static str>() {
            return Self::Panic((*msg).to_owned());
        }

        if let Some(msg) = payload.downcast_ref::<String>() {
            return Self::Panic(msg.to_owned());
        }

        if let Some(err) = payload.downcast_ref::<Error>() {
            return Self::Panic(err.to_string());
        }

        if let Some(err) = payload.downcast_ref::<Box<dyn std::error::Error + Send + Sync>>() {
            return Self::Panic(err.to_string());
        }

        if let Some(err) = payload.downcast_ref::<sqlx::Error>() {
            return Self::Panic(err.to_string());
        }

        Self::Panic("migration panicked with a non-string payload".to_owned())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Sqlx(Arc::new(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payload_message_is_kept() {
        let err = Error::from_panic(Box::new("Panic String"));
        assert_eq!(err.to_string(), "Panic String");

        let err = Error::from_panic(Box::new(String::from("Panic Owned")));
        assert_eq!(err.to_string(), "Panic Owned");

        let boxed: Box<dyn std::error::Error + Send + Sync> = "Panic Error".into();
        let err = Error::from_panic(Box::new(boxed));
        assert_eq!(err.to_string(), "Panic Error");

        let err = Error::from_panic(Box::new(42_u8));
        assert!(matches!(err, Error::Panic(_)));
    }

    #[test]
    fn script_error_keeps_driver_message() {
        let err = Error::script(
            "2019-01-01 Bad Migration",
            sqlx::Error::Protocol("near \"TIBBLE\": syntax error".to_owned()),
        );

        let msg = err.to_string();
        assert!(msg.contains("2019-01-01 Bad Migration"));
        assert!(msg.contains("TIBBLE"));
    }
}
