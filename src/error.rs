//! Error types for replica-router

use std::time::Duration;

use thiserror::Error;

use crate::routing::TargetKey;

/// SQLSTATE raised by the engine when a read-only transaction attempts a write.
pub const READ_ONLY_SQLSTATE: &str = "25006";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("pool '{pool}' could not supply a connection within {waited:?}")]
    AcquireTimeout { pool: String, waited: Duration },

    #[error("pool '{pool}' failed to create a connection after {attempts} attempt(s): {source}")]
    PoolExhausted {
        pool: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("read-only violation: {message}")]
    ReadOnlyViolation { message: String },

    #[error("no connection pool is registered for routing target '{target}'")]
    RoutingLookupFailure { target: TargetKey },

    #[error("pool '{pool}' is closed")]
    PoolClosed { pool: String },

    #[error("connection attempt timed out after {timeout:?}")]
    ConnectTimeout { timeout: Duration },

    #[error("transaction '{name}' was rolled back because it was marked rollback-only")]
    UnexpectedRollback { name: String },

    #[error("invalid pool settings: {0}")]
    Configuration(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl Error {
    /// Whether a failed connection attempt is worth repeating.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ConnectTimeout { .. } => true,
            Error::Database(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::WorkerCrashed => true,
                // connection exceptions (08), insufficient resources (53), startup in progress
                sqlx::Error::Database(db) => db
                    .code()
                    .map(|code| {
                        code.starts_with("08") || code.starts_with("53") || code == "57P03"
                    })
                    .unwrap_or(false),
                _ => false,
            },
            _ => false,
        }
    }

    /// Whether the underlying connection should be considered unusable.
    pub fn is_connection_broken(&self) -> bool {
        matches!(
            self,
            Error::Database(
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::WorkerCrashed
            )
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(READ_ONLY_SQLSTATE) {
                return Error::ReadOnlyViolation {
                    message: db.message().to_string(),
                };
            }
        }
        Error::Database(err)
    }
}
