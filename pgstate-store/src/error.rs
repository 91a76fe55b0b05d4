//! Classified errors for every store operation.
//!
//! The adapter and engine return sum-type results rather than raising; the
//! gRPC layer owns the translation to wire statuses. [`StoreError::TableMissing`]
//! never crosses the engine boundary: a missing tenant table is equivalent to
//! an absence of data on the read and delete paths.

use thiserror::Error;
use tokio_postgres::error::SqlState;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Rejected component configuration; fails `Init`.
    #[error("invalid component configuration: {0}")]
    Config(String),

    /// An operation arrived before a successful `Init`.
    #[error("state store has not been initialized")]
    NotInitialized,

    /// The configured tenant mode requires `metadata.tenantId` and it was
    /// absent or empty.
    #[error("the configured tenant mode requires a non-empty metadata.tenantId")]
    MissingTenant,

    /// A caller-supplied etag could not be parsed under the store's
    /// representation. No SQL was sent.
    #[error("etag {0:?} is not a valid row-version token")]
    EtagInvalid(String),

    /// A conditional write or delete matched zero rows.
    #[error("etag does not match the stored row")]
    EtagMismatch,

    /// The target table (or its schema) does not exist.
    #[error("target table does not exist")]
    TableMissing,

    /// Malformed per-operation input: bad ttl, non-JSON value, oversized
    /// identifier.
    #[error("{0}")]
    InvalidArgument(String),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("database error: {0}")]
    Postgres(tokio_postgres::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        let code = err.code();
        if code == Some(&SqlState::UNDEFINED_TABLE) || code == Some(&SqlState::INVALID_SCHEMA_NAME)
        {
            StoreError::TableMissing
        } else {
            StoreError::Postgres(err)
        }
    }
}

impl StoreError {
    /// Whether the error stems from the database connection itself rather
    /// than from the statement that ran on it.
    pub fn is_transport(&self) -> bool {
        match self {
            StoreError::Pool(_) => true,
            StoreError::Postgres(err) => err.is_closed() || err.as_db_error().is_none(),
            _ => false,
        }
    }
}
