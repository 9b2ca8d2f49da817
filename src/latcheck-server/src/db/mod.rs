//! Database layer: bounded connection pool, schema and typed DAOs.
//!
//! The pool lends raw connections; every DAO statement runs on a borrowed
//! connection, and multi-statement operations (report ingest, bootstrap
//! upserts) run inside a transaction bound to a single borrowed connection.

/// Bounded pool over raw `sqlx` connections
pub mod pool;
/// Report header + record persistence (transactional ingest)
pub mod report_dao;
/// Table DDL for supported backends
pub mod schema;
/// Test-server list access and upserts
pub mod server_dao;
/// User rows and credential rotation
pub mod user_dao;

pub use pool::{DbPool, PoolOptions, PooledConn};
pub use report_dao::ReportDao;
pub use server_dao::ServerDao;
pub use user_dao::UserDao;

use latcheck_proto::ResultCode;
use std::time::Duration;
use thiserror::Error;

/// Pool-level and driver-level failures.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to open database connection: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("transaction failed: {0}")]
    Transaction(#[source] sqlx::Error),

    #[error("no database connection became available within {0:?}")]
    AcquireTimeout(Duration),

    #[error("database pool is closed")]
    PoolClosed,

    #[error("unexpected row shape: {0}")]
    Decode(String),
}

impl DbError {
    /// Wire result code for this failure.
    pub fn result_code(&self) -> ResultCode {
        match self {
            DbError::Connect(_) | DbError::AcquireTimeout(_) | DbError::PoolClosed => {
                ResultCode::ConnectionFailed
            }
            DbError::Query(_) | DbError::Decode(_) => ResultCode::QueryFailed,
            DbError::Transaction(_) => ResultCode::TransactionFailed,
        }
    }
}

/// DAO-level failures: input validation on top of [`DbError`].
#[derive(Debug, Error)]
pub enum DaoError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("username already exists")]
    UserExists,

    #[error("user not found")]
    UserNotFound,

    #[error("password too short")]
    PasswordTooShort,

    #[error(transparent)]
    Db(#[from] DbError),
}

impl DaoError {
    /// Wire result code for this failure.
    pub fn result_code(&self) -> ResultCode {
        match self {
            DaoError::InvalidParameter(_) => ResultCode::InvalidParameter,
            DaoError::UserExists => ResultCode::UserExists,
            DaoError::UserNotFound => ResultCode::UserNotFound,
            DaoError::PasswordTooShort => ResultCode::PasswordTooShort,
            DaoError::Db(e) => e.result_code(),
        }
    }
}
