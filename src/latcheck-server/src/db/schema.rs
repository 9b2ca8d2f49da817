//! Table DDL for supported backends.
//!
//! Timestamps are stored as epoch seconds so the same DAO code runs on MySQL
//! in production and SQLite in tests. `apply_schema` picks the dialect from
//! the connection URL.

use sqlx::AnyConnection;

use super::DbError;

/// DDL for MySQL deployments.
pub const MYSQL_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        user_id BIGINT PRIMARY KEY AUTO_INCREMENT,
        username VARCHAR(32) NOT NULL UNIQUE,
        password_hash VARCHAR(64) NOT NULL,
        salt VARCHAR(64) NOT NULL,
        role BIGINT NOT NULL,
        status BIGINT NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        last_login_at BIGINT
    )",
    "CREATE TABLE IF NOT EXISTS test_server (
        server_id BIGINT PRIMARY KEY AUTO_INCREMENT,
        location VARCHAR(128) NOT NULL UNIQUE,
        ip_addr BIGINT NOT NULL,
        active BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS latcheck_report (
        report_id BIGINT PRIMARY KEY AUTO_INCREMENT,
        check_location VARCHAR(128) NOT NULL,
        user_name VARCHAR(32) NOT NULL,
        created_time BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS report_record (
        record_id BIGINT PRIMARY KEY AUTO_INCREMENT,
        report_id BIGINT NOT NULL,
        server_ip BIGINT NOT NULL,
        server_id BIGINT NOT NULL,
        latency BIGINT NOT NULL,
        CONSTRAINT fk_report FOREIGN KEY (report_id) REFERENCES latcheck_report (report_id)
    )",
];

/// DDL for SQLite (tests and small deployments).
pub const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        user_id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        salt TEXT NOT NULL,
        role INTEGER NOT NULL,
        status INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        last_login_at INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS test_server (
        server_id INTEGER PRIMARY KEY AUTOINCREMENT,
        location TEXT NOT NULL UNIQUE,
        ip_addr INTEGER NOT NULL,
        active INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS latcheck_report (
        report_id INTEGER PRIMARY KEY AUTOINCREMENT,
        check_location TEXT NOT NULL,
        user_name TEXT NOT NULL,
        created_time INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS report_record (
        record_id INTEGER PRIMARY KEY AUTOINCREMENT,
        report_id INTEGER NOT NULL REFERENCES latcheck_report (report_id),
        server_ip INTEGER NOT NULL,
        server_id INTEGER NOT NULL,
        latency INTEGER NOT NULL
    )",
];

/// Statements for the backend named by `url`.
pub fn schema_for(url: &str) -> &'static [&'static str] {
    if url.starts_with("sqlite") {
        SQLITE_SCHEMA
    } else {
        MYSQL_SCHEMA
    }
}

/// Create all tables on the given connection.
pub async fn apply_schema(conn: &mut AnyConnection, url: &str) -> Result<(), DbError> {
    for statement in schema_for(url) {
        sqlx::query(statement)
            .execute(&mut *conn)
            .await
            .map_err(DbError::Query)?;
    }
    Ok(())
}
