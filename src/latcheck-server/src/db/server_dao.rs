//! Test-server list access.
//!
//! `add_server` is an upsert keyed on the unique `location` column,
//! implemented as UPDATE-then-INSERT so it runs unchanged on every backend.
//! `upsert_many` wraps a whole bootstrap batch in one transaction.

use std::sync::Arc;

use sqlx::any::AnyRow;
use sqlx::{Connection, Row};
use tracing::info;

use super::{DaoError, DbError, DbPool};
use crate::types::TestServer;

/// Data access for the `test_server` table.
#[derive(Clone)]
pub struct ServerDao {
    pool: Arc<DbPool>,
}

impl ServerDao {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// All rows with `active = true`, in `server_id` order.
    pub async fn get_active_servers(&self) -> Result<Vec<TestServer>, DaoError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT server_id, location, ip_addr, active FROM test_server \
             WHERE active = 1 ORDER BY server_id",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(DbError::Query)?;
        conn.release().await;

        let servers = rows
            .iter()
            .map(server_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        info!(count = servers.len(), "loaded active test servers");
        Ok(servers)
    }

    /// Every row, active or not, in `server_id` order.
    pub async fn get_all_servers(&self) -> Result<Vec<TestServer>, DaoError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT server_id, location, ip_addr, active FROM test_server ORDER BY server_id",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(DbError::Query)?;
        conn.release().await;

        rows.iter()
            .map(server_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub async fn get_by_location(&self, location: &str) -> Result<Option<TestServer>, DaoError> {
        if location.is_empty() {
            return Ok(None);
        }
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            "SELECT server_id, location, ip_addr, active FROM test_server WHERE location = ?",
        )
        .bind(location)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DbError::Query)?;
        conn.release().await;

        row.as_ref().map(server_from_row).transpose().map_err(Into::into)
    }

    /// Upsert keyed on `location`: replaces `ip_addr` and `active`.
    pub async fn add_server(
        &self,
        location: &str,
        ip_addr: u32,
        active: bool,
    ) -> Result<(), DaoError> {
        if location.is_empty() || location.len() > 128 {
            return Err(DaoError::InvalidParameter("location"));
        }
        let mut conn = self.pool.acquire().await?;
        upsert_on(&mut *conn, location, ip_addr, active).await?;
        conn.release().await;
        Ok(())
    }

    /// Upsert a whole batch inside one transaction; either every row lands
    /// or none does. Returns the number of rows written.
    pub async fn upsert_many(
        &self,
        entries: &[(String, u32, bool)],
    ) -> Result<usize, DaoError> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await.map_err(DbError::Transaction)?;
        for (location, ip_addr, active) in entries {
            if location.is_empty() || location.len() > 128 {
                tx.rollback().await.map_err(DbError::Transaction)?;
                conn.release().await;
                return Err(DaoError::InvalidParameter("location"));
            }
            upsert_on(&mut *tx, location, *ip_addr, *active).await?;
        }
        tx.commit().await.map_err(DbError::Transaction)?;
        conn.release().await;
        Ok(entries.len())
    }

    pub async fn set_server_active(&self, server_id: u32, active: bool) -> Result<(), DaoError> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query("UPDATE test_server SET active = ? WHERE server_id = ?")
            .bind(active as i64)
            .bind(server_id as i64)
            .execute(&mut *conn)
            .await
            .map_err(DbError::Query)?;
        conn.release().await;

        if result.rows_affected() == 0 {
            return Err(DaoError::InvalidParameter("server_id"));
        }
        Ok(())
    }

    pub async fn remove_server(&self, server_id: u32) -> Result<(), DaoError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("DELETE FROM test_server WHERE server_id = ?")
            .bind(server_id as i64)
            .execute(&mut *conn)
            .await
            .map_err(DbError::Query)?;
        conn.release().await;
        Ok(())
    }
}

/// UPDATE-then-INSERT upsert; runs on a plain connection or inside a
/// transaction via `&mut *tx`.
async fn upsert_on(
    conn: &mut sqlx::AnyConnection,
    location: &str,
    ip_addr: u32,
    active: bool,
) -> Result<(), DaoError> {
    let updated = sqlx::query("UPDATE test_server SET ip_addr = ?, active = ? WHERE location = ?")
        .bind(ip_addr as i64)
        .bind(active as i64)
        .bind(location)
        .execute(&mut *conn)
        .await
        .map_err(DbError::Query)?;

    if updated.rows_affected() == 0 {
        sqlx::query("INSERT INTO test_server (location, ip_addr, active) VALUES (?, ?, ?)")
            .bind(location)
            .bind(ip_addr as i64)
            .bind(active as i64)
            .execute(&mut *conn)
            .await
            .map_err(DbError::Query)?;
    }
    Ok(())
}

fn server_from_row(row: &AnyRow) -> Result<TestServer, DbError> {
    let server_id: i64 = row
        .try_get("server_id")
        .map_err(|e| DbError::Decode(e.to_string()))?;
    let ip_addr: i64 = row
        .try_get("ip_addr")
        .map_err(|e| DbError::Decode(e.to_string()))?;
    let active: i64 = row
        .try_get("active")
        .map_err(|e| DbError::Decode(e.to_string()))?;

    Ok(TestServer {
        server_id: server_id as u32,
        location: row
            .try_get("location")
            .map_err(|e| DbError::Decode(e.to_string()))?,
        ip_addr: ip_addr as u32,
        active: active != 0,
    })
}
