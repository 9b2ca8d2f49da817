//! User rows: lookup, creation, credential rotation, soft delete.
//!
//! A row with `status = Deleted` is treated as absent by every query here.
//! Usernames are 1–32 characters of `[A-Za-z0-9_]` and matched
//! case-sensitively.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::Row;
use tracing::warn;

use super::{DaoError, DbError, DbPool};
use crate::auth::password::{generate_salt, hash_password};
use crate::types::{User, UserRole, UserStatus};

const USER_COLUMNS: &str =
    "user_id, username, password_hash, salt, role, status, created_at, updated_at, last_login_at";

/// Minimum password length accepted on create/rotate.
pub const MIN_PASSWORD_LEN: usize = 6;

/// Data access for the `users` table.
#[derive(Clone)]
pub struct UserDao {
    pool: Arc<DbPool>,
}

impl UserDao {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Fetch a user by name, including credential material.
    /// Returns `None` for missing or soft-deleted rows.
    pub async fn get_by_username(&self, name: &str) -> Result<Option<User>, DaoError> {
        if !is_valid_username(name) {
            return Ok(None);
        }
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ? AND status <> ?"
        ))
        .bind(name)
        .bind(UserStatus::Deleted.as_db())
        .fetch_optional(&mut *conn)
        .await
        .map_err(DbError::Query)?;
        conn.release().await;

        row.map(|r| user_from_row(&r)).transpose().map_err(Into::into)
    }

    /// Fetch a user by id. Returns `None` for missing or soft-deleted rows.
    pub async fn get_by_id(&self, user_id: i64) -> Result<Option<User>, DaoError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE user_id = ? AND status <> ?"
        ))
        .bind(user_id)
        .bind(UserStatus::Deleted.as_db())
        .fetch_optional(&mut *conn)
        .await
        .map_err(DbError::Query)?;
        conn.release().await;

        row.map(|r| user_from_row(&r)).transpose().map_err(Into::into)
    }

    /// Create a user with a fresh salt. Returns the new `user_id`.
    pub async fn create_user(
        &self,
        name: &str,
        password: &str,
        role: UserRole,
        status: UserStatus,
    ) -> Result<i64, DaoError> {
        if !is_valid_username(name) {
            return Err(DaoError::InvalidParameter("username"));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(DaoError::PasswordTooShort);
        }
        if self.is_username_exists(name).await? {
            return Err(DaoError::UserExists);
        }

        let salt = generate_salt();
        let password_hash = hash_password(password, &salt);
        let now = Utc::now().timestamp();

        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query(
            "INSERT INTO users (username, password_hash, salt, role, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(&password_hash)
        .bind(&salt)
        .bind(role.as_db())
        .bind(status.as_db())
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(DbError::Query)?;
        conn.release().await;

        result
            .last_insert_id()
            .ok_or_else(|| DaoError::from(DbError::Decode("insert id missing for users".into())))
    }

    /// Stamp `last_login_at` for a successful authentication.
    pub async fn update_last_login(&self, user_id: i64) -> Result<(), DaoError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("UPDATE users SET last_login_at = ? WHERE user_id = ?")
            .bind(Utc::now().timestamp())
            .bind(user_id)
            .execute(&mut *conn)
            .await
            .map_err(DbError::Query)?;
        conn.release().await;
        Ok(())
    }

    /// Rotate credentials: new salt, new hash, one atomic UPDATE.
    pub async fn update_password(&self, user_id: i64, new_password: &str) -> Result<(), DaoError> {
        if new_password.len() < MIN_PASSWORD_LEN {
            return Err(DaoError::PasswordTooShort);
        }
        let salt = generate_salt();
        let password_hash = hash_password(new_password, &salt);

        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query(
            "UPDATE users SET password_hash = ?, salt = ?, updated_at = ? WHERE user_id = ?",
        )
        .bind(&password_hash)
        .bind(&salt)
        .bind(Utc::now().timestamp())
        .bind(user_id)
        .execute(&mut *conn)
        .await
        .map_err(DbError::Query)?;
        conn.release().await;

        if result.rows_affected() == 0 {
            return Err(DaoError::UserNotFound);
        }
        Ok(())
    }

    pub async fn update_status(&self, user_id: i64, status: UserStatus) -> Result<(), DaoError> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query("UPDATE users SET status = ?, updated_at = ? WHERE user_id = ?")
            .bind(status.as_db())
            .bind(Utc::now().timestamp())
            .bind(user_id)
            .execute(&mut *conn)
            .await
            .map_err(DbError::Query)?;
        conn.release().await;

        if result.rows_affected() == 0 {
            return Err(DaoError::UserNotFound);
        }
        Ok(())
    }

    /// Soft delete: the row stays, queries stop seeing it.
    pub async fn delete_user(&self, user_id: i64) -> Result<(), DaoError> {
        self.update_status(user_id, UserStatus::Deleted).await
    }

    /// Case-sensitive existence check over non-deleted rows.
    pub async fn is_username_exists(&self, name: &str) -> Result<bool, DaoError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT COUNT(*) FROM users WHERE username = ? AND status <> ?")
            .bind(name)
            .bind(UserStatus::Deleted.as_db())
            .fetch_one(&mut *conn)
            .await
            .map_err(DbError::Query)?;
        conn.release().await;

        let count: i64 = row.try_get(0).map_err(|e| DbError::Decode(e.to_string()))?;
        Ok(count > 0)
    }

    pub async fn user_count(&self) -> Result<i64, DaoError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT COUNT(*) FROM users WHERE status <> ?")
            .bind(UserStatus::Deleted.as_db())
            .fetch_one(&mut *conn)
            .await
            .map_err(DbError::Query)?;
        conn.release().await;

        row.try_get(0)
            .map_err(|e| DbError::Decode(e.to_string()).into())
    }
}

/// Username rule: `^[A-Za-z0-9_]{1,32}$`.
pub fn is_valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn user_from_row(row: &AnyRow) -> Result<User, DbError> {
    let role_raw: i64 = row
        .try_get("role")
        .map_err(|e| DbError::Decode(e.to_string()))?;
    let status_raw: i64 = row
        .try_get("status")
        .map_err(|e| DbError::Decode(e.to_string()))?;
    let role = UserRole::from_db(role_raw).ok_or_else(|| {
        warn!(role = role_raw, "unknown role value in users row");
        DbError::Decode(format!("unknown role {role_raw}"))
    })?;
    let status = UserStatus::from_db(status_raw)
        .ok_or_else(|| DbError::Decode(format!("unknown status {status_raw}")))?;

    Ok(User {
        user_id: row
            .try_get("user_id")
            .map_err(|e| DbError::Decode(e.to_string()))?,
        user_name: row
            .try_get("username")
            .map_err(|e| DbError::Decode(e.to_string()))?,
        password_hash: row
            .try_get("password_hash")
            .map_err(|e| DbError::Decode(e.to_string()))?,
        salt: row
            .try_get("salt")
            .map_err(|e| DbError::Decode(e.to_string()))?,
        role,
        status,
        created_at: timestamp_from_row(row, "created_at")?,
        updated_at: timestamp_from_row(row, "updated_at")?,
        last_login_at: row
            .try_get::<Option<i64>, _>("last_login_at")
            .map_err(|e| DbError::Decode(e.to_string()))?
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
    })
}

fn timestamp_from_row(row: &AnyRow, column: &str) -> Result<DateTime<Utc>, DbError> {
    let secs: i64 = row
        .try_get(column)
        .map_err(|e| DbError::Decode(e.to_string()))?;
    Ok(DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default())
}
