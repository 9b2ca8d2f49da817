//! Authentication manager.
//!
//! `authenticate` runs a fixed pipeline: rate limit → account lock → user
//! fetch → password verify → token mint → last-login stamp. Every failed
//! stage records an attempt; rate-limit and lockout denials are reported to
//! the wire as `InvalidPassword` so a caller cannot tell which stage failed.
//!
//! Ledgers (login attempts per user, requests per client IP, locked
//! accounts, active session tokens) are in-memory maps guarded by mutexes
//! with append/lookup-sized critical sections.

pub mod password;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use latcheck_proto::ResultCode;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::db::{DaoError, UserDao};
use crate::types::{User, UserStatus};
use password::verify_password;

/// Tunables for the authenticator.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Session token validity measured from last activity
    pub session_timeout: Duration,
    /// Failed attempts inside `lockout_window` that trigger a lock
    pub max_login_attempts: u32,
    /// Window over which failed attempts are counted
    pub lockout_window: Duration,
    /// How long a locked account stays locked
    pub lockout_duration: Duration,
    /// Rolling window for the per-IP rate limit
    pub rate_limit_window: Duration,
    /// Requests allowed per IP inside the window
    pub max_requests_per_window: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(30 * 60),
            max_login_attempts: 5,
            lockout_window: Duration::from_secs(15 * 60),
            lockout_duration: Duration::from_secs(15 * 60),
            rate_limit_window: Duration::from_secs(60),
            max_requests_per_window: 10,
        }
    }
}

/// An authenticated session token entry.
#[derive(Debug, Clone)]
pub struct UserSession {
    pub user_name: String,
    pub client_ip: IpAddr,
    pub login_time: Instant,
    pub last_activity: Instant,
    pub is_active: bool,
}

/// Successful authentication: minted token plus the user row.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub token: String,
    pub user: User,
}

/// Denial reasons. `result_code` collapses stages that must not leak.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("account locked")]
    AccountLocked,

    #[error("unknown user")]
    UnknownUser,

    #[error("account is not active")]
    Disabled,

    #[error("password mismatch")]
    BadPassword,

    #[error(transparent)]
    Db(#[from] DaoError),
}

impl AuthError {
    /// Code reported on the wire for this denial.
    pub fn result_code(&self) -> ResultCode {
        match self {
            // Indistinguishable from a bad password on purpose.
            AuthError::RateLimited | AuthError::AccountLocked | AuthError::BadPassword => {
                ResultCode::InvalidPassword
            }
            AuthError::UnknownUser => ResultCode::InvalidUser,
            AuthError::Disabled => ResultCode::UserDisabled,
            AuthError::Db(e) => e.result_code(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LoginAttempt {
    at: Instant,
    successful: bool,
}

/// Process-wide authenticator.
pub struct AuthManager {
    users: UserDao,
    audit: AuditLog,
    cfg: AuthConfig,
    sessions: Mutex<HashMap<String, UserSession>>,
    attempts: Mutex<HashMap<String, Vec<LoginAttempt>>>,
    locked_until: Mutex<HashMap<String, Instant>>,
    rate: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl AuthManager {
    pub fn new(users: UserDao, audit: AuditLog, cfg: AuthConfig) -> Self {
        Self {
            users,
            audit,
            cfg,
            sessions: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            locked_until: Mutex::new(HashMap::new()),
            rate: Mutex::new(HashMap::new()),
        }
    }

    /// Verify credentials and mint a session token.
    pub async fn authenticate(
        &self,
        user_name: &str,
        password: &str,
        client_ip: IpAddr,
    ) -> Result<AuthGrant, AuthError> {
        if !self.check_rate_limit(client_ip) {
            warn!(ip = %client_ip, "rate limit exceeded");
            return Err(AuthError::RateLimited);
        }

        if self.is_account_locked(user_name) {
            warn!(user = %user_name, "login attempt on locked account");
            self.record_attempt(user_name, false);
            self.audit.record("0", "LOGIN", false, &format!("locked account {user_name}"));
            return Err(AuthError::AccountLocked);
        }

        let user = match self.users.get_by_username(user_name).await? {
            Some(user) => user,
            None => {
                warn!(user = %user_name, ip = %client_ip, "login attempt for unknown user");
                self.record_attempt(user_name, false);
                self.audit
                    .record("0", "LOGIN", false, &format!("unknown user {user_name}"));
                return Err(AuthError::UnknownUser);
            }
        };

        if user.status != UserStatus::Active {
            warn!(user = %user_name, status = ?user.status, "login attempt on inactive account");
            self.record_attempt(user_name, false);
            self.audit.record(
                &user.user_id.to_string(),
                "LOGIN",
                false,
                &format!("account not active ({:?})", user.status),
            );
            return Err(AuthError::Disabled);
        }

        if !verify_password(password, &user.password_hash, &user.salt) {
            warn!(user = %user_name, ip = %client_ip, "password mismatch");
            self.record_attempt(user_name, false);
            self.audit.record(
                &user.user_id.to_string(),
                "LOGIN",
                false,
                "password mismatch",
            );
            return Err(AuthError::BadPassword);
        }

        let token = Uuid::new_v4().to_string();
        let now = Instant::now();
        {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.insert(
                token.clone(),
                UserSession {
                    user_name: user_name.to_string(),
                    client_ip,
                    login_time: now,
                    last_activity: now,
                    is_active: true,
                },
            );
        }

        self.users.update_last_login(user.user_id).await?;
        self.record_attempt(user_name, true);
        self.audit
            .record(&user.user_id.to_string(), "LOGIN", true, "login ok");
        info!(user = %user_name, ip = %client_ip, "user authenticated");

        Ok(AuthGrant { token, user })
    }

    /// Token validity: session exists, is active and saw activity within the
    /// session timeout.
    pub fn validate_session(&self, token: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get_mut(token) {
            Some(session) if session.is_active => {
                if session.last_activity.elapsed() > self.cfg.session_timeout {
                    session.is_active = false;
                    debug!(user = %session.user_name, "session expired");
                    false
                } else {
                    true
                }
            }
            _ => false,
        }
    }

    /// Refresh a token's activity stamp.
    pub fn touch_session(&self, token: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = sessions.get_mut(token) {
            if session.is_active {
                session.last_activity = Instant::now();
            }
        }
    }

    /// Drop a session token. Returns false for unknown tokens.
    pub fn logout(&self, token: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.remove(token) {
            Some(session) => {
                info!(user = %session.user_name, "user logged out");
                true
            }
            None => false,
        }
    }

    pub fn active_session_count(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.values().filter(|s| s.is_active).count()
    }

    /// Periodic maintenance: expired sessions, elapsed lockouts, stale
    /// attempt and rate ledger entries.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.retain(|_, s| s.is_active && s.last_activity.elapsed() <= self.cfg.session_timeout);
        }
        {
            let mut locked = self.locked_until.lock().unwrap_or_else(|e| e.into_inner());
            locked.retain(|user, until| {
                let keep = *until > now;
                if !keep {
                    info!(user = %user, "account lock expired");
                }
                keep
            });
        }
        {
            // Attempts older than a day can no longer influence any window.
            let cutoff = Duration::from_secs(24 * 60 * 60);
            let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            for ledger in attempts.values_mut() {
                ledger.retain(|a| a.at.elapsed() < cutoff);
            }
            attempts.retain(|_, ledger| !ledger.is_empty());
        }
        {
            let window = self.cfg.rate_limit_window * 2;
            let mut rate = self.rate.lock().unwrap_or_else(|e| e.into_inner());
            for ledger in rate.values_mut() {
                ledger.retain(|at| at.elapsed() < window);
            }
            rate.retain(|_, ledger| !ledger.is_empty());
        }
    }

    fn is_account_locked(&self, user_name: &str) -> bool {
        let now = Instant::now();
        let mut locked = self.locked_until.lock().unwrap_or_else(|e| e.into_inner());
        locked.retain(|_, until| *until > now);
        locked.contains_key(user_name)
    }

    fn record_attempt(&self, user_name: &str, successful: bool) {
        let now = Instant::now();
        let failed_in_window = {
            let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            let ledger = attempts.entry(user_name.to_string()).or_default();
            ledger.push(LoginAttempt {
                at: now,
                successful,
            });
            ledger
                .iter()
                .filter(|a| !a.successful && a.at.elapsed() < self.cfg.lockout_window)
                .count() as u32
        };

        if !successful && failed_in_window >= self.cfg.max_login_attempts {
            let mut locked = self.locked_until.lock().unwrap_or_else(|e| e.into_inner());
            locked.insert(user_name.to_string(), now + self.cfg.lockout_duration);
            warn!(user = %user_name, failed = failed_in_window, "account locked");
        }
    }

    /// Sliding-window limit per client IP. Records the request when allowed.
    fn check_rate_limit(&self, client_ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut rate = self.rate.lock().unwrap_or_else(|e| e.into_inner());
        let ledger = rate.entry(client_ip).or_default();
        ledger.retain(|at| at.elapsed() < self.cfg.rate_limit_window);
        if ledger.len() as u32 >= self.cfg.max_requests_per_window {
            return false;
        }
        ledger.push(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::{DbPool, PoolOptions};
    use crate::db::schema::apply_schema;
    use crate::types::UserRole;
    use std::net::Ipv4Addr;

    async fn test_manager(cfg: AuthConfig) -> AuthManager {
        let opts = PoolOptions {
            min_connections: 1,
            max_connections: 1,
            acquire_timeout: Duration::from_secs(2),
            ..PoolOptions::new("sqlite::memory:")
        };
        let pool = DbPool::connect(opts).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        apply_schema(&mut conn, "sqlite::memory:").await.unwrap();
        conn.release().await;

        let users = UserDao::new(pool);
        users
            .create_user("alice", "correct-horse", UserRole::ReportUploader, UserStatus::Active)
            .await
            .unwrap();
        users
            .create_user("mallet", "irrelevant", UserRole::ReportViewer, UserStatus::Suspended)
            .await
            .unwrap();

        AuthManager::new(users, AuditLog::disabled(), cfg)
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test]
    async fn valid_credentials_mint_token_and_stamp_login() {
        let auth = test_manager(AuthConfig::default()).await;
        let grant = auth
            .authenticate("alice", "correct-horse", ip(1))
            .await
            .unwrap();
        assert!(!grant.token.is_empty());
        assert_eq!(grant.user.user_name, "alice");
        assert!(auth.validate_session(&grant.token));
        assert_eq!(auth.active_session_count(), 1);

        let user = auth.users.get_by_username("alice").await.unwrap().unwrap();
        assert!(user.last_login_at.is_some());
    }

    #[tokio::test]
    async fn wrong_password_denied() {
        let auth = test_manager(AuthConfig::default()).await;
        let err = auth.authenticate("alice", "wrong", ip(1)).await.unwrap_err();
        assert!(matches!(err, AuthError::BadPassword));
        assert_eq!(err.result_code(), ResultCode::InvalidPassword);
        assert_eq!(auth.active_session_count(), 0);
    }

    #[tokio::test]
    async fn unknown_user_denied() {
        let auth = test_manager(AuthConfig::default()).await;
        let err = auth
            .authenticate("mallory", "anything", ip(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownUser));
        assert_eq!(err.result_code(), ResultCode::InvalidUser);
    }

    #[tokio::test]
    async fn suspended_user_denied() {
        let auth = test_manager(AuthConfig::default()).await;
        let err = auth
            .authenticate("mallet", "irrelevant", ip(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Disabled));
        assert_eq!(err.result_code(), ResultCode::UserDisabled);
    }

    #[tokio::test]
    async fn repeated_failures_lock_the_account() {
        let cfg = AuthConfig {
            max_login_attempts: 3,
            ..AuthConfig::default()
        };
        let auth = test_manager(cfg).await;

        for _ in 0..3 {
            let _ = auth.authenticate("alice", "wrong", ip(1)).await;
        }
        // Even the correct password is refused now, and the denial reads as
        // a bad password from the outside.
        let err = auth
            .authenticate("alice", "correct-horse", ip(2))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccountLocked));
        assert_eq!(err.result_code(), ResultCode::InvalidPassword);
    }

    #[tokio::test]
    async fn lock_expires_after_duration() {
        let cfg = AuthConfig {
            max_login_attempts: 2,
            lockout_duration: Duration::from_millis(50),
            lockout_window: Duration::from_millis(50),
            ..AuthConfig::default()
        };
        let auth = test_manager(cfg).await;
        for _ in 0..2 {
            let _ = auth.authenticate("alice", "wrong", ip(1)).await;
        }
        assert!(matches!(
            auth.authenticate("alice", "correct-horse", ip(1)).await,
            Err(AuthError::AccountLocked)
        ));

        tokio::time::sleep(Duration::from_millis(80)).await;
        auth.authenticate("alice", "correct-horse", ip(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rate_limit_trips_before_user_lookup() {
        let cfg = AuthConfig {
            max_requests_per_window: 2,
            ..AuthConfig::default()
        };
        let auth = test_manager(cfg).await;

        auth.authenticate("alice", "correct-horse", ip(9)).await.unwrap();
        auth.authenticate("alice", "wrong", ip(9)).await.unwrap_err();
        let err = auth
            .authenticate("alice", "correct-horse", ip(9))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RateLimited));
        assert_eq!(err.result_code(), ResultCode::InvalidPassword);

        // A different client IP is unaffected.
        auth.authenticate("alice", "correct-horse", ip(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn session_expiry_and_touch() {
        let cfg = AuthConfig {
            session_timeout: Duration::from_millis(60),
            ..AuthConfig::default()
        };
        let auth = test_manager(cfg).await;
        let grant = auth
            .authenticate("alice", "correct-horse", ip(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        auth.touch_session(&grant.token);
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Touched halfway through, still valid.
        assert!(auth.validate_session(&grant.token));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!auth.validate_session(&grant.token));

        auth.cleanup_expired();
        assert_eq!(auth.active_session_count(), 0);
    }

    #[tokio::test]
    async fn logout_removes_session() {
        let auth = test_manager(AuthConfig::default()).await;
        let grant = auth
            .authenticate("alice", "correct-horse", ip(1))
            .await
            .unwrap();
        assert!(auth.logout(&grant.token));
        assert!(!auth.validate_session(&grant.token));
        assert!(!auth.logout(&grant.token));
    }
}
