//! Bounded database connection pool.
//!
//! Holds between `min_connections` and `max_connections` raw connections.
//! `acquire` lends a validated connection as an RAII guard; dropping the
//! guard returns the connection even if the borrower never called
//! [`PooledConn::release`]. A background task re-validates idle connections
//! with `SELECT 1` and refills the pool to its minimum size.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use sqlx::AnyConnection;
use sqlx::Connection;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use super::DbError;

/// Pool sizing and timing knobs.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub url: String,
    pub min_connections: usize,
    pub max_connections: usize,
    /// How long `acquire` waits when the pool is saturated
    pub acquire_timeout: Duration,
    /// Cadence of the idle-connection health check
    pub health_check_interval: Duration,
}

impl PoolOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            min_connections: 5,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct PoolState {
    idle: VecDeque<AnyConnection>,
    /// Connections currently lent out or being opened for a reserved slot
    active: usize,
    closed: bool,
}

/// Bounded pool of database connections.
#[derive(Debug)]
pub struct DbPool {
    opts: PoolOptions,
    state: Mutex<PoolState>,
    /// Signalled whenever a slot frees up
    notify: Notify,
}

/// The sqlx `Any` drivers may only be installed once per process.
static INSTALL_DRIVERS: std::sync::Once = std::sync::Once::new();

impl DbPool {
    /// Open the pool and pre-fill it with `min_connections` connections.
    pub async fn connect(opts: PoolOptions) -> Result<Arc<Self>, DbError> {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        let pool = Arc::new(Self {
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: 0,
                closed: false,
            }),
            notify: Notify::new(),
            opts,
        });

        {
            let mut state = pool.state.lock().await;
            for _ in 0..pool.opts.min_connections {
                let conn = pool.open_connection().await?;
                state.idle.push_back(conn);
            }
            debug!(
                idle = state.idle.len(),
                max = pool.opts.max_connections,
                "database pool initialized"
            );
        }

        Ok(pool)
    }

    /// Borrow a live connection.
    ///
    /// Prefers an idle connection (re-validated before hand-out), opens a new
    /// one while under `max_connections`, and otherwise waits up to
    /// `acquire_timeout` for a slot.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConn, DbError> {
        let deadline = Instant::now() + self.opts.acquire_timeout;

        loop {
            let reused = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(DbError::PoolClosed);
                }
                if let Some(conn) = state.idle.pop_front() {
                    state.active += 1;
                    Some(conn)
                } else if state.active < self.opts.max_connections {
                    state.active += 1;
                    None
                } else {
                    drop(state);
                    if timeout_at(deadline, self.notify.notified()).await.is_err() {
                        return Err(DbError::AcquireTimeout(self.opts.acquire_timeout));
                    }
                    continue;
                }
            };

            // A slot is reserved; validate or open outside the lock.
            match reused {
                Some(mut conn) => {
                    if Self::is_valid(&mut conn).await {
                        return Ok(PooledConn::new(conn, Arc::clone(self)));
                    }
                    warn!("idle connection failed validation, replacing");
                    let _ = conn.close().await;
                    match self.open_connection().await {
                        Ok(fresh) => return Ok(PooledConn::new(fresh, Arc::clone(self))),
                        Err(e) => {
                            self.forfeit_slot().await;
                            return Err(e);
                        }
                    }
                }
                None => match self.open_connection().await {
                    Ok(conn) => return Ok(PooledConn::new(conn, Arc::clone(self))),
                    Err(e) => {
                        self.forfeit_slot().await;
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Spawn the periodic health check that reaps invalid idle connections
    /// and refills the pool to `min_connections`.
    pub fn spawn_health_check(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(pool.opts.health_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !pool.run_health_check().await {
                    break;
                }
            }
        })
    }

    /// Close the pool: drain and close idle connections, wake all waiters.
    /// Lent connections are closed as they come back.
    pub async fn close(&self) {
        let idle: Vec<AnyConnection> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.idle.drain(..).collect()
        };
        for conn in idle {
            let _ = conn.close().await;
        }
        self.notify.notify_waiters();
        debug!("database pool closed");
    }

    pub async fn idle_count(&self) -> usize {
        self.state.lock().await.idle.len()
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active
    }

    /// One health-check pass. Returns false once the pool is closed.
    async fn run_health_check(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }

        let mut kept = VecDeque::with_capacity(state.idle.len());
        let mut dropped = 0usize;
        while let Some(mut conn) = state.idle.pop_front() {
            if Self::is_valid(&mut conn).await {
                kept.push_back(conn);
            } else {
                dropped += 1;
                let _ = conn.close().await;
            }
        }
        state.idle = kept;

        while state.idle.len() < self.opts.min_connections
            && state.active + state.idle.len() < self.opts.max_connections
        {
            match self.open_connection().await {
                Ok(conn) => state.idle.push_back(conn),
                Err(e) => {
                    error!(error = %e, "failed to refill pool during health check");
                    break;
                }
            }
        }

        debug!(
            active = state.active,
            idle = state.idle.len(),
            dropped,
            "pool health check"
        );
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Return a lent connection. Invalid connections are discarded; idle
    /// connections above `min_connections` are closed rather than kept.
    async fn release(&self, mut conn: AnyConnection) {
        let valid = Self::is_valid(&mut conn).await;
        let mut state = self.state.lock().await;
        state.active = state.active.saturating_sub(1);

        if state.closed || !valid {
            drop(state);
            if !valid {
                warn!("discarded invalid connection on release");
            }
            let _ = conn.close().await;
        } else if state.idle.len() >= self.opts.min_connections {
            drop(state);
            debug!("closed connection above minimum pool size");
            let _ = conn.close().await;
        } else {
            state.idle.push_back(conn);
            drop(state);
        }
        self.notify.notify_one();
    }

    async fn forfeit_slot(&self) {
        let mut state = self.state.lock().await;
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.notify.notify_one();
    }

    async fn open_connection(&self) -> Result<AnyConnection, DbError> {
        AnyConnection::connect(&self.opts.url)
            .await
            .map_err(DbError::Connect)
    }

    /// A connection is valid iff it executes `SELECT 1` without error.
    async fn is_valid(conn: &mut AnyConnection) -> bool {
        sqlx::query("SELECT 1").execute(&mut *conn).await.is_ok()
    }
}

/// RAII guard for a borrowed connection.
///
/// Dereferences to the underlying connection. Dropping the guard returns the
/// connection to the pool; [`PooledConn::release`] does the same but lets the
/// caller await re-validation.
#[derive(Debug)]
pub struct PooledConn {
    conn: Option<AnyConnection>,
    pool: Arc<DbPool>,
}

impl PooledConn {
    fn new(conn: AnyConnection, pool: Arc<DbPool>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// Explicitly return the connection, waiting until the pool took it back.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn).await;
        }
    }
}

impl Deref for PooledConn {
    type Target = AnyConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already released")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already released")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move { pool.release(conn).await });
        }
    }
}
