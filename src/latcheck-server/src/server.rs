//! TLS dispatcher: accept loop, connection cap and session sweeper.
//!
//! Each accepted socket is TLS-wrapped, checked against the peer-subject
//! policy and handed to a session task. Accepts beyond `max_connections` are
//! dropped before the handshake. A sweeper wakes every 60 s and reaps
//! sessions that never authenticated in time or idled out, mirroring the
//! per-session read deadlines for sessions whose reads are wedged.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::peer_policy::PeerPolicy;
use crate::session::{Session, SessionActivity, SessionContext, SessionState};

/// Sweep cadence for timed-out sessions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on the TLS handshake itself.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct SessionEntry {
    activity: Arc<SessionActivity>,
    abort: AbortHandle,
    peer: SocketAddr,
}

/// The accept-side of the collection server.
pub struct Dispatcher {
    acceptor: TlsAcceptor,
    policy: PeerPolicy,
    ctx: Arc<SessionContext>,
    max_connections: usize,
    /// Idle limit used by the sweeper for any state
    connection_timeout: Duration,
    sessions: Mutex<HashMap<u64, SessionEntry>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        acceptor: TlsAcceptor,
        policy: PeerPolicy,
        ctx: Arc<SessionContext>,
        max_connections: usize,
        connection_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            acceptor,
            policy,
            ctx,
            max_connections,
            connection_timeout,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Accept connections until the listener errors or the task is aborted.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().context("reading listener address")?;
        info!(addr = %local, max_connections = self.max_connections, "server listening");

        let sweeper = {
            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move { dispatcher.sweep_loop().await })
        };

        let result = loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e).context("accept failed"),
            };

            if self.connection_count() >= self.max_connections {
                warn!(peer = %peer, "connection limit reached, dropping accept");
                drop(socket);
                continue;
            }

            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move { dispatcher.handle_connection(socket, peer).await });
        };

        sweeper.abort();
        result
    }

    /// Sessions currently registered, any state.
    pub fn connection_count(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.len()
    }

    /// Sessions that passed LOGIN and are still alive.
    pub fn authenticated_count(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .values()
            .filter(|entry| entry.activity.state() == SessionState::Authenticated)
            .count()
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        socket.set_nodelay(true).ok();

        let tls = match timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(socket)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                warn!(peer = %peer, "TLS handshake timed out");
                return;
            }
        };

        let peer_subject = {
            let (_, connection) = tls.get_ref();
            match self.policy.check(connection.peer_certificates()) {
                Ok(subject) => subject,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "peer rejected by subject policy");
                    return;
                }
            }
        };
        debug!(peer = %peer, subject = ?peer_subject, "TLS session established");

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let activity = Arc::new(SessionActivity::new());
        let session = Session::new(tls, peer.ip(), Arc::clone(&self.ctx), Arc::clone(&activity));

        let dispatcher = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            if let Err(e) = session.run().await {
                debug!(peer = %peer, error = %e, "session terminated");
            }
            let mut sessions = dispatcher
                .sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            sessions.remove(&id);
        });

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(
            id,
            SessionEntry {
                activity,
                abort: handle.abort_handle(),
                peer,
            },
        );
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_once();
        }
    }

    /// Reap finished entries and force-close timed-out sessions.
    fn sweep_once(&self) {
        let auth_timeout = self.ctx.auth_timeout;
        let connection_timeout = self.connection_timeout;

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.retain(|_, entry| {
            if entry.abort.is_finished() {
                return false;
            }
            let state = entry.activity.state();
            if state == SessionState::Connected && entry.activity.connected_for() > auth_timeout {
                warn!(peer = %entry.peer, "sweeping session that never authenticated");
                entry.abort.abort();
                return false;
            }
            if entry.activity.idle_for() > connection_timeout {
                info!(peer = %entry.peer, "sweeping idle session");
                entry.abort.abort();
                return false;
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::auth::{AuthConfig, AuthManager};
    use crate::db::pool::{DbPool, PoolOptions};
    use crate::db::schema::apply_schema;
    use crate::db::{ReportDao, ServerDao, UserDao};
    use crate::tls::{build_server_config, load_certs, load_key};
    use std::io::Write;

    async fn test_ctx() -> Arc<SessionContext> {
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

        Arc::new(SessionContext {
            auth: Arc::new(AuthManager::new(
                UserDao::new(Arc::clone(&pool)),
                AuditLog::disabled(),
                AuthConfig::default(),
            )),
            servers: ServerDao::new(Arc::clone(&pool)),
            reports: ReportDao::new(pool),
            audit: AuditLog::disabled(),
            auth_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        })
    }

    fn test_acceptor() -> TlsAcceptor {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(certified.cert.pem().as_bytes()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file
            .write_all(certified.signing_key.serialize_pem().as_bytes())
            .unwrap();

        let certs = load_certs(cert_file.path()).unwrap();
        let key = load_key(key_file.path()).unwrap();
        let config = build_server_config(certs, key, None, false).unwrap();
        TlsAcceptor::from(config)
    }

    #[tokio::test]
    async fn counts_start_empty() {
        let dispatcher = Dispatcher::new(
            test_acceptor(),
            PeerPolicy::Open,
            test_ctx().await,
            10,
            Duration::from_secs(300),
        );
        assert_eq!(dispatcher.connection_count(), 0);
        assert_eq!(dispatcher.authenticated_count(), 0);
        // Sweeping an empty table is a no-op.
        dispatcher.sweep_once();
    }

    #[tokio::test]
    async fn accept_beyond_cap_is_dropped() {
        let dispatcher = Dispatcher::new(
            test_acceptor(),
            PeerPolicy::Open,
            test_ctx().await,
            0, // no session may register
            Duration::from_secs(300),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(Arc::clone(&dispatcher).run(listener));

        // The TCP connect succeeds but the socket is closed without any TLS
        // handshake: the first read returns EOF.
        let mut socket = TcpStream::connect(addr).await.unwrap();
        let mut byte = [0u8; 1];
        let n = tokio::io::AsyncReadExt::read(&mut socket, &mut byte)
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(dispatcher.connection_count(), 0);

        server.abort();
    }
}
