//! Per-connection protocol session.
//!
//! A session owns its transport exclusively and walks Connected →
//! Authenticated → Disconnected. The read loop appends bytes to a private
//! buffer and dispatches every complete frame in wire order; a partial frame
//! stays buffered until more bytes arrive. Protocol violations (oversize
//! frame, unknown type, malformed payload, message out of state order) end
//! the session.
//!
//! The session is generic over its stream so the state machine runs the same
//! over a TLS stream in production and an in-memory duplex pipe in tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use latcheck_proto::{extract_frame, Message, MessageType, ProtoError, ResultCode, ServerEntry};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::auth::AuthManager;
use crate::db::{ReportDao, ServerDao};
use crate::types::{NewRecord, NewReport, TestServer, UserRole};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Post-accept, pre-authentication; only LOGIN_REQUEST is legal
    Connected = 0,
    /// LOGIN succeeded; LIST_REQUEST and REPORT_REQUEST are legal
    Authenticated = 1,
    Disconnected = 2,
}

/// Why a session ended, beyond a clean peer close.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("authentication timed out")]
    AuthTimeout,

    #[error("session idled out")]
    IdleTimeout,
}

/// Timing and liveness view shared with the dispatcher's sweeper.
///
/// The session updates it; the sweeper reads it to decide which sessions to
/// reap without touching the session task itself.
pub struct SessionActivity {
    connected_at: Instant,
    last_active: Mutex<Instant>,
    state: AtomicU8,
}

impl SessionActivity {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            connected_at: now,
            last_active: Mutex::new(now),
            state: AtomicU8::new(SessionState::Connected as u8),
        }
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Relaxed) {
            0 => SessionState::Connected,
            1 => SessionState::Authenticated,
            _ => SessionState::Disconnected,
        }
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_active.lock().unwrap_or_else(|e| e.into_inner());
        last.elapsed()
    }

    fn touch(&self) {
        let mut last = self.last_active.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

impl Default for SessionActivity {
    fn default() -> Self {
        Self::new()
    }
}

/// Services and limits shared by every session.
pub struct SessionContext {
    pub auth: Arc<AuthManager>,
    pub servers: ServerDao,
    pub reports: ReportDao,
    pub audit: AuditLog,
    /// How long a session may stay unauthenticated
    pub auth_timeout: Duration,
    /// Idle limit between frames once authenticated
    pub idle_timeout: Duration,
}

/// One connection's protocol state machine.
pub struct Session<S> {
    stream: S,
    peer_ip: IpAddr,
    ctx: Arc<SessionContext>,
    activity: Arc<SessionActivity>,
    buf: BytesMut,
    user_name: Option<String>,
    role: Option<UserRole>,
    token: Option<String>,
    /// Snapshot of the server list from the last LIST_REQUEST
    server_cache: Vec<TestServer>,
    /// `server_id → ip_addr` built alongside the cache
    ip_map: HashMap<u32, u32>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer_ip: IpAddr,
        ctx: Arc<SessionContext>,
        activity: Arc<SessionActivity>,
    ) -> Self {
        Self {
            stream,
            peer_ip,
            ctx,
            activity,
            buf: BytesMut::with_capacity(4096),
            user_name: None,
            role: None,
            token: None,
            server_cache: Vec::new(),
            ip_map: HashMap::new(),
        }
    }

    /// Drive the session to completion. Always leaves the shared state as
    /// `Disconnected` and releases the auth token.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = self.read_loop().await;
        self.activity.set_state(SessionState::Disconnected);
        if let Some(token) = self.token.take() {
            self.ctx.auth.logout(&token);
        }
        let _ = self.stream.shutdown().await;
        match &result {
            Ok(()) => debug!(peer = %self.peer_ip, user = ?self.user_name, "session closed"),
            Err(e) => debug!(peer = %self.peer_ip, error = %e, "session ended with error"),
        }
        result
    }

    async fn read_loop(&mut self) -> Result<(), SessionError> {
        loop {
            let limit = match self.activity.state() {
                SessionState::Connected => {
                    match self
                        .ctx
                        .auth_timeout
                        .checked_sub(self.activity.connected_for())
                    {
                        Some(remaining) if !remaining.is_zero() => remaining,
                        _ => return Err(SessionError::AuthTimeout),
                    }
                }
                _ => self.ctx.idle_timeout,
            };

            let n = match timeout(limit, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(match self.activity.state() {
                        SessionState::Connected => {
                            warn!(peer = %self.peer_ip, "authentication timeout");
                            SessionError::AuthTimeout
                        }
                        _ => {
                            info!(peer = %self.peer_ip, user = ?self.user_name, "idle timeout");
                            SessionError::IdleTimeout
                        }
                    })
                }
            };
            if n == 0 {
                return Ok(());
            }

            // Drain every complete frame; a trailing partial stays buffered.
            loop {
                match extract_frame(&mut self.buf) {
                    Ok(Some((msg_type, payload))) => {
                        self.activity.touch();
                        if let Some(token) = &self.token {
                            self.ctx.auth.touch_session(token);
                        }
                        if !self.dispatch(msg_type, payload).await? {
                            return Ok(());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // Oversize or unknown-type header: drop the buffer
                        // and close without a response.
                        warn!(peer = %self.peer_ip, error = %e, "malformed frame, closing");
                        self.buf.clear();
                        return Err(e.into());
                    }
                }
            }
        }
    }

    /// Handle one frame. Returns false when the session must close.
    async fn dispatch(&mut self, msg_type: MessageType, payload: Bytes) -> Result<bool, SessionError> {
        match self.activity.state() {
            SessionState::Connected => match msg_type {
                MessageType::LoginRequest => match Message::decode(msg_type, payload) {
                    Ok(Message::LoginRequest {
                        user_name,
                        password,
                    }) => self.handle_login(user_name, password).await,
                    Ok(_) | Err(_) => {
                        self.send(Message::LoginFail(ResultCode::InvalidParameter))
                            .await?;
                        Ok(false)
                    }
                },
                other => {
                    warn!(peer = %self.peer_ip, msg = %other, "message before authentication");
                    self.send(Message::LoginFail(ResultCode::PermissionDenied))
                        .await?;
                    Ok(false)
                }
            },
            SessionState::Authenticated => match msg_type {
                MessageType::ListRequest => match Message::decode(msg_type, payload) {
                    Ok(Message::ListRequest) => self.handle_list().await,
                    _ => Ok(false),
                },
                MessageType::ReportRequest => match Message::decode(msg_type, payload) {
                    Ok(Message::ReportRequest { location, records }) => {
                        self.handle_report(location, records).await
                    }
                    Ok(_) => Ok(false),
                    Err(e) => {
                        self.send(Message::ReportFail(e.result_code())).await?;
                        Ok(false)
                    }
                },
                other => {
                    warn!(peer = %self.peer_ip, msg = %other, "unexpected message type, closing");
                    self.send(Message::LoginFail(ResultCode::InvalidParameter))
                        .await?;
                    Ok(false)
                }
            },
            SessionState::Disconnected => Ok(false),
        }
    }

    async fn handle_login(&mut self, user_name: String, password: String) -> Result<bool, SessionError> {
        match self
            .ctx
            .auth
            .authenticate(&user_name, &password, self.peer_ip)
            .await
        {
            Ok(grant) => {
                info!(peer = %self.peer_ip, user = %user_name, "session authenticated");
                self.activity.set_state(SessionState::Authenticated);
                self.activity.touch();
                self.user_name = Some(grant.user.user_name.clone());
                self.role = Some(grant.user.role);
                self.token = Some(grant.token);
                self.send(Message::LoginOk(ResultCode::Success)).await?;
                Ok(true)
            }
            Err(e) => {
                self.send(Message::LoginFail(e.result_code())).await?;
                Ok(false)
            }
        }
    }

    async fn handle_list(&mut self) -> Result<bool, SessionError> {
        let servers = match self.ctx.servers.get_active_servers().await {
            Ok(servers) => servers,
            Err(e) => {
                error!(peer = %self.peer_ip, error = %e, "server list query failed, closing");
                return Ok(false);
            }
        };

        self.ip_map = servers.iter().map(|s| (s.server_id, s.ip_addr)).collect();
        let entries: Vec<ServerEntry> = servers
            .iter()
            .map(|s| ServerEntry {
                server_id: s.server_id,
                ip_addr: s.ip_addr,
            })
            .collect();
        self.server_cache = servers;

        self.send(Message::ListResponse(entries)).await?;
        Ok(true)
    }

    async fn handle_report(
        &mut self,
        location: String,
        records: Vec<latcheck_proto::LatencyRecord>,
    ) -> Result<bool, SessionError> {
        let user_name = self.user_name.clone().unwrap_or_default();

        let may_upload = self.role.map(UserRole::may_upload_reports).unwrap_or(false);
        if !may_upload {
            warn!(peer = %self.peer_ip, user = %user_name, "report upload denied by role");
            self.ctx
                .audit
                .record(&user_name, "CREATE_REPORT", false, "permission denied");
            self.send(Message::ReportFail(ResultCode::PermissionDenied))
                .await?;
            return Ok(true);
        }

        // Resolve server_ip from the session cache; a session that never
        // listed (or an emptied cache) falls back to a fresh fetch.
        if self.ip_map.is_empty() {
            warn!(peer = %self.peer_ip, "server cache empty at report time, refetching");
            match self.ctx.servers.get_active_servers().await {
                Ok(servers) => {
                    self.ip_map = servers.iter().map(|s| (s.server_id, s.ip_addr)).collect();
                    self.server_cache = servers;
                }
                Err(e) => {
                    error!(peer = %self.peer_ip, error = %e, "server refetch failed");
                    self.send(Message::ReportFail(e.result_code())).await?;
                    return Ok(true);
                }
            }
        }

        let new_records: Vec<NewRecord> = records
            .iter()
            .map(|r| {
                let server_ip = match self.ip_map.get(&r.server_id) {
                    Some(ip) => *ip,
                    None => {
                        warn!(server_id = r.server_id, "record references unknown server");
                        0
                    }
                };
                NewRecord {
                    server_id: r.server_id,
                    server_ip,
                    latency: r.latency,
                }
            })
            .collect();

        let report = NewReport {
            user_name: user_name.clone(),
            location,
            created_at: Utc::now(),
        };

        match self.ctx.reports.create_report(&report, &new_records).await {
            Ok(report_id) => {
                self.ctx.audit.record(
                    &user_name,
                    "CREATE_REPORT",
                    true,
                    &format!("report {report_id} with {} records", new_records.len()),
                );
                self.send(Message::ReportOk(ResultCode::Success)).await?;
                Ok(true)
            }
            Err(e) => {
                error!(peer = %self.peer_ip, user = %user_name, error = %e, "report persist failed");
                self.ctx
                    .audit
                    .record(&user_name, "CREATE_REPORT", false, &e.to_string());
                self.send(Message::ReportFail(e.result_code())).await?;
                Ok(true)
            }
        }
    }

    async fn send(&mut self, msg: Message) -> Result<(), SessionError> {
        let frame = msg.encode()?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
