//! One measurement run: login, list, probe, upload.
//!
//! A LOGIN_FAIL terminates the run immediately. Probe failures do not: a
//! target that never answered is uploaded as a regular record carrying the
//! sentinel latency.

use std::sync::Arc;
use std::time::Duration;

use latcheck_proto::{LatencyRecord, Message, ResultCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::connection::{ClientConnection, NetError};
use crate::probe::{Coordinator, ProbeEvent, ProbeResult, Prober};

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Targets the server handed out
    pub target_count: usize,
    /// Finalized measurements, sorted by `server_id`
    pub results: Vec<ProbeResult>,
    /// Targets that answered at least once
    pub reachable: usize,
}

/// Run-level failures. Transport errors pass through.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error("login rejected: {0}")]
    LoginRejected(ResultCode),

    #[error("report rejected: {0}")]
    ReportRejected(ResultCode),
}

/// Per-run knobs beyond the connection itself.
pub struct RunOptions {
    pub user_name: String,
    pub password: String,
    pub location: String,
    pub workers: usize,
    /// Pause between probe attempts; production keeps the default
    pub retry_delay: Duration,
}

/// Drive a full login → list → probe → report run over an established
/// connection.
pub async fn run_check<S>(
    conn: &mut ClientConnection<S>,
    prober: Arc<dyn Prober>,
    opts: RunOptions,
) -> Result<RunSummary, RunError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Authenticate.
    let reply = conn
        .request(Message::LoginRequest {
            user_name: opts.user_name.clone(),
            password: opts.password.clone(),
        })
        .await?;
    match reply {
        Message::LoginOk(_) => info!(user = %opts.user_name, "login accepted"),
        Message::LoginFail(code) => return Err(RunError::LoginRejected(code)),
        other => {
            return Err(NetError::Unexpected {
                expected: "LOGIN_OK",
                got: other.msg_type(),
            }
            .into())
        }
    }

    // Fetch the target list.
    let servers = match conn.request(Message::ListRequest).await? {
        Message::ListResponse(servers) => servers,
        Message::LoginFail(code) => return Err(RunError::LoginRejected(code)),
        other => {
            return Err(NetError::Unexpected {
                expected: "LIST_RESPONSE",
                got: other.msg_type(),
            }
            .into())
        }
    };
    info!(count = servers.len(), "received target list");

    // Probe.
    let coordinator =
        Coordinator::new(prober, opts.workers).with_retry_delay(opts.retry_delay);
    let mut run = coordinator.start(servers.clone());

    let mut results = Vec::new();
    while let Some(event) = run.next_event().await {
        match event {
            ProbeEvent::Result(result) => {
                if result.latency == latcheck_proto::MAX_LATENCY {
                    warn!(server_id = result.server_id, "target never answered");
                }
            }
            ProbeEvent::Progress { done, total } => {
                info!(done, total, "probing progress");
            }
            ProbeEvent::Finished(collected) => {
                results = collected;
                break;
            }
        }
    }
    results.sort_unstable_by_key(|r| r.server_id);
    let reachable = results
        .iter()
        .filter(|r| r.latency < latcheck_proto::MAX_LATENCY)
        .count();

    // Upload. Sentinel latencies travel as regular records.
    let records: Vec<LatencyRecord> = results
        .iter()
        .map(|r| LatencyRecord {
            server_id: r.server_id,
            latency: r.latency,
        })
        .collect();
    let reply = conn
        .request(Message::ReportRequest {
            location: opts.location.clone(),
            records,
        })
        .await?;
    match reply {
        Message::ReportOk(_) => {
            info!(
                targets = servers.len(),
                reachable,
                "report uploaded"
            );
            Ok(RunSummary {
                target_count: servers.len(),
                results,
                reachable,
            })
        }
        Message::ReportFail(code) => Err(RunError::ReportRejected(code)),
        other => Err(NetError::Unexpected {
            expected: "REPORT_OK",
            got: other.msg_type(),
        }
        .into()),
    }
}
