//! Orchestrator tests against a scripted in-memory server.
//!
//! The run flow is generic over the connection's stream, so these tests put
//! a minimal protocol server on the far end of a duplex pipe and script the
//! prober, covering the happy path and both rejection paths.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use latcheck_agent::connection::ClientConnection;
use latcheck_agent::orchestrator::{run_check, RunError, RunOptions};
use latcheck_agent::probe::Prober;
use latcheck_proto::{
    extract_frame, LatencyRecord, Message, ResultCode, ServerEntry, MAX_LATENCY,
};

/// Latency script keyed by the last IP octet; everything else fails.
struct OctetProber;

#[async_trait]
impl Prober for OctetProber {
    async fn probe(&self, target: Ipv4Addr) -> u32 {
        match target.octets()[3] {
            100 => 27,
            _ => MAX_LATENCY,
        }
    }
}

async fn read_message(io: &mut DuplexStream, buf: &mut BytesMut) -> Message {
    loop {
        if let Some((msg_type, payload)) = extract_frame(buf).unwrap() {
            return Message::decode(msg_type, payload).unwrap();
        }
        let n = io.read_buf(buf).await.unwrap();
        assert!(n > 0, "agent closed unexpectedly");
    }
}

async fn write_message(io: &mut DuplexStream, msg: Message) {
    io.write_all(&msg.encode().unwrap()).await.unwrap();
}

fn options() -> RunOptions {
    RunOptions {
        user_name: "alice".into(),
        password: "pw-alice".into(),
        location: "lab".into(),
        workers: 2,
        retry_delay: Duration::from_millis(0),
    }
}

/// A fake collection server that follows the happy-path script and returns
/// the REPORT_REQUEST it saw.
fn spawn_happy_server(mut io: DuplexStream) -> JoinHandle<Message> {
    tokio::spawn(async move {
        let mut buf = BytesMut::new();

        let login = read_message(&mut io, &mut buf).await;
        assert!(matches!(login, Message::LoginRequest { ref user_name, .. } if user_name == "alice"));
        write_message(&mut io, Message::LoginOk(ResultCode::Success)).await;

        assert_eq!(read_message(&mut io, &mut buf).await, Message::ListRequest);
        write_message(
            &mut io,
            Message::ListResponse(vec![
                ServerEntry {
                    server_id: 1,
                    ip_addr: u32::from(Ipv4Addr::new(192, 168, 1, 100)),
                },
                ServerEntry {
                    server_id: 2,
                    ip_addr: u32::from(Ipv4Addr::new(192, 168, 1, 101)),
                },
            ]),
        )
        .await;

        let report = read_message(&mut io, &mut buf).await;
        write_message(&mut io, Message::ReportOk(ResultCode::Success)).await;
        report
    })
}

#[tokio::test]
async fn full_run_uploads_probe_results() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = spawn_happy_server(server_io);

    let mut conn = ClientConnection::new(client_io);
    let summary = run_check(&mut conn, Arc::new(OctetProber), options())
        .await
        .unwrap();

    assert_eq!(summary.target_count, 2);
    assert_eq!(summary.reachable, 1);
    assert_eq!(summary.results.len(), 2);
    assert_eq!(summary.results[0].server_id, 1);
    assert_eq!(summary.results[0].latency, 27);
    assert_eq!(summary.results[1].latency, MAX_LATENCY);

    // The server received the same records, sentinel included.
    let report = server.await.unwrap();
    assert_eq!(
        report,
        Message::ReportRequest {
            location: "lab".into(),
            records: vec![
                LatencyRecord {
                    server_id: 1,
                    latency: 27,
                },
                LatencyRecord {
                    server_id: 2,
                    latency: MAX_LATENCY,
                },
            ],
        }
    );
}

#[tokio::test]
async fn login_failure_terminates_the_run() {
    let (client_io, mut server_io) = tokio::io::duplex(4096);

    let server = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        let login = read_message(&mut server_io, &mut buf).await;
        assert!(matches!(login, Message::LoginRequest { .. }));
        write_message(&mut server_io, Message::LoginFail(ResultCode::InvalidUser)).await;

        // The agent must hang up without sending LIST_REQUEST.
        let n = server_io.read_buf(&mut buf).await.unwrap();
        assert_eq!(n, 0, "agent kept talking after LOGIN_FAIL");
    });

    let mut conn = ClientConnection::new(client_io);
    let err = run_check(&mut conn, Arc::new(OctetProber), options())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunError::LoginRejected(ResultCode::InvalidUser)
    ));

    conn.shutdown().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn report_rejection_surfaces_the_code() {
    let (client_io, mut server_io) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        read_message(&mut server_io, &mut buf).await;
        write_message(&mut server_io, Message::LoginOk(ResultCode::Success)).await;
        read_message(&mut server_io, &mut buf).await;
        write_message(
            &mut server_io,
            Message::ListResponse(vec![ServerEntry {
                server_id: 1,
                ip_addr: u32::from(Ipv4Addr::new(192, 168, 1, 100)),
            }]),
        )
        .await;
        read_message(&mut server_io, &mut buf).await;
        write_message(
            &mut server_io,
            Message::ReportFail(ResultCode::DatabaseError),
        )
        .await;
    });

    let mut conn = ClientConnection::new(client_io);
    let err = run_check(&mut conn, Arc::new(OctetProber), options())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunError::ReportRejected(ResultCode::DatabaseError)
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn empty_target_list_uploads_empty_report() {
    let (client_io, mut server_io) = tokio::io::duplex(4096);

    let server = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        read_message(&mut server_io, &mut buf).await;
        write_message(&mut server_io, Message::LoginOk(ResultCode::Success)).await;
        read_message(&mut server_io, &mut buf).await;
        write_message(&mut server_io, Message::ListResponse(Vec::new())).await;
        let report = read_message(&mut server_io, &mut buf).await;
        write_message(&mut server_io, Message::ReportOk(ResultCode::Success)).await;
        report
    });

    let mut conn = ClientConnection::new(client_io);
    let summary = run_check(&mut conn, Arc::new(OctetProber), options())
        .await
        .unwrap();
    assert_eq!(summary.target_count, 0);
    assert!(summary.results.is_empty());

    let report = server.await.unwrap();
    assert!(matches!(
        report,
        Message::ReportRequest { ref records, .. } if records.is_empty()
    ));
}
