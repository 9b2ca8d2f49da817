//! LatCheck probing agent binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use latcheck_agent::args::Args;
use latcheck_agent::config::AgentConfig;
use latcheck_agent::connection::{connect_tls, test_connection};
use latcheck_agent::orchestrator::{run_check, RunOptions};
use latcheck_agent::probe::coordinator::RETRY_DELAY;
use latcheck_agent::probe::IcmpProber;
use latcheck_agent::tls::build_client_config;

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let args = Args::parse();
    let mut config = if args.config.exists() {
        AgentConfig::load(&args.config)?
    } else {
        AgentConfig::default()
    };
    apply_overrides(&mut config, &args);

    let _log_guard = init_logging(&config);
    run_agent(config, args.test_connection).await
}

fn apply_overrides(config: &mut AgentConfig, args: &Args) {
    if let Some(server) = &args.server {
        config.server_host = server.clone();
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(username) = &args.username {
        config.username = username.clone();
    }
    if let Some(password) = &args.password {
        config.password = password.clone();
    }
    if let Some(location) = &args.location {
        config.location = location.clone();
    }
    if args.ignore_ssl_errors {
        config.ignore_ssl_errors = true;
    }
    if let Some(ca) = &args.ca_cert {
        config.ca_certificate_path = Some(ca.clone());
    }
    if let Some(cert) = &args.client_cert {
        config.client_certificate_path = Some(cert.clone());
    }
    if let Some(key) = &args.client_key {
        config.client_key_path = Some(key.clone());
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
}

fn init_logging(config: &AgentConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level: Level = config.log_level.parse().unwrap_or(Level::INFO);

    if let Some(dir) = &config.log_path {
        let appender = tracing_appender::rolling::hourly(dir, "latcheck-agent.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(non_blocking.and(std::io::stdout))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
        None
    }
}

async fn run_agent(config: AgentConfig, connection_test_only: bool) -> Result<()> {
    let client_identity = match (
        &config.client_certificate_path,
        &config.client_key_path,
    ) {
        (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
        _ => None,
    };
    let tls = build_client_config(
        config.ca_certificate_path.as_deref(),
        client_identity,
        config.ignore_ssl_errors,
    )?;

    if connection_test_only {
        test_connection(&config.server_host, config.server_port, tls)
            .await
            .context("connection test failed")?;
        info!("server is reachable");
        return Ok(());
    }

    let mut conn = connect_tls(&config.server_host, config.server_port, tls)
        .await
        .context("connecting to collection server")?;

    let summary = run_check(
        &mut conn,
        Arc::new(IcmpProber::new()),
        RunOptions {
            user_name: config.username.clone(),
            password: config.password.clone(),
            location: config.location.clone(),
            workers: config.threads,
            retry_delay: RETRY_DELAY,
        },
    )
    .await
    .context("measurement run failed")?;

    conn.shutdown().await.ok();

    info!(
        targets = summary.target_count,
        reachable = summary.reachable,
        unreachable = summary.target_count - summary.reachable,
        "run complete"
    );
    Ok(())
}
