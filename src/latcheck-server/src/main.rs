//! LatCheck collection server binary.
//!
//! Startup order: configuration → logging → database pool → DAOs → auth →
//! TLS → dispatcher. Shutdown runs in reverse on SIGINT.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use latcheck_server::args::Args;
use latcheck_server::audit::AuditLog;
use latcheck_server::auth::{AuthConfig, AuthManager};
use latcheck_server::bootstrap::load_ip_results;
use latcheck_server::config::Config;
use latcheck_server::db::pool::{DbPool, PoolOptions};
use latcheck_server::db::schema::apply_schema;
use latcheck_server::db::{ReportDao, ServerDao, UserDao};
use latcheck_server::peer_policy::PeerPolicy;
use latcheck_server::server::Dispatcher;
use latcheck_server::session::SessionContext;
use latcheck_server::tls::{build_server_config, load_certs, load_key, load_root_store};

/// Cadence of auth-ledger maintenance (expired sessions, lockouts).
const AUTH_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let args = Args::parse();
    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        Config::default()
    };
    apply_overrides(&mut config, &args);

    let _log_guard = init_logging(&config, args.log_level.as_deref());
    run_server(config, args).await
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(cert) = &args.cert {
        config.tls.certificate_path = cert.clone();
    }
    if let Some(key) = &args.key {
        config.tls.private_key_path = key.clone();
    }
    if let Some(ca) = &args.ca_cert {
        config.tls.ca_certificate_path = Some(ca.clone());
    }
    if args.require_client_cert {
        config.tls.require_client_cert = true;
    }
    if let Some(url) = &args.db_url {
        config.database.url = Some(url.clone());
    }
    if let Some(level) = &args.log_level {
        config.log.level = level.clone();
    }
}

fn init_logging(
    config: &Config,
    level_override: Option<&str>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level: Level = level_override
        .unwrap_or(&config.log.level)
        .parse()
        .unwrap_or(Level::INFO);

    if let (Some(dir), true) = (&config.log.file_path, config.log.enable_file) {
        let appender = tracing_appender::rolling::hourly(dir, "latcheck-server.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        if config.log.enable_console {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(non_blocking.and(std::io::stdout))
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(non_blocking)
                .init();
        }
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
        None
    }
}

async fn run_server(config: Config, args: Args) -> Result<()> {
    info!(
        host = %config.server.host,
        port = config.server.port,
        max_connections = config.server.max_connections,
        "starting LatCheck server"
    );

    let audit = match &config.log.audit_path {
        Some(path) => AuditLog::open(path)?,
        None => {
            warn!("no audit path configured, audit trail disabled");
            AuditLog::disabled()
        }
    };

    // Database pool and DAOs.
    let db_url = config.database.url();
    let pool = DbPool::connect(PoolOptions {
        min_connections: config.database.min_connections,
        max_connections: config.database.max_connections,
        acquire_timeout: config.database.connection_timeout(),
        health_check_interval: config.database.idle_timeout(),
        url: db_url.clone(),
    })
    .await
    .context("initializing database pool")?;
    info!(
        min = config.database.min_connections,
        max = config.database.max_connections,
        "database pool initialized"
    );

    if args.init_db {
        let mut conn = pool.acquire().await?;
        apply_schema(&mut conn, &db_url)
            .await
            .context("applying database schema")?;
        conn.release().await;
        info!("database schema applied");
    }

    let health_task = pool.spawn_health_check();

    let users = UserDao::new(Arc::clone(&pool));
    let servers = ServerDao::new(Arc::clone(&pool));
    let reports = ReportDao::new(Arc::clone(&pool));

    if let Some(bootstrap) = &args.bootstrap_file {
        load_ip_results(bootstrap, &servers).await?;
    }

    let auth = Arc::new(AuthManager::new(users, audit.clone(), AuthConfig::default()));
    let cleanup_task = {
        let auth = Arc::clone(&auth);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(AUTH_CLEANUP_INTERVAL);
            loop {
                ticker.tick().await;
                auth.cleanup_expired();
            }
        })
    };

    // TLS and peer policy.
    let certs = load_certs(&config.tls.certificate_path)?;
    let key = load_key(&config.tls.private_key_path)?;
    let client_ca = config
        .tls
        .ca_certificate_path
        .as_deref()
        .map(load_root_store)
        .transpose()?;
    let tls_config = build_server_config(certs, key, client_ca, config.tls.require_client_cert)?;
    let acceptor = TlsAcceptor::from(tls_config);
    let policy = PeerPolicy::from_config(&config.tls)?;

    let ctx = Arc::new(SessionContext {
        auth: Arc::clone(&auth),
        servers,
        reports,
        audit,
        auth_timeout: config.server.auth_timeout(),
        idle_timeout: config.server.connection_timeout(),
    });

    let dispatcher = Dispatcher::new(
        acceptor,
        policy,
        ctx,
        config.server.max_connections,
        config.server.connection_timeout(),
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;

    let result = tokio::select! {
        result = Arc::clone(&dispatcher).run(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
            Ok(())
        }
    };

    // Reverse of startup order.
    cleanup_task.abort();
    auth.cleanup_expired();
    health_task.abort();
    pool.close().await;
    info!("shutdown complete");

    result
}
