//! CLI argument definitions for the collection server.

use clap::Parser;
use std::path::PathBuf;

/// LatCheck collection server CLI arguments
#[derive(Parser, Debug)]
#[command(name = "latcheck-server", version, about = "LatCheck latency report collection server")]
pub struct Args {
    /// JSON configuration file
    #[arg(long, default_value = "config/server.json")]
    pub config: PathBuf,

    /// Override the listen host
    #[arg(long)]
    pub host: Option<String>,

    /// Override the listen port
    #[arg(long)]
    pub port: Option<u16>,

    /// Override the TLS certificate file (PEM)
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Override the TLS private key file (PEM)
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Override the CA certificate used to verify agent certificates
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,

    /// Reject agents that present no client certificate
    #[arg(long)]
    pub require_client_cert: bool,

    /// Override the database connection URL
    #[arg(long)]
    pub db_url: Option<String>,

    /// Create the database schema on startup
    #[arg(long)]
    pub init_db: bool,

    /// Bootstrap file of probing targets (id, status, ip, latency, description)
    #[arg(long)]
    pub bootstrap_file: Option<PathBuf>,

    /// Override the log level (trace|debug|info|warn|error)
    #[arg(long)]
    pub log_level: Option<String>,
}
