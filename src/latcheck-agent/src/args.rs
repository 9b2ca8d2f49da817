//! CLI argument definitions for the probing agent.

use clap::Parser;
use std::path::PathBuf;

/// LatCheck probing agent CLI arguments
#[derive(Parser, Debug)]
#[command(name = "latcheck-agent", version, about = "LatCheck latency probing agent")]
pub struct Args {
    /// JSON configuration file
    #[arg(long, default_value = "config/agent.json")]
    pub config: PathBuf,

    /// Override the collection server host
    #[arg(long)]
    pub server: Option<String>,

    /// Override the collection server port
    #[arg(long)]
    pub port: Option<u16>,

    /// Override the probe worker count
    #[arg(long)]
    pub threads: Option<usize>,

    /// Override the account name
    #[arg(long)]
    pub username: Option<String>,

    /// Override the account password
    #[arg(long)]
    pub password: Option<String>,

    /// Override the reported location string
    #[arg(long)]
    pub location: Option<String>,

    /// Accept the server certificate without verification
    #[arg(long)]
    pub ignore_ssl_errors: bool,

    /// Override the CA bundle used to verify the server
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,

    /// Override the client certificate (PEM)
    #[arg(long)]
    pub client_cert: Option<PathBuf>,

    /// Override the client private key (PEM)
    #[arg(long)]
    pub client_key: Option<PathBuf>,

    /// Dial and handshake only, then exit
    #[arg(long)]
    pub test_connection: bool,

    /// Override the log level (trace|debug|info|warn|error)
    #[arg(long)]
    pub log_level: Option<String>,
}
