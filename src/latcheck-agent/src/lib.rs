//! # LatCheck Probing Agent
//!
//! Measures round-trip latency from this machine to a set of target servers
//! and uploads the results to the collection server.
//!
//! A run is: dial + TLS handshake → LOGIN → LIST → concurrent ICMP probing
//! over the returned targets → REPORT upload. Probe failures are not errors;
//! a target that never answers is reported with the sentinel latency.

/// CLI argument definitions
pub mod args;
/// Agent configuration surface (JSON + flag overrides)
pub mod config;
/// Framed protocol client over a TLS stream
pub mod connection;
/// Login → list → probe → report run flow
pub mod orchestrator;
/// ICMP probe worker and the probing coordinator
pub mod probe;
/// Client-side TLS configuration
pub mod tls;
