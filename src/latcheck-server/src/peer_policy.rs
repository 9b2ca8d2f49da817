//! Peer-certificate subject policy.
//!
//! After the TLS handshake the dispatcher extracts the Common Name from the
//! peer's leaf certificate and applies the configured allow/deny list.
//! Whitelist and blacklist are mutually exclusive; with neither enabled any
//! chain-valid peer is accepted.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rustls::pki_types::CertificateDer;
use thiserror::Error;
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

use crate::config::TlsConfig;

/// Subject filter applied to inbound peers.
#[derive(Debug, Clone)]
pub enum PeerPolicy {
    /// Accept any peer the TLS layer admitted
    Open,
    /// Peer Common Name must appear in the set
    Whitelist(HashSet<String>),
    /// Peer Common Name must not appear in the set
    Blacklist(HashSet<String>),
}

/// Why a peer was turned away.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("peer presented no certificate")]
    NoCertificate,

    #[error("peer certificate has no Common Name")]
    NoCommonName,

    #[error("peer {0:?} is not on the whitelist")]
    NotWhitelisted(String),

    #[error("peer {0:?} is blacklisted")]
    Blacklisted(String),
}

impl PeerPolicy {
    /// Build the policy from TLS configuration, loading the subject file.
    pub fn from_config(tls: &TlsConfig) -> Result<Self> {
        match (tls.use_whitelist, tls.use_blacklist) {
            (true, true) => bail!("whitelist and blacklist are mutually exclusive"),
            (true, false) => {
                let path = tls
                    .whitelist_path
                    .as_deref()
                    .context("use_whitelist set without whitelist_path")?;
                Ok(PeerPolicy::Whitelist(load_subject_list(path)?))
            }
            (false, true) => {
                let path = tls
                    .blacklist_path
                    .as_deref()
                    .context("use_blacklist set without blacklist_path")?;
                Ok(PeerPolicy::Blacklist(load_subject_list(path)?))
            }
            (false, false) => Ok(PeerPolicy::Open),
        }
    }

    /// Evaluate the peer's certificate chain (leaf first, as rustls hands it
    /// out). Returns the peer's Common Name when one was presented.
    ///
    /// A whitelist demands a certificate with a listed CN. A blacklist only
    /// rejects peers whose CN is listed; peers without a certificate pass,
    /// since certificate presence is `require_client_cert`'s concern.
    pub fn check(
        &self,
        chain: Option<&[CertificateDer<'_>]>,
    ) -> Result<Option<String>, PolicyError> {
        let leaf = chain.and_then(|certs| certs.first());
        let common_name = leaf.and_then(peer_common_name);

        match self {
            PeerPolicy::Open => Ok(common_name),
            PeerPolicy::Whitelist(allowed) => {
                if leaf.is_none() {
                    return Err(PolicyError::NoCertificate);
                }
                let cn = common_name.ok_or(PolicyError::NoCommonName)?;
                if allowed.contains(&cn) {
                    Ok(Some(cn))
                } else {
                    Err(PolicyError::NotWhitelisted(cn))
                }
            }
            PeerPolicy::Blacklist(denied) => match common_name {
                Some(cn) if denied.contains(&cn) => Err(PolicyError::Blacklisted(cn)),
                other => Ok(other),
            },
        }
    }
}

/// Extract the subject Common Name from a DER certificate.
pub fn peer_common_name(cert: &CertificateDer<'_>) -> Option<String> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned);
    cn
}

/// One subject per line; blank lines and `#` comments are skipped.
fn load_subject_list(path: &Path) -> Result<HashSet<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading subject list {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair};
    use std::io::Write;

    fn cert_with_cn(cn: &str) -> CertificateDer<'static> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.self_signed(&key).unwrap().der().clone()
    }

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extracts_common_name() {
        let cert = cert_with_cn("agent-01");
        assert_eq!(peer_common_name(&cert).as_deref(), Some("agent-01"));
    }

    #[test]
    fn open_policy_accepts_anything() {
        let policy = PeerPolicy::Open;
        assert_eq!(policy.check(None).unwrap(), None);

        let chain = [cert_with_cn("agent-01")];
        assert_eq!(
            policy.check(Some(&chain)).unwrap().as_deref(),
            Some("agent-01")
        );
    }

    #[test]
    fn whitelist_requires_listed_cn() {
        let policy = PeerPolicy::Whitelist(set(&["agent-01", "agent-02"]));

        let listed = [cert_with_cn("agent-02")];
        assert_eq!(
            policy.check(Some(&listed)).unwrap().as_deref(),
            Some("agent-02")
        );

        let unlisted = [cert_with_cn("intruder")];
        assert_eq!(
            policy.check(Some(&unlisted)).unwrap_err(),
            PolicyError::NotWhitelisted("intruder".into())
        );

        assert_eq!(policy.check(None).unwrap_err(), PolicyError::NoCertificate);
    }

    #[test]
    fn blacklist_rejects_listed_cn_only() {
        let policy = PeerPolicy::Blacklist(set(&["banned"]));

        let banned = [cert_with_cn("banned")];
        assert_eq!(
            policy.check(Some(&banned)).unwrap_err(),
            PolicyError::Blacklisted("banned".into())
        );

        let fine = [cert_with_cn("agent-01")];
        assert_eq!(
            policy.check(Some(&fine)).unwrap().as_deref(),
            Some("agent-01")
        );

        // No certificate: nothing to deny.
        assert_eq!(policy.check(None).unwrap(), None);
    }

    #[test]
    fn subject_list_parsing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# trusted agents").unwrap();
        writeln!(file, "agent-01").unwrap();
        writeln!(file, "  agent-02  ").unwrap();
        writeln!(file).unwrap();

        let subjects = load_subject_list(file.path()).unwrap();
        assert_eq!(subjects, set(&["agent-01", "agent-02"]));
    }

    #[test]
    fn both_lists_rejected() {
        let tls = TlsConfig {
            use_whitelist: true,
            use_blacklist: true,
            ..TlsConfig::default()
        };
        assert!(PeerPolicy::from_config(&tls).is_err());
    }

    #[test]
    fn open_policy_from_default_config() {
        let policy = PeerPolicy::from_config(&TlsConfig::default()).unwrap();
        assert!(matches!(policy, PeerPolicy::Open));
    }
}
