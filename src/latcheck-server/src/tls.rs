//! Server-side TLS configuration.
//!
//! Protocol floor is TLS 1.2 (1.3 negotiated when both peers support it).
//! The server always presents its own certificate; peer (client) certificate
//! handling depends on configuration: with a CA configured the chain is
//! verified, and `require_client_cert` decides whether a missing certificate
//! is fatal at handshake time.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};

/// Load TLS certificates from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening cert file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("parsing certificates")
}

/// Load a private key from a PEM file.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening key file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)
        .context("parsing private key")?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

/// Load a CA bundle into a root store for peer verification.
pub fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .context("adding CA certificate to root store")?;
    }
    if roots.is_empty() {
        bail!("CA file {} contains no certificates", path.display());
    }
    Ok(roots)
}

/// Build the rustls server configuration.
///
/// `client_ca` enables peer-chain verification against that store;
/// `require_client_cert` additionally rejects peers that present nothing.
/// Requiring a client certificate without a CA to verify it against is a
/// configuration error.
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_ca: Option<RootCertStore>,
    require_client_cert: bool,
) -> Result<Arc<ServerConfig>> {
    let builder = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ]);

    let config = match client_ca {
        Some(roots) => {
            let verifier_builder = WebPkiClientVerifier::builder(Arc::new(roots));
            let verifier = if require_client_cert {
                verifier_builder.build()
            } else {
                verifier_builder.allow_unauthenticated().build()
            }
            .context("building client certificate verifier")?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
                .context("configuring server certificate")?
        }
        None => {
            if require_client_cert {
                bail!("require_client_cert is set but no CA certificate is configured");
            }
            builder
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .context("configuring server certificate")?
        }
    };

    Ok(Arc::new(config))
}
