//! Client-side TLS configuration.
//!
//! Protocol floor TLS 1.2. Server verification uses either the configured CA
//! bundle or, with `ignore_ssl_errors`, an accept-all verifier (self-signed
//! leaves and hostname mismatches included). The client certificate + key,
//! when configured, are offered for mutual authentication regardless of the
//! verification mode.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
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

/// Build the rustls client configuration.
pub fn build_client_config(
    ca_cert: Option<&Path>,
    client_identity: Option<(&Path, &Path)>,
    ignore_ssl_errors: bool,
) -> Result<Arc<ClientConfig>> {
    let versions = [&rustls::version::TLS13, &rustls::version::TLS12];
    let builder = ClientConfig::builder_with_protocol_versions(&versions);

    let builder = if ignore_ssl_errors {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
    } else {
        let mut roots = RootCertStore::empty();
        let ca_path = ca_cert.context("server verification enabled but no CA configured")?;
        for cert in load_certs(ca_path)? {
            roots
                .add(cert)
                .context("adding CA certificate to root store")?;
        }
        builder.with_root_certificates(roots)
    };

    let config = match client_identity {
        Some((cert_path, key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .context("configuring client certificate")?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Server-certificate verifier that accepts anything.
///
/// Used only when `ignore_ssl_errors` is set: deployments with self-signed
/// server certificates opt into this explicitly.
#[derive(Debug)]
pub struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn insecure_config_without_ca() {
        build_client_config(None, None, true).unwrap();
    }

    #[test]
    fn verifying_config_requires_ca() {
        assert!(build_client_config(None, None, false).is_err());
    }

    #[test]
    fn verifying_config_with_ca() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let ca = write_temp(&certified.cert.pem());
        build_client_config(Some(ca.path()), None, false).unwrap();
    }

    #[test]
    fn client_identity_is_offered() {
        let certified = rcgen::generate_simple_self_signed(vec!["agent-01".into()]).unwrap();
        let cert = write_temp(&certified.cert.pem());
        let key = write_temp(&certified.signing_key.serialize_pem());
        let config =
            build_client_config(None, Some((cert.path(), key.path())), true).unwrap();
        assert!(config.client_auth_cert_resolver.has_certs());
    }
}
