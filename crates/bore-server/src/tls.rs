//! TLS material for the QUIC tunnel endpoint.

use bore_core::{BoreError, BoreResult, ALPN};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Load certificate chain and key from PEM files.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> BoreResult<rustls::ServerConfig> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        BoreError::Config(format!("cannot read cert {}: {e}", cert_path.display()))
    })?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| BoreError::Config(format!("cannot read key {}: {e}", key_path.display())))?;

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(BoreError::Config(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or_else(|| {
        BoreError::Config(format!("no private key found in {}", key_path.display()))
    })?;

    server_tls_config(certs, key)
}

/// Build a QUIC-ready server config: TLS 1.3 only, *ring* provider, bore ALPN.
pub fn server_tls_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> BoreResult<rustls::ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| BoreError::Config(format!("TLS setup failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| BoreError::Config(format!("invalid certificate/key: {e}")))?;

    tls_config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(tls_config)
}

/// A freshly generated self-signed certificate.
pub struct SelfSigned {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
}

/// Generate a self-signed certificate valid for `names`.
pub fn self_signed(names: &[String]) -> BoreResult<SelfSigned> {
    let mut params = rcgen::CertificateParams::new(names.to_vec())
        .map_err(|e| BoreError::Config(format!("certificate params: {e}")))?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "bore-server self-signed");

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| BoreError::Config(format!("key generation: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| BoreError::Config(format!("certificate signing: {e}")))?;

    Ok(SelfSigned {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        cert_der: cert.der().clone(),
        key_der: PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
    })
}

/// Write a self-signed certificate for `domain` (and its wildcard) to the
/// given paths, creating parent directories.
pub fn generate_self_signed_cert(
    domain: &str,
    cert_path: &Path,
    key_path: &Path,
) -> BoreResult<(PathBuf, PathBuf)> {
    let names = vec![
        domain.to_string(),
        format!("*.{domain}"),
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ];
    let generated = self_signed(&names)?;

    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(cert_path, generated.cert_pem)?;
    std::fs::write(key_path, generated.key_pem)?;

    Ok((cert_path.to_path_buf(), key_path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_cert_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("certs/cert.pem");
        let key = dir.path().join("certs/key.pem");

        generate_self_signed_cert("tunnel.test", &cert, &key).unwrap();
        let config = load_tls_config(&cert, &key).unwrap();
        assert_eq!(config.alpn_protocols, vec![ALPN.to_vec()]);
    }

    #[test]
    fn in_memory_cert_builds_config() {
        let generated = self_signed(&["localhost".to_string()]).unwrap();
        assert!(generated.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(server_tls_config(vec![generated.cert_der], generated.key_der).is_ok());
    }

    #[test]
    fn missing_files_are_config_errors() {
        let result = load_tls_config(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"));
        assert!(matches!(result, Err(BoreError::Config(_))));
    }
}
