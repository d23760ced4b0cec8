//! # TLS
//!
//! Loads the node's PEM material and turns it into a rustls server
//! configuration. The same key and certificate double as the identity the
//! node presents on outbound hops to other nodes.
//!
//! Files looked up under `PEM_PATH`:
//!
//! | File         | Role                                                   |
//! |--------------|--------------------------------------------------------|
//! | `server.crt` | Certificate chain served to callers                    |
//! | `server.key` | Private key for `server.crt`                           |
//! | `ca.crt`     | Optional. When present, callers must present a client certificate signed by it |

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tracing::{info, warn};

use parley_protocol::error::RelayError;
use parley_protocol::transport::TlsIdentity;

pub const SERVER_CERT_FILE: &str = "server.crt";
pub const SERVER_KEY_FILE: &str = "server.key";
pub const CLIENT_CA_FILE: &str = "ca.crt";

/// PEM material read from disk.
#[derive(Clone)]
pub struct TlsMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub client_ca_pem: Option<Vec<u8>>,
}

impl TlsMaterial {
    /// Identity for outbound mutual-TLS hops.
    pub fn identity(&self) -> TlsIdentity {
        TlsIdentity::new(self.cert_pem.clone(), self.key_pem.clone())
    }
}

fn is_production(env: &str) -> bool {
    env.to_lowercase().starts_with("prod")
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, RelayError> {
    if !path.exists() {
        return Ok(None);
    }
    std::fs::read(path)
        .map(Some)
        .map_err(|e| RelayError::ServerInternal(format!("failed to read {}: {}", path.display(), e)))
}

/// Reads the node's TLS material from `pem_path`.
///
/// Without `server.crt` and `server.key` the node runs in plaintext, except
/// in production where that is a startup failure.
pub fn load_material(pem_path: &Path, env: &str) -> Result<Option<TlsMaterial>, RelayError> {
    let cert_pem = read_optional(&pem_path.join(SERVER_CERT_FILE))?;
    let key_pem = read_optional(&pem_path.join(SERVER_KEY_FILE))?;

    match (cert_pem, key_pem) {
        (Some(cert_pem), Some(key_pem)) => {
            let client_ca_pem = read_optional(&pem_path.join(CLIENT_CA_FILE))?;
            info!(
                path = %pem_path.display(),
                client_auth = client_ca_pem.is_some(),
                "tls material loaded"
            );
            Ok(Some(TlsMaterial {
                cert_pem,
                key_pem,
                client_ca_pem,
            }))
        }
        _ if is_production(env) => Err(RelayError::ServerInternal(format!(
            "certificates not found in {}",
            pem_path.display()
        ))),
        _ => {
            warn!(path = %pem_path.display(), "certificates not found, serving without TLS");
            Ok(None)
        }
    }
}

fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>, RelayError> {
    let mut reader = std::io::BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|e| RelayError::ServerInternal(format!("failed to parse {what}: {e}")))?;
    if certs.is_empty() {
        return Err(RelayError::ServerInternal(format!("no certificates found in {what}")));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, RelayError> {
    let mut reader = std::io::BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| RelayError::ServerInternal(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| RelayError::ServerInternal("no private key found".to_owned()))
}

/// Builds the rustls server configuration for `material`.
pub fn server_config(material: &TlsMaterial) -> Result<ServerConfig, RelayError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let certs = parse_certs(&material.cert_pem, SERVER_CERT_FILE)?;
    let key = parse_key(&material.key_pem)?;

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| RelayError::ServerInternal(format!("unsupported tls versions: {e}")))?;

    let builder = match &material.client_ca_pem {
        Some(ca_pem) => {
            let mut roots = RootCertStore::empty();
            for cert in parse_certs(ca_pem, CLIENT_CA_FILE)? {
                roots
                    .add(cert)
                    .map_err(|e| RelayError::ServerInternal(format!("invalid client ca: {e}")))?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| RelayError::ServerInternal(format!("invalid client ca: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::ServerInternal(format!("invalid certificate/key pair: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::error::ErrorCode;

    #[test]
    fn missing_certs_outside_production_is_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_material(dir.path(), "dev").unwrap().is_none());
        assert!(load_material(dir.path(), "").unwrap().is_none());
    }

    #[test]
    fn missing_certs_in_production_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_material(dir.path(), "Production").err().unwrap();
        assert_eq!(err.code(), ErrorCode::ServerInternal);
    }

    #[test]
    fn key_without_cert_counts_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SERVER_KEY_FILE), b"key").unwrap();
        assert!(load_material(dir.path(), "staging").unwrap().is_none());
        assert!(load_material(dir.path(), "prod").is_err());
    }

    #[test]
    fn material_is_read_with_optional_ca() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SERVER_CERT_FILE), b"cert").unwrap();
        std::fs::write(dir.path().join(SERVER_KEY_FILE), b"key").unwrap();

        let material = load_material(dir.path(), "prod").unwrap().unwrap();
        assert_eq!(material.cert_pem, b"cert");
        assert!(material.client_ca_pem.is_none());

        std::fs::write(dir.path().join(CLIENT_CA_FILE), b"ca").unwrap();
        let material = load_material(dir.path(), "prod").unwrap().unwrap();
        assert_eq!(material.client_ca_pem.as_deref(), Some(&b"ca"[..]));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let material = TlsMaterial {
            cert_pem: b"not a certificate".to_vec(),
            key_pem: b"not a key".to_vec(),
            client_ca_pem: None,
        };
        assert!(server_config(&material).is_err());
    }
}
