//! TLS configuration for the provider server.
//!
//! Kubernetes rotates serving certificates by rewriting the mounted secret,
//! so the key pair is re-read from the cert directory on every handshake
//! instead of once at startup; no signal handling or file watching is
//! involved. A client CA file switches on required client certificate
//! verification for callers that deploy the controller with mTLS.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use thiserror::Error;
use tracing::error;

/// Certificate file name inside the cert directory.
pub const TLS_CERT_FILE: &str = "tls.crt";

/// Private key file name inside the cert directory.
pub const TLS_KEY_FILE: &str = "tls.key";

/// Errors building the TLS server configuration.
#[derive(Debug, Error)]
pub enum TlsConfigError {
    /// A PEM file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// The offending path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The certificate file held no certificates.
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    /// The key file held no private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// The private key is not usable by the crypto provider.
    #[error("unusable private key in {path}: {source}")]
    InvalidKey {
        /// The offending path.
        path: PathBuf,
        /// The underlying rustls error.
        source: rustls::Error,
    },

    /// The client CA bundle could not be turned into a verifier.
    #[error("invalid client CA bundle {path}: {message}")]
    ClientCa {
        /// The offending path.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },
}

/// Builds a rustls server config that reloads the key pair from `cert_dir`
/// on each handshake. When `ca_cert_file` is given, client certificates are
/// required and verified against it.
///
/// # Errors
///
/// Fails when the initial key pair does not load (so misconfiguration
/// surfaces at startup, not on the first handshake) or when the CA bundle
/// is unusable.
pub fn build_server_config(
    cert_dir: &Path,
    ca_cert_file: Option<&Path>,
) -> Result<rustls::ServerConfig, TlsConfigError> {
    load_certified_key(cert_dir)?;
    let resolver = Arc::new(ReloadingCertResolver {
        cert_dir: cert_dir.to_path_buf(),
    });

    let builder = rustls::ServerConfig::builder();
    let mut config = match ca_cert_file {
        Some(path) => builder.with_client_cert_verifier(client_verifier(path)?),
        None => builder.with_no_client_auth(),
    }
    .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Resolves the serving certificate by reading it from disk per handshake.
#[derive(Debug)]
struct ReloadingCertResolver {
    cert_dir: PathBuf,
}

impl ResolvesServerCert for ReloadingCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match load_certified_key(&self.cert_dir) {
            Ok(key) => Some(Arc::new(key)),
            Err(error) => {
                error!(error = %error, "failed to reload TLS key pair");
                None
            }
        }
    }
}

fn load_certified_key(cert_dir: &Path) -> Result<CertifiedKey, TlsConfigError> {
    let cert_path = cert_dir.join(TLS_CERT_FILE);
    let key_path = cert_dir.join(TLS_KEY_FILE);

    let certs = read_certs(&cert_path)?;
    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificates(cert_path));
    }

    let mut reader = open(&key_path)?;
    let key_der = rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsConfigError::Read {
            path: key_path.clone(),
            source,
        })?
        .ok_or_else(|| TlsConfigError::NoPrivateKey(key_path.clone()))?;
    let signing_key =
        rustls::crypto::ring::sign::any_supported_type(&key_der).map_err(|source| {
            TlsConfigError::InvalidKey {
                path: key_path,
                source,
            }
        })?;

    Ok(CertifiedKey::new(certs, signing_key))
}

fn client_verifier(
    path: &Path,
) -> Result<Arc<dyn rustls::server::danger::ClientCertVerifier>, TlsConfigError> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(path)? {
        roots
            .add(cert)
            .map_err(|error| TlsConfigError::ClientCa {
                path: path.to_path_buf(),
                message: error.to_string(),
            })?;
    }
    if roots.is_empty() {
        return Err(TlsConfigError::ClientCa {
            path: path.to_path_buf(),
            message: "bundle holds no CA certificates".to_string(),
        });
    }

    WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|error| TlsConfigError::ClientCa {
            path: path.to_path_buf(),
            message: error.to_string(),
        })
}

fn read_certs(
    path: &Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, TlsConfigError> {
    let mut reader = open(path)?;
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn open(path: &Path) -> Result<BufReader<File>, TlsConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn install_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    #[test]
    fn missing_cert_dir_fails_at_startup() {
        install_provider();
        let dir = TempDir::new().unwrap();
        let error = build_server_config(&dir.path().join("absent"), None).unwrap_err();
        assert!(matches!(error, TlsConfigError::Read { .. }));
    }

    #[test]
    fn empty_cert_file_reports_no_certificates() {
        install_provider();
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(TLS_CERT_FILE), "not a pem").unwrap();
        fs::write(dir.path().join(TLS_KEY_FILE), "not a pem").unwrap();

        let error = build_server_config(dir.path(), None).unwrap_err();
        assert!(matches!(error, TlsConfigError::NoCertificates(_)));
    }

    #[test]
    fn empty_ca_bundle_is_rejected() {
        install_provider();
        let dir = TempDir::new().unwrap();
        let ca_path = dir.path().join("ca.crt");
        fs::write(&ca_path, "").unwrap();

        let error = client_verifier(&ca_path).unwrap_err();
        assert!(matches!(error, TlsConfigError::ClientCa { .. }));
    }

    #[test]
    fn missing_ca_file_is_a_read_error() {
        install_provider();
        let dir = TempDir::new().unwrap();
        let error = client_verifier(&dir.path().join("ca.crt")).unwrap_err();
        assert!(matches!(error, TlsConfigError::Read { .. }));
    }
}
