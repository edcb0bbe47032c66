//! The process-wide TLS context.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject as _;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::session::{SessionCache, TicketKeys};

/// TLS failures close the connection without emitting further bytes.
#[derive(Debug)]
pub enum TlsError {
    /// Certificate or key material failed to load.
    Material(String),
    /// rustls rejected the configuration or the handshake.
    Tls(rustls::Error),
    /// The record layer could not move bytes.
    Io(std::io::Error),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Material(what) => write!(f, "tls material: {what}"),
            Self::Tls(err) => write!(f, "tls failure: {err}"),
            Self::Io(err) => write!(f, "tls io failure: {err}"),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<rustls::Error> for TlsError {
    fn from(src: rustls::Error) -> Self {
        Self::Tls(src)
    }
}

impl From<std::io::Error> for TlsError {
    fn from(src: std::io::Error) -> Self {
        Self::Io(src)
    }
}

/// One per process: the rustls server config plus the shared session
/// cache, built from the configured certificate and key paths.
pub struct TlsContext {
    config: Arc<ServerConfig>,
}

impl TlsContext {
    /// Loads PEM material and assembles the server config.
    ///
    /// ALPN advertises `h2` when HTTP/2 is enabled, else `http/1.1`;
    /// the engine later inspects the negotiated protocol to pick the
    /// codec. Session ids resume through the shared cache, tickets
    /// through a per-process key set.
    pub fn new(
        certificate_path: &Path,
        private_key_path: &Path,
        enable_http2: bool,
    ) -> Result<Self, TlsError> {
        let certs: Vec<CertificateDer<'static>> =
            CertificateDer::pem_file_iter(certificate_path)
                .map_err(|err| TlsError::Material(format!("{}: {err}", certificate_path.display())))?
                .collect::<Result<_, _>>()
                .map_err(|err| TlsError::Material(format!("{}: {err}", certificate_path.display())))?;
        if certs.is_empty() {
            return Err(TlsError::Material(format!(
                "{}: no certificates found",
                certificate_path.display()
            )));
        }
        let key = PrivateKeyDer::from_pem_file(private_key_path)
            .map_err(|err| TlsError::Material(format!("{}: {err}", private_key_path.display())))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        config.alpn_protocols = if enable_http2 {
            vec![b"h2".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        };
        config.session_storage = Arc::new(SessionCache::new());
        config.ticketer = Arc::new(TicketKeys::generate()?);
        // No early data: request bytes only flow after the handshake.
        config.max_early_data_size = 0;

        tracing::debug!(
            alpn = if enable_http2 { "h2" } else { "http/1.1" },
            cert = %certificate_path.display(),
            "tls context ready"
        );
        Ok(Self {
            config: Arc::new(config),
        })
    }

    #[must_use]
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("alpn", &self.config.alpn_protocols)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testdata(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
    }

    #[test]
    fn context_builds_with_h2_alpn() {
        let context =
            TlsContext::new(&testdata("cert.pem"), &testdata("key.pem"), true).unwrap();
        assert_eq!(context.config().alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn context_builds_with_http11_alpn() {
        let context =
            TlsContext::new(&testdata("cert.pem"), &testdata("key.pem"), false).unwrap();
        assert_eq!(
            context.config().alpn_protocols,
            vec![b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn missing_material_is_reported() {
        let err = TlsContext::new(
            &testdata("missing.pem"),
            &testdata("key.pem"),
            true,
        )
        .unwrap_err();
        assert!(matches!(err, TlsError::Material(_)));
    }
}
