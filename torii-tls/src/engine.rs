//! The per-connection record engine.
//!
//! rustls's in-process buffers play the role of the input/output
//! memory BIO pair: [`TlsEngine::handshake`] drains ciphertext from the
//! receive buffer and flushes produced handshake records to the send
//! buffer; after completion [`TlsEngine::decrypt`] turns ciphertext
//! into plaintext in place and [`TlsEngine::encrypt`] ships plaintext
//! out as ciphertext records.

use std::io::Read as _;
use std::sync::Arc;

use rustls::{ServerConfig, ServerConnection};

use torii_core::IoBuffer;

use crate::context::TlsError;

/// The protocol selected by ALPN, deciding which codec runs after the
/// handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnProtocol {
    Http11,
    H2,
}

pub struct TlsEngine {
    conn: ServerConnection,
}

impl TlsEngine {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        Ok(Self {
            conn: ServerConnection::new(config)?,
        })
    }

    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// The negotiated protocol; `http/1.1` when the client sent no
    /// ALPN at all.
    #[must_use]
    pub fn alpn(&self) -> AlpnProtocol {
        match self.conn.alpn_protocol() {
            Some(b"h2") => AlpnProtocol::H2,
            Some(_) | None => AlpnProtocol::Http11,
        }
    }

    /// Advances the handshake: ciphertext from `src`, produced records
    /// into `dst`. Returns true once the handshake is complete.
    pub fn handshake(&mut self, src: &mut IoBuffer, dst: &mut IoBuffer) -> Result<bool, TlsError> {
        loop {
            let mut progressed = false;

            if self.conn.wants_read() && !src.is_empty() {
                let n = self.conn.read_tls(src)?;
                progressed |= n > 0;
                if let Err(err) = self.conn.process_new_packets() {
                    // Flush the alert the peer is owed, then fail.
                    let _ = self.conn.write_tls(dst);
                    tracing::warn!(%err, "tls handshake failed");
                    return Err(err.into());
                }
            }

            while self.conn.wants_write() {
                progressed |= self.conn.write_tls(dst)? > 0;
            }

            if !self.conn.is_handshaking() {
                tracing::debug!(alpn = ?self.alpn(), "tls handshake complete");
                return Ok(true);
            }
            if !progressed {
                // Waiting on more ciphertext from the peer.
                return Ok(false);
            }
        }
    }

    /// Transforms buffered ciphertext into plaintext in place.
    ///
    /// Returns true when the peer closed the TLS session
    /// (close_notify).
    pub fn decrypt(&mut self, buf: &mut IoBuffer) -> Result<bool, TlsError> {
        // Ciphertext drains out of `buf` first; the recovered plaintext
        // collects aside and refills the buffer once, so the loop never
        // re-reads its own output.
        let mut plain = Vec::new();
        let mut peer_closed = false;

        // Plaintext may already be pending from the handshake flight.
        peer_closed |= self.drain_plaintext(&mut plain)?;

        while !buf.is_empty() {
            if self.conn.read_tls(buf)? == 0 {
                break;
            }
            peer_closed |= self.drain_plaintext(&mut plain)?;
        }

        buf.append(&plain).map_err(std::io::Error::from)?;
        Ok(peer_closed)
    }

    fn drain_plaintext(&mut self, plain: &mut Vec<u8>) -> Result<bool, TlsError> {
        let state = match self.conn.process_new_packets() {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(%err, "tls record processing failed");
                return Err(err.into());
            }
        };

        let to_read = state.plaintext_bytes_to_read();
        if to_read > 0 {
            let start = plain.len();
            plain.resize(start + to_read, 0);
            self.conn.reader().read_exact(&mut plain[start..])?;
        }
        Ok(state.peer_has_closed())
    }

    /// Replaces the plaintext in `buf` with ciphertext records.
    pub fn encrypt(&mut self, buf: &mut IoBuffer) -> Result<(), TlsError> {
        use std::io::Write as _;

        let plain = buf.read_all();
        self.conn.writer().write_all(&plain)?;
        while self.conn.wants_write() {
            self.conn.write_tls(buf)?;
        }
        Ok(())
    }

    /// Queues close_notify; the caller drains the send buffer after.
    pub fn send_close_notify(&mut self, buf: &mut IoBuffer) -> Result<(), TlsError> {
        self.conn.send_close_notify();
        while self.conn.wants_write() {
            self.conn.write_tls(buf)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEngine")
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TlsContext;

    use std::io::Read as _;
    use std::path::Path;

    use rustls::ClientConnection;
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
    use torii_core::BlockFactory;

    /// Accepts the self-signed test certificate.
    #[derive(Debug)]
    struct TrustTestCert(Arc<rustls::crypto::CryptoProvider>);

    impl ServerCertVerifier for TrustTestCert {
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
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    fn testdata(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
    }

    fn client(alpn: &[&[u8]]) -> ClientConnection {
        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
        let mut config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TrustTestCert(provider)))
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

        ClientConnection::new(
            Arc::new(config),
            ServerName::try_from("localhost").unwrap(),
        )
        .unwrap()
    }

    fn io_buffer(factory: &BlockFactory) -> IoBuffer {
        IoBuffer::new(factory, 16).unwrap()
    }

    /// Shuttles records between the client and the engine until the
    /// handshake completes on both sides.
    fn drive_handshake(
        client: &mut ClientConnection,
        engine: &mut TlsEngine,
        src: &mut IoBuffer,
        dst: &mut IoBuffer,
    ) {
        for _ in 0..16 {
            while client.wants_write() {
                let mut wire = Vec::new();
                client.write_tls(&mut wire).unwrap();
                src.append(&wire).unwrap();
            }

            engine.handshake(src, dst).unwrap();

            let server_bytes = dst.read_all();
            if !server_bytes.is_empty() {
                let mut cursor = &server_bytes[..];
                while !cursor.is_empty() {
                    client.read_tls(&mut cursor).unwrap();
                }
                client.process_new_packets().unwrap();
            }

            if !client.is_handshaking() && !engine.is_handshaking() {
                return;
            }
        }
        panic!("handshake did not converge");
    }

    #[test]
    fn handshake_negotiates_h2_and_moves_data_both_ways() {
        let context =
            TlsContext::new(&testdata("cert.pem"), &testdata("key.pem"), true).unwrap();
        let factory = BlockFactory::new(256 * 1024, 2).unwrap();
        let (mut src, mut dst) = (io_buffer(&factory), io_buffer(&factory));

        let mut client = client(&[b"h2", b"http/1.1"]);
        let mut engine = TlsEngine::new(context.config()).unwrap();
        drive_handshake(&mut client, &mut engine, &mut src, &mut dst);

        assert_eq!(engine.alpn(), AlpnProtocol::H2);

        // Client -> server: ciphertext decrypts in place.
        use std::io::Write as _;
        client.writer().write_all(b"GET / HTTP/2\r\n").unwrap();
        let mut wire = Vec::new();
        client.write_tls(&mut wire).unwrap();
        src.append(&wire).unwrap();

        let closed = engine.decrypt(&mut src).unwrap();
        assert!(!closed);
        assert_eq!(src.peek(), b"GET / HTTP/2\r\n");

        // Server -> client: plaintext leaves as records.
        dst.append(b"HTTP/2 hello").unwrap();
        engine.encrypt(&mut dst).unwrap();
        let records = dst.read_all();
        assert!(!records.is_empty());
        assert_ne!(&records[..], b"HTTP/2 hello");

        let mut cursor = &records[..];
        while !cursor.is_empty() {
            client.read_tls(&mut cursor).unwrap();
        }
        client.process_new_packets().unwrap();
        let mut plain = Vec::new();
        client.reader().read_to_end(&mut plain).ok();
        assert_eq!(plain, b"HTTP/2 hello");
    }

    #[test]
    fn alpn_falls_back_to_http11() {
        let context =
            TlsContext::new(&testdata("cert.pem"), &testdata("key.pem"), false).unwrap();
        let factory = BlockFactory::new(256 * 1024, 2).unwrap();
        let (mut src, mut dst) = (io_buffer(&factory), io_buffer(&factory));

        let mut client = client(&[b"http/1.1"]);
        let mut engine = TlsEngine::new(context.config()).unwrap();
        drive_handshake(&mut client, &mut engine, &mut src, &mut dst);

        assert_eq!(engine.alpn(), AlpnProtocol::Http11);
    }

    #[test]
    fn close_notify_is_observed_by_decrypt() {
        let context =
            TlsContext::new(&testdata("cert.pem"), &testdata("key.pem"), true).unwrap();
        let factory = BlockFactory::new(256 * 1024, 2).unwrap();
        let (mut src, mut dst) = (io_buffer(&factory), io_buffer(&factory));

        let mut client = client(&[b"h2"]);
        let mut engine = TlsEngine::new(context.config()).unwrap();
        drive_handshake(&mut client, &mut engine, &mut src, &mut dst);

        client.send_close_notify();
        let mut wire = Vec::new();
        client.write_tls(&mut wire).unwrap();
        src.append(&wire).unwrap();

        assert!(engine.decrypt(&mut src).unwrap());
    }
}
