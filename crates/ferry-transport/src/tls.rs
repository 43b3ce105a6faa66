use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use ferry_types::StorageResult;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::{TlsConfig, TransportConfig};
use crate::error::{TransportError, TransportResult};
use crate::socket::connect_tcp;
use crate::timeout::TimeoutStream;

/// A client TLS session over a timed TCP channel.
pub type TlsStream = tokio_rustls::client::TlsStream<TimeoutStream<TcpStream>>;

/// Builds TLS sessions with one trust configuration.
///
/// Cheap to clone; the rustls configuration is shared.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
    verify: bool,
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector").field("verify", &self.verify).finish()
    }
}

impl TlsConnector {
    pub fn new(config: &TlsConfig) -> StorageResult<Self> {
        Ok(Self::build(config)?)
    }

    fn build(config: &TlsConfig) -> TransportResult<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        let client = if config.verify {
            builder
                .with_root_certificates(load_roots(config)?)
                .with_no_client_auth()
        } else {
            warn!(target: "ferry::tls", "TLS certificate verification disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
                .with_no_client_auth()
        };

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client)),
            verify: config.verify,
        })
    }

    /// Connect over TCP (with retry) and complete the handshake.
    ///
    /// The presented certificate is checked against `host`.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        transport: &TransportConfig,
    ) -> StorageResult<TlsStream> {
        let name = server_name(host)?;
        let tcp = connect_tcp(host, port, transport).await?;
        let stream = self
            .inner
            .connect(name, tcp)
            .await
            .map_err(|e| handshake_error(host, port, e))?;
        debug!(target: "ferry::tls", %host, port, "TLS handshake complete");
        Ok(stream)
    }
}

fn handshake_error(host: &str, port: u16, err: std::io::Error) -> TransportError {
    use std::io::ErrorKind as IoKind;

    match err.kind() {
        IoKind::TimedOut => TransportError::Timeout(format!("TLS handshake with {host}:{port}")),
        // A dropped socket mid-handshake is a network failure, not a trust failure.
        IoKind::ConnectionReset | IoKind::ConnectionAborted | IoKind::UnexpectedEof | IoKind::BrokenPipe => {
            TransportError::Reset(format!("TLS handshake with {host}:{port}: {err}"))
        }
        _ => TransportError::Tls(format!("handshake with {host}:{port} failed: {err}")),
    }
}

/// Validate the requested host before it is used for certificate name checks.
///
/// A name with an embedded null byte could be truncated by a lower layer into
/// a different, attacker-controlled name, so it is rejected outright.
pub fn server_name(host: &str) -> TransportResult<ServerName<'static>> {
    if host.contains('\0') {
        return Err(TransportError::Tls(format!(
            "host name '{}' contains an embedded null byte",
            host.escape_default()
        )));
    }
    ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::Tls(format!("invalid host name '{host}': {e}")))
}

fn load_roots(config: &TlsConfig) -> TransportResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    if config.ca_file.is_none() && config.ca_path.is_none() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(roots);
    }
    if let Some(file) = &config.ca_file {
        add_pem_file(&mut roots, file)?;
    }
    if let Some(dir) = &config.ca_path {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| TransportError::Config(format!("unable to read CA path {}: {e}", dir.display())))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_file() {
                add_pem_file(&mut roots, &path)?;
            }
        }
    }
    if roots.is_empty() {
        return Err(TransportError::Config("no CA certificates found".into()));
    }
    Ok(roots)
}

fn add_pem_file(roots: &mut RootCertStore, path: &Path) -> TransportResult<()> {
    let file = File::open(path)
        .map_err(|e| TransportError::Config(format!("unable to open CA file {}: {e}", path.display())))?;
    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        let cert = cert?;
        roots
            .add(cert)
            .map_err(|e| TransportError::Config(format!("bad CA certificate in {}: {e}", path.display())))?;
    }
    Ok(())
}

/// Orderly TLS close: send close_notify, then release the socket.
///
/// A failure while sending close_notify is logged and otherwise ignored; the
/// socket is released either way when the stream is dropped.
pub async fn shutdown(mut stream: TlsStream) {
    if let Err(err) = stream.shutdown().await {
        debug!(target: "ferry::tls", error = %err, "TLS shutdown failed, dropping channel");
    }
}

/// Accepts any certificate; signatures are still checked so the handshake
/// itself stays well formed.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
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
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
