// Shared transport configuration for opening RouterOS API sockets.
//
// The API listens on 8728 (plain TCP) and 8729 (API-SSL). Routers ship
// self-signed certificates, so TLS either pins a custom CA or accepts any
// certificate, mirroring how local controllers are usually reached.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use secrecy::SecretString;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::Error;

pub const DEFAULT_API_PORT: u16 = 8728;
pub const DEFAULT_API_SSL_PORT: u16 = 8729;

/// TLS mode for API-SSL connections.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Plain TCP (port 8728).
    #[default]
    Disabled,
    /// Verify against a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate (factory self-signed routers).
    DangerAcceptInvalid,
}

impl TlsMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Login credentials for the API user.
#[derive(Debug, Clone)]
pub struct RouterCredentials {
    pub username: String,
    pub password: SecretString,
}

/// Where and how to open API sockets.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    /// Explicit port; falls back to 8728 / 8729 based on `tls`.
    pub port: Option<u16>,
    pub tls: TlsMode,
    pub connect_timeout: Duration,
    /// Per-reply read timeout while a command is in flight.
    pub io_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "192.168.88.1".into(),
            port: None,
            tls: TlsMode::Disabled,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(10),
        }
    }
}

/// Byte stream a session runs over (plain TCP or TLS).
pub trait ApiStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ApiStream for T {}

impl TransportConfig {
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.tls.is_enabled() {
            DEFAULT_API_SSL_PORT
        } else {
            DEFAULT_API_PORT
        })
    }

    /// `host:port` label used in logs and breaker names.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.effective_port())
    }

    /// Open a socket, performing the TLS handshake when enabled.
    pub async fn connect(&self) -> Result<Box<dyn ApiStream>, Error> {
        let addr = (self.host.as_str(), self.effective_port());
        debug!(endpoint = %self.endpoint(), tls = self.tls.is_enabled(), "opening RouterOS socket");

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout {
                timeout_secs: self.connect_timeout.as_secs(),
            })??;
        tcp.set_nodelay(true)?;

        if !self.tls.is_enabled() {
            return Ok(Box::new(tcp));
        }

        let connector = tokio_rustls::TlsConnector::from(Arc::new(self.tls_config()?));
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| Error::Tls(format!("invalid server name '{}': {e}", self.host)))?;
        let tls = tokio::time::timeout(self.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::Timeout {
                timeout_secs: self.connect_timeout.as_secs(),
            })?
            .map_err(|e| Error::Tls(format!("handshake failed: {e}")))?;
        Ok(Box::new(tls))
    }

    fn tls_config(&self) -> Result<rustls::ClientConfig, Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(format!("unsupported protocol versions: {e}")))?;

        match &self.tls {
            TlsMode::CustomCa(path) => {
                let mut roots = RootCertStore::empty();
                let certs = CertificateDer::pem_file_iter(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                for cert in certs {
                    let cert = cert.map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                    roots
                        .add(cert)
                        .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                }
                Ok(builder.with_root_certificates(roots).with_no_client_auth())
            }
            TlsMode::DangerAcceptInvalid | TlsMode::Disabled => Ok(builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
                .with_no_client_auth()),
        }
    }
}

/// Certificate verifier that trusts any chain but still checks handshake
/// signatures.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
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
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
