//! TLS negotiation for backend connections.
//!
//! Builds a rustls client configuration from the `sslmode` family of
//! credentials and upgrades an established plaintext socket.
//!
//! | mode          | chain checked | hostname checked |
//! |---------------|---------------|------------------|
//! | `disable`     | no TLS        | no TLS           |
//! | `require`     | no            | no               |
//! | `verify-ca`   | yes           | no               |
//! | `verify-full` | yes           | yes              |

use crate::core::stream::BackendStream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::collections::HashMap;
use std::fmt;
use std::io::BufReader;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use zeroize::Zeroize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    /// Parse an `sslmode` value. Empty means `require`.
    pub fn parse(mode: &str) -> Result<Self, TlsError> {
        match mode {
            "disable" => Ok(SslMode::Disable),
            "" | "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(TlsError::UnsupportedMode(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved TLS settings for one backend connection.
pub struct TlsOptions {
    pub mode: SslMode,
    /// Name used for SNI and, under `verify-full`, for the hostname check.
    pub server_name: String,
    root_cert: Option<Vec<u8>>,
    client_cert: Option<Vec<u8>>,
    client_key: Option<Vec<u8>>,
}

impl TlsOptions {
    /// Build options from the SSL credentials (`sslmode`, `sslrootcert`,
    /// `sslcert`, `sslkey`, `sslhost`, `host`).
    ///
    /// With `require_can_verify_ca`, `require` plus a root CA behaves like
    /// `verify-ca`.
    pub fn from_ssl_options(
        options: &HashMap<String, String>,
        require_can_verify_ca: bool,
    ) -> Result<Self, TlsError> {
        let get = |key: &str| options.get(key).filter(|v| !v.is_empty()).cloned();

        let requested = SslMode::parse(options.get("sslmode").map(String::as_str).unwrap_or(""))?;
        let root_cert = get("sslrootcert").map(String::into_bytes);

        let mode = match requested {
            SslMode::Require if require_can_verify_ca && root_cert.is_some() => SslMode::VerifyCa,
            other => other,
        };

        if matches!(mode, SslMode::VerifyCa | SslMode::VerifyFull) && root_cert.is_none() {
            return Err(TlsError::MissingRootCert(mode));
        }

        let server_name = match mode {
            SslMode::VerifyFull => get("sslhost").or_else(|| get("host")).unwrap_or_default(),
            _ => get("host").unwrap_or_default(),
        };

        Ok(Self {
            mode,
            server_name,
            root_cert,
            client_cert: get("sslcert").map(String::into_bytes),
            client_key: get("sslkey").map(String::into_bytes),
        })
    }

    /// Options that never upgrade.
    pub fn disabled() -> Self {
        Self {
            mode: SslMode::Disable,
            server_name: String::new(),
            root_cert: None,
            client_cert: None,
            client_key: None,
        }
    }

    pub fn use_tls(&self) -> bool {
        self.mode != SslMode::Disable
    }

    /// Build the rustls client configuration for this mode.
    pub fn client_config(&self) -> Result<ClientConfig, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?;

        let builder = match self.mode {
            SslMode::Disable => {
                return Err(TlsError::Config(
                    "TLS configuration requested with sslmode \"disable\"".to_string(),
                ))
            }
            SslMode::Require => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification::new(
                    provider,
                ))),
            SslMode::VerifyCa => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(CaOnlyVerification::new(
                    self.root_store()?,
                    provider,
                ))),
            SslMode::VerifyFull => builder.with_root_certificates(self.root_store()?),
        };

        match self.client_identity()? {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TlsError::ClientCertificate(e.to_string())),
            None => Ok(builder.with_no_client_auth()),
        }
    }

    fn root_store(&self) -> Result<RootCertStore, TlsError> {
        let pem = self
            .root_cert
            .as_deref()
            .ok_or(TlsError::MissingRootCert(self.mode))?;

        let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| TlsError::InvalidRootCert)?;
        if certs.is_empty() {
            return Err(TlsError::InvalidRootCert);
        }

        let mut store = RootCertStore::empty();
        for cert in certs {
            store.add(cert).map_err(|_| TlsError::InvalidRootCert)?;
        }
        Ok(store)
    }

    fn client_identity(
        &self,
    ) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>, TlsError> {
        let Some(cert_pem) = self.client_cert.as_deref() else {
            return Ok(None);
        };

        let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::ClientCertificate(format!("invalid sslcert: {}", e)))?;
        if certs.is_empty() {
            return Err(TlsError::ClientCertificate(
                "no certificate found in sslcert".to_string(),
            ));
        }

        let key_pem = self.client_key.as_deref().ok_or_else(|| {
            TlsError::ClientCertificate("sslcert is set but sslkey is missing".to_string())
        })?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
            .map_err(|e| TlsError::ClientCertificate(format!("invalid sslkey: {}", e)))?
            .ok_or_else(|| {
                TlsError::ClientCertificate("no private key found in sslkey".to_string())
            })?;

        Ok(Some((certs, key)))
    }

    fn tls_server_name(&self) -> Result<ServerName<'static>, TlsError> {
        match ServerName::try_from(self.server_name.clone()) {
            Ok(name) => Ok(name),
            // Without a hostname check the name only feeds SNI.
            Err(_) if self.mode != SslMode::VerifyFull => Ok(ServerName::try_from("localhost")
                .map_err(|e| TlsError::InvalidServerName(e.to_string()))?),
            Err(_) => Err(TlsError::InvalidServerName(self.server_name.clone())),
        }
    }
}

impl Drop for TlsOptions {
    fn drop(&mut self) {
        if let Some(key) = self.client_key.as_mut() {
            key.zeroize();
        }
    }
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("mode", &self.mode)
            .field("server_name", &self.server_name)
            .field("root_cert", &self.root_cert.is_some())
            .field("client_cert", &self.client_cert.is_some())
            .finish()
    }
}

/// Perform the client side of a TLS handshake over any async stream.
pub async fn handshake<S>(stream: S, options: &TlsOptions) -> Result<TlsStream<S>, TlsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = options.client_config()?;
    let server_name = options.tls_server_name()?;
    debug!(
        "Starting TLS handshake (sslmode={}, server_name={:?})",
        options.mode, server_name
    );

    TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .map_err(|e| TlsError::Handshake(e.to_string()))
}

/// Upgrade a plaintext backend socket according to `options`.
///
/// `disable` returns the socket unchanged.
pub async fn upgrade(stream: TcpStream, options: &TlsOptions) -> Result<BackendStream, TlsError> {
    if !options.use_tls() {
        return Ok(BackendStream::Tcp(stream));
    }
    let tls = handshake(stream, options).await?;
    Ok(BackendStream::Tls(Box::new(tls)))
}

/// Accepts any server certificate; handshake signatures are still checked.
#[derive(Debug)]
struct NoCertificateVerification {
    provider: Arc<CryptoProvider>,
}

impl NoCertificateVerification {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for NoCertificateVerification {
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
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Verifies the chain against the configured roots but not the hostname.
#[derive(Debug)]
struct CaOnlyVerification {
    roots: RootCertStore,
    provider: Arc<CryptoProvider>,
}

impl CaOnlyVerification {
    fn new(roots: RootCertStore, provider: Arc<CryptoProvider>) -> Self {
        Self { roots, provider }
    }
}

impl ServerCertVerifier for CaOnlyVerification {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("unsupported sslmode {0:?}; only \"require\" (default), \"verify-ca\", \"verify-full\" and \"disable\" supported")]
    UnsupportedMode(String),
    #[error("sslmode \"{0}\" requires sslrootcert")]
    MissingRootCert(SslMode),
    #[error("couldn't parse pem in sslrootcert")]
    InvalidRootCert,
    #[error("couldn't load client certificate/key: {0}")]
    ClientCertificate(String),
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),
    #[error("TLS configuration error: {0}")]
    Config(String),
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
