//! Certificates and acceptors for TLS-capable mock backends
//!
//! Each call to [`TestPki::generate`] makes a fresh CA and a server
//! certificate for `localhost` signed by it.

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Name the server certificate is issued for
pub const SERVER_NAME: &str = "localhost";

pub struct TestPki {
    /// PEM of the issuing CA, suitable for `sslrootcert`
    pub ca_pem: String,
    server_cert: CertificateDer<'static>,
    server_key: Vec<u8>,
}

fn ca_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

impl TestPki {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params("warden test CA").self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params = CertificateParams::new(vec![SERVER_NAME.to_string()]).unwrap();
        server_params
            .distinguished_name
            .push(DnType::CommonName, SERVER_NAME);
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .unwrap();

        Self {
            ca_pem: ca_cert.pem(),
            server_cert: server_cert.der().clone(),
            server_key: server_key.serialize_der(),
        }
    }

    /// PEM of a CA that did not issue the server certificate
    pub fn unrelated_ca_pem() -> String {
        let key = KeyPair::generate().unwrap();
        ca_params("someone else's CA").self_signed(&key).unwrap().pem()
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        self.build_acceptor(false)
    }

    /// TLS 1.2 only, so the server sends the last handshake flight. SQL
    /// Server wraps that flight in PRELOGIN packets.
    pub fn tls12_acceptor(&self) -> TlsAcceptor {
        self.build_acceptor(true)
    }

    fn build_acceptor(&self, tls12_only: bool) -> TlsAcceptor {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ServerConfig::builder_with_provider(provider);
        let builder = if tls12_only {
            builder.with_protocol_versions(&[&rustls::version::TLS12])
        } else {
            builder.with_safe_default_protocol_versions()
        }
        .unwrap();

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.server_key.clone()));
        let config = builder
            .with_no_client_auth()
            .with_single_cert(vec![self.server_cert.clone()], key)
            .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }
}
