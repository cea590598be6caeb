//! sslmode behaviour against a TLS-capable backend
//!
//! PostgreSQL carries these checks: the proxy's failure reaches the client
//! as an ErrorResponse with the TLS error text.

use crate::integration::helpers::mock_backend::MockStats;
use crate::integration::{mock_pg, proxy, Expected, TestPki};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use warden::core::connectors::pg::messages::{
    read_message, AUTHENTICATION, AUTH_OK, ERROR_RESPONSE, PROTOCOL_VERSION,
};
use warden::core::connectors::pg::{PgError, StartupMessage};

/// Log in once through a service with `ssl` added to its credentials.
/// Returns what the backend recorded and the error the client got, if any.
async fn login_with(pki: &TestPki, ssl: &[(&'static str, &str)]) -> (MockStats, Option<String>) {
    let mock = mock_pg::spawn_tls(Expected::new("reports", "hunter2"), pki.acceptor())
        .await
        .unwrap();
    let mut credentials = vec![
        ("host", mock.host()),
        ("port", mock.port()),
        ("username", "reports".to_string()),
        ("password", "hunter2".to_string()),
    ];
    credentials.extend(ssl.iter().map(|(name, value)| (*name, value.to_string())));
    let (service, addr) = proxy::start_literal(proxy::connector("pg"), &credentials).await;

    let mut startup = StartupMessage::new(PROTOCOL_VERSION);
    startup.set("user", "whoever");
    startup.set("database", "analytics");
    let mut client = TcpStream::connect(&addr).await.unwrap();
    client.write_all(&startup.encode()).await.unwrap();

    let (kind, body) = read_message(&mut client).await.unwrap();
    let error = match kind {
        AUTHENTICATION => {
            assert_eq!(body, AUTH_OK.to_be_bytes().to_vec());
            None
        }
        ERROR_RESPONSE => Some(PgError::parse(&body).unwrap().message),
        other => panic!("unexpected message {:?}", other as char),
    };

    service.stop().await;
    let stats = mock.stats();
    mock.shutdown();
    (stats, error)
}

fn assert_accepted((stats, error): (MockStats, Option<String>)) {
    assert_eq!(error, None);
    assert_eq!(stats.logins.len(), 1);
    assert!(stats.logins[0].accepted);
}

fn assert_refused((stats, error): (MockStats, Option<String>), message: &str) {
    let error = error.expect("login should have failed");
    assert!(error.contains(message), "{:?} does not mention {:?}", error, message);
    assert!(stats.logins.is_empty());
}

#[tokio::test]
async fn test_disable_stays_in_plaintext() {
    let pki = TestPki::generate();
    assert_accepted(login_with(&pki, &[("sslmode", "disable")]).await);
}

#[tokio::test]
async fn test_require_skips_verification() {
    let pki = TestPki::generate();
    assert_accepted(login_with(&pki, &[("sslmode", "require")]).await);
    assert_accepted(login_with(&pki, &[]).await);
}

#[tokio::test]
async fn test_verify_ca_accepts_issuer_regardless_of_hostname() {
    let pki = TestPki::generate();
    // The backend is dialed by IP; the certificate only names localhost.
    let ssl = [("sslmode", "verify-ca"), ("sslrootcert", pki.ca_pem.as_str())];
    assert_accepted(login_with(&pki, &ssl).await);
}

#[tokio::test]
async fn test_verify_ca_rejects_unknown_issuer() {
    let pki = TestPki::generate();
    let other_ca = TestPki::unrelated_ca_pem();
    let ssl = [("sslmode", "verify-ca"), ("sslrootcert", other_ca.as_str())];
    assert_refused(login_with(&pki, &ssl).await, "TLS handshake failed");
}

#[tokio::test]
async fn test_require_with_root_cert_verifies_issuer() {
    let pki = TestPki::generate();
    let other_ca = TestPki::unrelated_ca_pem();
    let ssl = [("sslmode", "require"), ("sslrootcert", other_ca.as_str())];
    assert_refused(login_with(&pki, &ssl).await, "TLS handshake failed");

    let ssl = [("sslmode", "require"), ("sslrootcert", pki.ca_pem.as_str())];
    assert_accepted(login_with(&pki, &ssl).await);
}

#[tokio::test]
async fn test_verify_full_checks_sslhost() {
    let pki = TestPki::generate();
    let ssl = [
        ("sslmode", "verify-full"),
        ("sslrootcert", pki.ca_pem.as_str()),
        ("sslhost", "localhost"),
    ];
    assert_accepted(login_with(&pki, &ssl).await);
}

#[tokio::test]
async fn test_verify_full_rejects_hostname_mismatch() {
    let pki = TestPki::generate();
    // Without sslhost the name checked is the dialed IP address.
    let ssl = [("sslmode", "verify-full"), ("sslrootcert", pki.ca_pem.as_str())];
    assert_refused(login_with(&pki, &ssl).await, "TLS handshake failed");

    let ssl = [
        ("sslmode", "verify-full"),
        ("sslrootcert", pki.ca_pem.as_str()),
        ("sslhost", "db.elsewhere.test"),
    ];
    assert_refused(login_with(&pki, &ssl).await, "TLS handshake failed");
}

#[tokio::test]
async fn test_malformed_root_cert() {
    let pki = TestPki::generate();
    let ssl = [("sslmode", "verify-full"), ("sslrootcert", "not a certificate")];
    assert_refused(
        login_with(&pki, &ssl).await,
        "couldn't parse pem in sslrootcert",
    );
}

#[tokio::test]
async fn test_verification_without_root_cert_is_refused() {
    let pki = TestPki::generate();
    assert_refused(
        login_with(&pki, &[("sslmode", "verify-ca")]).await,
        "requires sslrootcert",
    );
}

#[tokio::test]
async fn test_unknown_sslmode_is_refused() {
    let pki = TestPki::generate();
    assert_refused(
        login_with(&pki, &[("sslmode", "prefer")]).await,
        "unsupported sslmode",
    );
}
