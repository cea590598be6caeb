//! MySQL end-to-end tests
//!
//! The client logs in with a throwaway username and an empty password; the
//! mock backend only accepts the credentials the proxy holds.

use crate::integration::mock_mysql::{AuthFlow, MySqlMock};
use crate::integration::{mock_mysql, proxy, Expected, MockBackend, TestPki, WipeRecorder};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use warden::core::connectors::mysql::auth::{caching_sha2_password, native_password};
use warden::core::connectors::mysql::packets::{
    read_packet, write_packet, HandshakeResponse41, HandshakeV10, MySqlError, Packet,
    CLIENT_CONNECT_WITH_DB, CLIENT_PLUGIN_AUTH, CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION,
    CLIENT_SSL, CR_SSL_CONNECTION_ERROR, CR_UNKNOWN_ERROR, ERR_PACKET, OK_PACKET,
};

fn credentials(backend: &MockBackend, password: &str) -> Vec<(&'static str, String)> {
    with_ssl(backend, password, &[("sslmode", "disable")])
}

fn with_ssl(
    backend: &MockBackend,
    password: &str,
    ssl: &[(&'static str, &str)],
) -> Vec<(&'static str, String)> {
    let mut credentials = vec![
        ("host", backend.host()),
        ("port", backend.port()),
        ("username", "real".to_string()),
        ("password", password.to_string()),
    ];
    credentials.extend(ssl.iter().map(|(name, value)| (*name, value.to_string())));
    credentials
}

async fn echo_check(client: &mut TcpStream, bytes: &[u8]) {
    client.write_all(bytes).await.unwrap();
    let mut echoed = vec![0u8; bytes.len()];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, bytes);
}

/// Run the client half of the connection phase; returns the greeting and
/// the proxy's final reply.
async fn client_login(client: &mut TcpStream) -> (HandshakeV10, Packet) {
    let greeting = read_packet(client).await.unwrap();
    assert_eq!(greeting.sequence_id, 0);
    let greeting = HandshakeV10::parse(&greeting.payload).unwrap();

    let response = HandshakeResponse41 {
        capability_flags: CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_PLUGIN_AUTH
            | CLIENT_CONNECT_WITH_DB,
        max_packet_size: 16 * 1024 * 1024,
        character_set: 0x21,
        username: b"nobody".to_vec(),
        auth_response: Vec::new(),
        database: Some("orders".to_string()),
        auth_plugin_name: "mysql_native_password".to_string(),
        tail: Vec::new(),
    };
    write_packet(client, &Packet::new(1, response.encode()))
        .await
        .unwrap();

    let reply = read_packet(client).await.unwrap();
    (greeting, reply)
}

#[tokio::test]
async fn test_mysql_injects_credentials() {
    let mock = mock_mysql::spawn(Expected::new("real", "secret")).await.unwrap();
    let (service, addr) =
        proxy::start_literal(proxy::connector("mysql"), &credentials(&mock, "secret")).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    let (greeting, reply) = client_login(&mut client).await;

    // The client is not offered TLS; the salt is the backend's.
    assert_eq!(greeting.capability_flags & CLIENT_SSL, 0);
    assert_eq!(greeting.salt, mock_mysql::SALT.to_vec());
    assert_eq!(reply.kind(), Some(OK_PACKET));
    assert_eq!(reply.sequence_id, 2);

    let stats = mock.stats();
    assert_eq!(stats.logins.len(), 1);
    assert!(stats.logins[0].accepted);
    assert_eq!(stats.logins[0].username, "real");
    assert_eq!(
        stats.logins[0].secret,
        native_password(b"secret", mock_mysql::SALT)
    );
    assert_eq!(
        stats.logins[0].parameters,
        vec![("database".to_string(), "orders".to_string())]
    );

    client.write_all(b"abc").await.unwrap();
    let mut echoed = [0u8; 3];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"abc");

    service.stop().await;
    mock.shutdown();
}

#[tokio::test]
async fn test_mysql_client_never_sees_the_password() {
    let mock = mock_mysql::spawn(Expected::new("real", "secret")).await.unwrap();
    let (service, addr) =
        proxy::start_literal(proxy::connector("mysql"), &credentials(&mock, "secret")).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    let (greeting, reply) = client_login(&mut client).await;

    let mut seen = greeting.encode();
    seen.extend_from_slice(&reply.payload);
    assert!(!seen.windows(6).any(|w| w == b"secret"));

    service.stop().await;
    mock.shutdown();
}

#[tokio::test]
async fn test_mysql_backend_rejection_is_relayed() {
    let mock = mock_mysql::spawn(Expected::new("real", "secret")).await.unwrap();
    let (service, addr) =
        proxy::start_literal(proxy::connector("mysql"), &credentials(&mock, "wrong")).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    let (_, reply) = client_login(&mut client).await;

    assert_eq!(reply.kind(), Some(ERR_PACKET));
    let err = MySqlError::parse(&reply.payload).unwrap();
    assert_eq!(err.code, mock_mysql::ACCESS_DENIED);
    assert_eq!(err.sql_state, "28000");
    assert!(!mock.stats().logins[0].accepted);

    // The proxy closes the client after the error.
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);

    service.stop().await;
    mock.shutdown();
}

#[tokio::test]
async fn test_mysql_credentials_zeroized_after_handshake() {
    let mock = mock_mysql::spawn(Expected::new("real", "secret")).await.unwrap();
    let (recorder, zeroized) = WipeRecorder::new(proxy::connector("mysql"));
    let (service, addr) =
        proxy::start_literal(Arc::new(recorder), &credentials(&mock, "secret")).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    let (_, reply) = client_login(&mut client).await;
    assert_eq!(reply.kind(), Some(OK_PACKET));

    for _ in 0..50 {
        if zeroized.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(zeroized.load(Ordering::SeqCst));

    service.stop().await;
    mock.shutdown();
}

#[tokio::test]
async fn test_mysql_backend_connection_upgraded_to_tls() {
    let pki = TestPki::generate();
    let mock = MySqlMock::new(Expected::new("real", "secret"))
        .tls(pki.acceptor())
        .spawn()
        .await
        .unwrap();
    let ssl = [
        ("sslmode", "verify-full"),
        ("sslrootcert", pki.ca_pem.as_str()),
        ("sslhost", "localhost"),
    ];
    let (service, addr) =
        proxy::start_literal(proxy::connector("mysql"), &with_ssl(&mock, "secret", &ssl)).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    let (greeting, reply) = client_login(&mut client).await;

    // The backend offers TLS; the client is still only offered plaintext.
    assert_eq!(greeting.capability_flags & CLIENT_SSL, 0);
    assert_eq!(reply.kind(), Some(OK_PACKET));
    assert_eq!(reply.sequence_id, 2);

    let stats = mock.stats();
    assert!(stats.logins[0].accepted);
    assert_eq!(
        stats.logins[0].secret,
        native_password(b"secret", mock_mysql::SALT)
    );

    echo_check(&mut client, b"over tls").await;
    assert_eq!(mock.stats().relayed, b"over tls".to_vec());

    service.stop().await;
    mock.shutdown();
}

#[tokio::test]
async fn test_mysql_required_tls_missing_on_backend() {
    let mock = MySqlMock::new(Expected::new("real", "secret"))
        .without_ssl()
        .spawn()
        .await
        .unwrap();
    let ssl = [("sslmode", "require")];
    let (service, addr) =
        proxy::start_literal(proxy::connector("mysql"), &with_ssl(&mock, "secret", &ssl)).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    let greeting = read_packet(&mut client).await.unwrap();
    assert_eq!(greeting.sequence_id, 0);

    // The error follows the greeting directly, before any client response.
    let reply = read_packet(&mut client).await.unwrap();
    assert_eq!(reply.kind(), Some(ERR_PACKET));
    assert_eq!(reply.sequence_id, 1);
    let err = MySqlError::parse(&reply.payload).unwrap();
    assert_eq!(err.code, CR_SSL_CONNECTION_ERROR);
    assert!(err.message.contains("SSL is required"));
    assert!(mock.stats().logins.is_empty());

    service.stop().await;
    mock.shutdown();
}

#[tokio::test]
async fn test_mysql_auth_switch_to_native_password() {
    let mock = MySqlMock::new(Expected::new("real", "secret"))
        .flow(AuthFlow::SwitchToNative)
        .spawn()
        .await
        .unwrap();
    let (service, addr) =
        proxy::start_literal(proxy::connector("mysql"), &credentials(&mock, "secret")).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    let (_, reply) = client_login(&mut client).await;
    assert_eq!(reply.kind(), Some(OK_PACKET));
    // The exchange with the backend is longer, the client's is not.
    assert_eq!(reply.sequence_id, 2);

    let login = &mock.stats().logins[0];
    assert!(login.accepted);
    assert_eq!(
        login.secret,
        native_password(b"secret", mock_mysql::SWITCH_SALT)
    );

    echo_check(&mut client, b"abc").await;

    service.stop().await;
    mock.shutdown();
}

#[tokio::test]
async fn test_mysql_caching_sha2_fast_auth() {
    let mock = MySqlMock::new(Expected::new("real", "secret"))
        .flow(AuthFlow::CachingSha2Fast)
        .spawn()
        .await
        .unwrap();
    let (service, addr) =
        proxy::start_literal(proxy::connector("mysql"), &credentials(&mock, "secret")).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    let (_, reply) = client_login(&mut client).await;
    assert_eq!(reply.kind(), Some(OK_PACKET));
    assert_eq!(reply.sequence_id, 2);

    let login = &mock.stats().logins[0];
    assert!(login.accepted);
    assert_eq!(
        login.secret,
        caching_sha2_password(b"secret", mock_mysql::SWITCH_SALT)
    );

    echo_check(&mut client, b"abc").await;

    service.stop().await;
    mock.shutdown();
}

#[tokio::test]
async fn test_mysql_caching_sha2_full_auth_over_tls() {
    let pki = TestPki::generate();
    let mock = MySqlMock::new(Expected::new("real", "secret"))
        .flow(AuthFlow::CachingSha2Full)
        .tls(pki.acceptor())
        .spawn()
        .await
        .unwrap();
    let ssl = [("sslmode", "require")];
    let (service, addr) =
        proxy::start_literal(proxy::connector("mysql"), &with_ssl(&mock, "secret", &ssl)).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    let (_, reply) = client_login(&mut client).await;
    assert_eq!(reply.kind(), Some(OK_PACKET));
    assert_eq!(reply.sequence_id, 2);

    let login = &mock.stats().logins[0];
    assert!(login.accepted);
    assert_eq!(login.secret, b"secret\0".to_vec());

    echo_check(&mut client, b"abc").await;

    service.stop().await;
    mock.shutdown();
}

#[tokio::test]
async fn test_mysql_caching_sha2_full_auth_refused_without_tls() {
    let mock = MySqlMock::new(Expected::new("real", "secret"))
        .flow(AuthFlow::CachingSha2Full)
        .spawn()
        .await
        .unwrap();
    let (service, addr) =
        proxy::start_literal(proxy::connector("mysql"), &credentials(&mock, "secret")).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    let (_, reply) = client_login(&mut client).await;
    assert_eq!(reply.kind(), Some(ERR_PACKET));
    assert_eq!(reply.sequence_id, 2);
    let err = MySqlError::parse(&reply.payload).unwrap();
    assert_eq!(err.code, CR_UNKNOWN_ERROR);
    assert!(err.message.contains("requires TLS"));

    // The cleartext password never went out, so the backend saw no login.
    assert!(mock.stats().logins.is_empty());

    service.stop().await;
    mock.shutdown();
}
