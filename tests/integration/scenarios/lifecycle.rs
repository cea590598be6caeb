//! Service lifecycle and session tests
//!
//! Connector-agnostic behaviour: resolution failures, byte relay in both
//! directions, and start/stop semantics.

use crate::integration::{mock_mysql, proxy, Expected};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use warden::config::Config;
use warden::{ProviderResolver, ProxyServer, ServiceMetrics};

#[tokio::test]
async fn test_missing_credential_closes_client_without_dialing() {
    let mock = mock_mysql::spawn(Expected::new("app", "s3cret")).await.unwrap();
    // "password" is requested but nothing provides it.
    let resolver = ProviderResolver::new()
        .with_literal("host", mock.host())
        .with_literal("port", mock.port())
        .with_literal("username", "app");
    let names = vec![
        "host".to_string(),
        "password".to_string(),
        "port".to_string(),
        "username".to_string(),
    ];
    let (service, addr) = proxy::start(proxy::connector("mysql"), resolver, names).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    assert_eq!(mock.stats().connections, 0);

    let snapshot = service.metrics().get_snapshot().await;
    assert_eq!(snapshot.resolve_failures, 1);
    assert_eq!(snapshot.handshake_successes, 0);

    service.stop().await;
    mock.shutdown();
}

#[tokio::test]
async fn test_duplex_relays_both_directions() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    let backend_task = tokio::spawn(async move {
        let (mut socket, _) = backend.accept().await.unwrap();
        let mut request = [0u8; 3];
        socket.read_exact(&mut request).await.unwrap();
        socket.write_all(b"xyz").await.unwrap();
        request
    });

    let (service, addr) = proxy::start_literal(
        proxy::connector("passthrough"),
        &[("address", backend_addr.to_string())],
    )
    .await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    client.write_all(b"abc").await.unwrap();
    let mut reply = [0u8; 3];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"xyz");
    assert_eq!(&backend_task.await.unwrap(), b"abc");

    // The backend hung up, which ends the session for the client too.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let metrics = service.metrics();
    for _ in 0..50 {
        if metrics.get_snapshot().await.active_sessions == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let snapshot = metrics.get_snapshot().await;
    assert_eq!(snapshot.active_sessions, 0);
    assert_eq!(snapshot.bytes_client_to_backend, 3);
    assert_eq!(snapshot.bytes_backend_to_client, 3);

    service.stop().await;
}

const CHUNKS: usize = 40;

fn chunks(side: char) -> Vec<Vec<u8>> {
    (0..CHUNKS)
        .map(|i| format!("{}{:03};", side, i).into_bytes())
        .collect()
}

/// Write `side`'s chunks while reading everything `peer` sends. The write
/// half stays open until the read is done.
async fn exchange(stream: TcpStream, side: char, peer: char) -> Vec<u8> {
    let (mut reader, mut writer) = stream.into_split();
    let writes = async move {
        for chunk in chunks(side) {
            writer.write_all(&chunk).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        writer
    };
    let reads = async move {
        let mut received = vec![0u8; chunks(peer).concat().len()];
        reader.read_exact(&mut received).await.unwrap();
        received
    };
    let (_writer, received) = tokio::join!(writes, reads);
    received
}

#[tokio::test]
async fn test_duplex_interleaved_traffic() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    let backend_task = tokio::spawn(async move {
        let (socket, _) = backend.accept().await.unwrap();
        exchange(socket, 'b', 'c').await
    });

    let (service, addr) = proxy::start_literal(
        proxy::connector("passthrough"),
        &[("address", backend_addr.to_string())],
    )
    .await;

    // Neither side waits for the other before writing.
    let client = TcpStream::connect(&addr).await.unwrap();
    let from_backend = exchange(client, 'c', 'b').await;
    let from_client = backend_task.await.unwrap();

    assert_eq!(from_backend, chunks('b').concat());
    assert_eq!(from_client, chunks('c').concat());

    service.stop().await;
}

#[tokio::test]
async fn test_stop_refuses_new_connections() {
    let mock = mock_mysql::spawn(Expected::new("app", "s3cret")).await.unwrap();
    let (service, addr) = proxy::start_literal(
        proxy::connector("passthrough"),
        &[("address", mock.addr().to_string())],
    )
    .await;

    assert!(TcpStream::connect(&addr).await.is_ok());
    service.stop().await;
    service.stop().await;
    assert!(TcpStream::connect(&addr).await.is_err());
    assert!(service.start().await.is_err());

    mock.shutdown();
}

#[tokio::test]
async fn test_server_from_config_with_env_credentials() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = backend.accept().await.unwrap();
        let (mut r, mut w) = socket.split();
        let _ = tokio::io::copy(&mut r, &mut w).await;
    });

    let var = format!("WARDEN_IT_ADDR_{}", uuid::Uuid::new_v4().simple());
    std::env::set_var(&var, backend_addr.to_string());
    let yaml = format!(
        r#"
services:
  echo:
    connector: passthrough
    listen_on: "127.0.0.1:0"
    credentials:
      address: {{ from: env, get: {} }}
"#,
        var
    );
    let config = Config::from_yaml_str(&yaml).unwrap();
    let server = ProxyServer::from_config(&config).unwrap();
    let bound: HashMap<String, std::net::SocketAddr> =
        server.start().await.unwrap().into_iter().collect();

    let mut client = TcpStream::connect(bound["echo"]).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    server.stop().await;
    std::env::remove_var(&var);
}
