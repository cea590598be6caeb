use super::{dial, Connector, ConnectorError};
use crate::core::credentials::{CredentialGuard, CredentialSet};
use crate::core::details::{ConnectionDetails, DEFAULT_PG_PORT};
use crate::core::stream::BackendStream;
use crate::core::tls::{self, TlsOptions};
use async_trait::async_trait;
use std::io::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub mod auth;
pub mod messages;

pub use messages::{PgError, StartupMessage};

use messages::{
    authentication_ok, read_startup_message, ssl_request, PROTOCOL_VERSION, SSL_ALLOWED,
    SSL_NOT_ALLOWED,
};

/// Injects credentials into the PostgreSQL startup and authentication
/// exchange.
///
/// Requires `host`, `username` and `password`; `port` defaults to 5432.
/// Any other credential is sent to the backend as a startup parameter.
#[derive(Debug)]
pub struct PgConnector {
    pub name: String,
}

impl PgConnector {
    pub fn new() -> Self {
        Self {
            name: "pg".to_string(),
        }
    }
}

impl Default for PgConnector {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the client's startup message. An SSLRequest is refused with `N`
/// and the real startup message is read after it.
pub async fn read_client_startup(client: &mut TcpStream) -> Result<StartupMessage, ConnectorError> {
    let mut startup = StartupMessage::parse(&read_startup_message(client).await?)?;

    if startup.is_ssl_request() {
        debug!("Client requested SSL, answering not supported");
        client.write_all(&[SSL_NOT_ALLOWED]).await?;
        startup = StartupMessage::parse(&read_startup_message(client).await?)?;
        if startup.is_ssl_request() {
            return Err(ConnectorError::Protocol(
                "Unexpected SSL Request after SSL not supported response".to_string(),
            ));
        }
    }

    debug!("Client protocol version: {}", startup.version);
    if startup.get("database").is_none() {
        return Err(ConnectorError::Protocol(
            "no 'database' found in connect options".to_string(),
        ));
    }
    Ok(startup)
}

/// Startup message for the backend: the client's parameters with the real
/// user, then any credential options on top.
fn backend_startup(client: &StartupMessage, details: &ConnectionDetails) -> StartupMessage {
    let mut startup = StartupMessage::new(PROTOCOL_VERSION);
    startup.set("user", details.username.as_str());
    for (key, value) in &client.parameters {
        if key != "user" {
            startup.set(key.as_str(), value.as_str());
        }
    }
    for (key, value) in &details.options {
        startup.set(key.as_str(), value.as_str());
    }
    startup
}

async fn negotiate_tls(
    mut backend: TcpStream,
    options: &TlsOptions,
) -> Result<BackendStream, ConnectorError> {
    if !options.use_tls() {
        return Ok(BackendStream::Tcp(backend));
    }

    backend.write_all(&ssl_request()).await?;
    let answer = backend.read_u8().await?;
    if answer != SSL_ALLOWED {
        return Err(ConnectorError::Protocol(
            "the backend does not allow SSL connections".to_string(),
        ));
    }
    Ok(tls::upgrade(backend, options).await?)
}

async fn connect_backend(
    startup: &StartupMessage,
    details: &ConnectionDetails,
) -> Result<BackendStream, ConnectorError> {
    let tls = TlsOptions::from_ssl_options(&details.ssl_options, true)?;
    let backend = dial(&details.address()).await?;
    let mut backend = negotiate_tls(backend, &tls).await?;

    debug!("Sending startup message");
    backend
        .write_all(&backend_startup(startup, details).encode())
        .await?;

    debug!("Authenticating to the backend");
    auth::authenticate(&mut backend, &details.username, &details.password).await?;

    debug!("Successfully connected to '{}'", details.address());
    Ok(backend)
}

fn client_error(err: &ConnectorError) -> PgError {
    match err {
        ConnectorError::Pg(e) => e.clone(),
        other => PgError::internal(other.to_string()),
    }
}

fn is_client_hangup(err: &ConnectorError) -> bool {
    matches!(err, ConnectorError::Io(e) if e.kind() == ErrorKind::UnexpectedEof)
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(
        &self,
        client: &mut TcpStream,
        credentials: &mut CredentialSet,
    ) -> Result<BackendStream, ConnectorError> {
        let credentials = CredentialGuard::new(credentials);

        let startup = match read_client_startup(client).await {
            Ok(startup) => startup,
            Err(err) => {
                if !is_client_hangup(&err) {
                    abort(client, &err).await;
                }
                return Err(err);
            }
        };

        let result = async {
            let details =
                ConnectionDetails::from_credentials_with_address(&credentials, DEFAULT_PG_PORT)?;
            debug!("Backend connection parameters: {:?}", credentials.names());
            let backend = connect_backend(&startup, &details).await?;
            client.write_all(&authentication_ok()).await?;
            Ok::<_, ConnectorError>(backend)
        }
        .await;
        drop(credentials);

        if let Err(err) = &result {
            abort(client, err).await;
        }
        result
    }

    fn name(&self) -> &str {
        &self.name
    }
}

async fn abort(client: &mut TcpStream, err: &ConnectorError) {
    if let Err(e) = client.write_all(&client_error(err).encode()).await {
        warn!("Attempted to write error {} to PostgreSQL client but failed", e);
    }
}
