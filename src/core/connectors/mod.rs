use crate::core::credentials::CredentialSet;
use crate::core::details::DetailsError;
use crate::core::stream::BackendStream;
use crate::core::tls::TlsError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

pub mod mssql;
pub mod mysql;
pub mod passthrough;
pub mod pg;

pub use mssql::MsSqlConnector;
pub use mysql::{MySqlConnector, MySqlError};
pub use passthrough::PassthroughConnector;
pub use pg::{PgConnector, PgError};

/// Names accepted by [`create`], sorted.
pub const CONNECTOR_NAMES: [&str; 4] = ["mssql", "mysql", "passthrough", "pg"];

/// Completes a backend's authentication on behalf of a client.
///
/// On success the returned stream is fully authenticated and ready for
/// byte relay. On failure nothing derived from `credentials` has been
/// written to `client`, and any backend socket opened along the way has
/// been closed.
///
/// Implementations zeroize `credentials` before returning, on every path.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        client: &mut TcpStream,
        credentials: &mut CredentialSet,
    ) -> Result<BackendStream, ConnectorError>;

    /// Connector name
    fn name(&self) -> &str;
}

pub fn is_registered(name: &str) -> bool {
    CONNECTOR_NAMES.contains(&name)
}

/// Build the connector registered under `name`.
pub fn create(name: &str) -> Result<Arc<dyn Connector>, ConnectorError> {
    match name {
        "mysql" => Ok(Arc::new(MySqlConnector::new())),
        "pg" => Ok(Arc::new(PgConnector::new())),
        "mssql" => Ok(Arc::new(MsSqlConnector::new())),
        "passthrough" => Ok(Arc::new(PassthroughConnector::new())),
        other => Err(ConnectorError::UnknownConnector(other.to_string())),
    }
}

/// Open the plaintext backend socket.
pub(crate) async fn dial(address: &str) -> Result<TcpStream, ConnectorError> {
    debug!("Dialing backend {}", address);
    TcpStream::connect(address)
        .await
        .map_err(|source| ConnectorError::Dial {
            address: address.to_string(),
            source,
        })
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Unknown connector: {0}")]
    UnknownConnector(String),
    #[error("Missing credential: {0}")]
    MissingCredential(String),
    #[error("Invalid connection details: {0}")]
    Details(#[from] DetailsError),
    #[error("Failed to connect to backend {address}: {source}")]
    Dial {
        address: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error(transparent)]
    MySql(#[from] MySqlError),
    #[error(transparent)]
    Pg(#[from] PgError),
    #[error("Login failed: {0}")]
    MsSqlLogin(String),
}
