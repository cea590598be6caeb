use super::{dial, Connector, ConnectorError};
use crate::core::credentials::{CredentialGuard, CredentialSet};
use crate::core::details::{ConnectionDetails, DEFAULT_MYSQL_PORT};
use crate::core::stream::BackendStream;
use crate::core::tls::TlsOptions;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::warn;

pub mod auth;
pub mod handshake;
pub mod packets;

pub use handshake::{AuthenticationHandshake, MySqlConnection};
pub use packets::MySqlError;

/// Injects credentials into the MySQL connection phase.
///
/// Requires `host`, `username` and `password`; `port` defaults to 3306.
#[derive(Debug)]
pub struct MySqlConnector {
    pub name: String,
}

impl MySqlConnector {
    pub fn new() -> Self {
        Self {
            name: "mysql".to_string(),
        }
    }
}

impl Default for MySqlConnector {
    fn default() -> Self {
        Self::new()
    }
}

/// Error the client can understand: protocol errors as-is, anything else
/// as a generic ERR.
fn client_error(err: &ConnectorError) -> MySqlError {
    match err {
        ConnectorError::MySql(e) => e.clone(),
        other => MySqlError::generic(other.to_string()),
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(
        &self,
        client: &mut TcpStream,
        credentials: &mut CredentialSet,
    ) -> Result<BackendStream, ConnectorError> {
        let credentials = CredentialGuard::new(credentials);
        let mut client = MySqlConnection::client(client);

        let result = async {
            let details = ConnectionDetails::from_credentials(&credentials, DEFAULT_MYSQL_PORT)?;
            let tls = TlsOptions::from_ssl_options(&details.ssl_options, false)?;
            let backend = dial(&details.address()).await?;

            AuthenticationHandshake::new(&mut client, &details, &tls)
                .run(MySqlConnection::backend(BackendStream::Tcp(backend)))
                .await
        }
        .await;
        drop(credentials);

        if let Err(err) = &result {
            if let Err(e) = client.write(client_error(err).encode()).await {
                warn!("Attempted to write error {} to MySQL client but failed", e);
            }
        }
        result
    }

    fn name(&self) -> &str {
        &self.name
    }
}
