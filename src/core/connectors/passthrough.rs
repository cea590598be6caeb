use super::{dial, Connector, ConnectorError};
use crate::core::credentials::{CredentialGuard, CredentialSet};
use crate::core::stream::BackendStream;
use async_trait::async_trait;
use tokio::net::TcpStream;

/// Dials the target named by the credentials and does nothing else.
///
/// The target is `address` if present, otherwise `host:port`.
#[derive(Debug)]
pub struct PassthroughConnector {
    pub name: String,
}

impl PassthroughConnector {
    pub fn new() -> Self {
        Self {
            name: "passthrough".to_string(),
        }
    }

    fn target(credentials: &CredentialSet) -> Result<String, ConnectorError> {
        if let Some(mut address) = credentials.get_str("address") {
            return Ok(std::mem::take(&mut *address));
        }
        let host = credentials
            .get_str("host")
            .ok_or_else(|| ConnectorError::MissingCredential("host".to_string()))?;
        let port = credentials
            .get_str("port")
            .ok_or_else(|| ConnectorError::MissingCredential("port".to_string()))?;
        Ok(format!("{}:{}", host.as_str(), port.as_str()))
    }
}

impl Default for PassthroughConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for PassthroughConnector {
    async fn connect(
        &self,
        _client: &mut TcpStream,
        credentials: &mut CredentialSet,
    ) -> Result<BackendStream, ConnectorError> {
        let credentials = CredentialGuard::new(credentials);
        let target = Self::target(&credentials)?;
        let backend = dial(&target).await?;
        Ok(BackendStream::Tcp(backend))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
