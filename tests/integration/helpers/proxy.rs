//! Spin up a proxy service in front of a mock backend.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use warden::core::connectors::{self, Connector, ConnectorError};
use warden::core::credentials::CredentialSet;
use warden::core::stream::BackendStream;
use warden::{ProviderResolver, ProxyService};

/// Wraps a connector and records whether the credentials it was handed
/// were wiped by the time it returned.
pub struct WipeRecorder {
    inner: Arc<dyn Connector>,
    zeroized: Arc<AtomicBool>,
}

impl WipeRecorder {
    pub fn new(inner: Arc<dyn Connector>) -> (Self, Arc<AtomicBool>) {
        let zeroized = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner,
                zeroized: Arc::clone(&zeroized),
            },
            zeroized,
        )
    }
}

#[async_trait]
impl Connector for WipeRecorder {
    async fn connect(
        &self,
        client: &mut TcpStream,
        credentials: &mut CredentialSet,
    ) -> Result<BackendStream, ConnectorError> {
        let result = self.inner.connect(client, credentials).await;
        self.zeroized
            .store(!credentials.is_empty() && credentials.is_zeroized(), Ordering::SeqCst);
        result
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Start a service named after `connector` with literal credentials.
pub async fn start_literal(
    connector: Arc<dyn Connector>,
    credentials: &[(&str, String)],
) -> (ProxyService, String) {
    let mut resolver = ProviderResolver::new();
    for (name, value) in credentials {
        resolver = resolver.with_literal(*name, value.clone());
    }
    let names = resolver.names();
    start(connector, resolver, names).await
}

pub async fn start(
    connector: Arc<dyn Connector>,
    resolver: ProviderResolver,
    credential_names: Vec<String>,
) -> (ProxyService, String) {
    let service = ProxyService::new(
        connector.name().to_string(),
        "127.0.0.1:0",
        connector,
        Arc::new(resolver),
        credential_names,
    );
    let addr = service.start().await.unwrap();
    (service, addr.to_string())
}

pub fn connector(name: &str) -> Arc<dyn Connector> {
    connectors::create(name).unwrap()
}
