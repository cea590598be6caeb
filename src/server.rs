use crate::config::Config;
use crate::core::connectors::{self, Connector, ConnectorError};
use crate::core::credentials::CredentialGuard;
use crate::core::metrics::{AtomicServiceMetrics, ServiceMetrics};
use crate::core::resolver::{CredentialResolver, ProviderResolver, ResolverError};
use crate::core::stream::BackendStream;
use futures::future::join_all;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Tune accepted client sockets for interactive database traffic.
fn optimize_client_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
    let socket_ref = socket2::SockRef::from(stream);
    let _ = socket_ref.set_send_buffer_size(32768);
    let _ = socket_ref.set_recv_buffer_size(32768);
}

/// Everything a connection worker needs, shared across workers.
struct ServiceContext {
    name: String,
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn CredentialResolver>,
    credential_names: Vec<String>,
    metrics: Arc<AtomicServiceMetrics>,
}

enum ServiceState {
    Idle,
    Running {
        local_addr: SocketAddr,
        shutdown: watch::Sender<bool>,
        accept_loop: JoinHandle<()>,
    },
    Stopped,
}

/// One listening endpoint bound to one connector.
pub struct ProxyService {
    listen_on: String,
    context: Arc<ServiceContext>,
    state: Mutex<ServiceState>,
}

impl ProxyService {
    pub fn new(
        name: impl Into<String>,
        listen_on: impl Into<String>,
        connector: Arc<dyn Connector>,
        resolver: Arc<dyn CredentialResolver>,
        credential_names: Vec<String>,
    ) -> Self {
        let name = name.into();
        Self {
            listen_on: listen_on.into(),
            context: Arc::new(ServiceContext {
                metrics: Arc::new(AtomicServiceMetrics::new(name.clone())),
                name,
                connector,
                resolver,
                credential_names,
            }),
            state: Mutex::new(ServiceState::Idle),
        }
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn metrics(&self) -> Arc<AtomicServiceMetrics> {
        Arc::clone(&self.context.metrics)
    }

    /// Bind the listener and spawn the accept loop. Returns the bound
    /// address; calling it again while running returns the same address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut state = self.state.lock().await;
        match &*state {
            ServiceState::Stopped => return Err(ServerError::Stopped(self.name().to_string())),
            ServiceState::Running { local_addr, .. } => return Ok(*local_addr),
            ServiceState::Idle => {}
        }

        let listener = TcpListener::bind(&self.listen_on)
            .await
            .map_err(|e| ServerError::BindFailed(format!("{}: {}", self.listen_on, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::IoError(e.to_string()))?;

        info!(
            "Service '{}' ({}) listening on {}",
            self.name(),
            self.context.connector.name(),
            local_addr
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.context),
            shutdown_rx,
        ));

        *state = ServiceState::Running {
            local_addr,
            shutdown,
            accept_loop,
        };
        Ok(local_addr)
    }

    /// Close the listener. Connections already accepted keep running.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, ServiceState::Stopped);
        if let ServiceState::Running {
            shutdown,
            accept_loop,
            ..
        } = previous
        {
            let _ = shutdown.send(true);
            if let Err(e) = accept_loop.await {
                warn!("Accept loop of '{}' ended abnormally: {}", self.name(), e);
            }
            info!("Service '{}' stopped", self.name());
        }
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock().await {
            ServiceState::Running { local_addr, .. } => Some(*local_addr),
            _ => None,
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ServiceContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("Accept loop of '{}' shutting down", context.name);
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((client, addr)) => {
                    debug!("New connection to '{}' from {}", context.name, addr);
                    optimize_client_socket(&client);
                    context.metrics.record_connection_accepted();

                    let context = Arc::clone(&context);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(client, &context).await {
                            error!("Connection to '{}' from {} failed: {}", context.name, addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection on '{}': {}", context.name, e);
                }
            }
        }
    }
}

async fn handle_connection(
    mut client: TcpStream,
    context: &ServiceContext,
) -> Result<(), ServerError> {
    let mut credentials = match context.resolver.resolve(&context.credential_names).await {
        Ok(credentials) => credentials,
        Err(e) => {
            context.metrics.record_resolve_failure();
            return Err(e.into());
        }
    };

    let started = Instant::now();
    let backend = {
        let mut credentials = CredentialGuard::new(&mut credentials);
        context.connector.connect(&mut client, &mut credentials).await
    };
    let backend = match backend {
        Ok(backend) => backend,
        Err(e) => {
            context.metrics.record_handshake_failure();
            return Err(e.into());
        }
    };

    context
        .metrics
        .record_handshake_success(started.elapsed())
        .await;
    debug!(
        "Handshake for '{}' done in {:?}, backend {:?}",
        context.name,
        started.elapsed(),
        backend.peer_addr().ok()
    );

    let stats = duplex(client, backend).await;
    context
        .metrics
        .record_session_closed(stats.client_to_backend, stats.backend_to_client);
    debug!(
        "Session on '{}' closed ({:?}): {} bytes to backend, {} bytes to client",
        context.name, stats.end, stats.client_to_backend, stats.backend_to_client
    );
    Ok(())
}

/// How the first direction of a session to finish came to an end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionEnd {
    /// A peer closed its side of the stream.
    #[default]
    Closed,
    /// A read or write failed after traffic had been relayed.
    Failed,
    /// A read or write failed before a single byte went either way.
    Unexpected,
}

impl SessionEnd {
    pub fn from_outcome(failed: bool, relayed: u64) -> Self {
        match (failed, relayed) {
            (false, _) => SessionEnd::Closed,
            (true, 0) => SessionEnd::Unexpected,
            (true, _) => SessionEnd::Failed,
        }
    }
}

/// Bytes relayed in each direction during one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DuplexStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    pub end: SessionEnd,
}

/// Pump bytes both ways until either direction ends, then close both sides.
pub async fn duplex(client: TcpStream, backend: BackendStream) -> DuplexStats {
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = tokio::io::split(backend);

    let to_backend = Arc::new(AtomicU64::new(0));
    let to_client = Arc::new(AtomicU64::new(0));

    let mut upstream = tokio::spawn(pump(client_read, backend_write, Arc::clone(&to_backend)));
    let mut downstream = tokio::spawn(pump(backend_read, client_write, Arc::clone(&to_client)));

    // The first direction to finish ends the session; the other one's
    // outcome is not reported.
    let (direction, result, upstream_finished) = tokio::select! {
        result = &mut upstream => ("client -> backend", result, true),
        result = &mut downstream => ("backend -> client", result, false),
    };
    let other = if upstream_finished { downstream } else { upstream };
    other.abort();
    let _ = other.await;

    let client_to_backend = to_backend.load(Ordering::Relaxed);
    let backend_to_client = to_client.load(Ordering::Relaxed);
    let end = SessionEnd::from_outcome(
        !matches!(result, Ok(Ok(()))),
        client_to_backend + backend_to_client,
    );

    match (&result, end) {
        (Ok(Ok(())), _) => debug!("{} reached end of stream", direction),
        (Ok(Err(e)), SessionEnd::Unexpected) => {
            warn!("{} closed unexpectedly before any data was relayed: {}", direction, e)
        }
        (Ok(Err(e)), _) => debug!("{} ended with error: {}", direction, e),
        (Err(e), _) => warn!("{} copy task failed: {}", direction, e),
    }

    DuplexStats {
        client_to_backend,
        backend_to_client,
        end,
    }
}

async fn pump<R, W>(mut reader: R, mut writer: W, copied: Arc<AtomicU64>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// All services from a configuration file.
pub struct ProxyServer {
    services: Vec<ProxyService>,
}

impl ProxyServer {
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let mut names: Vec<&String> = config.services.keys().collect();
        names.sort();

        let mut services = Vec::with_capacity(names.len());
        for name in names {
            let service = &config.services[name];
            let connector = connectors::create(&service.connector)?;
            let resolver = ProviderResolver::from_config(&service.credentials)?;
            services.push(ProxyService::new(
                name.clone(),
                service.listen_on.clone(),
                connector,
                Arc::new(resolver),
                service.credential_names(),
            ));
        }

        if services.is_empty() {
            return Err(ServerError::NoServices);
        }
        Ok(Self { services })
    }

    pub fn services(&self) -> &[ProxyService] {
        &self.services
    }

    /// Start every service; on failure the ones already started are stopped.
    pub async fn start(&self) -> Result<Vec<(String, SocketAddr)>, ServerError> {
        let mut bound = Vec::with_capacity(self.services.len());
        for service in &self.services {
            match service.start().await {
                Ok(addr) => bound.push((service.name().to_string(), addr)),
                Err(e) => {
                    self.stop().await;
                    return Err(e);
                }
            }
        }
        Ok(bound)
    }

    pub async fn stop(&self) {
        join_all(self.services.iter().map(|service| service.stop())).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("No services configured")]
    NoServices,
    #[error("Service '{0}' has been stopped")]
    Stopped(String),
    #[error("Bind failed: {0}")]
    BindFailed(String),
    #[error("Credential resolution failed: {0}")]
    Resolve(#[from] ResolverError),
    #[error("Connector failed: {0}")]
    Connector(#[from] ConnectorError),
    #[error("IO error: {0}")]
    IoError(String),
}
