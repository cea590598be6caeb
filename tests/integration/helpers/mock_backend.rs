//! Shared plumbing for the mock database backends
//!
//! Every mock:
//! - Listens on an ephemeral port and accepts until shut down
//! - Runs a protocol-specific login exchange per connection
//! - Records what the proxy sent during login
//! - Echoes bytes back after a successful login, over TLS when the login
//!   upgraded the connection

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Any stream a mock can keep echoing on after login.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStream for T {}

pub type Session = Box<dyn SessionStream>;

pub fn session<S: SessionStream + 'static>(stream: S) -> Session {
    Box::new(stream)
}

pub fn io_error(message: impl ToString) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, message.to_string())
}

/// What one login attempt looked like from the backend's side
#[derive(Debug, Clone, Default)]
pub struct RecordedLogin {
    pub username: String,
    /// Auth response, password message or LOGIN7 payload, as received
    pub secret: Vec<u8>,
    /// Database or startup parameters the proxy forwarded
    pub parameters: Vec<(String, String)>,
    pub accepted: bool,
}

/// Statistics tracked by a mock backend
#[derive(Debug, Clone, Default)]
pub struct MockStats {
    pub connections: usize,
    pub logins: Vec<RecordedLogin>,
    /// Bytes echoed after login, across all connections
    pub relayed: Vec<u8>,
}

/// Expected login for a mock backend
#[derive(Debug, Clone)]
pub struct Expected {
    pub username: String,
    pub password: String,
}

impl Expected {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

/// A running mock backend
pub struct MockBackend {
    addr: String,
    stats: Arc<Mutex<MockStats>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockBackend {
    /// Start a backend that runs `login` on each connection, then echoes on
    /// the stream it hands back.
    pub async fn spawn<F, Fut>(login: F) -> std::io::Result<Self>
    where
        F: Fn(TcpStream, Arc<Mutex<MockStats>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::io::Result<Option<Session>>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        let stats = Arc::new(Mutex::new(MockStats::default()));
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();

        let stats_clone = Arc::clone(&stats);
        let login = Arc::new(login);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                stats_clone.lock().unwrap().connections += 1;
                                let stats = Arc::clone(&stats_clone);
                                let login = Arc::clone(&login);
                                tokio::spawn(async move {
                                    if let Ok(Some(stream)) = (*login)(stream, Arc::clone(&stats)).await {
                                        let _ = echo(stream, stats).await;
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
        });

        Ok(Self {
            addr,
            stats,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Get the address the mock is listening on
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn host(&self) -> String {
        self.addr.rsplit_once(':').map(|(h, _)| h.to_string()).unwrap_or_default()
    }

    pub fn port(&self) -> String {
        self.addr.rsplit_once(':').map(|(_, p)| p.to_string()).unwrap_or_default()
    }

    /// Get current statistics
    pub fn stats(&self) -> MockStats {
        self.stats.lock().unwrap().clone()
    }

    /// Shutdown the mock server
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn echo(mut stream: Session, stats: Arc<Mutex<MockStats>>) -> std::io::Result<()> {
    let mut buffer = vec![0u8; 4096];
    loop {
        let n = match stream.read(&mut buffer).await {
            Ok(0) | Err(_) => return Ok(()),
            Ok(n) => n,
        };
        stats.lock().unwrap().relayed.extend_from_slice(&buffer[..n]);
        stream.write_all(&buffer[..n]).await?;
        stream.flush().await?;
    }
}
