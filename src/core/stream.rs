use crate::core::connectors::mssql::tds_tls::TdsTlsStream;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Authenticated backend connection handed back by a connector.
///
/// Once a connector returns, the session is pure byte relay regardless of
/// which variant is in use.
pub enum BackendStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// TLS whose handshake was carried inside TDS PRELOGIN packets.
    TdsTls(Box<TlsStream<TdsTlsStream>>),
}

impl BackendStream {
    pub fn is_tls(&self) -> bool {
        !matches!(self, BackendStream::Tcp(_))
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        match self {
            BackendStream::Tcp(s) => s.peer_addr(),
            BackendStream::Tls(s) => s.get_ref().0.peer_addr(),
            BackendStream::TdsTls(s) => s.get_ref().0.get_ref().peer_addr(),
        }
    }
}

impl std::fmt::Debug for BackendStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            BackendStream::Tcp(_) => "Tcp",
            BackendStream::Tls(_) => "Tls",
            BackendStream::TdsTls(_) => "TdsTls",
        };
        f.debug_tuple("BackendStream").field(&kind).finish()
    }
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            BackendStream::TdsTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            BackendStream::TdsTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            BackendStream::TdsTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            BackendStream::TdsTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
