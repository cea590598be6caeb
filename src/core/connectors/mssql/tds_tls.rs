//! SQL Server carries the TLS handshake inside PRELOGIN packets. This
//! wrapper frames outgoing handshake records and strips the TDS headers from
//! incoming ones; once the handshake is done it is switched to passthrough
//! and TLS records flow over the socket unwrapped.

use super::packets::{encode_message, packet_type, PacketHeader, HEADER_LEN};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::trace;

pub struct TdsTlsStream {
    inner: TcpStream,
    passthrough: bool,
    header: [u8; HEADER_LEN],
    header_filled: usize,
    payload_remaining: usize,
    /// Handshake bytes written since the last flush.
    pending: Vec<u8>,
    /// Framed packets being written by the current flush.
    outgoing: Vec<u8>,
    outgoing_written: usize,
}

impl TdsTlsStream {
    pub fn new(inner: TcpStream) -> Self {
        Self {
            inner,
            passthrough: false,
            header: [0; HEADER_LEN],
            header_filled: 0,
            payload_remaining: 0,
            pending: Vec::new(),
            outgoing: Vec::new(),
            outgoing_written: 0,
        }
    }

    pub fn set_passthrough(&mut self, enabled: bool) {
        trace!("TDS TLS wrapper passthrough = {}", enabled);
        self.passthrough = enabled;
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.inner
    }

    pub fn into_inner(self) -> TcpStream {
        self.inner
    }
}

impl AsyncRead for TdsTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.passthrough {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if this.payload_remaining > 0 {
                let want = this.payload_remaining.min(buf.remaining());
                let mut chunk = vec![0u8; want];
                let mut chunk_buf = ReadBuf::new(&mut chunk);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf))?;

                let n = chunk_buf.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside a TDS packet",
                    )));
                }
                this.payload_remaining -= n;
                buf.put_slice(chunk_buf.filled());
                return Poll::Ready(Ok(()));
            }

            while this.header_filled < HEADER_LEN {
                let mut header_buf = ReadBuf::new(&mut this.header[this.header_filled..]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut header_buf))?;

                let n = header_buf.filled().len();
                if n == 0 {
                    if this.header_filled == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside a TDS header",
                    )));
                }
                this.header_filled += n;
            }

            this.header_filled = 0;
            let header = PacketHeader::parse(&this.header)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            trace!(
                "TDS packet type 0x{:02X} carrying {} TLS bytes",
                header.packet_type,
                header.payload_len()
            );
            this.payload_remaining = header.payload_len();
        }
    }
}

impl AsyncWrite for TdsTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.passthrough {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        this.pending.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.outgoing.is_empty() && !this.pending.is_empty() {
            this.outgoing = encode_message(packet_type::PRELOGIN, &this.pending);
            this.outgoing_written = 0;
            this.pending.clear();
        }

        while this.outgoing_written < this.outgoing.len() {
            let n = ready!(Pin::new(&mut this.inner)
                .poll_write(cx, &this.outgoing[this.outgoing_written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.outgoing_written += n;
        }
        this.outgoing.clear();
        this.outgoing_written = 0;

        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
