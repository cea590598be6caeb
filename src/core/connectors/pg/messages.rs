//! PostgreSQL frontend/backend messages needed for startup and
//! authentication.
//!
//! Regular messages are a type byte, a big-endian `i32` length that counts
//! itself, then the body. Startup-phase messages have no type byte.

use crate::core::connectors::ConnectorError;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};
use zeroize::Zeroizing;

/// Protocol 3.0.
pub const PROTOCOL_VERSION: i32 = 196_608;
pub const SSL_REQUEST_CODE: i32 = 80_877_103;

pub const SSL_ALLOWED: u8 = b'S';
pub const SSL_NOT_ALLOWED: u8 = b'N';

pub const AUTHENTICATION: u8 = b'R';
pub const ERROR_RESPONSE: u8 = b'E';
pub const PASSWORD_MESSAGE: u8 = b'p';

pub const AUTH_OK: i32 = 0;
pub const AUTH_CLEARTEXT_PASSWORD: i32 = 3;
pub const AUTH_MD5_PASSWORD: i32 = 5;
pub const AUTH_SASL: i32 = 10;
pub const AUTH_SASL_CONTINUE: i32 = 11;
pub const AUTH_SASL_FINAL: i32 = 12;

pub const SEVERITY_FATAL: &str = "FATAL";
pub const CODE_INTERNAL_ERROR: &str = "XX000";

/// Upper bound on startup and authentication message sizes.
const MAX_MESSAGE_LEN: usize = 10_000;

/// Read one startup-phase message (length-prefixed, no type byte) and
/// return everything after the length.
pub async fn read_startup_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, ConnectorError> {
    let len = reader.read_i32().await?;
    let body_len = body_len(len)?;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Read one typed message and return its type and body.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(u8, Vec<u8>), ConnectorError> {
    let kind = reader.read_u8().await?;
    let len = reader.read_i32().await?;
    let body_len = body_len(len)?;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    Ok((kind, body))
}

fn body_len(len: i32) -> Result<usize, ConnectorError> {
    if len < 4 || len as usize - 4 > MAX_MESSAGE_LEN {
        return Err(ConnectorError::Protocol(format!(
            "invalid message length {}",
            len
        )));
    }
    Ok(len as usize - 4)
}

/// Frame `body` as a typed message.
pub fn encode_message(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + body.len());
    out.push(kind);
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn ssl_request() -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&8i32.to_be_bytes());
    out[4..].copy_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
    out
}

/// `R` message with code 0, sent to the client in place of the backend's
/// real authentication exchange.
pub fn authentication_ok() -> Vec<u8> {
    encode_message(AUTHENTICATION, &AUTH_OK.to_be_bytes())
}

/// `p` message carrying a NUL-terminated string.
///
/// Built in a single exact-size buffer so no intermediate copy of the
/// password is freed without being wiped.
pub fn password_message(password: &str) -> Zeroizing<Vec<u8>> {
    let len = 4 + password.len() + 1;
    let mut out = Zeroizing::new(Vec::with_capacity(1 + len));
    out.push(PASSWORD_MESSAGE);
    out.extend_from_slice(&(len as i32).to_be_bytes());
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// Body cursor for big-endian integers and C strings.
pub(crate) struct MessageReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub(crate) fn i32(&mut self) -> Result<i32, ConnectorError> {
        let bytes = self.bytes(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ConnectorError> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], ConnectorError> {
        if self.buf.len() - self.pos < n {
            return Err(ConnectorError::Protocol(
                "unexpected end of message".to_string(),
            ));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn cstring(&mut self) -> Result<String, ConnectorError> {
        let rest = &self.buf[self.pos..];
        let end = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            ConnectorError::Protocol("unterminated string in message".to_string())
        })?;
        self.pos += end + 1;
        Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

/// Startup message: protocol version plus ordered parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub version: i32,
    pub parameters: Vec<(String, String)>,
}

impl StartupMessage {
    pub fn new(version: i32) -> Self {
        Self {
            version,
            parameters: Vec::new(),
        }
    }

    /// Parse a body as returned by [`read_startup_message`].
    pub fn parse(body: &[u8]) -> Result<Self, ConnectorError> {
        let mut r = MessageReader::new(body);
        let mut message = Self::new(r.i32()?);
        if message.version == SSL_REQUEST_CODE {
            return Ok(message);
        }

        while !r.is_empty() {
            let key = r.cstring()?;
            if key.is_empty() {
                break;
            }
            let value = r.cstring()?;
            message.parameters.push((key, value));
        }
        Ok(message)
    }

    pub fn is_ssl_request(&self) -> bool {
        self.version == SSL_REQUEST_CODE
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set `key`, replacing an earlier value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.parameters.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.parameters.push((key, value)),
        }
    }

    /// Full message including the length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        body.extend_from_slice(&self.version.to_be_bytes());
        for (key, value) in &self.parameters {
            body.extend_from_slice(key.as_bytes());
            body.push(0);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);

        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }
}

/// A PostgreSQL ErrorResponse as a Rust error.
#[derive(Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("pg: {severity}: {message}")]
pub struct PgError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: String,
    pub hint: String,
}

impl PgError {
    /// FATAL / XX000 wrapper for failures the backend did not report.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            severity: SEVERITY_FATAL.to_string(),
            code: CODE_INTERNAL_ERROR.to_string(),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Parse an ErrorResponse body. Unknown fields are skipped.
    pub fn parse(body: &[u8]) -> Result<Self, ConnectorError> {
        let mut err = Self::default();
        let mut r = MessageReader::new(body);
        loop {
            let field = match r.u8() {
                Ok(0) | Err(_) => break,
                Ok(field) => field,
            };
            let value = r.cstring().map_err(|_| {
                ConnectorError::Protocol("unparseable error from postgres server".to_string())
            })?;
            match field {
                b'S' => err.severity = value,
                b'C' => err.code = value,
                b'M' => err.message = value,
                b'D' => err.detail = value,
                b'H' => err.hint = value,
                _ => {}
            }
        }
        Ok(err)
    }

    /// Full `E` message.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(32 + self.message.len());
        let mut field = |tag: u8, value: &str| {
            body.push(tag);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        };
        field(b'S', &self.severity);
        field(b'C', &self.code);
        field(b'M', &self.message);
        if !self.detail.is_empty() {
            field(b'D', &self.detail);
        }
        if !self.hint.is_empty() {
            field(b'H', &self.hint);
        }
        body.push(0);
        encode_message(ERROR_RESPONSE, &body)
    }
}

impl fmt::Debug for PgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgError")
            .field("severity", &self.severity)
            .field("code", &self.code)
            .field("message", &self.message)
            .finish()
    }
}
