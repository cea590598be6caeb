//! MySQL wire packets used during the connection phase.
//!
//! Every packet is a 3-byte little-endian payload length, a 1-byte sequence
//! ID and the payload. Records here are decoded from a payload, edited as
//! plain fields and re-encoded; the header is always rebuilt from the
//! encoded payload.

use crate::core::connectors::ConnectorError;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 4;
pub const MAX_PAYLOAD_LEN: usize = 0x00FF_FFFF;

pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
pub const CLIENT_SSL: u32 = 0x0000_0800;
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
pub const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;

pub const OK_PACKET: u8 = 0x00;
pub const AUTH_MORE_DATA: u8 = 0x01;
pub const AUTH_SWITCH_REQUEST: u8 = 0xFE;
pub const ERR_PACKET: u8 = 0xFF;

/// Capability flags, max packet size, charset and the reserved filler.
pub const SSL_REQUEST_PAYLOAD_LEN: usize = 4 + 4 + 1 + 23;

pub const CR_UNKNOWN_ERROR: u16 = 2000;
pub const CR_SSL_CONNECTION_ERROR: u16 = 2026;
pub const SQLSTATE_GENERAL_ERROR: &str = "HY000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: Vec<u8>) -> Self {
        Self {
            sequence_id,
            payload,
        }
    }

    /// First payload byte, which identifies OK/ERR/auth-switch packets.
    pub fn kind(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Header plus payload, with the length recomputed.
    pub fn to_bytes(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(HEADER_LEN + len);
        out.extend_from_slice(&[len as u8, (len >> 8) as u8, (len >> 16) as u8, self.sequence_id]);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a complete packet; the declared length must match exactly.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConnectorError> {
        if bytes.len() < HEADER_LEN {
            return Err(malformed("packet shorter than its header"));
        }
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]) as usize;
        if bytes.len() - HEADER_LEN != len {
            return Err(malformed("declared length does not match payload"));
        }
        Ok(Self::new(bytes[3], bytes[HEADER_LEN..].to_vec()))
    }
}

pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Packet> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Packet::new(header[3], payload))
}

pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> Result<(), ConnectorError> {
    if packet.payload.len() > MAX_PAYLOAD_LEN {
        return Err(ConnectorError::Protocol(format!(
            "packet payload of {} bytes exceeds the single-packet limit",
            packet.payload.len()
        )));
    }
    writer.write_all(&packet.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn malformed(what: &str) -> ConnectorError {
    ConnectorError::Protocol(format!("Malformed packet: {}", what))
}

/// Bounds-checked cursor over a payload.
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ConnectorError> {
        if self.remaining() < n {
            return Err(malformed("unexpected end of payload"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ConnectorError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16, ConnectorError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Result<u32, ConnectorError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn null_terminated(&mut self) -> Result<&'a [u8], ConnectorError> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| malformed("missing NUL terminator"))?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    fn null_terminated_string(&mut self) -> Result<String, ConnectorError> {
        Ok(String::from_utf8_lossy(self.null_terminated()?).into_owned())
    }

    fn lenenc_int(&mut self) -> Result<u64, ConnectorError> {
        let first = self.u8()?;
        let value = match first {
            0xFB => 0,
            0xFC => self.u16_le()? as u64,
            0xFD => {
                let b = self.bytes(3)?;
                u32::from_le_bytes([b[0], b[1], b[2], 0]) as u64
            }
            0xFE => {
                let b = self.bytes(8)?;
                u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            }
            0xFF => return Err(malformed("invalid length-encoded integer")),
            n => n as u64,
        };
        Ok(value)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

fn put_lenenc_int(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xFA => out.push(value as u8),
        0xFB..=0xFFFF => {
            out.push(0xFC);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFF_FFFF => {
            out.push(0xFD);
            out.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
        }
        _ => {
            out.push(0xFE);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Initial handshake sent by the server (protocol version 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeV10 {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Scramble: part 1 (8 bytes) followed by part 2 without its NUL.
    pub salt: Vec<u8>,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    /// Raw length byte as sent; some servers fill it in even without
    /// CLIENT_PLUGIN_AUTH.
    pub auth_plugin_data_len: u8,
    /// `None` when the greeting ends before a plugin name.
    pub auth_plugin_name: Option<String>,
}

impl HandshakeV10 {
    pub fn parse(payload: &[u8]) -> Result<Self, ConnectorError> {
        let mut r = PayloadReader::new(payload);

        let protocol_version = r.u8()?;
        if protocol_version != 10 {
            return Err(ConnectorError::Protocol(format!(
                "Unsupported protocol version: {}",
                protocol_version
            )));
        }
        let server_version = r.null_terminated_string()?;
        let connection_id = r.u32_le()?;
        let mut salt = r.bytes(8)?.to_vec();
        r.u8()?; // filler

        let caps_lower = r.u16_le()?;
        let character_set = r.u8()?;
        let status_flags = r.u16_le()?;
        let caps_upper = r.u16_le()?;
        let capability_flags = (caps_upper as u32) << 16 | caps_lower as u32;

        let auth_plugin_data_len = r.u8()?;
        r.bytes(10)?; // reserved

        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let part2 = r.bytes(Self::part2_len(auth_plugin_data_len))?;
            match part2.split_last() {
                Some((0, scramble)) => salt.extend_from_slice(scramble),
                _ => return Err(malformed("auth plugin data is not NUL terminated")),
            }
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && r.remaining() > 0
        {
            Some(r.null_terminated_string()?)
        } else {
            None
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            salt,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data_len,
            auth_plugin_name,
        })
    }

    /// Length of auth-plugin-data part 2 including its NUL.
    fn part2_len(auth_plugin_data_len: u8) -> usize {
        std::cmp::max(13, (auth_plugin_data_len as usize).saturating_sub(8))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.push(self.protocol_version);
        out.extend_from_slice(self.server_version.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.connection_id.to_le_bytes());

        let mut part1 = [0u8; 8];
        let n = self.salt.len().min(8);
        part1[..n].copy_from_slice(&self.salt[..n]);
        out.extend_from_slice(&part1);
        out.push(0);

        out.extend_from_slice(&(self.capability_flags as u16).to_le_bytes());
        out.push(self.character_set);
        out.extend_from_slice(&self.status_flags.to_le_bytes());
        out.extend_from_slice(&((self.capability_flags >> 16) as u16).to_le_bytes());
        out.push(self.auth_plugin_data_len);
        out.extend_from_slice(&[0u8; 10]);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let part2_len = Self::part2_len(self.auth_plugin_data_len);
            let mut part2 = self.salt.get(8..).unwrap_or_default().to_vec();
            part2.resize(part2_len, 0);
            if let Some(last) = part2.last_mut() {
                *last = 0;
            }
            out.extend_from_slice(&part2);
        }

        if let Some(name) = &self.auth_plugin_name {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        out
    }

    pub fn supports_ssl(&self) -> bool {
        self.capability_flags & CLIENT_SSL != 0
    }

    /// Copy of this greeting that no longer advertises TLS.
    pub fn without_ssl(&self) -> Self {
        let mut greeting = self.clone();
        greeting.capability_flags &= !CLIENT_SSL;
        greeting
    }
}

/// Client reply to [`HandshakeV10`] for 4.1+ clients.
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeResponse41 {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: Vec<u8>,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
    /// Connect attributes and anything else after the known fields.
    pub tail: Vec<u8>,
}

impl HandshakeResponse41 {
    pub fn parse(payload: &[u8]) -> Result<Self, ConnectorError> {
        let mut r = PayloadReader::new(payload);

        let capability_flags = r.u32_le()?;
        if capability_flags & CLIENT_PROTOCOL_41 == 0 {
            return Err(ConnectorError::Protocol("Client Protocol mismatch".to_string()));
        }
        if capability_flags & CLIENT_SSL != 0 {
            return Err(ConnectorError::Protocol("SSL Protocol mismatch".to_string()));
        }

        let max_packet_size = r.u32_le()?;
        let character_set = r.u8()?;
        r.bytes(23)?; // reserved
        let username = r.null_terminated()?.to_vec();

        let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            let len = r.lenenc_int()? as usize;
            r.bytes(len)?.to_vec()
        } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = r.u8()? as usize;
            r.bytes(len)?.to_vec()
        } else {
            r.null_terminated()?.to_vec()
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && r.remaining() > 0 {
            Some(r.null_terminated_string()?)
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && r.remaining() > 0
        {
            r.null_terminated_string()?
        } else {
            String::new()
        };

        Ok(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
            tail: r.rest().to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.username.len() + self.tail.len());
        out.extend_from_slice(&self.capability_flags.to_le_bytes());
        out.extend_from_slice(&self.max_packet_size.to_le_bytes());
        out.push(self.character_set);
        out.extend_from_slice(&[0u8; 23]);
        out.extend_from_slice(&self.username);
        out.push(0);

        if self.capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            put_lenenc_int(&mut out, self.auth_response.len() as u64);
            out.extend_from_slice(&self.auth_response);
        } else if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            out.push(self.auth_response.len() as u8);
            out.extend_from_slice(&self.auth_response);
        } else {
            out.extend_from_slice(&self.auth_response);
            out.push(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            out.extend_from_slice(self.database.as_deref().unwrap_or("").as_bytes());
            out.push(0);
        }
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            out.extend_from_slice(self.auth_plugin_name.as_bytes());
            out.push(0);
        }
        out.extend_from_slice(&self.tail);
        out
    }

    /// Payload of the SSLRequest that precedes this response on a TLS
    /// upgrade: the encoded response cut off before the username.
    pub fn ssl_request(&self) -> Vec<u8> {
        let mut payload = self.encode();
        payload.truncate(SSL_REQUEST_PAYLOAD_LEN);
        payload
    }
}

impl fmt::Debug for HandshakeResponse41 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeResponse41")
            .field("capability_flags", &format_args!("{:#010x}", self.capability_flags))
            .field("max_packet_size", &self.max_packet_size)
            .field("character_set", &self.character_set)
            .field("username", &String::from_utf8_lossy(&self.username))
            .field("auth_response_len", &self.auth_response.len())
            .field("database", &self.database)
            .field("auth_plugin_name", &self.auth_plugin_name)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn parse(payload: &[u8]) -> Result<Self, ConnectorError> {
        let mut r = PayloadReader::new(payload);
        if r.u8()? != OK_PACKET {
            return Err(malformed("expected OK packet"));
        }
        Ok(Self {
            affected_rows: r.lenenc_int()?,
            last_insert_id: r.lenenc_int()?,
            status_flags: r.u16_le()?,
            warnings: r.u16_le()?,
        })
    }
}

/// Server request to continue authentication with another plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub plugin_data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, ConnectorError> {
        let mut r = PayloadReader::new(payload);
        if r.u8()? != AUTH_SWITCH_REQUEST {
            return Err(malformed("expected AuthSwitchRequest"));
        }
        let plugin_name = r.null_terminated_string()?;
        if plugin_name.is_empty() {
            return Err(ConnectorError::Protocol(
                "Invalid AuthSwitchRequest packet: Missing plugin name".to_string(),
            ));
        }
        let mut plugin_data = r.rest().to_vec();
        if plugin_data.last() == Some(&0) {
            plugin_data.pop();
        }
        Ok(Self {
            plugin_name,
            plugin_data,
        })
    }
}

/// A MySQL ERR packet as a Rust error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("ERROR: {code} ({sql_state}): {message}")]
pub struct MySqlError {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl MySqlError {
    pub fn new(code: u16, sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            sql_state: sql_state.into(),
            message: message.into(),
        }
    }

    /// Wrap a proxy-side failure the client has no native code for.
    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(CR_UNKNOWN_ERROR, SQLSTATE_GENERAL_ERROR, message)
    }

    pub fn no_tls() -> Self {
        Self::new(
            CR_SSL_CONNECTION_ERROR,
            SQLSTATE_GENERAL_ERROR,
            "SSL connection error: SSL is required but the server doesn't support it",
        )
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ConnectorError> {
        let mut r = PayloadReader::new(payload);
        if r.u8()? != ERR_PACKET {
            return Err(malformed("expected ERR packet"));
        }
        let code = r.u16_le()?;
        let mut sql_state = String::new();
        if r.remaining() >= 6 && payload[r.pos] == b'#' {
            r.u8()?;
            sql_state = String::from_utf8_lossy(r.bytes(5)?).into_owned();
        }
        let message = String::from_utf8_lossy(r.rest()).into_owned();
        Ok(Self {
            code,
            sql_state,
            message,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.message.len());
        out.push(ERR_PACKET);
        out.extend_from_slice(&self.code.to_le_bytes());
        out.push(b'#');
        let mut state = self.sql_state.as_bytes().to_vec();
        state.resize(5, b'0');
        out.extend_from_slice(&state);
        out.extend_from_slice(self.message.as_bytes());
        out
    }
}
