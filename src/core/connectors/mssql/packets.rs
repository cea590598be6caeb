//! TDS framing plus the PRELOGIN, LOGIN7 and login-response layouts.

use crate::core::connectors::ConnectorError;
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

pub const HEADER_LEN: usize = 8;
pub const DEFAULT_PACKET_SIZE: usize = 4096;

pub mod packet_type {
    pub const TABULAR_RESULT: u8 = 0x04;
    pub const LOGIN7: u8 = 0x10;
    pub const PRELOGIN: u8 = 0x12;
}

pub const STATUS_EOM: u8 = 0x01;

pub mod prelogin_option {
    pub const VERSION: u8 = 0x00;
    pub const ENCRYPTION: u8 = 0x01;
    pub const INSTOPT: u8 = 0x02;
    pub const THREADID: u8 = 0x03;
    pub const MARS: u8 = 0x04;
    pub const TERMINATOR: u8 = 0xFF;
}

pub mod encryption {
    pub const OFF: u8 = 0x00;
    pub const ON: u8 = 0x01;
    pub const NOT_SUP: u8 = 0x02;
    pub const REQ: u8 = 0x03;
}

pub mod token {
    pub const ERROR: u8 = 0xAA;
    pub const INFO: u8 = 0xAB;
    pub const LOGINACK: u8 = 0xAD;
    pub const ENVCHANGE: u8 = 0xE3;
    pub const DONE: u8 = 0xFD;
}

pub const TDS_7_4: u32 = 0x7400_0004;

/// Upper bound on a reassembled message.
const MAX_MESSAGE_LEN: usize = 1 << 20;

/// 8-byte packet header; the length is big-endian and includes the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: u8,
    pub status: u8,
    pub length: u16,
    pub spid: u16,
    pub packet_id: u8,
    pub window: u8,
}

impl PacketHeader {
    pub fn new(packet_type: u8, status: u8, payload_len: usize, packet_id: u8) -> Self {
        Self {
            packet_type,
            status,
            length: (HEADER_LEN + payload_len) as u16,
            spid: 0,
            packet_id,
            window: 0,
        }
    }

    pub fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self, ConnectorError> {
        let header = Self {
            packet_type: buf[0],
            status: buf[1],
            length: u16::from_be_bytes([buf[2], buf[3]]),
            spid: u16::from_be_bytes([buf[4], buf[5]]),
            packet_id: buf[6],
            window: buf[7],
        };
        if (header.length as usize) < HEADER_LEN {
            return Err(ConnectorError::Protocol(format!(
                "invalid TDS packet length {}",
                header.length
            )));
        }
        Ok(header)
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let len = self.length.to_be_bytes();
        let spid = self.spid.to_be_bytes();
        [
            self.packet_type,
            self.status,
            len[0],
            len[1],
            spid[0],
            spid[1],
            self.packet_id,
            self.window,
        ]
    }

    pub fn is_end_of_message(&self) -> bool {
        self.status & STATUS_EOM != 0
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_LEN
    }
}

/// Read packets until one carries the EOM status and return the message type
/// and the concatenated payload.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(u8, Vec<u8>), ConnectorError> {
    let mut payload = Vec::new();
    loop {
        let mut raw = [0u8; HEADER_LEN];
        reader.read_exact(&mut raw).await?;
        let header = PacketHeader::parse(&raw)?;

        let start = payload.len();
        if start + header.payload_len() > MAX_MESSAGE_LEN {
            return Err(ConnectorError::Protocol("TDS message too large".to_string()));
        }
        payload.resize(start + header.payload_len(), 0);
        reader.read_exact(&mut payload[start..]).await?;

        if header.is_end_of_message() {
            return Ok((header.packet_type, payload));
        }
    }
}

/// Split `payload` into packets of at most [`DEFAULT_PACKET_SIZE`] bytes.
pub fn encode_message(packet_type: u8, payload: &[u8]) -> Vec<u8> {
    let max_payload = DEFAULT_PACKET_SIZE - HEADER_LEN;
    let packets = payload.len().div_ceil(max_payload).max(1);
    let mut out = Vec::with_capacity(payload.len() + packets * HEADER_LEN);
    let mut chunks = payload.chunks(max_payload).peekable();
    let mut packet_id: u8 = 1;

    if chunks.peek().is_none() {
        out.extend_from_slice(&PacketHeader::new(packet_type, STATUS_EOM, 0, packet_id).encode());
        return out;
    }

    while let Some(chunk) = chunks.next() {
        let status = if chunks.peek().is_none() { STATUS_EOM } else { 0 };
        out.extend_from_slice(&PacketHeader::new(packet_type, status, chunk.len(), packet_id).encode());
        out.extend_from_slice(chunk);
        packet_id = packet_id.wrapping_add(1);
    }
    out
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet_type: u8,
    payload: &[u8],
) -> Result<(), ConnectorError> {
    let bytes = Zeroizing::new(encode_message(packet_type, payload));
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// PRELOGIN option table, kept sorted by option token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prelogin {
    pub options: BTreeMap<u8, Vec<u8>>,
}

impl Prelogin {
    pub fn parse(payload: &[u8]) -> Result<Self, ConnectorError> {
        let malformed = || ConnectorError::Protocol("malformed PRELOGIN message".to_string());
        let mut options = BTreeMap::new();
        let mut pos = 0;

        loop {
            let option = *payload.get(pos).ok_or_else(malformed)?;
            if option == prelogin_option::TERMINATOR {
                break;
            }
            let entry = payload.get(pos + 1..pos + 5).ok_or_else(malformed)?;
            let offset = u16::from_be_bytes([entry[0], entry[1]]) as usize;
            let len = u16::from_be_bytes([entry[2], entry[3]]) as usize;
            let value = payload.get(offset..offset + len).ok_or_else(malformed)?;
            options.insert(option, value.to_vec());
            pos += 5;
        }

        Ok(Self { options })
    }

    pub fn encode(&self) -> Vec<u8> {
        let table_len = self.options.len() * 5 + 1;
        let mut table = Vec::with_capacity(table_len);
        let mut data = Vec::new();

        for (option, value) in &self.options {
            table.push(*option);
            table.extend_from_slice(&((table_len + data.len()) as u16).to_be_bytes());
            table.extend_from_slice(&(value.len() as u16).to_be_bytes());
            data.extend_from_slice(value);
        }
        table.push(prelogin_option::TERMINATOR);
        table.extend_from_slice(&data);
        table
    }

    pub fn set(&mut self, option: u8, value: Vec<u8>) {
        self.options.insert(option, value);
    }

    pub fn get(&self, option: u8) -> Option<&[u8]> {
        self.options.get(&option).map(Vec::as_slice)
    }

    pub fn encryption(&self) -> Option<u8> {
        self.get(prelogin_option::ENCRYPTION)
            .and_then(|v| v.first().copied())
    }

    /// The request the proxy sends to the backend.
    pub fn request(encryption: u8) -> Self {
        let mut prelogin = Self::default();
        prelogin.set(prelogin_option::VERSION, vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        prelogin.set(prelogin_option::ENCRYPTION, vec![encryption]);
        prelogin.set(prelogin_option::INSTOPT, vec![0x00]);
        prelogin.set(prelogin_option::THREADID, Vec::new());
        prelogin.set(prelogin_option::MARS, vec![0x00]);
        prelogin
    }

    /// Answer to the client's PRELOGIN: its own options echoed back with a
    /// fixed server version, no thread id and encryption declared
    /// unsupported.
    pub fn client_response(request: &Prelogin) -> Self {
        let mut response = request.clone();
        response.set(prelogin_option::VERSION, vec![0x0e, 0x00, 0x0c, 0xa6, 0x00, 0x00]);
        response.set(prelogin_option::ENCRYPTION, vec![encryption::NOT_SUP]);
        response.set(prelogin_option::THREADID, Vec::new());
        response
    }
}

/// Fixed part of LOGIN7 up to the variable data.
const LOGIN7_HEADER_LEN: usize = 94;

/// A SQL-authentication LOGIN7 request.
pub struct Login7 {
    pub hostname: String,
    pub username: String,
    pub password: Zeroizing<String>,
    pub app_name: String,
    pub server_name: String,
    pub library_name: String,
    pub database: String,
    pub packet_size: u32,
}

impl Login7 {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            hostname: String::new(),
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
            app_name: "warden".to_string(),
            server_name: String::new(),
            library_name: "warden".to_string(),
            database: String::new(),
            packet_size: DEFAULT_PACKET_SIZE as u32,
        }
    }

    pub fn encode(&self) -> Zeroizing<Vec<u8>> {
        let fields: [(&str, bool); 7] = [
            (self.hostname.as_str(), false),
            (self.username.as_str(), false),
            (self.password.as_str(), true),
            (self.app_name.as_str(), false),
            (self.server_name.as_str(), false),
            (self.library_name.as_str(), false),
            (self.database.as_str(), false),
        ];

        // Variable data is written straight into one exact-size buffer; the
        // obfuscated password never lives anywhere else.
        let data_len: usize = fields.iter().map(|(text, _)| utf16_len(text) * 2).sum();
        let mut data = Zeroizing::new(Vec::with_capacity(data_len));
        let mut offsets = [[0u8; 4]; 7];
        for ((text, obfuscate), entry) in fields.iter().zip(offsets.iter_mut()) {
            let chars = utf16_len(text);
            let offset = if chars == 0 { 0 } else { LOGIN7_HEADER_LEN + data.len() };
            for byte in text.encode_utf16().flat_map(u16::to_le_bytes) {
                data.push(if *obfuscate { obfuscate_byte(byte) } else { byte });
            }
            entry[..2].copy_from_slice(&(offset as u16).to_le_bytes());
            entry[2..].copy_from_slice(&(chars as u16).to_le_bytes());
        }
        let [hostname, username, password, app_name, server_name, library, database] = offsets;

        let total = LOGIN7_HEADER_LEN + data.len();
        let mut out = Zeroizing::new(Vec::with_capacity(total));
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(&TDS_7_4.to_le_bytes());
        out.extend_from_slice(&self.packet_size.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // client program version
        out.extend_from_slice(&std::process::id().to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // connection id
        // OptionFlags1: USE_DB_ON | INIT_DB_FATAL | SET_LANG_ON
        out.push(0xE0);
        // OptionFlags2: INIT_LANG_FATAL | ODBC_ON
        out.push(0x03);
        out.push(0x00); // type flags
        out.push(0x00); // option flags 3
        out.extend_from_slice(&0i32.to_le_bytes()); // timezone
        out.extend_from_slice(&0x0409u32.to_le_bytes()); // LCID en-US

        out.extend_from_slice(&hostname);
        out.extend_from_slice(&username);
        out.extend_from_slice(&password);
        out.extend_from_slice(&app_name);
        out.extend_from_slice(&server_name);
        out.extend_from_slice(&[0, 0, 0, 0]); // extension
        out.extend_from_slice(&library);
        out.extend_from_slice(&[0, 0, 0, 0]); // language
        out.extend_from_slice(&database);
        out.extend_from_slice(&[0u8; 6]); // client id
        out.extend_from_slice(&[0, 0, 0, 0]); // SSPI
        out.extend_from_slice(&[0, 0, 0, 0]); // attach db file
        out.extend_from_slice(&[0, 0, 0, 0]); // change password
        out.extend_from_slice(&0u32.to_le_bytes()); // SSPI long

        out.extend_from_slice(&data);
        out
    }
}

fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

fn obfuscate_byte(byte: u8) -> u8 {
    byte.rotate_left(4) ^ 0xA5
}

/// UTF-16LE, then per byte: swap nibbles and XOR with 0xA5.
pub fn obfuscate_password(password: &str) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(utf16_len(password) * 2));
    out.extend(password.encode_utf16().flat_map(u16::to_le_bytes).map(obfuscate_byte));
    out
}

/// An ERROR token from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub number: u32,
    pub state: u8,
    pub class: u8,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Accepted { tds_version: u32, server_name: String },
    Rejected(ServerError),
}

/// Walk the tokens of a login response until LOGINACK, ERROR or DONE.
pub fn scan_login_response(payload: &[u8]) -> Result<LoginOutcome, ConnectorError> {
    let truncated = || ConnectorError::Protocol("truncated login response".to_string());
    let mut pos = 0;
    let mut error = None;

    while pos < payload.len() {
        let kind = payload[pos];
        pos += 1;
        match kind {
            token::DONE => break,
            token::LOGINACK | token::ERROR | token::INFO | token::ENVCHANGE => {
                let len_bytes = payload.get(pos..pos + 2).ok_or_else(truncated)?;
                let len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
                pos += 2;
                let body = payload.get(pos..pos + len).ok_or_else(truncated)?;
                pos += len;

                if kind == token::LOGINACK {
                    return parse_login_ack(body);
                }
                if kind == token::ERROR && error.is_none() {
                    error = Some(parse_error(body)?);
                }
            }
            other => {
                return Err(ConnectorError::Protocol(format!(
                    "unexpected token 0x{:02X} in login response",
                    other
                )))
            }
        }
    }

    match error {
        Some(err) => Ok(LoginOutcome::Rejected(err)),
        None => Err(ConnectorError::Protocol(
            "login response carried neither LOGINACK nor ERROR".to_string(),
        )),
    }
}

fn parse_login_ack(body: &[u8]) -> Result<LoginOutcome, ConnectorError> {
    // interface(1) tds_version(4, big-endian) name_len(1) name(UTF-16) version(4)
    let truncated = || ConnectorError::Protocol("truncated LOGINACK token".to_string());
    let version = body.get(1..5).ok_or_else(truncated)?;
    let tds_version = u32::from_be_bytes([version[0], version[1], version[2], version[3]]);
    let name_len = *body.get(5).ok_or_else(truncated)? as usize;
    let name = body.get(6..6 + name_len * 2).ok_or_else(truncated)?;
    Ok(LoginOutcome::Accepted {
        tds_version,
        server_name: from_utf16le(name),
    })
}

fn parse_error(body: &[u8]) -> Result<ServerError, ConnectorError> {
    let truncated = || ConnectorError::Protocol("truncated ERROR token".to_string());
    let head = body.get(0..8).ok_or_else(truncated)?;
    let number = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    let msg_len = u16::from_le_bytes([head[6], head[7]]) as usize;
    let message = body.get(8..8 + msg_len * 2).ok_or_else(truncated)?;
    Ok(ServerError {
        number,
        state: head[4],
        class: head[5],
        message: from_utf16le(message),
    })
}

fn from_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}
