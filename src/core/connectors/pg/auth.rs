//! Backend authentication: cleartext, MD5 and SCRAM-SHA-256.

use super::messages::{
    encode_message, password_message, read_message, MessageReader, PgError, AUTHENTICATION,
    AUTH_CLEARTEXT_PASSWORD, AUTH_MD5_PASSWORD, AUTH_OK, AUTH_SASL, AUTH_SASL_CONTINUE,
    AUTH_SASL_FINAL, ERROR_RESPONSE, PASSWORD_MESSAGE,
};
use crate::core::connectors::ConnectorError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use zeroize::Zeroizing;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

type HmacSha256 = Hmac<Sha256>;

/// Answer the backend's authentication request with the real credentials
/// and wait for AuthenticationOk.
pub async fn authenticate<S>(stream: &mut S, username: &str, password: &str) -> Result<(), ConnectorError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body = read_authentication(stream).await?;
    let mut r = MessageReader::new(&body);

    match r.i32()? {
        AUTH_OK => {
            debug!("Backend accepted the connection without a password");
            Ok(())
        }
        AUTH_CLEARTEXT_PASSWORD => {
            debug!("Backend requested cleartext password authentication");
            send(stream, password_message(password)).await?;
            verify_authentication(stream).await
        }
        AUTH_MD5_PASSWORD => {
            debug!("Backend requested MD5 password authentication");
            let salt = r.bytes(4)?;
            let hashed = md5_password(username, password, salt);
            send(stream, password_message(&hashed)).await?;
            verify_authentication(stream).await
        }
        AUTH_SASL => {
            let mechanisms = sasl_mechanisms(&mut r)?;
            if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                return Err(ConnectorError::Auth(format!(
                    "none of the SASL mechanisms {:?} are supported",
                    mechanisms
                )));
            }
            debug!("Backend requested {} authentication", SCRAM_SHA_256);
            authenticate_scram(stream, username, password).await
        }
        other => Err(ConnectorError::Auth(format!(
            "authentication method {} is not supported",
            other
        ))),
    }
}

/// `"md5" + hex(md5(hex(md5(password ++ username)) ++ salt))`
pub fn md5_password(username: &str, password: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    let inner = Zeroizing::new(hex(&hasher.finalize()));

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{}", hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

async fn send<S: AsyncWrite + Unpin>(
    stream: &mut S,
    message: Zeroizing<Vec<u8>>,
) -> Result<(), ConnectorError> {
    stream.write_all(&message).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the next message, which must be an `R`. An ErrorResponse becomes
/// [`PgError`].
async fn read_authentication<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, ConnectorError> {
    let (kind, body) = read_message(stream).await?;
    match kind {
        AUTHENTICATION => Ok(body),
        ERROR_RESPONSE => Err(PgError::parse(&body)?.into()),
        other => Err(ConnectorError::Protocol(format!(
            "Expected {} message type, got {}",
            AUTHENTICATION, other
        ))),
    }
}

async fn verify_authentication<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), ConnectorError> {
    let body = read_authentication(stream).await?;
    let code = MessageReader::new(&body).i32()?;
    if code != AUTH_OK {
        return Err(ConnectorError::Protocol(format!(
            "Expected {} (AuthenticationOk), got {}",
            AUTH_OK, code
        )));
    }
    Ok(())
}

fn sasl_mechanisms(r: &mut MessageReader<'_>) -> Result<Vec<String>, ConnectorError> {
    let mut mechanisms = Vec::new();
    while !r.is_empty() {
        let name = r.cstring()?;
        if name.is_empty() {
            break;
        }
        mechanisms.push(name);
    }
    Ok(mechanisms)
}

async fn authenticate_scram<S>(stream: &mut S, username: &str, password: &str) -> Result<(), ConnectorError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client = ScramClient::new(username, password);

    let first = client.client_first_message();
    let mut body = Vec::with_capacity(SCRAM_SHA_256.len() + 5 + first.len());
    body.extend_from_slice(SCRAM_SHA_256.as_bytes());
    body.push(0);
    body.extend_from_slice(&(first.len() as i32).to_be_bytes());
    body.extend_from_slice(&first);
    send(stream, Zeroizing::new(encode_message(PASSWORD_MESSAGE, &body))).await?;

    let server_first = expect_sasl(stream, AUTH_SASL_CONTINUE).await?;
    let client_final = client.process_server_first(&server_first)?;
    send(stream, Zeroizing::new(encode_message(PASSWORD_MESSAGE, &client_final))).await?;

    let server_final = expect_sasl(stream, AUTH_SASL_FINAL).await?;
    client.verify_server_final(&server_final)?;

    verify_authentication(stream).await
}

async fn expect_sasl<S: AsyncRead + Unpin>(stream: &mut S, expected: i32) -> Result<Vec<u8>, ConnectorError> {
    let body = read_authentication(stream).await?;
    let mut r = MessageReader::new(&body);
    let code = r.i32()?;
    if code != expected {
        return Err(ConnectorError::Protocol(format!(
            "unexpected authentication response: expected {}, got {}",
            expected, code
        )));
    }
    Ok(r.rest().to_vec())
}

/// Client side of SCRAM-SHA-256 (RFC 5802/7677) without channel binding.
pub struct ScramClient {
    username: String,
    password: Zeroizing<String>,
    client_nonce: String,
    state: ScramState,
}

enum ScramState {
    Initial,
    SentClientFirst {
        client_first_bare: String,
    },
    SentClientFinal {
        auth_message: String,
        salted_password: Zeroizing<[u8; 32]>,
    },
    Done,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        Self::with_nonce(username, password, generate_nonce())
    }

    fn with_nonce(username: &str, password: &str, client_nonce: String) -> Self {
        Self {
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
            client_nonce,
            state: ScramState::Initial,
        }
    }

    pub fn client_first_message(&mut self) -> Vec<u8> {
        // PostgreSQL ignores the SCRAM username and uses the startup user.
        let client_first_bare = format!(
            "n={},r={}",
            self.username.replace('=', "=3D").replace(',', "=2C"),
            self.client_nonce
        );
        let message = format!("n,,{}", client_first_bare);
        self.state = ScramState::SentClientFirst { client_first_bare };
        message.into_bytes()
    }

    pub fn process_server_first(&mut self, server_first: &[u8]) -> Result<Vec<u8>, ConnectorError> {
        let ScramState::SentClientFirst { client_first_bare } = &self.state else {
            return Err(scram_error("unexpected server-first-message"));
        };
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| scram_error("invalid UTF-8 in server-first-message"))?;

        let (nonce, salt, iterations) = parse_server_first(server_first)?;
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(scram_error("server nonce does not extend the client nonce"));
        }

        let mut salted_password = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            salted_password.as_mut(),
        );

        let without_proof = format!("c={},r={}", BASE64.encode(b"n,,"), nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

        let client_key = hmac_sha256(salted_password.as_ref(), b"Client Key")?;
        let stored_key = Sha256::digest(client_key.as_slice());
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        self.state = ScramState::SentClientFinal {
            auth_message,
            salted_password,
        };
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check the server signature; a mismatch means the server does not
    /// know the password.
    pub fn verify_server_final(&mut self, server_final: &[u8]) -> Result<(), ConnectorError> {
        let ScramState::SentClientFinal {
            auth_message,
            salted_password,
        } = &self.state
        else {
            return Err(scram_error("unexpected server-final-message"));
        };
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| scram_error("invalid UTF-8 in server-final-message"))?;

        if let Some(reason) = server_final.strip_prefix("e=") {
            return Err(scram_error(&format!("server error: {}", reason)));
        }
        let signature = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or_else(|| scram_error("missing server signature"))?;
        let signature = BASE64
            .decode(signature)
            .map_err(|_| scram_error("invalid base64 in server signature"))?;

        let server_key = hmac_sha256(salted_password.as_ref(), b"Server Key")?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&server_key)
            .map_err(|e| scram_error(&e.to_string()))?;
        mac.update(auth_message.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| scram_error("server signature verification failed"))?;

        self.state = ScramState::Done;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, ScramState::Done)
    }
}

fn scram_error(reason: &str) -> ConnectorError {
    ConnectorError::Auth(format!("SCRAM-SHA-256 error: {}", reason))
}

fn generate_nonce() -> String {
    let bytes: [u8; 18] = rand::random();
    BASE64.encode(bytes)
}

/// `r=<nonce>,s=<salt>,i=<iterations>`
fn parse_server_first(message: &str) -> Result<(String, Vec<u8>, u32), ConnectorError> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in message.split(',') {
        if let Some(value) = part.strip_prefix("r=") {
            nonce = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("s=") {
            salt = Some(
                BASE64
                    .decode(value)
                    .map_err(|_| scram_error("invalid base64 in salt"))?,
            );
        } else if let Some(value) = part.strip_prefix("i=") {
            iterations = Some(
                value
                    .parse::<u32>()
                    .ok()
                    .filter(|&i| i > 0)
                    .ok_or_else(|| scram_error("invalid iteration count"))?,
            );
        }
    }

    match (nonce, salt, iterations) {
        (Some(n), Some(s), Some(i)) => Ok((n, s, i)),
        _ => Err(scram_error("missing field in server-first-message")),
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Zeroizing<Vec<u8>>, ConnectorError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| scram_error(&e.to_string()))?;
    mac.update(data);
    Ok(Zeroizing::new(mac.finalize().into_bytes().to_vec()))
}
