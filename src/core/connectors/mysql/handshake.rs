//! The MySQL connection phase, run between a client and a backend.
//!
//! ```text
//! client            proxy                         backend
//!   |                 |<------- HandshakeV10 --------|
//!   |<- HandshakeV10 -|  (CLIENT_SSL cleared)        |
//!   |- Response41 --->|                              |
//!   |                 |-- SSLRequest + TLS --------->|  (when sslmode asks)
//!   |                 |-- Response41 (real creds) -->|
//!   |                 |<------- OK / ERR ------------|
//!   |<--- OK ---------|                              |
//! ```

use super::auth;
use super::packets::{
    read_packet, write_packet, AuthSwitchRequest, HandshakeResponse41, HandshakeV10, MySqlError,
    OkPacket, Packet, AUTH_MORE_DATA, AUTH_SWITCH_REQUEST, CLIENT_PLUGIN_AUTH,
    CLIENT_SECURE_CONNECTION, CLIENT_SSL, ERR_PACKET, HEADER_LEN, MAX_PAYLOAD_LEN, OK_PACKET,
};
use crate::core::connectors::ConnectorError;
use crate::core::details::ConnectionDetails;
use crate::core::stream::BackendStream;
use crate::core::tls::{self, TlsOptions};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use zeroize::Zeroizing;

/// One side of a MySQL conversation. Owns the sequence ID the peer expects
/// next so packet payload code never deals with headers.
pub struct MySqlConnection<S> {
    stream: S,
    sequence_id: u8,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MySqlConnection<S> {
    /// The proxy plays server towards the client; the first packet it
    /// writes there is the greeting.
    pub fn client(stream: S) -> Self {
        Self {
            stream,
            sequence_id: 0,
        }
    }

    pub fn backend(stream: S) -> Self {
        Self {
            stream,
            sequence_id: 1,
        }
    }

    pub fn sequence_id(&self) -> u8 {
        self.sequence_id
    }

    pub async fn read(&mut self) -> Result<Packet, ConnectorError> {
        let packet = read_packet(&mut self.stream).await?;
        self.sequence_id = packet.sequence_id.wrapping_add(1);
        Ok(packet)
    }

    pub async fn write(&mut self, payload: Vec<u8>) -> Result<(), ConnectorError> {
        let packet = Packet::new(self.sequence_id, payload);
        self.sequence_id = self.sequence_id.wrapping_add(1);
        write_packet(&mut self.stream, &packet).await
    }

    /// Frame and send a payload holding secret bytes. The framed copy is
    /// built at its final size and wiped once written.
    pub async fn write_secret(&mut self, payload: &[u8]) -> Result<(), ConnectorError> {
        let len = payload.len();
        if len > MAX_PAYLOAD_LEN {
            return Err(ConnectorError::Protocol(format!(
                "packet payload of {} bytes exceeds the single-packet limit",
                len
            )));
        }
        let mut frame = Zeroizing::new(Vec::with_capacity(HEADER_LEN + len));
        frame.extend_from_slice(&[len as u8, (len >> 8) as u8, (len >> 16) as u8, self.sequence_id]);
        frame.extend_from_slice(payload);
        self.sequence_id = self.sequence_id.wrapping_add(1);

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl MySqlConnection<BackendStream> {
    /// Switch the plaintext socket to TLS, keeping the sequence.
    async fn upgrade_tls(self, options: &TlsOptions) -> Result<Self, ConnectorError> {
        let stream = match self.stream {
            BackendStream::Tcp(tcp) => tls::upgrade(tcp, options).await?,
            other => other,
        };
        Ok(Self {
            stream,
            sequence_id: self.sequence_id,
        })
    }
}

/// Runs the connection phase with the real credentials injected.
pub struct AuthenticationHandshake<'a, C> {
    client: &'a mut MySqlConnection<C>,
    details: &'a ConnectionDetails,
    tls: &'a TlsOptions,
}

impl<'a, C: AsyncRead + AsyncWrite + Unpin> AuthenticationHandshake<'a, C> {
    pub fn new(
        client: &'a mut MySqlConnection<C>,
        details: &'a ConnectionDetails,
        tls: &'a TlsOptions,
    ) -> Self {
        Self {
            client,
            details,
            tls,
        }
    }

    /// Drive the handshake to completion and return the authenticated
    /// backend stream. Errors leave the caller to notify the client.
    pub async fn run(
        self,
        mut backend: MySqlConnection<BackendStream>,
    ) -> Result<BackendStream, ConnectorError> {
        let greeting_packet = backend.read().await?;
        let greeting = HandshakeV10::parse(&greeting_packet.payload)?;
        debug!(
            "Backend greeting: version {} connection id {} plugin '{}'",
            greeting.server_version,
            greeting.connection_id,
            greeting.auth_plugin_name.as_deref().unwrap_or_default()
        );

        self.client.write(greeting.without_ssl().encode()).await?;

        if self.tls.use_tls() && !greeting.supports_ssl() {
            return Err(MySqlError::no_tls().into());
        }

        let client_packet = self.client.read().await?;
        let mut response = HandshakeResponse41::parse(&client_packet.payload)?;

        response.capability_flags &= !CLIENT_PLUGIN_AUTH;
        response.capability_flags |= CLIENT_SECURE_CONNECTION;
        if self.tls.use_tls() {
            response.capability_flags |= CLIENT_SSL;
        }

        response.username = self.details.username.as_bytes().to_vec();
        response.auth_response =
            auth::native_password(self.details.password.as_bytes(), &greeting.salt);
        response.auth_plugin_name = auth::NATIVE_PASSWORD.to_string();

        if self.tls.use_tls() {
            backend.write(response.ssl_request()).await?;
            backend = backend.upgrade_tls(self.tls).await?;
            debug!("Backend connection upgraded to TLS");
        }

        backend.write(response.encode()).await?;

        let ok = self.await_result(&mut backend).await?;
        self.client.write(ok).await?;

        Ok(backend.into_inner())
    }

    /// Read backend packets until an OK or ERR, answering auth switches
    /// and caching_sha2 continuation requests along the way.
    async fn await_result(
        &self,
        backend: &mut MySqlConnection<BackendStream>,
    ) -> Result<Vec<u8>, ConnectorError> {
        let password = self.details.password.as_bytes();
        let mut plugin = auth::NATIVE_PASSWORD.to_string();

        loop {
            let packet = backend.read().await?;
            match packet.kind() {
                Some(ERR_PACKET) => return Err(MySqlError::parse(&packet.payload)?.into()),
                Some(OK_PACKET) => {
                    OkPacket::parse(&packet.payload)?;
                    return Ok(packet.payload);
                }
                Some(AUTH_SWITCH_REQUEST) => {
                    let switch = AuthSwitchRequest::parse(&packet.payload)?;
                    debug!("Backend requested auth switch to '{}'", switch.plugin_name);
                    let scramble =
                        auth::auth_response(&switch.plugin_name, password, &switch.plugin_data)?;
                    plugin = switch.plugin_name;
                    backend.write(scramble).await?;
                }
                Some(AUTH_MORE_DATA) if plugin == auth::CACHING_SHA2_PASSWORD => {
                    match packet.payload.get(1).copied() {
                        Some(auth::FAST_AUTH_SUCCESS) => {
                            debug!("caching_sha2_password fast authentication succeeded");
                        }
                        Some(auth::PERFORM_FULL_AUTHENTICATION) if backend.stream.is_tls() => {
                            let mut cleartext =
                                Zeroizing::new(Vec::with_capacity(password.len() + 1));
                            cleartext.extend_from_slice(password);
                            cleartext.push(0);
                            backend.write_secret(&cleartext).await?;
                        }
                        Some(auth::PERFORM_FULL_AUTHENTICATION) => {
                            return Err(ConnectorError::Auth(
                                "caching_sha2_password full authentication requires TLS to the backend"
                                    .to_string(),
                            ));
                        }
                        other => {
                            return Err(ConnectorError::Protocol(format!(
                                "unexpected caching_sha2_password status {:?}",
                                other
                            )))
                        }
                    }
                }
                other => {
                    return Err(ConnectorError::Protocol(format!(
                        "Malformed packet: unexpected response type {:?}",
                        other
                    )))
                }
            }
        }
    }
}
