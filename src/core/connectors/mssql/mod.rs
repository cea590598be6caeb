//! SQL Server connector.
//!
//! ```text
//! client              proxy                              backend
//!   |-- PRELOGIN ------>|                                   |
//!   |<- PRELOGIN -------|  (encryption not supported)       |
//!   |-- LOGIN7 -------->|  (discarded)                      |
//!   |                   |-- PRELOGIN ---------------------->|
//!   |                   |<- PRELOGIN -----------------------|
//!   |                   |== TLS handshake in PRELOGIN =====>|  (unless sslmode=disable)
//!   |                   |-- LOGIN7 (real credentials) ----->|
//!   |                   |<- LOGINACK / ERROR ---------------|
//!   |<- LOGINACK -------|  (fixed frame)                    |
//! ```

use super::{dial, Connector, ConnectorError};
use crate::core::credentials::{CredentialGuard, CredentialSet};
use crate::core::details::{ConnectionDetails, DEFAULT_MSSQL_PORT};
use crate::core::stream::BackendStream;
use crate::core::tls::{self, TlsOptions};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub mod packets;
pub mod responses;
pub mod tds_tls;

use packets::{
    encryption, packet_type, read_message, scan_login_response, write_message, Login7,
    LoginOutcome, Prelogin,
};
use tds_tls::TdsTlsStream;

/// Injects credentials into the TDS login.
///
/// Requires `host`, `username` and `password`; `port` defaults to 1433 and an
/// optional `database` is sent in LOGIN7.
#[derive(Debug)]
pub struct MsSqlConnector {
    pub name: String,
}

impl MsSqlConnector {
    pub fn new() -> Self {
        Self {
            name: "mssql".to_string(),
        }
    }
}

impl Default for MsSqlConnector {
    fn default() -> Self {
        Self::new()
    }
}

async fn expect_message<S: AsyncRead + Unpin>(
    stream: &mut S,
    expected: u8,
    what: &str,
) -> Result<Zeroizing<Vec<u8>>, ConnectorError> {
    let (kind, payload) = read_message(stream).await?;
    let payload = Zeroizing::new(payload);
    if kind != expected {
        return Err(ConnectorError::Protocol(format!(
            "expected {} (packet type 0x{:02X}), got packet type 0x{:02X}",
            what, expected, kind
        )));
    }
    Ok(payload)
}

/// Answer the client's PRELOGIN and swallow its LOGIN7.
async fn fake_prelogin(client: &mut TcpStream) -> Result<(), ConnectorError> {
    let request = expect_message(client, packet_type::PRELOGIN, "PRELOGIN").await?;
    let request = Prelogin::parse(&request)?;
    debug!(
        "Client PRELOGIN with encryption {:?}",
        request.encryption()
    );

    let response = Prelogin::client_response(&request);
    write_message(client, packet_type::TABULAR_RESULT, &response.encode()).await?;

    expect_message(client, packet_type::LOGIN7, "LOGIN7").await?;
    debug!("Discarded client LOGIN7");
    Ok(())
}

/// PRELOGIN with the backend, upgrading to TLS when asked for.
async fn negotiate(
    mut backend: TcpStream,
    options: &TlsOptions,
) -> Result<BackendStream, ConnectorError> {
    let wanted = if options.use_tls() {
        encryption::ON
    } else {
        encryption::NOT_SUP
    };
    write_message(&mut backend, packet_type::PRELOGIN, &Prelogin::request(wanted).encode()).await?;

    let (_, payload) = read_message(&mut backend).await?;
    let answer = Prelogin::parse(&payload)?.encryption();
    debug!("Backend PRELOGIN with encryption {:?}", answer);

    match (options.use_tls(), answer) {
        (false, Some(encryption::REQ)) => Err(ConnectorError::Protocol(
            "the backend requires encryption but sslmode is disable".to_string(),
        )),
        (false, _) => Ok(BackendStream::Tcp(backend)),
        (true, Some(encryption::ON)) | (true, Some(encryption::REQ)) => {
            let mut tls = tls::handshake(TdsTlsStream::new(backend), options).await?;
            tls.get_mut().0.set_passthrough(true);
            debug!("Backend TLS handshake complete");
            Ok(BackendStream::TdsTls(Box::new(tls)))
        }
        (true, _) => Err(ConnectorError::Protocol(
            "the backend does not support encryption".to_string(),
        )),
    }
}

async fn login<S: AsyncRead + AsyncWrite + Unpin>(
    backend: &mut S,
    details: &ConnectionDetails,
) -> Result<(), ConnectorError> {
    let mut login = Login7::new(&details.username, &details.password);
    if let Some(database) = details.options.get("database") {
        login.database = database.clone();
    }
    login.server_name = details.host.clone();
    write_message(backend, packet_type::LOGIN7, &login.encode()).await?;

    let response = expect_message(backend, packet_type::TABULAR_RESULT, "login response").await?;
    match scan_login_response(&response)? {
        LoginOutcome::Accepted {
            tds_version,
            server_name,
        } => {
            debug!(
                "Backend login accepted (TDS 0x{:08X}, {})",
                tds_version,
                server_name.trim_end_matches('\0')
            );
            Ok(())
        }
        LoginOutcome::Rejected(err) => {
            warn!(
                "Backend rejected login: error {} (class {}): {}",
                err.number, err.class, err.message
            );
            Err(ConnectorError::MsSqlLogin(format!(
                "server error {}: {}",
                err.number, err.message
            )))
        }
    }
}

async fn connect_backend(details: &ConnectionDetails) -> Result<BackendStream, ConnectorError> {
    let options = TlsOptions::from_ssl_options(&details.ssl_options, false)?;
    let backend = dial(&details.address()).await?;
    let mut backend = negotiate(backend, &options).await?;
    login(&mut backend, details).await?;
    Ok(backend)
}

#[async_trait]
impl Connector for MsSqlConnector {
    async fn connect(
        &self,
        client: &mut TcpStream,
        credentials: &mut CredentialSet,
    ) -> Result<BackendStream, ConnectorError> {
        let credentials = CredentialGuard::new(credentials);

        let result = async {
            fake_prelogin(client).await?;
            let details = ConnectionDetails::from_credentials(&credentials, DEFAULT_MSSQL_PORT)?;
            let backend = connect_backend(&details).await?;
            client.write_all(&responses::LOGIN_OK).await?;
            Ok::<_, ConnectorError>(backend)
        }
        .await;
        drop(credentials);

        if let Err(err) = &result {
            debug!("MSSQL handshake failed: {}", err);
            if let Err(e) = client.write_all(&responses::GENERIC_ERROR).await {
                warn!("Attempted to write error {} to MSSQL client but failed", e);
            }
        }
        result
    }

    fn name(&self) -> &str {
        &self.name
    }
}
