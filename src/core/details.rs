use crate::core::credentials::CredentialSet;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;
use zeroize::Zeroize;

pub const DEFAULT_MYSQL_PORT: u16 = 3306;
pub const DEFAULT_PG_PORT: u16 = 5432;
pub const DEFAULT_MSSQL_PORT: u16 = 1433;

/// Credential names that configure the TLS upgrade rather than the login.
pub const SSL_OPTION_NAMES: [&str; 6] =
    ["host", "sslhost", "sslmode", "sslrootcert", "sslcert", "sslkey"];

/// Backend address, login and options extracted from a [`CredentialSet`].
pub struct ConnectionDetails {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Everything that is not host/port/username/password or an SSL option.
    pub options: HashMap<String, String>,
    pub ssl_options: HashMap<String, String>,
}

impl ConnectionDetails {
    pub fn from_credentials(
        credentials: &CredentialSet,
        default_port: u16,
    ) -> Result<Self, DetailsError> {
        let host = take_str(credentials, "host");
        let port = match credentials.get_str("port") {
            Some(port) => parse_port(&port)?,
            None => default_port,
        };

        let mut details = Self {
            host,
            port,
            username: take_str(credentials, "username"),
            password: take_str(credentials, "password"),
            options: HashMap::new(),
            ssl_options: HashMap::new(),
        };

        // Only option values are copied here; the login fields above are
        // the sole copies of username and password.
        for (name, value) in credentials.iter() {
            if SSL_OPTION_NAMES.contains(&name) {
                if !value.is_empty() {
                    details
                        .ssl_options
                        .insert(name.to_string(), String::from_utf8_lossy(value).into_owned());
                }
                continue;
            }
            match name {
                "host" | "port" | "username" | "password" | "address" => {}
                _ => {
                    details
                        .options
                        .insert(name.to_string(), String::from_utf8_lossy(value).into_owned());
                }
            }
        }

        Ok(details)
    }

    /// Like [`ConnectionDetails::from_credentials`], but also honours the
    /// deprecated `address` credential (`host[:port]`).
    pub fn from_credentials_with_address(
        credentials: &CredentialSet,
        default_port: u16,
    ) -> Result<Self, DetailsError> {
        let mut details = Self::from_credentials(credentials, default_port)?;

        if let Some(address) = credentials.get_str("address") {
            warn!("'address' has been deprecated. Please use 'host' and 'port' instead.");
            let (host, port) = split_address(&address, default_port)?;
            details.host = host.clone();
            details.port = port;
            details.ssl_options.insert("host".to_string(), host);
        }

        Ok(details)
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn take_str(credentials: &CredentialSet, name: &str) -> String {
    credentials
        .get_str(name)
        .map(|mut value| std::mem::take(&mut *value))
        .unwrap_or_default()
}

fn parse_port(port: &str) -> Result<u16, DetailsError> {
    port.trim()
        .parse::<u16>()
        .map_err(|_| DetailsError::InvalidPort(port.to_string()))
}

fn split_address(address: &str, default_port: u16) -> Result<(String, u16), DetailsError> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| DetailsError::InvalidAddress(address.to_string()))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port(p)?,
            None if tail.is_empty() => default_port,
            None => return Err(DetailsError::InvalidAddress(address.to_string())),
        };
        return Ok((host.to_string(), port));
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host.to_string(), parse_port(port)?)),
        Some(_) => Err(DetailsError::InvalidAddress(address.to_string())),
        None => Ok((address.to_string(), default_port)),
    }
}

impl Drop for ConnectionDetails {
    fn drop(&mut self) {
        self.username.zeroize();
        self.password.zeroize();
        for value in self.options.values_mut() {
            value.zeroize();
        }
        for value in self.ssl_options.values_mut() {
            value.zeroize();
        }
    }
}

impl fmt::Debug for ConnectionDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDetails")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("options", &self.options.keys().collect::<Vec<_>>())
            .field("ssl_options", &self.ssl_options.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetailsError {
    #[error("Invalid port: {0}")]
    InvalidPort(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}
