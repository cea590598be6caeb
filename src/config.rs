use crate::core::connectors;
use crate::core::resolver::Provider;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub services: HashMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Registered connector name (mysql, pg, mssql, passthrough)
    pub connector: String,
    pub listen_on: String,
    #[serde(default)]
    pub credentials: HashMap<String, CredentialConfig>,
}

/// A credential is either a bare value or a provider reference.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CredentialConfig {
    Literal(String),
    /// Unquoted YAML numbers such as `port: 5432`
    Number(serde_yaml::Number),
    Provider {
        #[serde(default = "default_provider")]
        from: String,
        get: String,
    },
}

impl CredentialConfig {
    fn provider_name(&self) -> &str {
        match self {
            CredentialConfig::Literal(_) | CredentialConfig::Number(_) => "literal",
            CredentialConfig::Provider { from, .. } => from,
        }
    }
}

fn default_provider() -> String {
    "literal".to_string()
}

impl ServiceConfig {
    /// Sorted credential names, as handed to the resolver per connection.
    pub fn credential_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.credentials.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub async fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.to_string())
            } else {
                ConfigError::IoError(e.to_string())
            }
        })?;

        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML string (useful for testing)
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for common errors
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::ValidationError(
                "No services configured".to_string(),
            ));
        }

        let mut seen_addresses = HashSet::new();
        let mut names: Vec<&String> = self.services.keys().collect();
        names.sort();

        for name in names {
            let service = &self.services[name];

            if !connectors::is_registered(&service.connector) {
                return Err(ConfigError::ValidationError(format!(
                    "Service '{}' references unknown connector '{}'",
                    name, service.connector
                )));
            }

            let addr: SocketAddr = service.listen_on.parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "Service '{}' has invalid listen_on address '{}'",
                    name, service.listen_on
                ))
            })?;
            // Port 0 asks the OS for a fresh port, so it never collides.
            if addr.port() != 0 && !seen_addresses.insert(addr) {
                return Err(ConfigError::ValidationError(format!(
                    "Service '{}' listens on '{}' which is already in use by another service",
                    name, service.listen_on
                )));
            }

            for (cred_name, credential) in &service.credentials {
                if Provider::from_name(credential.provider_name()).is_err() {
                    return Err(ConfigError::ValidationError(format!(
                        "Credential '{}' of service '{}' uses unknown provider '{}'",
                        cred_name,
                        name,
                        credential.provider_name()
                    )));
                }
                if let CredentialConfig::Provider { from, get } = credential {
                    if from != "literal" && get.is_empty() {
                        return Err(ConfigError::ValidationError(format!(
                            "Credential '{}' of service '{}' has an empty 'get'",
                            cred_name, name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}
