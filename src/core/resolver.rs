use crate::config::CredentialConfig;
use crate::core::credentials::CredentialSet;
use async_trait::async_trait;
use std::collections::HashMap;
use std::ffi::OsString;
use tracing::debug;

/// Maps credential names to resolved bytes.
///
/// Resolution is all-or-nothing: on error no partial set is returned.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, names: &[String]) -> Result<CredentialSet, ResolverError>;
}

/// Where a credential value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    Literal,
    Env,
    File,
}

impl Provider {
    pub fn from_name(name: &str) -> Result<Self, ResolverError> {
        match name {
            "" | "literal" => Ok(Provider::Literal),
            "env" => Ok(Provider::Env),
            "file" => Ok(Provider::File),
            other => Err(ResolverError::UnknownProvider(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::Literal => "literal",
            Provider::Env => "env",
            Provider::File => "file",
        }
    }

    async fn fetch(&self, id: &str) -> Result<Vec<u8>, ResolverError> {
        match self {
            Provider::Literal => Ok(id.as_bytes().to_vec()),
            Provider::Env => {
                let value = std::env::var_os(id).ok_or_else(|| {
                    ResolverError::NotFound(format!("environment variable '{}' is not set", id))
                })?;
                env_bytes(value, id)
            }
            Provider::File => tokio::fs::read(id).await.map_err(|e| {
                ResolverError::NotFound(format!("failed to read file '{}': {}", id, e))
            }),
        }
    }
}

/// Raw bytes of an environment value, unaltered.
#[cfg(unix)]
fn env_bytes(value: OsString, _id: &str) -> Result<Vec<u8>, ResolverError> {
    use std::os::unix::ffi::OsStringExt;
    Ok(value.into_vec())
}

#[cfg(not(unix))]
fn env_bytes(value: OsString, id: &str) -> Result<Vec<u8>, ResolverError> {
    value.into_string().map(String::into_bytes).map_err(|_| {
        ResolverError::InvalidValue(format!("environment variable '{}' is not valid UTF-8", id))
    })
}

#[derive(Debug, Clone)]
struct CredentialSource {
    provider: Provider,
    id: String,
}

/// Resolver backed by the literal/env/file providers of one service.
#[derive(Debug, Clone, Default)]
pub struct ProviderResolver {
    sources: HashMap<String, CredentialSource>,
}

impl ProviderResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(
        credentials: &HashMap<String, CredentialConfig>,
    ) -> Result<Self, ResolverError> {
        let mut resolver = Self::new();
        for (name, credential) in credentials {
            let (provider, id) = match credential {
                CredentialConfig::Literal(value) => (Provider::Literal, value.clone()),
                CredentialConfig::Number(value) => (Provider::Literal, value.to_string()),
                CredentialConfig::Provider { from, get } => (Provider::from_name(from)?, get.clone()),
            };
            resolver = resolver.with_source(name, provider, id);
        }
        Ok(resolver)
    }

    pub fn with_source(
        mut self,
        name: impl Into<String>,
        provider: Provider,
        id: impl Into<String>,
    ) -> Self {
        self.sources.insert(
            name.into(),
            CredentialSource {
                provider,
                id: id.into(),
            },
        );
        self
    }

    pub fn with_literal(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_source(name, Provider::Literal, value)
    }

    /// Names of every credential this resolver knows about, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl CredentialResolver for ProviderResolver {
    async fn resolve(&self, names: &[String]) -> Result<CredentialSet, ResolverError> {
        let mut resolved = CredentialSet::new();
        for name in names {
            let source = self
                .sources
                .get(name)
                .ok_or_else(|| ResolverError::UnknownCredential(name.clone()))?;
            debug!(
                "Resolving credential '{}' from {} provider",
                name,
                source.provider.name()
            );
            // On error `resolved` drops here and wipes what was already fetched.
            let value = source.provider.fetch(&source.id).await?;
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("Unknown credential provider: {0}")]
    UnknownProvider(String),
    #[error("Credential '{0}' is not configured")]
    UnknownCredential(String),
    #[error("Credential not found: {0}")]
    NotFound(String),
    #[error("Invalid credential value: {0}")]
    InvalidValue(String),
}
