pub mod connectors;
pub mod credentials;
pub mod details;
pub mod metrics;
pub mod resolver;
pub mod stream;
pub mod tls;

// Re-export core traits
pub use connectors::{Connector, ConnectorError};
pub use credentials::{CredentialGuard, CredentialSet};
pub use details::ConnectionDetails;
pub use metrics::{AtomicServiceMetrics, MetricsSnapshot, ServiceMetrics};
pub use resolver::{CredentialResolver, Provider, ProviderResolver, ResolverError};
pub use stream::BackendStream;
pub use tls::{SslMode, TlsOptions};
