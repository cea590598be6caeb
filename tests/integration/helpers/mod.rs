pub mod mock_backend;
pub mod proxy;
pub mod tls;
