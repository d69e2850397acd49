//! HTTP to FastCGI gateway library.

pub mod config;
pub mod http;
pub mod fastcgi;
pub mod client;
pub mod session;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::GatewayConfig;
pub use http::GatewayServer;
pub use lifecycle::Shutdown;
