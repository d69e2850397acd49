//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, tracing, concurrency limit)
//!     → bridge.rs (body limit → dial → session → release)
//!         → session::handler (FastCGI exchange)
//!     → response.rs (CGI header block → HTTP response)
//!     → Send to client
//! ```

pub mod bridge;
pub mod request;
pub mod response;
pub mod server;

pub use bridge::{Bridge, BridgeSettings};
pub use request::{LocalAddr, UuidRequestId, X_REQUEST_ID};
pub use server::GatewayServer;
