//! One request/response exchange with the application.
//!
//! # Data Flow
//! ```text
//! http::request::Parts + body
//!     → request.rs (BackendRequest + CGI params)
//!     → handler.rs (encode → exchange → demultiplex)
//!         STDOUT      → response stdout
//!         STDERR      → response stderr
//!         END_REQUEST → ExchangeStatus + app_status
//!     → response.rs (BackendResponse, or SessionError with the partial)
//! ```
//!
//! # Design Decisions
//! - The handler borrows the connection; releasing it is the caller's job
//! - Output received before a failure is never discarded
//! - A non-zero exit code is not an error

pub mod handler;
pub mod request;
pub mod response;

pub use handler::{DefaultSessionHandler, SessionError, SessionHandler};
pub use request::{BackendRequest, RequestEnv};
pub use response::{BackendResponse, ExchangeStatus};
