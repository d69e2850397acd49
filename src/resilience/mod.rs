//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Startup readiness probe:
//!     → dial backend
//!     → On failure: backoff.rs (sleep, then dial again)
//! ```
//!
//! # Design Decisions
//! - Request handling never retries; backoff is only for startup polling
//! - Jitter keeps many gateways from probing a backend in lockstep

pub mod backoff;

pub use backoff::Backoff;
