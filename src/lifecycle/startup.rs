//! Startup orchestration.
//!
//! # Responsibilities
//! - Optionally wait for the backend to accept connections
//!   before the listener starts taking traffic
//!
//! # Design Decisions
//! - Fail fast: a backend that never comes up is a fatal startup error
//! - Probe connections are released right away

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::client::{ClientFactory, DialError};
use crate::config::schema::StartupConfig;
use crate::resilience::Backoff;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("backend not ready after {attempts} attempts in {waited:?}: {last_error}")]
    BackendUnavailable {
        attempts: u32,
        waited: Duration,
        #[source]
        last_error: DialError,
    },
}

/// Dial the backend until it accepts a connection, sleeping with backoff
/// between attempts. Returns the number of attempts it took.
pub async fn wait_for_backend<F: ClientFactory>(
    factory: &F,
    config: &StartupConfig,
) -> Result<u32, StartupError> {
    let started = Instant::now();
    let deadline = started + Duration::from_secs(config.ready_timeout_secs);
    let mut backoff = Backoff::new(
        Duration::from_millis(config.base_delay_ms),
        Duration::from_millis(config.max_delay_ms),
    );
    let mut attempts = 0;

    loop {
        attempts += 1;
        let last_error = match factory.new_connection().await {
            Ok(mut connection) => {
                if let Err(e) = connection.close().await {
                    tracing::debug!(error = %e, "Failed to release readiness probe");
                }
                tracing::info!(attempts, "Backend is accepting connections");
                return Ok(attempts);
            }
            Err(e) => e,
        };

        let delay = backoff.next_delay();
        if Instant::now() + delay >= deadline {
            return Err(StartupError::BackendUnavailable {
                attempts,
                waited: started.elapsed(),
                last_error,
            });
        }
        tracing::warn!(
            attempt = attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %last_error,
            "Backend not ready"
        );
        tokio::time::sleep(delay).await;
    }
}
