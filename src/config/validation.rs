//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, sizes > 0)
//! - Check that addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::client::factory::BackendAddress;
use crate::config::schema::GatewayConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Check a parsed configuration, collecting every error.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    if let Err(e) = config.backend.address.parse::<BackendAddress>() {
        errors.push(ValidationError::new("backend.address", e.to_string()));
    }

    if config.fastcgi.index.is_empty() || config.fastcgi.index.contains('/') {
        errors.push(ValidationError::new("fastcgi.index", "must be a plain file name"));
    }
    if let Some(script) = &config.fastcgi.script_name {
        if !script.starts_with('/') {
            errors.push(ValidationError::new("fastcgi.script_name", "must start with '/'"));
        }
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::new("timeouts.connect_secs", "must be greater than 0"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }

    if config.startup.wait_for_backend {
        if config.startup.ready_timeout_secs == 0 {
            errors.push(ValidationError::new("startup.ready_timeout_secs", "must be greater than 0"));
        }
        if config.startup.base_delay_ms == 0 || config.startup.base_delay_ms > config.startup.max_delay_ms {
            errors.push(ValidationError::new(
                "startup.base_delay_ms",
                "must be greater than 0 and at most startup.max_delay_ms",
            ));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if config.security.max_body_size == 0 {
        errors.push(ValidationError::new("security.max_body_size", "must be greater than 0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&GatewayConfig::default()), Ok(()));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = GatewayConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.backend.address = "php-fpm".into();
        config.timeouts.request_secs = 0;
        config.fastcgi.script_name = Some("index.php".into());

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "listener.bind_address",
                "backend.address",
                "fastcgi.script_name",
                "timeouts.request_secs",
            ]
        );
    }

    #[test]
    fn test_startup_delays_checked_only_when_waiting() {
        let mut config = GatewayConfig::default();
        config.startup.base_delay_ms = 5_000;
        assert!(validate_config(&config).is_ok());

        config.startup.wait_for_backend = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "startup.base_delay_ms");
    }
}
