//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, backpressure).
    pub listener: ListenerConfig,

    /// FastCGI application endpoint.
    pub backend: BackendConfig,

    /// CGI environment handed to the application.
    pub fastcgi: FastCgiConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Backend readiness polling at startup.
    pub startup: StartupConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub security: SecurityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent in-flight requests (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// FastCGI backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend address: "host:port", "tcp://host:port" or "unix:/path".
    pub address: String,

    /// Ask the application to keep the connection open after a request.
    /// Connections are never reused, so this only affects the flag sent.
    pub keep_conn: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9000".to_string(),
            keep_conn: false,
        }
    }
}

/// CGI meta-variable settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FastCgiConfig {
    /// Prepended to the script name to form SCRIPT_FILENAME.
    pub document_root: String,

    /// Script appended to directory requests (paths ending in "/").
    pub index: String,

    /// Value of SERVER_SOFTWARE.
    pub server_software: String,

    /// Route every request to this script (front controller), keeping the
    /// request path as PATH_INFO.
    pub script_name: Option<String>,
}

impl Default for FastCgiConfig {
    fn default() -> Self {
        Self {
            document_root: "/var/www/html".to_string(),
            index: "index.php".to_string(),
            server_software: concat!("fcgi-gateway/", env!("CARGO_PKG_VERSION")).to_string(),
            script_name: None,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backend connect timeout in seconds.
    pub connect_secs: u64,

    /// Deadline for dial plus the whole exchange, in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
        }
    }
}

/// Startup readiness configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Poll the backend before accepting traffic.
    pub wait_for_backend: bool,

    /// Give up waiting after this many seconds.
    pub ready_timeout_secs: u64,

    /// Base delay between dial attempts (milliseconds).
    pub base_delay_ms: u64,

    /// Maximum delay between dial attempts (milliseconds).
    pub max_delay_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            wait_for_backend: false,
            ready_timeout_secs: 30,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Largest request body forwarded to the backend, in bytes.
    pub max_body_size: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [backend]
            address = "unix:/run/php-fpm.sock"

            [fastcgi]
            script_name = "/index.php"
            "#,
        )
        .unwrap();

        assert_eq!(config.backend.address, "unix:/run/php-fpm.sock");
        assert!(!config.backend.keep_conn);
        assert_eq!(config.fastcgi.script_name.as_deref(), Some("/index.php"));
        assert_eq!(config.fastcgi.index, "index.php");
        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");
        assert_eq!(config.timeouts.request_secs, 30);
    }
}
