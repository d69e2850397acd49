//! HTTP to FastCGI bridge.
//!
//! # Responsibilities
//! - Buffer the request body within the configured limit
//! - Dial the backend, run one session, release the connection
//! - Map every failure to a gateway status code
//! - Log backend stderr; never return it to the client
//!
//! # Design Decisions
//! - The connection is closed explicitly after the session and dropped on
//!   cancellation, so it is released exactly once either way
//! - Dial and session share one deadline

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;

use crate::client::ClientFactory;
use crate::config::schema::{FastCgiConfig, GatewayConfig};
use crate::http::request::{request_id, LocalAddr};
use crate::http::response::{cgi_response, error_response};
use crate::observability::metrics;
use crate::session::{BackendRequest, BackendResponse, ExchangeStatus, RequestEnv, SessionHandler};

/// Per-request settings taken from configuration.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub fastcgi: FastCgiConfig,
    /// Address reported to the application as SERVER_NAME/SERVER_PORT
    /// when the request has no Host header and the listener did not tag it
    /// with its bound address.
    pub server_addr: SocketAddr,
    pub request_timeout: Duration,
    pub max_body_size: usize,
}

impl BridgeSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let server_addr = config
            .listener
            .bind_address
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        Self {
            fastcgi: config.fastcgi.clone(),
            server_addr,
            request_timeout: Duration::from_secs(config.timeouts.request_secs),
            max_body_size: config.security.max_body_size,
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

enum BodyError {
    TooLarge,
    Read(axum::Error),
}

/// Forwards HTTP requests to the backend.
pub struct Bridge<F, S> {
    factory: Arc<F>,
    session: Arc<S>,
    settings: Arc<BridgeSettings>,
}

impl<F, S> Clone for Bridge<F, S> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            session: self.session.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<F: ClientFactory, S: SessionHandler> Bridge<F, S> {
    pub fn new(factory: F, session: S, settings: BridgeSettings) -> Self {
        Self {
            factory: Arc::new(factory),
            session: Arc::new(session),
            settings: Arc::new(settings),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Handle one inbound request end to end. Never fails: every error is
    /// already mapped to a response.
    pub async fn serve(&self, request: Request<Body>, remote_addr: SocketAddr) -> Response<Body> {
        let start = Instant::now();
        let method = request.method().to_string();
        let request_id = request_id(request.headers()).unwrap_or("unknown").to_string();

        tracing::debug!(
            request_id = %request_id,
            method = %method,
            path = %request.uri().path(),
            remote_addr = %remote_addr,
            "Forwarding request"
        );

        let forward = self.forward(request, remote_addr, &request_id);
        let response = match tokio::time::timeout(self.settings.request_timeout, forward).await {
            Ok(response) => response,
            Err(_) => {
                // Dropping the forward future dropped the connection with it.
                tracing::error!(
                    request_id = %request_id,
                    timeout_secs = self.settings.request_timeout.as_secs_f64(),
                    "Backend did not complete in time"
                );
                error_response(StatusCode::GATEWAY_TIMEOUT, "Backend timed out")
            }
        };

        metrics::record_request(&method, response.status().as_u16(), start);
        response
    }

    async fn forward(
        &self,
        request: Request<Body>,
        remote_addr: SocketAddr,
        request_id: &str,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let limit = self.settings.max_body_size;

        let declared = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > limit as u64) {
            tracing::warn!(request_id = %request_id, declared, limit, "Request body too large");
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }

        let body = match read_body(body, limit).await {
            Ok(body) => body,
            Err(BodyError::TooLarge) => {
                tracing::warn!(request_id = %request_id, limit, "Request body too large");
                return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
            }
            Err(BodyError::Read(e)) => {
                tracing::warn!(request_id = %request_id, error = %e, "Failed to read request body");
                return error_response(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };

        let server_addr = parts
            .extensions
            .get::<LocalAddr>()
            .map_or(self.settings.server_addr, |local| local.0);
        let env = RequestEnv {
            remote_addr,
            server_addr,
            fastcgi: &self.settings.fastcgi,
            request_id: Some(request_id),
        };
        let backend_request = BackendRequest::from_parts(&parts, body, &env);

        let mut connection = match self.factory.new_connection().await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "Failed to connect to FastCGI backend");
                metrics::record_dial_failure(e.address());
                return error_response(StatusCode::BAD_GATEWAY, "Failed to connect to FastCGI application");
            }
        };
        let connection_id = connection.id();

        let result = self.session.handle(&mut connection, backend_request).await;

        if let Err(e) = connection.close().await {
            tracing::warn!(
                request_id = %request_id,
                connection_id = %connection_id,
                error = %e,
                "Failed to release backend connection"
            );
        }

        match result {
            Ok(response) => {
                log_stderr(request_id, &response);
                if !response.succeeded() {
                    if let ExchangeStatus::BackendFailure(status) = response.status() {
                        tracing::warn!(
                            request_id = %request_id,
                            protocol_status = ?status,
                            "Backend rejected the request"
                        );
                    } else {
                        tracing::info!(
                            request_id = %request_id,
                            app_status = response.app_status(),
                            "Backend exited with non-zero status"
                        );
                    }
                }
                cgi_response(response.into_stdout())
            }
            Err(e) => {
                if let Some(partial) = e.partial() {
                    log_stderr(request_id, partial);
                }
                tracing::error!(
                    request_id = %request_id,
                    connection_id = %connection_id,
                    error = %e,
                    "Failed to process request"
                );
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to process request")
            }
        }
    }
}

fn log_stderr(request_id: &str, response: &BackendResponse) {
    let stderr = response.stderr();
    if stderr.is_empty() {
        return;
    }
    metrics::record_backend_stderr();
    tracing::warn!(
        request_id = %request_id,
        stderr = %String::from_utf8_lossy(stderr),
        "Backend wrote to stderr"
    );
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes, BodyError> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        if buf.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}
