//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the bridge as its only handler
//! - Wire up middleware (request ID, tracing, concurrency limit)
//! - Bind server to listener and drain on shutdown

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, Response},
    Extension, Router,
};
use tokio::net::TcpListener;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::client::{AddressError, BackendAddress, ClientFactory, DialFactory};
use crate::config::GatewayConfig;
use crate::http::bridge::{Bridge, BridgeSettings};
use crate::http::request::{LocalAddr, UuidRequestId};
use crate::session::{DefaultSessionHandler, SessionHandler};

/// HTTP front end of the gateway.
pub struct GatewayServer {
    router: Router,
    config: GatewayConfig,
}

impl GatewayServer {
    /// Create a server around an existing bridge.
    pub fn new<F: ClientFactory, S: SessionHandler>(config: GatewayConfig, bridge: Bridge<F, S>) -> Self {
        let router = Self::build_router(&config, bridge);
        Self { router, config }
    }

    /// Create a server that dials the configured backend for every request.
    pub fn from_config(config: GatewayConfig) -> Result<Self, AddressError> {
        let bridge = Self::default_bridge(&config)?;
        Ok(Self::new(config, bridge))
    }

    /// The bridge `from_config` uses.
    pub fn default_bridge(
        config: &GatewayConfig,
    ) -> Result<Bridge<DialFactory, DefaultSessionHandler>, AddressError> {
        let address: BackendAddress = config.backend.address.parse()?;
        let factory = DialFactory::new(address, Duration::from_secs(config.timeouts.connect_secs));
        let session = DefaultSessionHandler::new(config.backend.keep_conn);
        Ok(Bridge::new(factory, session, BridgeSettings::from_config(config)))
    }

    /// Build the Axum router with all middleware layers.
    fn build_router<F: ClientFactory, S: SessionHandler>(config: &GatewayConfig, bridge: Bridge<F, S>) -> Router {
        Router::new()
            .fallback(gateway_handler::<F, S>)
            .with_state(bridge)
            .layer(GlobalConcurrencyLimitLayer::new(config.listener.max_connections))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
    }

    /// The configured router, for driving requests without a listener.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server until `shutdown` resolves, then drain in-flight
    /// requests.
    pub async fn run<G>(self, listener: TcpListener, shutdown: G) -> Result<(), std::io::Error>
    where
        G: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            backend = %self.config.backend.address,
            max_connections = self.config.listener.max_connections,
            "HTTP server starting"
        );

        let app = self
            .router
            .layer(Extension(LocalAddr(addr)))
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

async fn gateway_handler<F: ClientFactory, S: SessionHandler>(
    State(bridge): State<Bridge<F, S>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response<Body> {
    bridge.serve(request, remote_addr).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BackendConnection, DialError};
    use axum::http::StatusCode;
    use std::io;
    use tower::ServiceExt;

    struct RefusingFactory;

    impl ClientFactory for RefusingFactory {
        async fn new_connection(&self) -> Result<BackendConnection, DialError> {
            Err(DialError::Connect {
                address: "test".into(),
                source: io::ErrorKind::ConnectionRefused.into(),
            })
        }
    }

    #[test]
    fn test_from_config_rejects_bad_backend() {
        let mut config = GatewayConfig::default();
        config.backend.address = "not-an-address".into();
        assert!(GatewayServer::from_config(config).is_err());
    }

    #[tokio::test]
    async fn test_request_id_set_and_propagated() {
        let config = GatewayConfig::default();
        let bridge = Bridge::new(
            RefusingFactory,
            DefaultSessionHandler::default(),
            BridgeSettings::from_config(&config),
        );
        let server = GatewayServer::new(config, bridge);

        let mut request = Request::get("/").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
        let response = server.router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let id = response.headers()["x-request-id"].to_str().unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }
}
