//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use fcgi_gateway::config::GatewayConfig;
use fcgi_gateway::fastcgi::{Params, Record, RecordBody, RecordDecoder};
use fcgi_gateway::http::GatewayServer;
use fcgi_gateway::lifecycle::Shutdown;

/// What the mock application received for one request.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub request_id: u16,
    pub params: Params,
    pub stdin: Bytes,
}

/// How the mock application answers.
#[derive(Debug, Clone)]
pub struct Reply {
    pub records: Vec<RecordBody>,
    /// Close the socket right after writing, without waiting for the
    /// gateway to hang up.
    pub close: bool,
}

impl Reply {
    pub fn complete(records: Vec<RecordBody>) -> Self {
        Self { records, close: false }
    }

    pub fn abrupt(records: Vec<RecordBody>) -> Self {
        Self { records, close: true }
    }
}

/// Start a FastCGI application on an ephemeral port. `f` maps each
/// request to its reply.
pub async fn start_fastcgi_backend<F>(f: F) -> SocketAddr
where
    F: Fn(&ReceivedRequest) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        serve_one(socket, move |req| f(req)).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Read one request from `stream`, answer it and hang up.
pub async fn serve_one<T, F>(mut stream: T, f: F)
where
    T: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&ReceivedRequest) -> Reply,
{
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    let reply = f(&request);

    let mut out = BytesMut::new();
    for body in reply.records {
        Record::new(request.request_id, body).encode(&mut out).unwrap();
    }
    let _ = stream.write_all(&out).await;
    if reply.close {
        let _ = stream.shutdown().await;
        return;
    }

    // Wait for the gateway to release the connection.
    let mut rest = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
}

async fn read_request<T: AsyncRead + Unpin>(stream: &mut T) -> Option<ReceivedRequest> {
    let mut buf = BytesMut::new();
    let mut decoder: Option<RecordDecoder> = None;
    let mut request_id = 0;
    let mut params = BytesMut::new();
    let mut stdin = BytesMut::new();

    loop {
        // The request id is learned from the first header.
        if decoder.is_none() && buf.len() >= 4 {
            request_id = u16::from_be_bytes([buf[2], buf[3]]);
            decoder = Some(RecordDecoder::new(request_id));
        }
        if let Some(decoder) = decoder.as_mut() {
            while let Some(record) = decoder.decode(&mut buf).ok()? {
                match record.body {
                    RecordBody::Params(data) => params.extend_from_slice(&data),
                    RecordBody::Stdin(data) if data.is_empty() => {
                        return Some(ReceivedRequest {
                            request_id,
                            params: Params::decode(&params).ok()?,
                            stdin: stdin.freeze(),
                        });
                    }
                    RecordBody::Stdin(data) => stdin.extend_from_slice(&data),
                    _ => {}
                }
            }
        }

        let mut chunk = [0u8; 8192];
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// A port nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Gateway config pointing at `backend`, listening on an ephemeral port.
pub fn gateway_config(backend: &str) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.backend.address = backend.to_string();
    config.timeouts.connect_secs = 2;
    config.timeouts.request_secs = 5;
    config
}

/// Start the gateway; trigger the returned `Shutdown` to stop it.
pub async fn start_gateway(config: GatewayConfig) -> (SocketAddr, Shutdown) {
    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = GatewayServer::from_config(config).unwrap();
    let shutdown = Shutdown::new();
    let signal = shutdown.wait();

    tokio::spawn(async move {
        server.run(listener, signal).await.unwrap();
    });

    (addr, shutdown)
}

pub fn stdout(data: &str) -> RecordBody {
    RecordBody::Stdout(Bytes::copy_from_slice(data.as_bytes()))
}

pub fn stderr(data: &str) -> RecordBody {
    RecordBody::Stderr(Bytes::copy_from_slice(data.as_bytes()))
}

pub fn end_request(app_status: u32) -> RecordBody {
    RecordBody::EndRequest {
        app_status,
        protocol_status: fcgi_gateway::fastcgi::ProtocolStatus::RequestComplete,
    }
}
