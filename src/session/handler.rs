//! Driving one request through a backend connection.

use std::future::Future;

use futures_util::StreamExt;
use thiserror::Error;

use crate::client::{BackendConnection, ExchangeError};
use crate::fastcgi::{encode_request, CodecError, EncodingError, RecordBody};
use crate::session::request::BackendRequest;
use crate::session::response::{BackendResponse, ResponseBuilder};

/// Why a session could not produce a complete response.
///
/// Every variant raised after the exchange started carries whatever output
/// arrived before the failure.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The request could not be serialized. The connection was not used.
    #[error("cannot encode request: {0}")]
    Encoding(#[from] EncodingError),

    #[error("backend protocol violation: {source}")]
    Protocol {
        #[source]
        source: CodecError,
        partial: BackendResponse,
    },

    #[error("backend transport failed: {source}")]
    Transport {
        #[source]
        source: std::io::Error,
        partial: BackendResponse,
    },

    /// The backend closed the stream before `FCGI_END_REQUEST`.
    #[error("backend closed the connection before completing the request")]
    IncompleteExchange { partial: BackendResponse },

    #[error("backend connection already released")]
    Released,
}

impl SessionError {
    /// Output received before the failure, if the exchange started.
    pub fn partial(&self) -> Option<&BackendResponse> {
        match self {
            SessionError::Protocol { partial, .. }
            | SessionError::Transport { partial, .. }
            | SessionError::IncompleteExchange { partial } => Some(partial),
            SessionError::Encoding(_) | SessionError::Released => None,
        }
    }
}

/// Runs one request/response exchange on a connection it does not own.
pub trait SessionHandler: Send + Sync + 'static {
    fn handle(
        &self,
        connection: &mut BackendConnection,
        request: BackendRequest,
    ) -> impl Future<Output = Result<BackendResponse, SessionError>> + Send;
}

/// Responder-role session: encode, exchange, demultiplex.
#[derive(Debug, Clone, Default)]
pub struct DefaultSessionHandler {
    keep_conn: bool,
}

impl DefaultSessionHandler {
    pub fn new(keep_conn: bool) -> Self {
        Self { keep_conn }
    }
}

impl SessionHandler for DefaultSessionHandler {
    async fn handle(
        &self,
        connection: &mut BackendConnection,
        request: BackendRequest,
    ) -> Result<BackendResponse, SessionError> {
        if connection.is_released() {
            return Err(SessionError::Released);
        }

        let request_id = connection.next_request_id();
        let records = encode_request(&request, request_id, self.keep_conn)?;
        let connection_id = connection.id();

        tracing::debug!(
            connection_id = %connection_id,
            request_id,
            method = %request.method(),
            path = %request.path(),
            query = %request.query(),
            headers = request.headers().len(),
            records = records.len(),
            "Sending request to backend"
        );

        let mut builder = ResponseBuilder::default();
        let mut exchange = connection.exchange(records);

        while let Some(item) = exchange.next().await {
            let record = match item {
                Ok(record) => record,
                Err(ExchangeError::Codec(source)) => {
                    return Err(SessionError::Protocol {
                        source,
                        partial: builder.build(),
                    })
                }
                Err(ExchangeError::Io(source)) => {
                    return Err(SessionError::Transport {
                        source,
                        partial: builder.build(),
                    })
                }
                Err(ExchangeError::Encoding(e)) => return Err(SessionError::Encoding(e)),
                Err(ExchangeError::Released) => return Err(SessionError::Released),
            };

            match record.body {
                RecordBody::Stdout(data) => builder.push_stdout(&data),
                RecordBody::Stderr(data) => builder.push_stderr(&data),
                RecordBody::EndRequest {
                    app_status,
                    protocol_status,
                } => {
                    tracing::debug!(
                        connection_id = %connection_id,
                        request_id,
                        app_status,
                        protocol_status = ?protocol_status,
                        "Backend completed request"
                    );
                    builder.end(app_status, protocol_status);
                    break;
                }
                other => {
                    tracing::trace!(
                        connection_id = %connection_id,
                        record_type = other.record_type(),
                        "Ignoring record"
                    );
                }
            }
        }

        if !builder.is_ended() {
            return Err(SessionError::IncompleteExchange {
                partial: builder.build(),
            });
        }
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fastcgi::{Params, ProtocolStatus, Record, RecordDecoder, RecordType};
    use crate::session::response::ExchangeStatus;
    use axum::http::{HeaderMap, Method};
    use bytes::{Bytes, BytesMut};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn request(body: &'static [u8]) -> BackendRequest {
        let mut params = Params::new();
        params.insert("REQUEST_METHOD", "POST");
        params.insert("SERVER_PROTOCOL", "HTTP/1.1");
        params.insert("CONTENT_LENGTH", body.len().to_string());
        BackendRequest::new(
            Method::POST,
            "/index.php",
            "",
            HeaderMap::new(),
            Bytes::from_static(body),
            params,
        )
    }

    fn wire(records: &[Record]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for record in records {
            record.encode(&mut buf).unwrap();
        }
        buf.to_vec()
    }

    /// Read the request up to the empty stdin record, then answer.
    async fn backend(mut stream: DuplexStream, reply: Vec<u8>, close: bool) -> Vec<Record> {
        let mut decoder = RecordDecoder::new(1);
        let mut buf = BytesMut::new();
        let mut received = Vec::new();
        loop {
            while let Some(record) = decoder.decode(&mut buf).unwrap() {
                let done = matches!(&record.body, RecordBody::Stdin(d) if d.is_empty());
                received.push(record);
                if done {
                    stream.write_all(&reply).await.unwrap();
                    if close {
                        stream.shutdown().await.unwrap();
                    }
                    return received;
                }
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "request ended early");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn end(app_status: u32) -> Record {
        Record::new(
            1,
            RecordBody::EndRequest {
                app_status,
                protocol_status: ProtocolStatus::RequestComplete,
            },
        )
    }

    #[tokio::test]
    async fn test_demultiplexes_streams() {
        let (client, server) = duplex(4096);
        let reply = wire(&[
            Record::new(1, RecordBody::Stdout(Bytes::from_static(b"Content-Type: text/plain\r\n\r\n"))),
            Record::new(1, RecordBody::Stderr(Bytes::from_static(b"notice\n"))),
            Record::new(1, RecordBody::Stdout(Bytes::from_static(b"body"))),
            Record::new(1, RecordBody::Stderr(Bytes::from_static(b"warning\n"))),
            end(7),
        ]);
        let server = tokio::spawn(backend(server, reply, false));

        let mut connection = BackendConnection::new(client, "test");
        let response = DefaultSessionHandler::default()
            .handle(&mut connection, request(b"payload"))
            .await
            .unwrap();

        assert_eq!(response.stdout().as_ref(), b"Content-Type: text/plain\r\n\r\nbody");
        assert_eq!(response.stderr().as_ref(), b"notice\nwarning\n");
        assert_eq!(response.status(), ExchangeStatus::Complete);
        assert_eq!(response.app_status(), 7);

        let received = server.await.unwrap();
        assert_eq!(received[0].record_type(), RecordType::BeginRequest as u8);
        let stdin: Vec<u8> = received
            .iter()
            .filter_map(|r| match &r.body {
                RecordBody::Stdin(d) => Some(d.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(stdin, b"payload");
    }

    #[tokio::test]
    async fn test_missing_end_request_is_incomplete() {
        let (client, server) = duplex(4096);
        let reply = wire(&[Record::new(1, RecordBody::Stdout(Bytes::from_static(b"0123456789")))]);
        let server = tokio::spawn(backend(server, reply, true));

        let mut connection = BackendConnection::new(client, "test");
        let err = DefaultSessionHandler::default()
            .handle(&mut connection, request(b""))
            .await
            .unwrap_err();
        server.await.unwrap();

        let partial = err.partial().unwrap();
        assert!(matches!(err, SessionError::IncompleteExchange { .. }));
        assert_eq!(partial.status(), ExchangeStatus::ConnectionFailure);
        assert_eq!(partial.stdout().as_ref(), b"0123456789");
    }

    #[tokio::test]
    async fn test_protocol_error_keeps_partial_output() {
        let (client, server) = duplex(4096);
        let mut reply = wire(&[Record::new(1, RecordBody::Stderr(Bytes::from_static(b"boom")))]);
        // Record for someone else's request.
        reply.extend(wire(&[Record::new(9, RecordBody::Stdout(Bytes::from_static(b"x")))]));
        let server = tokio::spawn(backend(server, reply, false));

        let mut connection = BackendConnection::new(client, "test");
        let err = DefaultSessionHandler::default()
            .handle(&mut connection, request(b""))
            .await
            .unwrap_err();
        server.await.unwrap();

        match err {
            SessionError::Protocol { source, partial } => {
                assert!(matches!(source, CodecError::IdentifierMismatch { actual: 9, .. }));
                assert_eq!(partial.stderr().as_ref(), b"boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_encoding_failure_leaves_connection_untouched() {
        let (client, mut server) = duplex(64);
        let mut connection = BackendConnection::new(client, "test");
        let bad = BackendRequest::new(
            Method::GET,
            "/",
            "",
            HeaderMap::new(),
            Bytes::new(),
            Params::new(),
        );
        let err = DefaultSessionHandler::default()
            .handle(&mut connection, bad)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Encoding(EncodingError::MissingParam("REQUEST_METHOD"))
        ));
        assert!(err.partial().is_none());

        connection.close().await.unwrap();
        let mut sent = Vec::new();
        server.read_to_end(&mut sent).await.unwrap();
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn test_released_connection() {
        let (client, _server) = duplex(64);
        let mut connection = BackendConnection::new(client, "test");
        connection.close().await.unwrap();
        let err = DefaultSessionHandler::default()
            .handle(&mut connection, request(b""))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Released));
    }
}
