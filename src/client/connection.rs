//! Backend connection lifecycle and the record exchange.
//!
//! # Responsibilities
//! - Own exactly one backend transport
//! - Write an outbound record sequence while reading replies, so a backend
//!   that answers before draining its input cannot deadlock the exchange
//! - Release the transport exactly once, explicitly or on drop
//!
//! # Design Decisions
//! - Write and read progress are driven from one `poll_next`, which
//!   serializes all access to the transport
//! - After release every operation fails with a defined error

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures_util::Stream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::fastcgi::record::NULL_REQUEST_ID;
use crate::fastcgi::{CodecError, EncodingError, Record, RecordDecoder};

/// Global counter for connection IDs.
/// Relaxed ordering is enough, only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

const READ_CHUNK: usize = 8 * 1024;

/// Byte-stream transports a connection can own.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Unique identifier for a backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "backend-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is held and usable.
    Open,
    /// Transport has been released.
    Released,
}

/// Errors from releasing a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection already released")]
    Released,

    #[error("failed to shut down backend transport: {0}")]
    Shutdown(#[source] io::Error),
}

/// Errors surfaced while an exchange is in flight.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("connection already released")]
    Released,

    #[error("cannot encode outbound records: {0}")]
    Encoding(#[from] EncodingError),

    #[error("protocol violation: {0}")]
    Codec(#[from] CodecError),

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// One exclusively owned backend connection.
pub struct BackendConnection {
    id: ConnectionId,
    peer: String,
    transport: Option<Box<dyn Transport>>,
    next_request_id: u16,
}

impl BackendConnection {
    /// Wrap an established transport. `peer` names the backend in logs.
    pub fn new<T>(transport: T, peer: impl Into<String>) -> Self
    where
        T: Transport + 'static,
    {
        let connection = Self {
            id: ConnectionId::new(),
            peer: peer.into(),
            transport: Some(Box::new(transport)),
            next_request_id: 1,
        };
        tracing::trace!(connection_id = %connection.id, peer = %connection.peer, "Backend connection opened");
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        if self.transport.is_some() {
            ConnectionState::Open
        } else {
            ConnectionState::Released
        }
    }

    pub fn is_released(&self) -> bool {
        self.state() == ConnectionState::Released
    }

    /// Allocate the request id for the next exchange. Never returns the
    /// null id, wraps back to 1.
    pub fn next_request_id(&mut self) -> u16 {
        let id = self.next_request_id;
        self.next_request_id = match id.checked_add(1) {
            Some(next) => next,
            None => 1,
        };
        id
    }

    /// Start an exchange: send `records` and yield the replies for the
    /// request id they carry, up to and including `FCGI_END_REQUEST`.
    pub fn exchange(&mut self, records: Vec<Record>) -> Exchange<'_> {
        let request_id = records.first().map_or(NULL_REQUEST_ID, |r| r.request_id);

        let mut outbound = BytesMut::new();
        let mut pending_error = None;
        for record in &records {
            if let Err(e) = record.encode(&mut outbound) {
                pending_error = Some(ExchangeError::Encoding(e));
                break;
            }
        }
        if self.transport.is_none() {
            pending_error = Some(ExchangeError::Released);
        }

        tracing::trace!(
            connection_id = %self.id,
            request_id,
            records = records.len(),
            bytes = outbound.len(),
            "Starting exchange"
        );

        Exchange {
            id: self.id,
            transport: self.transport.as_deref_mut(),
            outbound,
            flushed: false,
            write_error: None,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            decoder: RecordDecoder::new(request_id),
            pending_error,
            finished: false,
        }
    }

    /// Shut the transport down and release it. A second call fails with
    /// `ConnectionError::Released`.
    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        let mut transport = self.transport.take().ok_or(ConnectionError::Released)?;
        tracing::trace!(connection_id = %self.id, "Releasing backend connection");
        transport.shutdown().await.map_err(ConnectionError::Shutdown)
    }
}

impl std::fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for BackendConnection {
    fn drop(&mut self) {
        // Dropping the box closes the socket; the protocol state is unknown
        // so the transport is never handed back for reuse.
        if self.transport.take().is_some() {
            tracing::debug!(connection_id = %self.id, peer = %self.peer, "Backend connection dropped before release");
        }
    }
}

/// In-flight exchange over a borrowed connection.
///
/// Yields received records. Ends after `FCGI_END_REQUEST`, at end of stream,
/// or after the first error.
pub struct Exchange<'a> {
    id: ConnectionId,
    transport: Option<&'a mut (dyn Transport + 'static)>,
    outbound: BytesMut,
    flushed: bool,
    write_error: Option<io::Error>,
    inbound: BytesMut,
    decoder: RecordDecoder,
    pending_error: Option<ExchangeError>,
    finished: bool,
}

impl Exchange<'_> {
    /// Push as much outbound data as the transport accepts without waiting.
    fn poll_send(
        transport: &mut (dyn Transport + 'static),
        outbound: &mut BytesMut,
        flushed: &mut bool,
        cx: &mut Context<'_>,
    ) -> io::Result<()> {
        while !outbound.is_empty() {
            match Pin::new(&mut *transport).poll_write(cx, outbound) {
                Poll::Ready(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Poll::Ready(Ok(n)) => outbound.advance(n),
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => return Ok(()),
            }
        }
        if !*flushed {
            if let Poll::Ready(result) = Pin::new(&mut *transport).poll_flush(cx) {
                result?;
                *flushed = true;
            }
        }
        Ok(())
    }
}

impl Stream for Exchange<'_> {
    type Item = Result<Record, ExchangeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if let Some(err) = this.pending_error.take() {
            this.finished = true;
            return Poll::Ready(Some(Err(err)));
        }
        let Some(transport) = this.transport.as_deref_mut() else {
            this.finished = true;
            return Poll::Ready(Some(Err(ExchangeError::Released)));
        };

        if this.write_error.is_none() && !this.flushed {
            if let Err(e) = Self::poll_send(transport, &mut this.outbound, &mut this.flushed, cx) {
                // The backend may have answered and stopped reading; keep
                // reading so its reply is not lost.
                tracing::warn!(connection_id = %this.id, error = %e, "Backend stopped accepting request data");
                this.write_error = Some(e);
            }
        }

        loop {
            match this.decoder.decode(&mut this.inbound) {
                Ok(Some(record)) => {
                    if record.is_end_request() {
                        this.finished = true;
                        // Only what arrived in the same read is seen here; the
                        // transport is not read past the end record.
                        if !this.inbound.is_empty() {
                            tracing::warn!(
                                connection_id = %this.id,
                                trailing_bytes = this.inbound.len(),
                                "Discarding bytes buffered after FCGI_END_REQUEST"
                            );
                        }
                    }
                    return Poll::Ready(Some(Ok(record)));
                }
                Ok(None) => {}
                Err(e) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(ExchangeError::Codec(e))));
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut read_buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut *transport).poll_read(cx, &mut read_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(ExchangeError::Io(e))));
                }
                Poll::Ready(Ok(())) if read_buf.filled().is_empty() => {
                    this.finished = true;
                    if let Some(e) = this.write_error.take() {
                        tracing::debug!(connection_id = %this.id, error = %e, "Write failure preceded end of stream");
                    }
                    return match this.decoder.finish(&this.inbound) {
                        Ok(()) => Poll::Ready(None),
                        Err(e) => Poll::Ready(Some(Err(ExchangeError::Codec(e)))),
                    };
                }
                Poll::Ready(Ok(())) => this.inbound.extend_from_slice(read_buf.filled()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fastcgi::record::{ProtocolStatus, RecordBody};
    use bytes::Bytes;
    use futures_util::StreamExt;
    use tokio::io::{duplex, AsyncReadExt};
    use tracing_test::traced_test;

    fn stdout(id: u16, data: &'static [u8]) -> Record {
        Record::new(id, RecordBody::Stdout(Bytes::from_static(data)))
    }

    fn end_request(id: u16) -> Record {
        Record::new(
            id,
            RecordBody::EndRequest {
                app_status: 0,
                protocol_status: ProtocolStatus::RequestComplete,
            },
        )
    }

    fn wire(records: &[Record]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for record in records {
            record.encode(&mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn request_ids_skip_null() {
        let (client, _server) = duplex(64);
        let mut conn = BackendConnection::new(client, "test");
        assert_eq!(conn.next_request_id(), 1);
        conn.next_request_id = u16::MAX;
        assert_eq!(conn.next_request_id(), u16::MAX);
        assert_eq!(conn.next_request_id(), 1);
    }

    #[tokio::test]
    async fn exchange_stops_at_end_request() {
        let (client, mut server) = duplex(4096);
        let mut conn = BackendConnection::new(client, "test");

        server
            .write_all(&wire(&[stdout(1, b"hello"), end_request(1), stdout(1, b"late")]))
            .await
            .unwrap();

        let records: Vec<_> = conn
            .exchange(vec![stdout(1, b"request")])
            .collect()
            .await;
        assert_eq!(records.len(), 2);
        assert!(records[1].as_ref().unwrap().is_end_request());

        let mut sent = vec![0u8; 16];
        server.read_exact(&mut sent).await.unwrap();
        assert_eq!(&sent[8..15], b"request");
    }

    #[tokio::test]
    #[traced_test]
    async fn buffered_bytes_after_end_request_are_discarded() {
        let (client, mut server) = duplex(4096);
        let mut conn = BackendConnection::new(client, "test");

        server
            .write_all(&wire(&[end_request(1), stdout(1, b"late")]))
            .await
            .unwrap();

        let records: Vec<_> = conn.exchange(vec![stdout(1, b"x")]).collect().await;
        assert_eq!(records.len(), 1);
        assert!(logs_contain("Discarding bytes buffered after FCGI_END_REQUEST"));
        assert!(logs_contain("trailing_bytes=16"));
    }

    #[tokio::test]
    async fn backend_answering_early_does_not_deadlock() {
        // The pipe holds far less than the request; the backend replies
        // before reading anything.
        let (client, mut server) = duplex(1024);
        let mut conn = BackendConnection::new(client, "test");

        let backend = tokio::spawn(async move {
            server
                .write_all(&wire(&[stdout(1, b"early"), end_request(1)]))
                .await
                .unwrap();
            let mut sink = Vec::new();
            let _ = server.read_to_end(&mut sink).await;
        });

        let big = Bytes::from(vec![b'x'; 60_000]);
        let request: Vec<Record> = (0..8)
            .map(|_| Record::new(1, RecordBody::Stdin(big.clone())))
            .collect();

        let records: Vec<_> = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            conn.exchange(request).collect::<Vec<_>>(),
        )
        .await
        .expect("exchange deadlocked");
        assert_eq!(records.len(), 2);

        conn.close().await.unwrap();
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn close_twice_is_an_error() {
        let (client, _server) = duplex(64);
        let mut conn = BackendConnection::new(client, "test");
        conn.close().await.unwrap();
        assert!(conn.is_released());
        assert!(matches!(conn.close().await, Err(ConnectionError::Released)));
    }

    #[tokio::test]
    async fn exchange_after_release_fails() {
        let (client, _server) = duplex(64);
        let mut conn = BackendConnection::new(client, "test");
        conn.close().await.unwrap();

        let items: Vec<_> = conn.exchange(vec![stdout(1, b"x")]).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ExchangeError::Released)));
    }

    #[tokio::test]
    async fn eof_mid_record_is_truncated() {
        let (client, mut server) = duplex(4096);
        let mut conn = BackendConnection::new(client, "test");

        let mut raw = wire(&[stdout(1, b"0123456789")]);
        raw.truncate(12);
        server.write_all(&raw).await.unwrap();
        drop(server);

        let items: Vec<_> = conn.exchange(vec![stdout(1, b"x")]).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Err(ExchangeError::Codec(CodecError::TruncatedFrame { .. }))
        ));
    }

    #[tokio::test]
    async fn drop_closes_transport() {
        let (client, mut server) = duplex(64);
        let conn = BackendConnection::new(client, "test");
        drop(conn);

        let mut buf = Vec::new();
        assert_eq!(server.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
