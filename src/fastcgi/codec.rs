//! Request encoding and streaming record decoding.

use bytes::{Buf, Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::fastcgi::error::{CodecError, DecodeState, EncodingError};
use crate::fastcgi::record::{
    Record, RecordBody, RecordHeader, RecordType, Role, FCGI_KEEP_CONN, FCGI_VERSION_1,
    HEADER_LEN, MAX_CHUNK_LEN, MAX_CONTENT_LEN, NULL_REQUEST_ID,
};
use crate::session::request::BackendRequest;

/// Parameters the responder role cannot do without.
pub const REQUIRED_PARAMS: [&str; 2] = ["REQUEST_METHOD", "SERVER_PROTOCOL"];

const READ_CHUNK: usize = 8 * 1024;

/// Serialize `request` into the record sequence of one responder exchange:
/// begin-request, params, empty params, stdin, empty stdin.
pub fn encode_request(
    request: &BackendRequest,
    request_id: u16,
    keep_conn: bool,
) -> Result<Vec<Record>, EncodingError> {
    if request_id == NULL_REQUEST_ID {
        return Err(EncodingError::NullRequestId);
    }

    let params = request.params();
    for name in REQUIRED_PARAMS {
        if !params.contains(name) {
            return Err(EncodingError::MissingParam(name));
        }
    }
    if !request.body().is_empty() && !params.contains("CONTENT_LENGTH") {
        return Err(EncodingError::MissingParam("CONTENT_LENGTH"));
    }

    let mut encoded = BytesMut::new();
    params.encode(&mut encoded)?;
    let encoded = encoded.freeze();
    let body = request.body();

    let mut records = Vec::with_capacity(
        4 + encoded.len() / MAX_CHUNK_LEN + body.len() / MAX_CHUNK_LEN,
    );
    records.push(Record::new(
        request_id,
        RecordBody::BeginRequest {
            role: Role::Responder,
            flags: if keep_conn { FCGI_KEEP_CONN } else { 0 },
        },
    ));
    records.extend(chunks(&encoded).map(|c| Record::new(request_id, RecordBody::Params(c))));
    records.push(Record::new(request_id, RecordBody::Params(Bytes::new())));
    records.extend(chunks(body).map(|c| Record::new(request_id, RecordBody::Stdin(c))));
    records.push(Record::new(request_id, RecordBody::Stdin(Bytes::new())));
    Ok(records)
}

fn chunks(data: &Bytes) -> impl Iterator<Item = Bytes> + '_ {
    (0..data.len())
        .step_by(MAX_CHUNK_LEN)
        .map(move |start| data.slice(start..data.len().min(start + MAX_CHUNK_LEN)))
}

enum State {
    Header,
    Content(RecordHeader),
    Padding { record: Record, remaining: usize },
}

/// Resumable record decoder.
///
/// Feed it whatever bytes the transport produced; it consumes exactly the
/// bytes of each complete record and leaves the rest in the buffer.
pub struct RecordDecoder {
    expected_id: u16,
    state: State,
    /// Bytes consumed since the decoder was created.
    position: u64,
    record_start: u64,
}

impl RecordDecoder {
    /// Decoder for the exchange identified by `expected_id`.
    pub fn new(expected_id: u16) -> Self {
        Self {
            expected_id,
            state: State::Header,
            position: 0,
            record_start: 0,
        }
    }

    pub fn state(&self) -> DecodeState {
        match self.state {
            State::Header => DecodeState::Header,
            State::Content(_) => DecodeState::Content,
            State::Padding { .. } => DecodeState::Padding,
        }
    }

    /// Total bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Decode the next record out of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold the rest of the
    /// current record. A record is only returned once its padding has been
    /// consumed too.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Record>, CodecError> {
        loop {
            match std::mem::replace(&mut self.state, State::Header) {
                State::Header => {
                    if buf.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let header = RecordHeader::parse(&buf[..HEADER_LEN]);
                    self.record_start = self.position;
                    self.validate(&header)?;
                    buf.advance(HEADER_LEN);
                    self.position += HEADER_LEN as u64;
                    self.state = State::Content(header);
                }
                State::Content(header) => {
                    let len = header.content_length as usize;
                    if buf.len() < len {
                        self.state = State::Content(header);
                        return Ok(None);
                    }
                    let content = buf.split_to(len).freeze();
                    self.position += len as u64;
                    let body = RecordBody::parse(header.record_type, content, self.record_start)?;
                    if let RecordBody::Ignored { record_type } = body {
                        tracing::debug!(record_type, offset = self.record_start, "Skipping unknown record type");
                    }
                    self.state = State::Padding {
                        record: Record::new(header.request_id, body),
                        remaining: header.padding_length as usize,
                    };
                }
                State::Padding { record, remaining } => {
                    let skip = remaining.min(buf.len());
                    buf.advance(skip);
                    self.position += skip as u64;
                    if skip < remaining {
                        self.state = State::Padding {
                            record,
                            remaining: remaining - skip,
                        };
                        return Ok(None);
                    }
                    return Ok(Some(record));
                }
            }
        }
    }

    /// Check that the byte source ended on a record boundary.
    pub fn finish(&self, buf: &BytesMut) -> Result<(), CodecError> {
        let (offset, missing) = match &self.state {
            State::Header if buf.is_empty() => return Ok(()),
            State::Header => (self.position, HEADER_LEN.saturating_sub(buf.len())),
            State::Content(header) => (
                self.record_start,
                (header.content_length as usize).saturating_sub(buf.len())
                    + header.padding_length as usize,
            ),
            State::Padding { remaining, .. } => {
                (self.record_start, remaining.saturating_sub(buf.len()))
            }
        };
        Err(CodecError::TruncatedFrame {
            stage: self.state(),
            offset,
            missing,
        })
    }

    fn validate(&self, header: &RecordHeader) -> Result<(), CodecError> {
        if header.version != FCGI_VERSION_1 {
            return Err(CodecError::UnsupportedVersion {
                version: header.version,
                offset: self.record_start,
            });
        }
        if header.content_length as usize + header.padding_length as usize > MAX_CONTENT_LEN {
            return Err(CodecError::OversizedFrame {
                record_type: header.record_type,
                content_length: header.content_length,
                padding_length: header.padding_length,
                offset: self.record_start,
            });
        }
        let management = RecordType::from_u8(header.record_type)
            .is_some_and(RecordType::is_management);
        let matches = header.request_id == self.expected_id
            || (management && header.request_id == NULL_REQUEST_ID);
        if !matches {
            return Err(CodecError::IdentifierMismatch {
                expected: self.expected_id,
                actual: header.request_id,
                record_type: header.record_type,
                offset: self.record_start,
            });
        }
        Ok(())
    }
}

/// Decode exactly one record from the front of `raw`.
///
/// Returns the record and the number of bytes it occupied. A record that
/// declares more bytes than `raw` holds is a `TruncatedFrame`.
pub fn decode_record(raw: &[u8], expected_id: u16) -> Result<(Record, usize), CodecError> {
    let mut buf = BytesMut::from(raw);
    let mut decoder = RecordDecoder::new(expected_id);
    match decoder.decode(&mut buf)? {
        Some(record) => Ok((record, raw.len() - buf.len())),
        None => match decoder.finish(&buf) {
            Err(e) => Err(e),
            Ok(()) => Err(CodecError::TruncatedFrame {
                stage: DecodeState::Header,
                offset: 0,
                missing: HEADER_LEN,
            }),
        },
    }
}

/// Lazily decode records from `reader` until end of stream or the first
/// error. The error, if any, is the last item.
pub fn decode_stream<R>(reader: R, expected_id: u16) -> impl Stream<Item = Result<Record, CodecError>>
where
    R: AsyncRead + Unpin,
{
    struct Source<R> {
        reader: R,
        decoder: RecordDecoder,
        buf: BytesMut,
        done: bool,
    }

    let source = Source {
        reader,
        decoder: RecordDecoder::new(expected_id),
        buf: BytesMut::with_capacity(READ_CHUNK),
        done: false,
    };

    stream::unfold(source, |mut src| async move {
        if src.done {
            return None;
        }
        loop {
            match src.decoder.decode(&mut src.buf) {
                Ok(Some(record)) => return Some((Ok(record), src)),
                Ok(None) => {}
                Err(e) => {
                    src.done = true;
                    return Some((Err(e), src));
                }
            }

            src.buf.reserve(READ_CHUNK);
            match src.reader.read_buf(&mut src.buf).await {
                Ok(0) => {
                    src.done = true;
                    return match src.decoder.finish(&src.buf) {
                        Ok(()) => None,
                        Err(e) => Some((Err(e), src)),
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    src.done = true;
                    return Some((Err(CodecError::Io(e)), src));
                }
            }
        }
    })
}
