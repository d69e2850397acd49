//! Record framing.
//!
//! Every record on the wire is an 8-byte header followed by content and
//! padding:
//!
//! ```text
//! version | type | request id (BE u16) | content length (BE u16) | padding length | reserved
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::fastcgi::error::{CodecError, EncodingError};

/// The only protocol version in existence.
pub const FCGI_VERSION_1: u8 = 1;

/// Size of the fixed record header.
pub const HEADER_LEN: usize = 8;

/// Largest content a single record can declare.
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;

/// Largest content the encoder puts into one record. 8-byte aligned, so a
/// full chunk needs no padding and content plus padding stays within
/// `MAX_CONTENT_LEN`.
pub const MAX_CHUNK_LEN: usize = MAX_CONTENT_LEN & !7;

/// Request id reserved for management records.
pub const NULL_REQUEST_ID: u16 = 0;

/// `flags` bit asking the application to keep the connection open after the
/// request completes.
pub const FCGI_KEEP_CONN: u8 = 1;

/// Record types defined by the protocol.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    /// Map a wire value to a known type.
    pub fn from_u8(value: u8) -> Option<Self> {
        let kind = match value {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            _ => return None,
        };
        Some(kind)
    }

    /// Management records are addressed to the connection, not a request,
    /// and always travel with request id 0.
    pub fn is_management(self) -> bool {
        matches!(
            self,
            RecordType::GetValues | RecordType::GetValuesResult | RecordType::UnknownType
        )
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecordType::BeginRequest => "FCGI_BEGIN_REQUEST",
            RecordType::AbortRequest => "FCGI_ABORT_REQUEST",
            RecordType::EndRequest => "FCGI_END_REQUEST",
            RecordType::Params => "FCGI_PARAMS",
            RecordType::Stdin => "FCGI_STDIN",
            RecordType::Stdout => "FCGI_STDOUT",
            RecordType::Stderr => "FCGI_STDERR",
            RecordType::Data => "FCGI_DATA",
            RecordType::GetValues => "FCGI_GET_VALUES",
            RecordType::GetValuesResult => "FCGI_GET_VALUES_RESULT",
            RecordType::UnknownType => "FCGI_UNKNOWN_TYPE",
        };
        f.write_str(name)
    }
}

/// Role requested in `FCGI_BEGIN_REQUEST`.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

impl Role {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Role::Responder),
            2 => Some(Role::Authorizer),
            3 => Some(Role::Filter),
            _ => None,
        }
    }
}

/// Protocol-level outcome reported in `FCGI_END_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    RequestComplete,
    CantMultiplexConnections,
    Overloaded,
    UnknownRole,
    /// A value outside the defined set. Kept rather than rejected so the
    /// application's exit code is not lost.
    Other(u8),
}

impl From<u8> for ProtocolStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => ProtocolStatus::RequestComplete,
            1 => ProtocolStatus::CantMultiplexConnections,
            2 => ProtocolStatus::Overloaded,
            3 => ProtocolStatus::UnknownRole,
            other => ProtocolStatus::Other(other),
        }
    }
}

impl From<ProtocolStatus> for u8 {
    fn from(status: ProtocolStatus) -> Self {
        match status {
            ProtocolStatus::RequestComplete => 0,
            ProtocolStatus::CantMultiplexConnections => 1,
            ProtocolStatus::Overloaded => 2,
            ProtocolStatus::UnknownRole => 3,
            ProtocolStatus::Other(other) => other,
        }
    }
}

/// Fixed-size record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    /// Parse the first `HEADER_LEN` bytes of `raw`.
    ///
    /// The caller guarantees `raw` holds at least a full header.
    pub fn parse(raw: &[u8]) -> Self {
        Self {
            version: raw[0],
            record_type: raw[1],
            request_id: u16::from_be_bytes([raw[2], raw[3]]),
            content_length: u16::from_be_bytes([raw[4], raw[5]]),
            padding_length: raw[6],
        }
    }

    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.put_u8(self.version);
        dst.put_u8(self.record_type);
        dst.put_u16(self.request_id);
        dst.put_u16(self.content_length);
        dst.put_u8(self.padding_length);
        dst.put_u8(0);
    }

    /// Total size of the framed record, header included.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.content_length as usize + self.padding_length as usize
    }
}

/// Padding that aligns `len` to 8 bytes without pushing the frame past
/// `MAX_CONTENT_LEN`.
pub fn padding_for(len: usize) -> u8 {
    let pad = (8 - len % 8) % 8;
    if len + pad > MAX_CONTENT_LEN {
        0
    } else {
        pad as u8
    }
}

/// Typed record content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    BeginRequest { role: Role, flags: u8 },
    AbortRequest,
    EndRequest {
        app_status: u32,
        protocol_status: ProtocolStatus,
    },
    Params(Bytes),
    Stdin(Bytes),
    Stdout(Bytes),
    Stderr(Bytes),
    Data(Bytes),
    GetValues(Bytes),
    GetValuesResult(Bytes),
    /// Reply to a management record the peer did not understand.
    UnknownType(u8),
    /// A record of a type this codec does not know. Its content and padding
    /// were consumed and discarded.
    Ignored { record_type: u8 },
}

impl RecordBody {
    /// Wire value of this body's type.
    pub fn record_type(&self) -> u8 {
        let kind = match self {
            RecordBody::BeginRequest { .. } => RecordType::BeginRequest,
            RecordBody::AbortRequest => RecordType::AbortRequest,
            RecordBody::EndRequest { .. } => RecordType::EndRequest,
            RecordBody::Params(_) => RecordType::Params,
            RecordBody::Stdin(_) => RecordType::Stdin,
            RecordBody::Stdout(_) => RecordType::Stdout,
            RecordBody::Stderr(_) => RecordType::Stderr,
            RecordBody::Data(_) => RecordType::Data,
            RecordBody::GetValues(_) => RecordType::GetValues,
            RecordBody::GetValuesResult(_) => RecordType::GetValuesResult,
            RecordBody::UnknownType(_) => RecordType::UnknownType,
            RecordBody::Ignored { record_type } => return *record_type,
        };
        kind as u8
    }

    /// Build the typed body for a record whose header and content are
    /// complete. `offset` is where the record started, for error context.
    pub fn parse(record_type: u8, content: Bytes, offset: u64) -> Result<Self, CodecError> {
        let Some(kind) = RecordType::from_u8(record_type) else {
            return Ok(RecordBody::Ignored { record_type });
        };

        let malformed = |reason| CodecError::MalformedBody {
            record_type: kind,
            reason,
            offset,
        };

        let body = match kind {
            RecordType::BeginRequest => {
                if content.len() < 8 {
                    return Err(malformed("body shorter than 8 bytes"));
                }
                let role = Role::from_u16(u16::from_be_bytes([content[0], content[1]]))
                    .ok_or_else(|| malformed("unknown role"))?;
                RecordBody::BeginRequest {
                    role,
                    flags: content[2],
                }
            }
            RecordType::AbortRequest => RecordBody::AbortRequest,
            RecordType::EndRequest => {
                if content.len() < 8 {
                    return Err(malformed("body shorter than 8 bytes"));
                }
                RecordBody::EndRequest {
                    app_status: u32::from_be_bytes([content[0], content[1], content[2], content[3]]),
                    protocol_status: ProtocolStatus::from(content[4]),
                }
            }
            RecordType::Params => RecordBody::Params(content),
            RecordType::Stdin => RecordBody::Stdin(content),
            RecordType::Stdout => RecordBody::Stdout(content),
            RecordType::Stderr => RecordBody::Stderr(content),
            RecordType::Data => RecordBody::Data(content),
            RecordType::GetValues => RecordBody::GetValues(content),
            RecordType::GetValuesResult => RecordBody::GetValuesResult(content),
            RecordType::UnknownType => {
                let Some(&unknown) = content.first() else {
                    return Err(malformed("empty body"));
                };
                RecordBody::UnknownType(unknown)
            }
        };
        Ok(body)
    }

    fn content_len(&self) -> usize {
        match self {
            RecordBody::BeginRequest { .. }
            | RecordBody::EndRequest { .. }
            | RecordBody::UnknownType(_) => 8,
            RecordBody::AbortRequest | RecordBody::Ignored { .. } => 0,
            RecordBody::Params(b)
            | RecordBody::Stdin(b)
            | RecordBody::Stdout(b)
            | RecordBody::Stderr(b)
            | RecordBody::Data(b)
            | RecordBody::GetValues(b)
            | RecordBody::GetValuesResult(b) => b.len(),
        }
    }

    fn write_content(&self, dst: &mut BytesMut) {
        match self {
            RecordBody::BeginRequest { role, flags } => {
                dst.put_u16(*role as u16);
                dst.put_u8(*flags);
                dst.put_bytes(0, 5);
            }
            RecordBody::EndRequest {
                app_status,
                protocol_status,
            } => {
                dst.put_u32(*app_status);
                dst.put_u8(u8::from(*protocol_status));
                dst.put_bytes(0, 3);
            }
            RecordBody::UnknownType(kind) => {
                dst.put_u8(*kind);
                dst.put_bytes(0, 7);
            }
            RecordBody::AbortRequest | RecordBody::Ignored { .. } => {}
            RecordBody::Params(b)
            | RecordBody::Stdin(b)
            | RecordBody::Stdout(b)
            | RecordBody::Stderr(b)
            | RecordBody::Data(b)
            | RecordBody::GetValues(b)
            | RecordBody::GetValuesResult(b) => dst.extend_from_slice(b),
        }
    }
}

/// One framed unit of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub request_id: u16,
    pub body: RecordBody,
}

impl Record {
    pub fn new(request_id: u16, body: RecordBody) -> Self {
        Self { request_id, body }
    }

    pub fn record_type(&self) -> u8 {
        self.body.record_type()
    }

    pub fn is_end_request(&self) -> bool {
        matches!(self.body, RecordBody::EndRequest { .. })
    }

    /// Append the framed record (header, content, padding) to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodingError> {
        let len = self.body.content_len();
        if len > MAX_CONTENT_LEN {
            return Err(EncodingError::ContentTooLong {
                record_type: RecordType::from_u8(self.record_type())
                    .unwrap_or(RecordType::UnknownType),
                len,
            });
        }
        let header = RecordHeader {
            version: FCGI_VERSION_1,
            record_type: self.record_type(),
            request_id: self.request_id,
            content_length: len as u16,
            padding_length: padding_for(len),
        };

        dst.reserve(header.frame_len());
        header.write_to(dst);
        self.body.write_content(dst);
        dst.put_bytes(0, header.padding_length as usize);
        Ok(())
    }
}
