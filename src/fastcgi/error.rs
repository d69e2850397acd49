//! Codec error types.

use thiserror::Error;

use crate::fastcgi::record::RecordType;

/// Decoder stage a failure was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Waiting for the fixed 8-byte record header.
    Header,
    /// Waiting for `content_length` bytes of content.
    Content,
    /// Skipping `padding_length` bytes of padding.
    Padding,
}

impl std::fmt::Display for DecodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeState::Header => write!(f, "header"),
            DecodeState::Content => write!(f, "content"),
            DecodeState::Padding => write!(f, "padding"),
        }
    }
}

/// Errors raised while decoding records received from a backend.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The stream ended in the middle of a record.
    #[error("truncated frame: stream ended in record {stage} at offset {offset}, {missing} bytes missing")]
    TruncatedFrame {
        stage: DecodeState,
        offset: u64,
        missing: usize,
    },

    /// A record carried a request id other than the one of the exchange.
    #[error("record {record_type} at offset {offset} belongs to request {actual}, expected {expected}")]
    IdentifierMismatch {
        expected: u16,
        actual: u16,
        record_type: u8,
        offset: u64,
    },

    /// Content plus padding exceed what a single frame may carry.
    #[error("record {record_type} at offset {offset} declares {content_length} content and {padding_length} padding bytes, exceeding the frame limit")]
    OversizedFrame {
        record_type: u8,
        content_length: u16,
        padding_length: u8,
        offset: u64,
    },

    /// The header declared a protocol version this codec does not speak.
    #[error("unsupported protocol version {version} at offset {offset}")]
    UnsupportedVersion { version: u8, offset: u64 },

    /// A record body did not match the layout of its type.
    #[error("malformed {record_type} record at offset {offset}: {reason}")]
    MalformedBody {
        record_type: RecordType,
        reason: &'static str,
        offset: u64,
    },

    /// Reading from the underlying byte source failed.
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while turning a request into records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    /// A parameter the responder role depends on is absent.
    #[error("missing required parameter {0}")]
    MissingParam(&'static str),

    /// Request id 0 is reserved for management records.
    #[error("request id 0 is reserved for management records")]
    NullRequestId,

    /// A single record was built with more content than a frame can carry.
    #[error("{record_type} record content of {len} bytes exceeds the frame limit")]
    ContentTooLong { record_type: RecordType, len: usize },

    /// A name or value does not fit the 31-bit length prefix.
    #[error("parameter {name} is {len} bytes long, exceeding the length prefix")]
    NameValueTooLong { name: String, len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CodecError::TruncatedFrame {
            stage: DecodeState::Content,
            offset: 16,
            missing: 4,
        };
        assert_eq!(
            err.to_string(),
            "truncated frame: stream ended in record content at offset 16, 4 bytes missing"
        );

        let err = EncodingError::MissingParam("REQUEST_METHOD");
        assert!(err.to_string().contains("REQUEST_METHOD"));
    }
}
