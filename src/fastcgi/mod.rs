//! FastCGI wire codec.
//!
//! # Data Flow
//! ```text
//! BackendRequest
//!     → codec.rs (encode_request: BEGIN_REQUEST, PARAMS…, STDIN…)
//!     → record.rs (framing: header + content + padding)
//!     → bytes on the backend transport
//!
//! bytes from the backend transport
//!     → codec.rs (RecordDecoder: header → content → padding)
//!     → record.rs (typed RecordBody)
//!     → Session Handler
//! ```
//!
//! # Design Decisions
//! - No I/O here beyond `decode_stream`, which only drives the decoder over
//!   an `AsyncRead`
//! - Unknown record types are skipped, not rejected
//! - Every record is checked against the exchange's request id

pub mod codec;
pub mod error;
pub mod params;
pub mod record;

pub use codec::{decode_record, decode_stream, encode_request, RecordDecoder};
pub use error::{CodecError, DecodeState, EncodingError};
pub use params::Params;
pub use record::{ProtocolStatus, Record, RecordBody, RecordType, Role};
