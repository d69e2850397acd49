//! What the application produced for one exchange.

use bytes::{Bytes, BytesMut};

use crate::fastcgi::ProtocolStatus;

/// How an exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    /// `FCGI_END_REQUEST` with `FCGI_REQUEST_COMPLETE`, whatever the
    /// application's exit code.
    Complete,
    /// `FCGI_END_REQUEST` carrying another protocol status (overloaded,
    /// unknown role, cannot multiplex).
    BackendFailure(ProtocolStatus),
    /// No `FCGI_END_REQUEST` was seen.
    ConnectionFailure,
}

/// Collected output of one exchange. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResponse {
    stdout: Bytes,
    stderr: Bytes,
    status: ExchangeStatus,
    app_status: u32,
}

impl BackendResponse {
    pub fn stdout(&self) -> &Bytes {
        &self.stdout
    }

    pub fn stderr(&self) -> &Bytes {
        &self.stderr
    }

    pub fn status(&self) -> ExchangeStatus {
        self.status
    }

    /// Exit code reported by the application; 0 unless the exchange
    /// completed.
    pub fn app_status(&self) -> u32 {
        self.app_status
    }

    /// Completed normally with a zero exit code.
    pub fn succeeded(&self) -> bool {
        self.status == ExchangeStatus::Complete && self.app_status == 0
    }

    pub fn into_stdout(self) -> Bytes {
        self.stdout
    }
}

/// Accumulates stream output while records arrive.
#[derive(Debug, Default)]
pub(crate) struct ResponseBuilder {
    stdout: BytesMut,
    stderr: BytesMut,
    end: Option<(u32, ProtocolStatus)>,
}

impl ResponseBuilder {
    pub(crate) fn push_stdout(&mut self, data: &[u8]) {
        self.stdout.extend_from_slice(data);
    }

    pub(crate) fn push_stderr(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
    }

    pub(crate) fn end(&mut self, app_status: u32, protocol_status: ProtocolStatus) {
        self.end = Some((app_status, protocol_status));
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.end.is_some()
    }

    pub(crate) fn build(self) -> BackendResponse {
        let (status, app_status) = match self.end {
            Some((app_status, ProtocolStatus::RequestComplete)) => {
                (ExchangeStatus::Complete, app_status)
            }
            Some((app_status, other)) => (ExchangeStatus::BackendFailure(other), app_status),
            None => (ExchangeStatus::ConnectionFailure, 0),
        };
        BackendResponse {
            stdout: self.stdout.freeze(),
            stderr: self.stderr.freeze(),
            status,
            app_status,
        }
    }
}
