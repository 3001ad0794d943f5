use serde::{Deserialize, Serialize};
use std::fmt;

/// Status codes carried by stream-level errors.
///
/// These mirror the usual RPC status codes so that an error raised on the
/// agent can cross the tunnel inside an `Error` frame and be mapped to an
/// HTTP status on the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    PermissionDenied,
    Unavailable,
    Unimplemented,
    Internal,
    Unauthenticated,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Cancelled => "cancelled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid argument",
            Code::DeadlineExceeded => "deadline exceeded",
            Code::NotFound => "not found",
            Code::PermissionDenied => "permission denied",
            Code::Unavailable => "unavailable",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unauthenticated => "unauthenticated",
        };
        f.write_str(name)
    }
}

/// Terminal result of a stream that did not finish cleanly.
///
/// Clean end-of-stream is never a `Status`; it shows up as `Ok(None)` on the
/// receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    /// Protocol violations and other bugs on the peer's side.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Cancellation and deadlines need no further action from higher layers.
    pub fn is_cancellation(&self) -> bool {
        matches!(self.code, Code::Cancelled | Code::DeadlineExceeded)
    }

    /// Maps transport I/O failures. Broken pipes and resets mean the peer went
    /// away, which callers can retry on a different tunnel.
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match err.kind() {
            ErrorKind::TimedOut => Code::DeadlineExceeded,
            ErrorKind::InvalidData => Code::Internal,
            _ => Code::Unavailable,
        };
        Self::new(code, format!("{context}: {err}"))
    }
}

/// Signals that a proxied response failed after its status line and headers
/// were already written to the client. The response cannot be repaired, so the
/// connection has to be dropped without any further writes.
#[derive(Debug, thiserror::Error)]
#[error("response aborted after headers were sent: {0}")]
pub struct AbortHandler(pub Status);

/// Receives processing errors: failures that are not the stream's own I/O
/// problems but should still be surfaced to an operator.
pub trait ErrReporter: Send + Sync {
    fn handle_processing_error(&self, msg: &str, err: &(dyn std::error::Error + 'static));
}

/// Default reporter that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrReporter for LogReporter {
    fn handle_processing_error(&self, msg: &str, err: &(dyn std::error::Error + 'static)) {
        tracing::warn!(error = %err, "{}", msg);
    }
}
