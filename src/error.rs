//! Error taxonomy shared by every component (spec §7).
//!
//! Variant names map 1:1 onto the kinds the spec enumerates; callers match
//! on them to decide retry/propagate/abort behavior rather than string
//! matching, except at the one boundary (broken-pipe classification) where
//! the upstream transport itself only gives us a message or errno.

use std::fmt;

pub type PlcResult<T> = Result<T, PlcError>;

#[derive(thiserror::Error, Debug)]
pub enum PlcError {
    /// Socket-level PLC failures, including the broken-pipe family.
    /// Retried locally by the communicator; surfaced once retries are
    /// exhausted.
    #[error("PLC unavailable: {0}")]
    Transport(String),

    /// A Modbus exception response (illegal address, illegal data). Not
    /// retried.
    #[error("PLC protocol error: {0}")]
    Protocol(String),

    /// Parameter is missing a required address for the requested
    /// operation.
    #[error("parameter not configured: {0}")]
    NotConfigured(String),

    /// Value violates a known min/max bound.
    #[error("value {value} out of range [{min}, {max}] for {parameter}")]
    OutOfRange {
        parameter: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// A write's read-back didn't match within tolerance.
    #[error("verify failed for {parameter}: wrote {written}, read back {read_back} (tolerance {tolerance})")]
    VerifyFailed {
        parameter: String,
        written: f64,
        read_back: f64,
        tolerance: f64,
    },

    /// The store call failed after its own retries; triggers a DLQ spill.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Task cancellation. Clean unwind, no audit-row change beyond
    /// `error_message = "cancelled"`.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation. Terminates the owning terminal after logging.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl PlcError {
    /// Classifies a raw transport error message/errno against the
    /// broken-pipe family (spec §4.B, GLOSSARY). Kept as an explicit
    /// string-match fallback for foreign errors per §9 design notes, in
    /// addition to the typed `std::io::ErrorKind` check callers should
    /// prefer where an `io::Error` is available.
    pub fn is_broken_pipe_family(msg: &str) -> bool {
        let lower = msg.to_ascii_lowercase();
        lower.contains("broken pipe")
            || lower.contains("connection reset")
            || lower.contains("connection aborted")
            || lower.contains("errno 32")
            || lower.contains("epipe")
    }

    pub fn is_broken_pipe_io(err: &std::io::Error) -> bool {
        matches!(
            err.kind(),
            std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
        )
    }

    pub fn transport(msg: impl fmt::Display) -> Self {
        PlcError::Transport(msg.to_string())
    }

    pub fn protocol(msg: impl fmt::Display) -> Self {
        PlcError::Protocol(msg.to_string())
    }

    pub fn not_configured(parameter: impl fmt::Display) -> Self {
        PlcError::NotConfigured(parameter.to_string())
    }

    pub fn store_unavailable(msg: impl fmt::Display) -> Self {
        PlcError::StoreUnavailable(msg.to_string())
    }

    pub fn fatal(msg: impl fmt::Display) -> Self {
        PlcError::Fatal(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_broken_pipe_family() {
        assert!(PlcError::is_broken_pipe_family("Broken pipe"));
        assert!(PlcError::is_broken_pipe_family("Connection reset by peer"));
        assert!(PlcError::is_broken_pipe_family("errno 32"));
        assert!(PlcError::is_broken_pipe_family("[Errno 32] EPIPE"));
        assert!(!PlcError::is_broken_pipe_family("illegal data address"));
    }

    #[test]
    fn classifies_broken_pipe_io_kind() {
        assert!(PlcError::is_broken_pipe_io(&std::io::Error::from(
            std::io::ErrorKind::BrokenPipe
        )));
        assert!(!PlcError::is_broken_pipe_io(&std::io::Error::from(
            std::io::ErrorKind::TimedOut
        )));
    }
}
