//! Domain-specific error types for the link layer.
//!
//! Everything below the `CommLink` boolean contract returns
//! `Result<T, LinkError>`. Transport faults carry enough detail to be
//! surfaced on the alert channel with a stable numeric code.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for links and transports.
#[derive(Debug, Error)]
pub enum LinkError {
    // ── Parameter Errors ─────────────────────────────────────────
    /// Connection parameters were rejected by the transport.
    #[error("invalid connection parameters: {0}")]
    InvalidParams(String),

    /// An operation needed parameters that were never accepted.
    #[error("transport not configured")]
    NotConfigured,

    // ── Connection Errors ────────────────────────────────────────
    /// The transport has no open handle.
    #[error("transport not open")]
    NotOpen,

    /// The socket/IO layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port driver reported an error.
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),

    /// The peer closed the channel.
    #[error("peer closed the connection")]
    PeerClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Fewer bytes than requested were accepted by the channel.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    // ── Task Errors ─────────────────────────────────────────────
    /// A spawned unit of work failed.
    #[error("task error: {0}")]
    Task(#[from] TaskError),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl LinkError {
    /// Numeric code raised on the alert channel.
    ///
    /// OS-level failures report the raw OS error; everything else maps to
    /// a fixed code above the errno range.
    pub fn alert_code(&self) -> i32 {
        match self {
            LinkError::Io(e) => e
                .raw_os_error()
                .unwrap_or(ALERT_IO_BASE + io_kind_code(e.kind())),
            LinkError::Serial(e) => ALERT_SERIAL_BASE + serial_kind_code(&e.kind),
            LinkError::InvalidParams(_) => 9001,
            LinkError::NotConfigured => 9002,
            LinkError::NotOpen => 9003,
            LinkError::PeerClosed => 9004,
            LinkError::Timeout(_) => 9005,
            LinkError::ShortWrite { .. } => 9006,
            LinkError::Task(TaskError::Timeout(_)) => 9005,
            LinkError::Task(_) => 9007,
            LinkError::Other(_) => 9999,
        }
    }

    /// Whether the error means the underlying channel is gone.
    pub fn is_disconnect(&self) -> bool {
        match self {
            LinkError::PeerClosed | LinkError::NotOpen => true,
            LinkError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            LinkError::Serial(e) => matches!(e.kind, serialport::ErrorKind::NoDevice),
            _ => false,
        }
    }
}

const ALERT_IO_BASE: i32 = 10_000;
const ALERT_SERIAL_BASE: i32 = 20_000;

fn io_kind_code(kind: std::io::ErrorKind) -> i32 {
    use std::io::ErrorKind::*;
    match kind {
        NotFound => 1,
        PermissionDenied => 2,
        ConnectionRefused => 3,
        ConnectionReset => 4,
        ConnectionAborted => 5,
        NotConnected => 6,
        AddrInUse => 7,
        AddrNotAvailable => 8,
        BrokenPipe => 9,
        WouldBlock => 10,
        InvalidInput => 11,
        TimedOut => 12,
        UnexpectedEof => 13,
        _ => 99,
    }
}

fn serial_kind_code(kind: &serialport::ErrorKind) -> i32 {
    match kind {
        serialport::ErrorKind::NoDevice => 1,
        serialport::ErrorKind::InvalidInput => 2,
        serialport::ErrorKind::Unknown => 3,
        serialport::ErrorKind::Io(io) => 100 + io_kind_code(*io),
        #[allow(unreachable_patterns)]
        _ => 99,
    }
}

// ── TaskError ─────────────────────────────────────────────────────

/// Typed error for work dispatched to the executor.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task exceeded its deadline and was cancelled.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// The task was aborted before it finished.
    #[error("task was cancelled")]
    Cancelled,

    /// The task panicked or otherwise failed to produce a result.
    #[error("task failed: {0}")]
    Failed(String),
}

impl From<tokio::task::JoinError> for TaskError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            TaskError::Cancelled
        } else {
            TaskError::Failed(e.to_string())
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for LinkError {
    fn from(s: String) -> Self {
        LinkError::Other(s)
    }
}

impl From<&str> for LinkError {
    fn from(s: &str) -> Self {
        LinkError::Other(s.to_string())
    }
}

impl From<tokio::task::JoinError> for LinkError {
    fn from(e: tokio::task::JoinError) -> Self {
        LinkError::Task(e.into())
    }
}
