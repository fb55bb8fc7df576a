//! Byte-pipe transports.
//!
//! A [`Transport`] is the leaf of the link layer: it opens and closes one
//! channel and moves raw bytes. It knows nothing about link status; the
//! owning `CommLink` drives it and turns its results into transitions.
//!
//! | Variant  | Type               | `endpoint`        | `number`  |
//! |----------|--------------------|-------------------|-----------|
//! | `Tcp`    | [`TcpTransport`]   | IP literal        | port      |
//! | `Udp`    | [`UdpTransport`]   | IP literal or `*` | port      |
//! | `Serial` | [`SerialTransport`]| port name         | baud rate |
//!
//! Reads are staged: [`Transport::peek_available`] pulls whatever has
//! arrived into an internal buffer without handing it out, and
//! [`Transport::read_available`] drains that buffer plus anything newer.
//!
//! Between operations each open transport runs a monitor task. It never
//! consumes data; it only reports a dropped channel or an error the
//! channel raised while idle, through the [`SignalHook`] the owner set.

use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::state::Timeout;

mod params;
mod serial;
mod tcp;
mod udp;

pub use params::{ConnectionParams, SerialOptions, SerialParity, TransportExtra};
pub use serial::SerialTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// Upper bound for a single drain of a socket or port.
pub(crate) const READ_CHUNK: usize = 64 * 1024;

/// How long a monitor backs off while unread data is waiting.
pub(crate) const MONITOR_BACKOFF: Duration = Duration::from_millis(20);

// ── Signals ──────────────────────────────────────────────────────

/// Something a transport noticed on its own, outside any operation.
#[derive(Debug)]
pub enum TransportSignal {
    /// The channel dropped: peer closed, connection reset, device gone.
    Lost,
    /// The channel reported an error while no operation was running.
    Fault(LinkError),
}

/// Receiver of [`TransportSignal`]s. Called from the monitor task, so it
/// must not block.
pub type SignalHook = Arc<dyn Fn(TransportSignal) + Send + Sync>;

/// Holder for the owner's hook.
#[derive(Default)]
pub(crate) struct SignalSlot(Mutex<Option<SignalHook>>);

impl SignalSlot {
    pub(crate) fn set(&self, hook: SignalHook) {
        *lock(&self.0) = Some(hook);
    }

    /// Snapshot for a monitor task.
    pub(crate) fn get(&self) -> Option<SignalHook> {
        lock(&self.0).clone()
    }
}

pub(crate) fn notify(hook: &Option<SignalHook>, signal: TransportSignal) {
    if let Some(hook) = hook {
        hook(signal);
    }
}

// ── Transport ────────────────────────────────────────────────────

/// The capability set every byte pipe provides.
///
/// Methods take `&self`: a transport is shared between its link and the
/// tasks the link spawns, so implementations keep their handles behind
/// their own locks. `is_live` must never wait on those locks, because the
/// emergency liveness check calls it while an operation may be stalled.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Which variant this is.
    fn kind(&self) -> TransportKind;

    /// Validate and store connection parameters. Rejected parameters
    /// leave the previous ones in place.
    fn configure(&self, params: &ConnectionParams) -> Result<(), LinkError>;

    /// Open the channel. Opening an already-open channel succeeds.
    async fn open(&self, timeout: Timeout) -> Result<(), LinkError>;

    /// Close the channel. Closing a closed channel succeeds.
    async fn close(&self, timeout: Timeout) -> Result<(), LinkError>;

    /// Write `data`, returning how many bytes the channel accepted before
    /// the deadline.
    async fn write(&self, data: &[u8], timeout: Timeout) -> Result<usize, LinkError>;

    /// Number of bytes ready to read, waiting at most `timeout` when none
    /// are buffered yet. Does not consume anything.
    async fn peek_available(&self, timeout: Timeout) -> Result<usize, LinkError>;

    /// Drain every byte currently available, waiting at most `timeout`
    /// when none are buffered yet.
    async fn read_available(&self, timeout: Timeout) -> Result<Bytes, LinkError>;

    /// Whether the channel is open and has not been observed to drop.
    fn is_live(&self) -> bool;

    /// Register the owner's hook for signals raised between operations.
    /// Transports that cannot watch their channel ignore it.
    fn set_signal_hook(&self, _hook: SignalHook) {}
}

// ── TransportKind ────────────────────────────────────────────────

/// Transport variant, chosen when a link is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Udp,
    Serial,
}

impl TransportKind {
    /// Build a fresh, unconfigured transport of this kind.
    pub fn build(self) -> Arc<dyn Transport> {
        match self {
            Self::Tcp => Arc::new(TcpTransport::new()),
            Self::Udp => Arc::new(UdpTransport::new()),
            Self::Serial => Arc::new(SerialTransport::new()),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Serial => write!(f, "serial"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "serial" | "com" => Ok(Self::Serial),
            other => Err(LinkError::InvalidParams(format!("unknown transport {other:?}"))),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────

/// Run `fut` under `timeout`. `Immediate` polls it exactly once.
///
/// Returns `None` when the deadline passed first.
pub(crate) async fn within<F: Future>(timeout: Timeout, fut: F) -> Option<F::Output> {
    match timeout {
        Timeout::Infinite => Some(fut.await),
        Timeout::After(d) => tokio::time::timeout(d, fut).await.ok(),
        Timeout::Immediate => fut.now_or_never(),
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("TCP".parse::<TransportKind>().unwrap(), TransportKind::Tcp);
        assert_eq!("udp".parse::<TransportKind>().unwrap(), TransportKind::Udp);
        assert_eq!("COM".parse::<TransportKind>().unwrap(), TransportKind::Serial);
        assert!("pipe".parse::<TransportKind>().is_err());
    }

    #[test]
    fn build_selects_variant() {
        for kind in [TransportKind::Tcp, TransportKind::Udp, TransportKind::Serial] {
            let t = kind.build();
            assert_eq!(t.kind(), kind);
            assert!(!t.is_live());
        }
    }

    #[tokio::test]
    async fn within_immediate_polls_once() {
        assert_eq!(within(Timeout::Immediate, async { 7 }).await, Some(7));
        let pending = within(Timeout::Immediate, std::future::pending::<()>()).await;
        assert!(pending.is_none());
    }

    #[tokio::test]
    async fn within_bounded_expires() {
        let slow = tokio::time::sleep(Duration::from_secs(5));
        let started = std::time::Instant::now();
        assert!(within(Timeout::After(Duration::from_millis(20)), slow).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
