//! # lumos-core
//!
//! Link layer for the Lumos LiDAR viewer.
//!
//! This crate contains:
//! - **State**: `LinkStatus` and its transition table, `Timeout` and `TimeoutPolicy`
//! - **Link**: `CommLink`, the state machine that drives connect/send/receive/close
//! - **Executor**: `GuardedExecutor` (timeout guard) and `OpTimer` (per-operation timer)
//! - **Transport**: the `Transport` trait with TCP, UDP and serial variants
//! - **Event**: `LinkEvent` queue and the `LinkListener` trait
//! - **Error**: `LinkError` and `TaskError`, `thiserror`-based
//!
//! The link moves raw bytes only. Decoding the sensor stream is up to the
//! caller.

pub mod error;
pub mod event;
pub mod executor;
pub mod link;
pub mod state;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use error::{LinkError, TaskError};
pub use event::{EventReceiver, EventSender, LinkEvent, LinkId, LinkListener, ProgressKind, event_channel};
pub use executor::{GuardedExecutor, OpTimer};
pub use link::{CommLink, IoMode, RxBuffer};
pub use state::{LinkStatus, Timeout, TimeoutFlags, TimeoutPolicy};
pub use transport::{
    ConnectionParams, SerialOptions, SerialParity, SerialTransport, SignalHook, TcpTransport,
    Transport, TransportExtra, TransportKind, TransportSignal, UdpTransport,
};
