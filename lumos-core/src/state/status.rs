//! Link status machine shared by every transport.
//!
//! `LinkStatus` is the single source of truth for what a `CommLink` is
//! doing. Transitions are validated against a fixed table; the link
//! refuses anything outside it.

use serde::{Deserialize, Serialize};

use crate::error::LinkError;

// ── LinkStatus ───────────────────────────────────────────────────

/// The current status of a link.
///
/// ```text
///            ┌──────────────► Closing ──► Closed | DisconnectFailed
///            │
///  * ──► Connecting ──► Connected ──► Ready ◄──── Sent ◄── Sending ◄──┐
///            │                          │  ▲                           │
///            ▼                          │  └──── Received ◄─ Receiving │
///      ConnectFailed                    └──────────────────────────────┘
///
///  * ──► ConnectionLost   (liveness check, any state)
/// ```
///
/// The discriminants are stable: everything at or above `ON_ERROR` is
/// the error band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum LinkStatus {
    /// No active connection. Initial / terminal state.
    #[default]
    Closed = 0,
    /// Transport open in progress.
    Connecting = 1,
    /// Transport opened; advances to `Ready` right after notification.
    Connected = 2,
    /// Idle. The previous step completed and the next may start.
    Ready = 3,
    /// Transmission in progress.
    Sending = 4,
    /// Transmission complete; advances to `Ready`.
    Sent = 5,
    /// Reception in progress.
    Receiving = 6,
    /// Reception complete; advances to `Ready`.
    Received = 7,
    /// Graceful shutdown in progress.
    Closing = 8,

    /// The transport dropped while the link believed it was connected.
    ConnectionLost = 1001,
    /// Opening the transport failed or timed out.
    ConnectFailed = 1002,
    /// Closing the transport failed.
    DisconnectFailed = 1003,
    /// A send failed or timed out.
    SendFailed = 1004,
    /// A receive failed or timed out.
    ReceiveFailed = 1005,
}

impl LinkStatus {
    /// First code of the error band.
    pub const ON_ERROR: u32 = 1000;

    /// Every status, in discriminant order.
    pub const ALL: [LinkStatus; 14] = [
        Self::Closed,
        Self::Connecting,
        Self::Connected,
        Self::Ready,
        Self::Sending,
        Self::Sent,
        Self::Receiving,
        Self::Received,
        Self::Closing,
        Self::ConnectionLost,
        Self::ConnectFailed,
        Self::DisconnectFailed,
        Self::SendFailed,
        Self::ReceiveFailed,
    ];

    /// Stable numeric code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// `Ready`: the link can start a new operation.
    pub fn is_idle(self) -> bool {
        self == Self::Ready
    }

    /// `Sending` or `Receiving`.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Sending | Self::Receiving)
    }

    /// `Closed` or `Closing`.
    pub fn is_at_home(self) -> bool {
        matches!(self, Self::Closed | Self::Closing)
    }

    /// `Sent` or `Received`.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Sent | Self::Received)
    }

    /// Any status in the error band.
    pub fn is_on_error(self) -> bool {
        self.code() >= Self::ON_ERROR
    }

    /// Statuses that are immediately followed by `Ready`.
    pub fn advances_to_ready(self) -> bool {
        matches!(self, Self::Connected | Self::Sent | Self::Received)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Whether `self → next` is allowed.
    ///
    /// `Connecting`, `Closing` and `ConnectionLost` may be entered from
    /// anywhere. `Connected` is also reachable without `Connecting` when a
    /// liveness check rediscovers an open transport from a home or error
    /// status.
    pub fn can_transition_to(self, next: LinkStatus) -> bool {
        use LinkStatus::*;
        match next {
            Connecting | Closing | ConnectionLost => true,
            Connected => self == Connecting || self.is_at_home() || self.is_on_error(),
            Ready => self.advances_to_ready(),
            Sending | Receiving => self == Ready,
            Sent | SendFailed => self == Sending,
            Received | ReceiveFailed => self == Receiving,
            ConnectFailed => self == Connecting,
            Closed | DisconnectFailed => self == Closing,
        }
    }

    /// Validated transition.
    pub fn transition(&mut self, next: LinkStatus) -> Result<(), LinkError> {
        if self.can_transition_to(next) {
            *self = next;
            Ok(())
        } else {
            Err(LinkError::Other(format!("illegal transition {self} -> {next}")))
        }
    }
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "Closed",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Ready => "Ready",
            Self::Sending => "Sending",
            Self::Sent => "Sent",
            Self::Receiving => "Receiving",
            Self::Received => "Received",
            Self::Closing => "Closing",
            Self::ConnectionLost => "ConnectionLost",
            Self::ConnectFailed => "ConnectFailed",
            Self::DisconnectFailed => "DisconnectFailed",
            Self::SendFailed => "SendFailed",
            Self::ReceiveFailed => "ReceiveFailed",
        };
        f.write_str(name)
    }
}

// ── Tests ────────────────────────────────────────────────────────
