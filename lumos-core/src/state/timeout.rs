//! Timeout values and the per-link timeout policy.

use std::time::Duration;

use bitflags::bitflags;

// ── Timeout ──────────────────────────────────────────────────────

/// How long an operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Do not wait at all: act on whatever is available right now.
    Immediate,
    /// Wait at most this long.
    After(Duration),
    /// Wait as long as it takes.
    #[default]
    Infinite,
}

impl Timeout {
    /// Millisecond sentinel meaning "wait forever".
    pub const INFINITE_MS: u32 = u32::MAX;

    /// Map a raw millisecond value: `0` is `Immediate`, `u32::MAX` is
    /// `Infinite`.
    pub fn from_millis(ms: u32) -> Self {
        match ms {
            0 => Self::Immediate,
            Self::INFINITE_MS => Self::Infinite,
            ms => Self::After(Duration::from_millis(ms as u64)),
        }
    }

    /// The deadline, if this timeout is bounded and non-zero.
    pub fn bounded(self) -> Option<Duration> {
        match self {
            Self::After(d) if !d.is_zero() => Some(d),
            _ => None,
        }
    }

    /// Whether the operation may wait at all.
    pub fn waits(self) -> bool {
        !matches!(self, Self::Immediate)
    }
}

// ── TimeoutPolicy ────────────────────────────────────────────────

bitflags! {
    /// Operations whose timeout is enforced by the link.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TimeoutFlags: u8 {
        const CONNECT = 0b001;
        const SEND    = 0b010;
        const RECEIVE = 0b100;
    }
}

/// Timeout enforcement and watchdog settings owned by a `CommLink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeoutPolicy {
    /// Liveness watchdog period; `None` when the watchdog is off.
    pub watchdog: Option<Duration>,
    /// Which operations get a guard timer.
    pub enforce: TimeoutFlags,
}

impl TimeoutPolicy {
    pub fn new(
        watchdog_enabled: bool,
        interval_ms: u64,
        connect: bool,
        send: bool,
        receive: bool,
    ) -> Self {
        let mut enforce = TimeoutFlags::empty();
        enforce.set(TimeoutFlags::CONNECT, connect);
        enforce.set(TimeoutFlags::SEND, send);
        enforce.set(TimeoutFlags::RECEIVE, receive);
        Self {
            watchdog: (watchdog_enabled && interval_ms > 0)
                .then(|| Duration::from_millis(interval_ms)),
            enforce,
        }
    }

    pub fn connect_enforced(&self) -> bool {
        self.enforce.contains(TimeoutFlags::CONNECT)
    }

    pub fn send_enforced(&self) -> bool {
        self.enforce.contains(TimeoutFlags::SEND)
    }

    pub fn receive_enforced(&self) -> bool {
        self.enforce.contains(TimeoutFlags::RECEIVE)
    }
}
