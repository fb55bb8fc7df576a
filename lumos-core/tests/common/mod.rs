//! Shared helpers: a scripted in-memory transport and event collectors.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use lumos_core::{
    CommLink, ConnectionParams, EventReceiver, LinkError, LinkEvent, LinkStatus, SignalHook,
    Timeout, Transport, TransportKind, TransportSignal, event_channel,
};

/// Transport whose behaviour is flipped by flags from the test body.
#[derive(Default)]
pub struct MockTransport {
    pub live: AtomicBool,
    pub stall_open: AtomicBool,
    pub fail_open: AtomicBool,
    pub stall_write: AtomicBool,
    /// Writes finish, but only after 100ms.
    pub slow_write: AtomicBool,
    pub short_write: AtomicBool,
    /// Peeks and reads never finish.
    pub stall_read: AtomicBool,
    pub fail_close: AtomicBool,
    /// Bytes the "peer" has sent us.
    pub inbox: Mutex<BytesMut>,
    /// Bytes we have written.
    pub written: Mutex<Vec<u8>>,
    /// Number of open/write/peek/read calls.
    pub io_calls: AtomicUsize,
    hook: Mutex<Option<SignalHook>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_inbox(&self, data: &[u8]) {
        self.inbox.lock().unwrap().extend_from_slice(data);
    }

    pub fn calls(&self) -> usize {
        self.io_calls.load(Ordering::SeqCst)
    }

    pub fn set(&self, flag: &AtomicBool, on: bool) {
        flag.store(on, Ordering::SeqCst);
    }

    /// Raise `signal` the way a transport monitor would.
    pub fn signal(&self, signal: TransportSignal) {
        let hook = self.hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(signal);
        }
    }

    async fn stall_if(flag: &AtomicBool) {
        if flag.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    async fn idle_until(timeout: Timeout) {
        match timeout {
            Timeout::After(d) => tokio::time::sleep(d).await,
            Timeout::Infinite => std::future::pending::<()>().await,
            Timeout::Immediate => {}
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn configure(&self, params: &ConnectionParams) -> Result<(), LinkError> {
        if params.endpoint == "bad" || params.number == 0 {
            return Err(LinkError::InvalidParams(params.to_string()));
        }
        Ok(())
    }

    async fn open(&self, _timeout: Timeout) -> Result<(), LinkError> {
        self.io_calls.fetch_add(1, Ordering::SeqCst);
        if self.stall_open.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
        }
        self.live.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _timeout: Timeout) -> Result<(), LinkError> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(LinkError::Other("close refused".into()));
        }
        self.live.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, data: &[u8], _timeout: Timeout) -> Result<usize, LinkError> {
        self.io_calls.fetch_add(1, Ordering::SeqCst);
        if !self.live.load(Ordering::SeqCst) {
            return Err(LinkError::NotOpen);
        }
        Self::stall_if(&self.stall_write).await;
        if self.slow_write.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let n = if self.short_write.load(Ordering::SeqCst) {
            data.len() / 2
        } else {
            data.len()
        };
        self.written.lock().unwrap().extend_from_slice(&data[..n]);
        Ok(n)
    }

    async fn peek_available(&self, timeout: Timeout) -> Result<usize, LinkError> {
        self.io_calls.fetch_add(1, Ordering::SeqCst);
        Self::stall_if(&self.stall_read).await;
        let n = self.inbox.lock().unwrap().len();
        if n == 0 {
            Self::idle_until(timeout).await;
        }
        Ok(self.inbox.lock().unwrap().len())
    }

    async fn read_available(&self, timeout: Timeout) -> Result<Bytes, LinkError> {
        self.io_calls.fetch_add(1, Ordering::SeqCst);
        if !self.live.load(Ordering::SeqCst) {
            return Err(LinkError::PeerClosed);
        }
        Self::stall_if(&self.stall_read).await;
        if self.inbox.lock().unwrap().is_empty() {
            Self::idle_until(timeout).await;
        }
        Ok(self.inbox.lock().unwrap().split().freeze())
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn set_signal_hook(&self, hook: SignalHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }
}

/// A link over `mock` with accepted parameters, still closed.
pub fn link_over(mock: &Arc<MockTransport>) -> (CommLink, EventReceiver) {
    let (tx, rx) = event_channel();
    let transport: Arc<dyn Transport> = mock.clone();
    let link = CommLink::with_transport(1, transport, tx);
    assert!(link.set_connection_params(ConnectionParams::new("sensor", 1)));
    (link, rx)
}

/// A link over `mock` that is connected and `Ready`; its connect events
/// have been drained.
pub async fn ready_link(mock: &Arc<MockTransport>) -> (CommLink, EventReceiver) {
    let (link, mut rx) = link_over(mock);
    assert!(link.connect(Timeout::from_millis(500)).await);
    assert_eq!(link.status(), LinkStatus::Ready);
    drain(&mut rx);
    (link, rx)
}

/// Every event queued so far.
pub fn drain(rx: &mut EventReceiver) -> Vec<LinkEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

/// The status events among `events`, in order.
pub fn statuses(events: &[LinkEvent]) -> Vec<LinkStatus> {
    events
        .iter()
        .filter_map(|ev| match ev {
            LinkEvent::Status { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

/// Alert codes among `events`, in order.
pub fn alerts(events: &[LinkEvent]) -> Vec<i32> {
    events
        .iter()
        .filter_map(|ev| match ev {
            LinkEvent::Alert { code, .. } => Some(*code),
            _ => None,
        })
        .collect()
}

/// Assert `seq` is a walk through the transition table from `from`.
pub fn assert_legal(from: LinkStatus, seq: &[LinkStatus]) {
    let mut current = from;
    for &next in seq {
        assert!(
            current.can_transition_to(next),
            "illegal step {current} -> {next} in {seq:?}"
        );
        current = next;
    }
}

/// Poll until the link reaches `status` or `within` elapses.
pub async fn wait_for_status(link: &CommLink, status: LinkStatus, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if link.status() == status {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    link.status() == status
}
