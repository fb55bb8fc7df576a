//! The link state machine.
//!
//! A [`CommLink`] owns one [`Transport`] and the [`LinkStatus`] describing
//! it. Every connect, close, send, receive and inbox poll goes through the
//! status table, is bounded by the link's timeout policy, and is reported
//! on the link's event queue.
//!
//! Public methods keep a boolean contract: `true` means the operation (or,
//! in [`IoMode::Async`], its scheduling) succeeded. Details of a failure
//! arrive as an alert event.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::event::{EventSender, LinkEvent, LinkId, ProgressKind};
use crate::executor::{GuardedExecutor, OpTimer};
use crate::state::{LinkStatus, Timeout, TimeoutPolicy};
use crate::transport::{ConnectionParams, Transport, TransportKind, TransportSignal, lock};

/// Whether an I/O call waits for its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    /// The caller awaits the outcome.
    #[default]
    Sync,
    /// The work is spawned and the call returns once it is scheduled.
    Async,
}

// ── RxBuffer ─────────────────────────────────────────────────────

/// Shared destination for received bytes.
///
/// Cloning yields another handle to the same buffer, so a detached receive
/// can fill it while the owner keeps its own handle.
#[derive(Debug, Clone, Default)]
pub struct RxBuffer(Arc<Mutex<BytesMut>>);

impl RxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything received so far.
    pub fn take(&self) -> Bytes {
        lock(&self.0).split().freeze()
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.0).is_empty()
    }

    fn append(&self, data: &[u8]) {
        lock(&self.0).extend_from_slice(data);
    }
}

// ── CommLink ─────────────────────────────────────────────────────

/// Transport-agnostic connection manager.
///
/// Must be created and used inside a Tokio runtime.
pub struct CommLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    id: LinkId,
    transport: Arc<dyn Transport>,
    events: EventSender,

    status: Mutex<LinkStatus>,
    connected: AtomicBool,
    /// Set by `close`, cleared by `connect`/`reconnect`. The watchdog
    /// stays quiet while set.
    closed: AtomicBool,
    params_valid: AtomicBool,
    params: Mutex<Option<ConnectionParams>>,
    last_connect_timeout: Mutex<Timeout>,

    bytes_sent: AtomicUsize,
    bytes_received: AtomicUsize,
    bytes_inbox: AtomicUsize,

    policy: Mutex<TimeoutPolicy>,
    /// Serialises send, receive and inbox.
    op_lock: tokio::sync::Mutex<()>,
    guard: GuardedExecutor,
    op_timer: OpTimer,
    op_cancel: Mutex<Option<CancellationToken>>,
    worker: Mutex<Option<AbortHandle>>,
    watchdog: Mutex<Option<CancellationToken>>,
}

impl CommLink {
    /// A closed link over a fresh transport of `kind`.
    pub fn new(id: LinkId, kind: TransportKind, events: EventSender) -> Self {
        Self::with_transport(id, kind.build(), events)
    }

    /// A closed link over a caller-supplied transport.
    ///
    /// The link registers itself for the transport's out-of-band signals:
    /// a drop is answered with an emergency liveness check, an idle fault
    /// with an alert.
    pub fn with_transport(id: LinkId, transport: Arc<dyn Transport>, events: EventSender) -> Self {
        let inner = Arc::new(LinkInner {
            id,
            transport,
            events,
            status: Mutex::new(LinkStatus::Closed),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(true),
            params_valid: AtomicBool::new(false),
            params: Mutex::new(None),
            last_connect_timeout: Mutex::new(Timeout::Infinite),
            bytes_sent: AtomicUsize::new(0),
            bytes_received: AtomicUsize::new(0),
            bytes_inbox: AtomicUsize::new(0),
            policy: Mutex::new(TimeoutPolicy::default()),
            op_lock: tokio::sync::Mutex::new(()),
            guard: GuardedExecutor::new(),
            op_timer: OpTimer::new(),
            op_cancel: Mutex::new(None),
            worker: Mutex::new(None),
            watchdog: Mutex::new(None),
        });
        let link = Arc::downgrade(&inner);
        inner.transport.set_signal_hook(Arc::new(move |signal: TransportSignal| {
            if let Some(inner) = link.upgrade() {
                inner.on_transport_signal(signal);
            }
        }));
        Self { inner }
    }

    // ── Configuration ────────────────────────────────────────────

    /// Hand `params` to the transport for validation. Rejected parameters
    /// leave the link untouched.
    pub fn set_connection_params(&self, params: ConnectionParams) -> bool {
        match self.inner.transport.configure(&params) {
            Ok(()) => {
                debug!("link {} params set to {params}", self.inner.id);
                *lock(&self.inner.params) = Some(params);
                self.inner.params_valid.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                warn!("link {} rejected params {params}: {e}", self.inner.id);
                false
            }
        }
    }

    /// Replace the timeout policy and (re)start or stop the watchdog.
    pub fn configure_timeouts(
        &self,
        watchdog_enabled: bool,
        interval_ms: u64,
        connect: bool,
        send: bool,
        receive: bool,
    ) {
        let policy = TimeoutPolicy::new(watchdog_enabled, interval_ms, connect, send, receive);
        *lock(&self.inner.policy) = policy;
        self.inner.stop_watchdog();
        if let Some(period) = policy.watchdog {
            self.inner.start_watchdog(period);
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Open the transport.
    ///
    /// Fails at once if no parameters were ever accepted; succeeds at once
    /// if the link is already connected and not in an error status. From
    /// an error status over a live transport this walks back to `Ready`.
    pub async fn connect(&self, timeout: Timeout) -> bool {
        let inner = &self.inner;
        if !inner.params_valid.load(Ordering::SeqCst) {
            return false;
        }
        if inner.connected.load(Ordering::SeqCst)
            && inner.transport.is_live()
            && !inner.status().is_on_error()
        {
            return true;
        }

        inner.closed.store(false, Ordering::SeqCst);
        inner.connected.store(false, Ordering::SeqCst);
        *lock(&inner.last_connect_timeout) = timeout;
        inner.set_status(LinkStatus::Connecting);

        let transport = Arc::clone(&inner.transport);
        let enforced = inner.policy().connect_enforced();
        let result = inner
            .guard
            .run_with_timeout(enforced, timeout, async move { transport.open(timeout).await })
            .await;

        match result {
            Ok(()) => {
                info!("link {} connected", inner.id);
                if !inner.connected.swap(true, Ordering::SeqCst) {
                    inner.set_status(LinkStatus::Connected);
                }
                true
            }
            Err(e) => {
                inner.connected.store(false, Ordering::SeqCst);
                inner.raise_alert(&e);
                inner.set_status(LinkStatus::ConnectFailed);
                false
            }
        }
    }

    /// Close the transport.
    ///
    /// Closing a link whose transport is already down succeeds without
    /// any status change.
    pub async fn close(&self, timeout: Timeout) -> bool {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);

        if !inner.transport.is_live() {
            inner.connected.store(false, Ordering::SeqCst);
            // Release whatever handle a dropped peer left behind.
            if let Err(e) = inner.transport.close(timeout).await {
                debug!("link {} release after drop: {e}", inner.id);
            }
            return true;
        }

        inner.set_status(LinkStatus::Closing);
        match inner.transport.close(timeout).await {
            Ok(()) => {
                inner.connected.store(false, Ordering::SeqCst);
                inner.set_status(LinkStatus::Closed);
                info!("link {} closed", inner.id);
                true
            }
            Err(e) => {
                inner.raise_alert(&e);
                inner.set_status(LinkStatus::DisconnectFailed);
                false
            }
        }
    }

    /// Close (if open) and reopen the transport with the current
    /// parameters, then report liveness. Failures of the close and open
    /// steps are only logged.
    pub async fn reconnect(&self) -> bool {
        let inner = &self.inner;
        let timeout = *lock(&inner.last_connect_timeout);
        if inner.transport.is_live() {
            if let Err(e) = inner.transport.close(timeout).await {
                debug!("link {} reconnect close: {e}", inner.id);
            }
        }
        inner.closed.store(false, Ordering::SeqCst);
        if let Err(e) = inner.transport.open(timeout).await {
            debug!("link {} reconnect open: {e}", inner.id);
        }
        self.check_connection(false).await
    }

    /// Like [`reconnect`](Self::reconnect), but reports the first failure.
    pub async fn try_reconnect(&self) -> Result<(), LinkError> {
        let inner = &self.inner;
        if !inner.params_valid.load(Ordering::SeqCst) {
            return Err(LinkError::NotConfigured);
        }
        let timeout = *lock(&inner.last_connect_timeout);
        if inner.transport.is_live() {
            inner.transport.close(timeout).await?;
        }
        inner.closed.store(false, Ordering::SeqCst);
        inner.transport.open(timeout).await?;
        if self.check_connection(false).await {
            Ok(())
        } else {
            Err(LinkError::NotOpen)
        }
    }

    /// Re-check transport liveness and update the connected flag.
    ///
    /// `emergency` skips the operation lock so the check can run while an
    /// operation is stalled.
    pub async fn check_connection(&self, emergency: bool) -> bool {
        if emergency {
            return self.inner.check_liveness();
        }
        let _op = self.inner.op_lock.lock().await;
        self.inner.check_liveness()
    }

    // ── I/O ──────────────────────────────────────────────────────

    /// Write `data`. Requires `Ready`; otherwise returns `false` without
    /// touching the transport.
    pub async fn send(&self, data: impl Into<Bytes>, timeout: Timeout, mode: IoMode) -> bool {
        if !self.is_idle() {
            return false;
        }
        let data = data.into();
        match mode {
            IoMode::Sync => self.inner.do_send(data, timeout).await,
            IoMode::Async => {
                let inner = Arc::clone(&self.inner);
                self.inner.spawn_worker(async move {
                    inner.do_send(data, timeout).await;
                });
                true
            }
        }
    }

    /// Receive whatever is available into `buffer`. Requires `Ready`.
    pub async fn receive(&self, buffer: &RxBuffer, timeout: Timeout, mode: IoMode) -> bool {
        if !self.is_idle() {
            return false;
        }
        match mode {
            IoMode::Sync => self.inner.do_receive(buffer, timeout).await,
            IoMode::Async => {
                let inner = Arc::clone(&self.inner);
                let buffer = buffer.clone();
                self.inner.spawn_worker(async move {
                    inner.do_receive(&buffer, timeout).await;
                });
                true
            }
        }
    }

    /// Check for pending bytes without consuming them. Requires `Ready`.
    /// A hit is reported as an `InboxReady` progress event.
    pub async fn poll_inbox(&self, timeout: Timeout, mode: IoMode) -> bool {
        if !self.is_idle() {
            return false;
        }
        match mode {
            IoMode::Sync => self.inner.do_inbox(timeout).await,
            IoMode::Async => {
                let inner = Arc::clone(&self.inner);
                self.inner.spawn_worker(async move {
                    inner.do_inbox(timeout).await;
                });
                true
            }
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn id(&self) -> LinkId {
        self.inner.id
    }

    pub fn status(&self) -> LinkStatus {
        self.inner.status()
    }

    pub fn params(&self) -> Option<ConnectionParams> {
        lock(&self.inner.params).clone()
    }

    pub fn policy(&self) -> TimeoutPolicy {
        self.inner.policy()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    pub fn bytes_sent(&self) -> usize {
        self.inner.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> usize {
        self.inner.bytes_received.load(Ordering::SeqCst)
    }

    pub fn bytes_inbox(&self) -> usize {
        self.inner.bytes_inbox.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.status().is_idle()
    }

    pub fn is_busy(&self) -> bool {
        self.status().is_busy()
    }

    pub fn is_at_home(&self) -> bool {
        self.status().is_at_home()
    }

    pub fn is_done(&self) -> bool {
        self.status().is_done()
    }

    pub fn is_on_error(&self) -> bool {
        self.status().is_on_error()
    }
}

impl std::fmt::Debug for CommLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommLink")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.transport.kind())
            .field("status", &self.inner.status())
            .finish()
    }
}

impl Drop for CommLink {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);
        inner.connected.store(false, Ordering::SeqCst);
        inner.stop_watchdog();
        inner.op_timer.stop();
        if let Some(token) = lock(&inner.op_cancel).take() {
            token.cancel();
        }
        if let Some(worker) = lock(&inner.worker).take() {
            worker.abort();
        }
        inner.guard.abort();
        *lock(&inner.status) = LinkStatus::Closed;
        debug!("link {} dropped", inner.id);
    }
}

// ── LinkInner ────────────────────────────────────────────────────

impl LinkInner {
    fn status(&self) -> LinkStatus {
        *lock(&self.status)
    }

    fn policy(&self) -> TimeoutPolicy {
        *lock(&self.policy)
    }

    fn emit(&self, event: LinkEvent) {
        // The owner may have stopped listening; that is not our problem.
        let _ = self.events.send(event);
    }

    fn progress(&self, kind: ProgressKind, bytes: usize) {
        self.emit(LinkEvent::Progress {
            link: self.id,
            kind,
            bytes,
        });
    }

    fn raise_alert(&self, err: &LinkError) {
        warn!("link {} alert: {err}", self.id);
        self.emit(LinkEvent::Alert {
            link: self.id,
            code: err.alert_code(),
            message: err.to_string(),
        });
    }

    fn set_status(&self, next: LinkStatus) -> bool {
        self.set_status_if(None, next)
    }

    /// Apply `next`, optionally only when the current status is
    /// `expected`. Both the change and the follow-up `Ready` are queued
    /// while the status lock is held.
    fn set_status_if(&self, expected: Option<LinkStatus>, next: LinkStatus) -> bool {
        let mut status = lock(&self.status);
        if expected.is_some_and(|e| e != *status) {
            return false;
        }
        if *status == next {
            return true;
        }
        if let Err(e) = status.transition(next) {
            warn!("link {}: {e}", self.id);
            return false;
        }
        debug!("link {} -> {next}", self.id);
        self.emit(LinkEvent::Status {
            link: self.id,
            status: next,
        });
        if next.advances_to_ready() {
            *status = LinkStatus::Ready;
            self.emit(LinkEvent::Status {
                link: self.id,
                status: LinkStatus::Ready,
            });
        }
        true
    }

    /// Lock-free liveness check shared by the watchdog and the
    /// emergency path.
    fn check_liveness(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            return false;
        }
        if self.transport.is_live() {
            if !self.connected.swap(true, Ordering::SeqCst) {
                info!("link {} transport is up", self.id);
                self.set_status(LinkStatus::Connected);
            }
        } else if self.connected.swap(false, Ordering::SeqCst) {
            warn!("link {} lost its transport", self.id);
            self.set_status(LinkStatus::ConnectionLost);
        }
        self.connected.load(Ordering::SeqCst)
    }

    fn spawn_worker<F>(&self, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(work);
        *lock(&self.worker) = Some(task.abort_handle());
    }

    // ── Operation timer ──────────────────────────────────────────

    /// Arm the per-operation timer when `enforced` and `timeout` is
    /// bounded. Returns the timer generation (if armed) and the token the
    /// operation must select against.
    fn begin_op(self: &Arc<Self>, enforced: bool, timeout: Timeout) -> (Option<u64>, CancellationToken) {
        let cancel = CancellationToken::new();
        *lock(&self.op_cancel) = Some(cancel.clone());

        let armed = match timeout.bounded() {
            Some(after) if enforced => {
                let link: Weak<Self> = Arc::downgrade(self);
                let token = cancel.clone();
                Some(self.op_timer.arm(after, move || {
                    token.cancel();
                    if let Some(inner) = link.upgrade() {
                        inner.on_op_timeout();
                    }
                }))
            }
            _ => None,
        };
        (armed, cancel)
    }

    /// Returns `false` when the timer already expired and owns the
    /// outcome.
    fn end_op(&self, armed: Option<u64>) -> bool {
        lock(&self.op_cancel).take();
        match armed {
            Some(generation) => self.op_timer.disarm(generation),
            None => true,
        }
    }

    fn on_op_timeout(&self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
        match self.status() {
            LinkStatus::Sending => {
                warn!("link {} send timed out", self.id);
                self.set_status_if(Some(LinkStatus::Sending), LinkStatus::SendFailed);
            }
            LinkStatus::Receiving => {
                warn!("link {} receive timed out", self.id);
                self.set_status_if(Some(LinkStatus::Receiving), LinkStatus::ReceiveFailed);
            }
            LinkStatus::Connecting => {
                self.set_status_if(Some(LinkStatus::Connecting), LinkStatus::ConnectFailed);
            }
            LinkStatus::Ready => {
                self.progress(ProgressKind::InboxReady, self.bytes_inbox.load(Ordering::SeqCst));
            }
            _ => {}
        }
    }

    fn on_transport_signal(&self, signal: TransportSignal) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match signal {
            TransportSignal::Fault(e) => self.raise_alert(&e),
            TransportSignal::Lost => {
                debug!("link {} transport reported a drop", self.id);
                self.check_liveness();
            }
        }
    }

    /// Record a failed operation and look for a dropped transport.
    fn fail_op(&self, err: &LinkError, failed: LinkStatus) {
        self.raise_alert(err);
        self.set_status(failed);
        if err.is_disconnect() {
            self.check_liveness();
        }
    }

    // ── Operations ───────────────────────────────────────────────

    async fn do_send(self: &Arc<Self>, data: Bytes, timeout: Timeout) -> bool {
        let _op = self.op_lock.lock().await;
        if !self.status().is_idle() {
            return false;
        }
        self.bytes_sent.store(0, Ordering::SeqCst);
        if !self.set_status(LinkStatus::Sending) {
            return false;
        }

        let (armed, cancel) = self.begin_op(self.policy().send_enforced(), timeout);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            r = self.transport.write(&data, timeout) => Some(r),
        };
        if !self.end_op(armed) {
            return false;
        }

        match outcome {
            Some(Ok(written)) => {
                self.bytes_sent.store(written, Ordering::SeqCst);
                self.progress(ProgressKind::Sending, written);
                if written == data.len() {
                    // Refused when a close overtook the write.
                    self.set_status(LinkStatus::Sent)
                } else {
                    let err = LinkError::ShortWrite {
                        written,
                        expected: data.len(),
                    };
                    self.fail_op(&err, LinkStatus::SendFailed);
                    false
                }
            }
            Some(Err(e)) => {
                self.fail_op(&e, LinkStatus::SendFailed);
                false
            }
            None => {
                self.set_status(LinkStatus::SendFailed);
                false
            }
        }
    }

    async fn do_receive(self: &Arc<Self>, buffer: &RxBuffer, timeout: Timeout) -> bool {
        let _op = self.op_lock.lock().await;
        if !self.status().is_idle() {
            return false;
        }
        self.bytes_received.store(0, Ordering::SeqCst);
        if !self.set_status(LinkStatus::Receiving) {
            return false;
        }

        let (armed, cancel) = self.begin_op(self.policy().receive_enforced(), timeout);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            r = self.transport.read_available(timeout) => Some(r),
        };
        if !self.end_op(armed) {
            return false;
        }

        match outcome {
            Some(Ok(data)) if !data.is_empty() => {
                buffer.append(&data);
                self.bytes_received.store(data.len(), Ordering::SeqCst);
                self.progress(ProgressKind::Receiving, data.len());
                self.set_status(LinkStatus::Received)
            }
            Some(Ok(_)) | None => {
                self.set_status(LinkStatus::ReceiveFailed);
                false
            }
            Some(Err(e)) => {
                self.fail_op(&e, LinkStatus::ReceiveFailed);
                false
            }
        }
    }

    async fn do_inbox(self: &Arc<Self>, timeout: Timeout) -> bool {
        let _op = self.op_lock.lock().await;
        if !self.status().is_idle() {
            return false;
        }
        self.bytes_inbox.store(0, Ordering::SeqCst);

        let (armed, cancel) = self.begin_op(self.policy().receive_enforced(), timeout);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            r = self.transport.peek_available(timeout) => Some(r),
        };
        if !self.end_op(armed) {
            return false;
        }

        match outcome {
            Some(Ok(pending)) => {
                self.bytes_inbox.store(pending, Ordering::SeqCst);
                if pending > 0 {
                    self.progress(ProgressKind::InboxReady, pending);
                }
                pending > 0
            }
            Some(Err(e)) => {
                self.raise_alert(&e);
                if e.is_disconnect() {
                    self.check_liveness();
                }
                false
            }
            None => false,
        }
    }

    // ── Watchdog ─────────────────────────────────────────────────

    fn start_watchdog(self: &Arc<Self>, period: Duration) {
        let stop = CancellationToken::new();
        let link = Arc::downgrade(self);
        let token = stop.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let Some(inner) = link.upgrade() else { break };
                if !inner.closed.load(Ordering::SeqCst) {
                    inner.check_liveness();
                }
            }
        });
        debug!("link {} watchdog every {period:?}", self.id);
        *lock(&self.watchdog) = Some(stop);
    }

    fn stop_watchdog(&self) {
        if let Some(token) = lock(&self.watchdog).take() {
            token.cancel();
        }
    }
}
