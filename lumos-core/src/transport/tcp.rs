//! Stream-socket transport.
//!
//! The read half is shared with a monitor task that peeks the socket
//! between operations, so a peer that goes away while the link is idle is
//! still reported.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ConnectionParams, MONITOR_BACKOFF, READ_CHUNK, SignalHook, SignalSlot, Transport,
    TransportKind, TransportSignal, lock, notify, within,
};
use crate::error::LinkError;
use crate::state::Timeout;

/// Staged bytes are capped so a fast sender cannot grow the buffer
/// without bound between two reads.
const MAX_STAGED: usize = 4 * 1024 * 1024;

struct StagedReader {
    half: Arc<OwnedReadHalf>,
    staged: BytesMut,
}

/// TCP client transport.
pub struct TcpTransport {
    addr: Mutex<Option<SocketAddr>>,
    reader: tokio::sync::Mutex<Option<StagedReader>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Cancelled by `close` to unblock in-flight reads and writes and to
    /// stop the monitor.
    shutdown: Mutex<CancellationToken>,
    live: Arc<AtomicBool>,
    signals: SignalSlot,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            addr: Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
            live: Arc::new(AtomicBool::new(false)),
            signals: SignalSlot::default(),
        }
    }

    /// The configured peer address.
    pub fn peer(&self) -> Option<SocketAddr> {
        *lock(&self.addr)
    }

    /// Run `fut` unless the transport is closed underneath it.
    async fn unless_closed<T>(
        &self,
        fut: impl Future<Output = Result<T, LinkError>>,
    ) -> Result<T, LinkError> {
        let token = lock(&self.shutdown).clone();
        tokio::select! {
            _ = token.cancelled() => Err(LinkError::NotOpen),
            r = fut => r,
        }
    }

    fn mark_dropped(&self, err: &LinkError) {
        if err.is_disconnect() && self.live.swap(false, Ordering::SeqCst) {
            debug!("tcp peer dropped: {err}");
        }
    }

    /// Make sure something is staged, waiting up to `timeout` if not.
    async fn fill(&self, reader: &mut StagedReader, timeout: Timeout) -> Result<(), LinkError> {
        drain(reader, &self.live)?;
        if reader.staged.is_empty() && timeout.waits() {
            let wait = async {
                loop {
                    reader.half.readable().await?;
                    drain(reader, &self.live)?;
                    if !reader.staged.is_empty() {
                        return Ok::<_, LinkError>(());
                    }
                }
            };
            if let Some(r) = within(timeout, wait).await {
                r?;
            }
        }
        Ok(())
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        lock(&self.shutdown).cancel();
    }
}

/// Peek the idle socket until it reports EOF or an error, or `stop` fires.
///
/// Waiting data is left for the link; the monitor backs off and looks
/// again once the reader had a chance to drain it.
async fn monitor(
    half: Arc<OwnedReadHalf>,
    live: Arc<AtomicBool>,
    stop: CancellationToken,
    hook: Option<SignalHook>,
) {
    let stream: &TcpStream = (*half).as_ref();
    let mut first_byte = [0u8; 1];
    loop {
        let peeked = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            r = stream.peek(&mut first_byte) => r,
        };
        match peeked {
            Ok(0) => {
                live.store(false, Ordering::SeqCst);
                debug!("tcp peer closed while idle");
                notify(&hook, TransportSignal::Lost);
                return;
            }
            Ok(_) => {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(MONITOR_BACKOFF) => {}
                }
            }
            Err(e) => {
                live.store(false, Ordering::SeqCst);
                warn!("tcp socket error while idle: {e}");
                notify(&hook, TransportSignal::Fault(e.into()));
                notify(&hook, TransportSignal::Lost);
                return;
            }
        }
    }
}

/// Pull everything the socket has without blocking.
fn drain(reader: &mut StagedReader, live: &AtomicBool) -> Result<(), LinkError> {
    while reader.staged.len() < MAX_STAGED {
        reader.staged.reserve(READ_CHUNK);
        match reader.half.try_read_buf(&mut reader.staged) {
            Ok(0) => {
                live.store(false, Ordering::SeqCst);
                if reader.staged.is_empty() {
                    return Err(LinkError::PeerClosed);
                }
                return Ok(());
            }
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                live.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn configure(&self, params: &ConnectionParams) -> Result<(), LinkError> {
        let addr = params.socket_addr()?;
        *lock(&self.addr) = Some(addr);
        Ok(())
    }

    async fn open(&self, timeout: Timeout) -> Result<(), LinkError> {
        if self.is_live() {
            return Ok(());
        }
        let addr = self.peer().ok_or(LinkError::NotConfigured)?;

        let stream = match within(timeout, TcpStream::connect(addr)).await {
            Some(r) => r?,
            None => return Err(LinkError::Timeout(timeout.bounded().unwrap_or_default())),
        };
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let read_half = Arc::new(read_half);

        *self.reader.lock().await = Some(StagedReader {
            half: Arc::clone(&read_half),
            staged: BytesMut::with_capacity(READ_CHUNK),
        });
        *self.writer.lock().await = Some(write_half);
        let stop = CancellationToken::new();
        std::mem::replace(&mut *lock(&self.shutdown), stop.clone()).cancel();
        self.live.store(true, Ordering::SeqCst);
        tokio::spawn(monitor(
            read_half,
            Arc::clone(&self.live),
            stop,
            self.signals.get(),
        ));

        info!("tcp connected to {addr}");
        Ok(())
    }

    async fn close(&self, timeout: Timeout) -> Result<(), LinkError> {
        lock(&self.shutdown).cancel();
        self.live.store(false, Ordering::SeqCst);

        let writer = self.writer.lock().await.take();
        let reader = self.reader.lock().await.take();
        if writer.is_none() && reader.is_none() {
            return Ok(());
        }

        if let Some(mut w) = writer {
            if let Some(Err(e)) = within(timeout, w.shutdown()).await {
                debug!("tcp shutdown: {e}");
            }
        }
        info!("tcp closed");
        Ok(())
    }

    async fn write(&self, data: &[u8], timeout: Timeout) -> Result<usize, LinkError> {
        let result = self
            .unless_closed(async {
                let mut guard = self.writer.lock().await;
                let w = guard.as_mut().ok_or(LinkError::NotOpen)?;

                let mut written = 0;
                let pump = async {
                    while written < data.len() {
                        let n = w.write(&data[written..]).await?;
                        if n == 0 {
                            return Err(io::Error::from(io::ErrorKind::WriteZero));
                        }
                        written += n;
                    }
                    w.flush().await
                };
                let outcome = within(timeout, pump).await;
                match outcome {
                    Some(Err(e)) => Err(e.into()),
                    _ => Ok(written),
                }
            })
            .await;
        if let Err(e) = &result {
            self.mark_dropped(e);
        }
        result
    }

    async fn peek_available(&self, timeout: Timeout) -> Result<usize, LinkError> {
        self.unless_closed(async {
            let mut guard = self.reader.lock().await;
            let reader = guard.as_mut().ok_or(LinkError::NotOpen)?;
            self.fill(reader, timeout).await?;
            Ok(reader.staged.len())
        })
        .await
    }

    async fn read_available(&self, timeout: Timeout) -> Result<Bytes, LinkError> {
        self.unless_closed(async {
            let mut guard = self.reader.lock().await;
            let reader = guard.as_mut().ok_or(LinkError::NotOpen)?;
            self.fill(reader, timeout).await?;
            Ok(reader.staged.split().freeze())
        })
        .await
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn set_signal_hook(&self, hook: SignalHook) {
        self.signals.set(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpTransport, TcpStream) {
        pair_with(None).await
    }

    async fn pair_with(hook: Option<SignalHook>) -> (TcpTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let t = TcpTransport::new();
        if let Some(hook) = hook {
            t.set_signal_hook(hook);
        }
        t.configure(&ConnectionParams::new(addr.ip().to_string(), addr.port() as u32))
            .unwrap();
        let (opened, accepted) = tokio::join!(t.open(Timeout::Infinite), listener.accept());
        opened.unwrap();
        (t, accepted.unwrap().0)
    }

    #[test]
    fn configure_rejects_bad_params() {
        let t = TcpTransport::new();
        assert!(t.configure(&ConnectionParams::new("999.999.1.1", 80)).is_err());
        assert!(t.configure(&ConnectionParams::new("127.0.0.1", 70000)).is_err());
        assert!(t.peer().is_none());
    }

    #[tokio::test]
    async fn open_without_params_fails() {
        let t = TcpTransport::new();
        assert!(matches!(
            t.open(Timeout::Infinite).await,
            Err(LinkError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn write_then_peer_reads() {
        let (t, mut peer) = pair().await;
        let n = t.write(b"scan", Timeout::from_millis(500)).await.unwrap();
        assert_eq!(n, 4);

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"scan");
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let (t, mut peer) = pair().await;
        peer.write_all(&[1, 2, 3]).await.unwrap();

        let n = t.peek_available(Timeout::from_millis(500)).await.unwrap();
        assert_eq!(n, 3);
        let again = t.peek_available(Timeout::Immediate).await.unwrap();
        assert_eq!(again, 3);

        let data = t.read_available(Timeout::Immediate).await.unwrap();
        assert_eq!(&data[..], &[1, 2, 3]);
        assert_eq!(t.peek_available(Timeout::Immediate).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_waits_no_longer_than_deadline() {
        let (t, _peer) = pair().await;
        let started = std::time::Instant::now();
        let data = t.read_available(Timeout::from_millis(50)).await.unwrap();
        assert!(data.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn peer_close_marks_not_live() {
        let (t, peer) = pair().await;
        assert!(t.is_live());
        drop(peer);

        let r = t.read_available(Timeout::from_millis(500)).await;
        assert!(matches!(r, Err(LinkError::PeerClosed)));
        assert!(!t.is_live());
    }

    #[tokio::test]
    async fn idle_peer_drop_is_signalled() {
        let (seen_tx, mut seen) = tokio::sync::mpsc::unbounded_channel();
        let hook: SignalHook = Arc::new(move |signal: TransportSignal| {
            let _ = seen_tx.send(signal);
        });
        let (t, peer) = pair_with(Some(hook)).await;
        drop(peer);

        let signal = tokio::time::timeout(Duration::from_secs(1), seen.recv())
            .await
            .expect("no signal after peer drop")
            .unwrap();
        assert!(matches!(signal, TransportSignal::Lost));
        assert!(!t.is_live());
    }

    #[tokio::test]
    async fn monitor_leaves_waiting_data_alone() {
        let (seen_tx, mut seen) = tokio::sync::mpsc::unbounded_channel();
        let hook: SignalHook = Arc::new(move |signal: TransportSignal| {
            let _ = seen_tx.send(signal);
        });
        let (t, mut peer) = pair_with(Some(hook)).await;
        peer.write_all(&[5, 6, 7]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(seen.try_recv().is_err());
        assert!(t.is_live());
        let data = t.read_available(Timeout::from_millis(500)).await.unwrap();
        assert_eq!(&data[..], &[5, 6, 7]);
    }

    #[tokio::test]
    async fn close_stops_the_monitor() {
        let (seen_tx, mut seen) = tokio::sync::mpsc::unbounded_channel();
        let hook: SignalHook = Arc::new(move |signal: TransportSignal| {
            let _ = seen_tx.send(signal);
        });
        let (t, peer) = pair_with(Some(hook)).await;
        t.close(Timeout::from_millis(200)).await.unwrap();
        drop(peer);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(seen.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (t, _peer) = pair().await;
        t.close(Timeout::from_millis(200)).await.unwrap();
        assert!(!t.is_live());
        t.close(Timeout::from_millis(200)).await.unwrap();
        assert!(matches!(
            t.write(b"x", Timeout::Immediate).await,
            Err(LinkError::NotOpen)
        ));
    }
}
