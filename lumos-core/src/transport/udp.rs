//! Datagram-socket transport.
//!
//! With an address the socket binds an ephemeral port and connects to
//! the sensor. With a wildcard endpoint it listens on the given port and
//! replies to whichever peer sent the last datagram.
//!
//! A datagram socket never "drops", but it can still surface errors
//! between operations (an ICMP port-unreachable after a send, say). A
//! monitor task reports those as faults.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ConnectionParams, MONITOR_BACKOFF, READ_CHUNK, SignalHook, SignalSlot, Transport,
    TransportKind, TransportSignal, lock, notify, within,
};
use crate::error::LinkError;
use crate::state::Timeout;

/// Largest UDP payload.
const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Clone, Copy)]
struct Target {
    addr: SocketAddr,
    listen: bool,
}

/// UDP transport.
pub struct UdpTransport {
    target: Mutex<Option<Target>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    /// Source of the most recent datagram (listen mode reply target).
    last_peer: Mutex<Option<SocketAddr>>,
    staged: tokio::sync::Mutex<BytesMut>,
    shutdown: Mutex<CancellationToken>,
    live: AtomicBool,
    signals: SignalSlot,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self {
            target: Mutex::new(None),
            socket: Mutex::new(None),
            last_peer: Mutex::new(None),
            staged: tokio::sync::Mutex::new(BytesMut::new()),
            shutdown: Mutex::new(CancellationToken::new()),
            live: AtomicBool::new(false),
            signals: SignalSlot::default(),
        }
    }

    /// Local address of the open socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.socket).as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Whether the configured endpoint was a wildcard.
    pub fn is_listening(&self) -> bool {
        lock(&self.target).is_some_and(|t| t.listen)
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, LinkError> {
        lock(&self.socket).clone().ok_or(LinkError::NotOpen)
    }

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

    /// Move every queued datagram into `staged` without blocking.
    fn drain(&self, socket: &UdpSocket, staged: &mut BytesMut) -> Result<(), LinkError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match socket.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    staged.extend_from_slice(&buf[..n]);
                    *lock(&self.last_peer) = Some(from);
                    if staged.len() >= READ_CHUNK * 64 {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn fill(&self, staged: &mut BytesMut, timeout: Timeout) -> Result<(), LinkError> {
        let socket = self.socket()?;
        self.drain(&socket, staged)?;
        if staged.is_empty() && timeout.waits() {
            let wait = async {
                loop {
                    socket.readable().await?;
                    self.drain(&socket, staged)?;
                    if !staged.is_empty() {
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

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        lock(&self.shutdown).cancel();
    }
}

/// Report socket errors raised while idle until `stop` fires.
async fn monitor(socket: Arc<UdpSocket>, stop: CancellationToken, hook: Option<SignalHook>) {
    loop {
        let peeked = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            r = socket.peek_sender() => r,
        };
        if let Err(e) = peeked {
            warn!("udp socket error while idle: {e}");
            notify(&hook, TransportSignal::Fault(e.into()));
        }
        // Either a datagram is waiting for the reader or the error was
        // just consumed; look again later.
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(MONITOR_BACKOFF) => {}
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn configure(&self, params: &ConnectionParams) -> Result<(), LinkError> {
        let (addr, listen) = params.socket_addr_or_wildcard()?;
        *lock(&self.target) = Some(Target { addr, listen });
        Ok(())
    }

    async fn open(&self, timeout: Timeout) -> Result<(), LinkError> {
        if self.is_live() {
            return Ok(());
        }
        let target = (*lock(&self.target)).ok_or(LinkError::NotConfigured)?;

        let setup = async {
            if target.listen {
                UdpSocket::bind(target.addr).await
            } else {
                let any = match target.addr.ip() {
                    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                };
                let socket = UdpSocket::bind(SocketAddr::new(any, 0)).await?;
                socket.connect(target.addr).await?;
                Ok(socket)
            }
        };
        let socket = match within(timeout, setup).await {
            Some(r) => r?,
            None => return Err(LinkError::Timeout(timeout.bounded().unwrap_or_default())),
        };

        self.staged.lock().await.clear();
        *lock(&self.last_peer) = None;
        let socket = Arc::new(socket);
        *lock(&self.socket) = Some(Arc::clone(&socket));
        let stop = CancellationToken::new();
        std::mem::replace(&mut *lock(&self.shutdown), stop.clone()).cancel();
        self.live.store(true, Ordering::SeqCst);
        tokio::spawn(monitor(socket, stop, self.signals.get()));

        if target.listen {
            info!("udp listening on {}", target.addr);
        } else {
            info!("udp connected to {}", target.addr);
        }
        Ok(())
    }

    async fn close(&self, _timeout: Timeout) -> Result<(), LinkError> {
        lock(&self.shutdown).cancel();
        self.live.store(false, Ordering::SeqCst);
        let socket = lock(&self.socket).take();
        if socket.is_some() {
            self.staged.lock().await.clear();
            debug!("udp socket released");
        }
        Ok(())
    }

    async fn write(&self, data: &[u8], timeout: Timeout) -> Result<usize, LinkError> {
        let socket = self.socket()?;
        let listen = self.is_listening();
        let peer = *lock(&self.last_peer);
        self.unless_closed(async {
            let send = async {
                if listen {
                    let peer = peer.ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
                    socket.send_to(data, peer).await
                } else {
                    socket.send(data).await
                }
            };
            match within(timeout, send).await {
                Some(r) => Ok(r?),
                None => Ok(0),
            }
        })
        .await
    }

    async fn peek_available(&self, timeout: Timeout) -> Result<usize, LinkError> {
        self.unless_closed(async {
            let mut staged = self.staged.lock().await;
            self.fill(&mut staged, timeout).await?;
            Ok(staged.len())
        })
        .await
    }

    async fn read_available(&self, timeout: Timeout) -> Result<Bytes, LinkError> {
        self.unless_closed(async {
            let mut staged = self.staged.lock().await;
            self.fill(&mut staged, timeout).await?;
            Ok(staged.split().freeze())
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
