//! Serial-line transport.
//!
//! `serialport` is blocking, so every call runs on Tokio's blocking pool.
//! Waits are polled in short slices so `close` can interrupt them.
//! Between operations a monitor polls the port so an unplugged device is
//! reported even when nobody is reading.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ConnectionParams, READ_CHUNK, SerialOptions, SerialParity, SignalHook, SignalSlot, Transport,
    TransportExtra, TransportKind, TransportSignal, lock, notify,
};
use crate::error::LinkError;
use crate::state::Timeout;

/// Poll period while waiting for bytes or write room.
const POLL_SLICE: Duration = Duration::from_millis(2);
/// Driver timeout for a single blocking write attempt.
const WRITE_SLICE: Duration = Duration::from_millis(100);
/// How often the monitor looks at an idle port.
const MONITOR_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct LineConfig {
    name: String,
    baud: u32,
    options: SerialOptions,
}

type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

/// Serial port transport.
pub struct SerialTransport {
    config: Mutex<Option<LineConfig>>,
    port: SharedPort,
    /// Set while closing so blocked waits give up.
    closing: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
    monitor: Mutex<CancellationToken>,
    signals: SignalSlot,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self {
            config: Mutex::new(None),
            port: Arc::new(Mutex::new(None)),
            closing: Arc::new(AtomicBool::new(false)),
            live: Arc::new(AtomicBool::new(false)),
            monitor: Mutex::new(CancellationToken::new()),
            signals: SignalSlot::default(),
        }
    }

    /// Configured port name.
    pub fn port_name(&self) -> Option<String> {
        lock(&self.config).as_ref().map(|c| c.name.clone())
    }

    /// Run `f` against the open port on the blocking pool.
    async fn with_port<T, F>(&self, f: F) -> Result<T, LinkError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn SerialPort, &AtomicBool) -> Result<T, LinkError> + Send + 'static,
    {
        let port = Arc::clone(&self.port);
        let closing = Arc::clone(&self.closing);
        let live = Arc::clone(&self.live);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&port);
            let p = guard.as_mut().ok_or(LinkError::NotOpen)?;
            let result = f(p.as_mut(), &closing);
            if let Err(e) = &result {
                if e.is_disconnect() {
                    live.store(false, Ordering::SeqCst);
                }
            }
            result
        })
        .await?
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        lock(&self.monitor).cancel();
    }
}

/// Poll the idle port for errors until `stop` fires or the device goes.
async fn monitor(
    port: SharedPort,
    live: Arc<AtomicBool>,
    stop: CancellationToken,
    hook: Option<SignalHook>,
) {
    let mut tick = tokio::time::interval(MONITOR_PERIOD);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // A persistent error is reported once, not every period.
    let mut reported: Option<i32> = None;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = tick.tick() => {}
        }
        let port = Arc::clone(&port);
        let checked = tokio::task::spawn_blocking(move || {
            // A running operation owns the port and sees its errors itself.
            let Ok(mut guard) = port.try_lock() else {
                return Ok(());
            };
            match guard.as_mut() {
                Some(p) => p.bytes_to_read().map(|_| ()).map_err(LinkError::from),
                None => Ok(()),
            }
        })
        .await;
        let err = match checked {
            Ok(Ok(())) => {
                reported = None;
                continue;
            }
            Ok(Err(e)) => e,
            Err(e) => e.into(),
        };
        if stop.is_cancelled() {
            return;
        }
        let gone = err.is_disconnect();
        if reported != Some(err.alert_code()) {
            warn!("serial port error while idle: {err}");
            reported = Some(err.alert_code());
            notify(&hook, TransportSignal::Fault(err));
        }
        if gone {
            live.store(false, Ordering::SeqCst);
            notify(&hook, TransportSignal::Lost);
            return;
        }
    }
}

fn deadline_of(timeout: Timeout) -> Option<Instant> {
    match timeout {
        Timeout::Infinite => None,
        Timeout::Immediate => Some(Instant::now()),
        Timeout::After(d) => Some(Instant::now() + d),
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Poll until bytes are waiting, the deadline passes, or the port closes.
fn wait_readable(
    port: &mut dyn SerialPort,
    closing: &AtomicBool,
    timeout: Timeout,
) -> Result<usize, LinkError> {
    let deadline = deadline_of(timeout);
    loop {
        let n = port.bytes_to_read()? as usize;
        if n > 0 || expired(deadline) || closing.load(Ordering::SeqCst) {
            return Ok(n);
        }
        std::thread::sleep(POLL_SLICE);
    }
}

fn write_all_until(
    port: &mut dyn SerialPort,
    closing: &AtomicBool,
    data: &[u8],
    timeout: Timeout,
) -> Result<usize, LinkError> {
    let deadline = deadline_of(timeout);
    let mut written = 0;
    while written < data.len() && !closing.load(Ordering::SeqCst) {
        let slice = match deadline {
            Some(d) => d.saturating_duration_since(Instant::now()).clamp(Duration::from_millis(1), WRITE_SLICE),
            None => WRITE_SLICE,
        };
        port.set_timeout(slice)?;
        match port.write(&data[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
        if written < data.len() && expired(deadline) {
            break;
        }
    }
    if written == data.len() {
        port.flush()?;
    }
    Ok(written)
}

fn data_bits(bits: u8) -> Option<DataBits> {
    match bits {
        5 => Some(DataBits::Five),
        6 => Some(DataBits::Six),
        7 => Some(DataBits::Seven),
        8 => Some(DataBits::Eight),
        _ => None,
    }
}

fn stop_bits(bits: u8) -> Option<StopBits> {
    match bits {
        1 => Some(StopBits::One),
        2 => Some(StopBits::Two),
        _ => None,
    }
}

fn parity(p: SerialParity) -> Parity {
    match p {
        SerialParity::None => Parity::None,
        SerialParity::Odd => Parity::Odd,
        SerialParity::Even => Parity::Even,
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn configure(&self, params: &ConnectionParams) -> Result<(), LinkError> {
        let name = params.endpoint.trim();
        if name.is_empty() {
            return Err(LinkError::InvalidParams("empty serial port name".into()));
        }
        if params.number == 0 {
            return Err(LinkError::InvalidParams("baud rate must be non-zero".into()));
        }
        let options = match &params.extra {
            TransportExtra::Serial(options) => *options,
            TransportExtra::None => SerialOptions::default(),
        };
        if data_bits(options.data_bits).is_none() || stop_bits(options.stop_bits).is_none() {
            return Err(LinkError::InvalidParams(format!(
                "unsupported framing {}/{}",
                options.data_bits, options.stop_bits
            )));
        }
        *lock(&self.config) = Some(LineConfig {
            name: name.to_string(),
            baud: params.number,
            options,
        });
        Ok(())
    }

    async fn open(&self, _timeout: Timeout) -> Result<(), LinkError> {
        if self.is_live() {
            return Ok(());
        }
        let cfg = lock(&self.config).clone().ok_or(LinkError::NotConfigured)?;
        let port = Arc::clone(&self.port);
        self.closing.store(false, Ordering::SeqCst);

        let name = cfg.name.clone();
        tokio::task::spawn_blocking(move || {
            let opened = serialport::new(&cfg.name, cfg.baud)
                .data_bits(data_bits(cfg.options.data_bits).unwrap_or(DataBits::Eight))
                .parity(parity(cfg.options.parity))
                .stop_bits(stop_bits(cfg.options.stop_bits).unwrap_or(StopBits::One))
                .flow_control(if cfg.options.hardware_flow_control {
                    FlowControl::Hardware
                } else {
                    FlowControl::None
                })
                .timeout(WRITE_SLICE)
                .open()?;
            *lock(&port) = Some(opened);
            Ok::<_, LinkError>(())
        })
        .await??;

        self.live.store(true, Ordering::SeqCst);
        let stop = CancellationToken::new();
        std::mem::replace(&mut *lock(&self.monitor), stop.clone()).cancel();
        tokio::spawn(monitor(
            Arc::clone(&self.port),
            Arc::clone(&self.live),
            stop,
            self.signals.get(),
        ));
        info!("serial port {name} open");
        Ok(())
    }

    async fn close(&self, _timeout: Timeout) -> Result<(), LinkError> {
        self.closing.store(true, Ordering::SeqCst);
        self.live.store(false, Ordering::SeqCst);
        lock(&self.monitor).cancel();
        let port = Arc::clone(&self.port);
        let released = tokio::task::spawn_blocking(move || lock(&port).take().is_some()).await?;
        if released {
            debug!("serial port released");
        }
        Ok(())
    }

    async fn write(&self, data: &[u8], timeout: Timeout) -> Result<usize, LinkError> {
        let data = data.to_vec();
        self.with_port(move |port, closing| write_all_until(port, closing, &data, timeout))
            .await
    }

    async fn peek_available(&self, timeout: Timeout) -> Result<usize, LinkError> {
        self.with_port(move |port, closing| wait_readable(port, closing, timeout))
            .await
    }

    async fn read_available(&self, timeout: Timeout) -> Result<Bytes, LinkError> {
        self.with_port(move |port, closing| {
            let n = wait_readable(port, closing, timeout)?;
            if n == 0 {
                return Ok(Bytes::new());
            }
            let mut buf = vec![0u8; n.min(READ_CHUNK * 16)];
            port.set_timeout(WRITE_SLICE)?;
            let got = port.read(&mut buf)?;
            buf.truncate(got);
            Ok(Bytes::from(buf))
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
