//! Headless viewer loop.
//!
//! The [`Controller`] owns the link and polls it on a fixed cadence: when
//! the link is idle and bytes are waiting, it schedules an async receive.
//! Link events are drained on the same task and handed to [`ScanView`],
//! which decodes received bytes into the point buffer.

use std::time::Duration;

use bytes::BytesMut;
use lumos_core::{
    CommLink, EventReceiver, IoMode, LinkError, LinkId, LinkListener, LinkStatus, ProgressKind,
    RxBuffer, Timeout, event_channel,
};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloud::PointCloud;
use crate::codec::SampleCodec;
use crate::config::ViewerConfig;

// ── ScanView ─────────────────────────────────────────────────────

/// Listener side of the viewer: status, alerts, and the point buffer.
#[derive(Debug)]
pub struct ScanView {
    cloud: PointCloud,
    codec: SampleCodec,
    /// Received bytes not yet forming a whole sample.
    pending: BytesMut,
    rx: RxBuffer,
    status: LinkStatus,
    last_alert: Option<String>,
    samples: u64,
    lost: bool,
}

impl ScanView {
    pub fn new(cloud: PointCloud) -> Self {
        Self {
            cloud,
            codec: SampleCodec,
            pending: BytesMut::new(),
            rx: RxBuffer::new(),
            status: LinkStatus::Closed,
            last_alert: None,
            samples: 0,
            lost: false,
        }
    }

    pub fn cloud(&self) -> &PointCloud {
        &self.cloud
    }

    /// Last status seen on the event queue.
    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn last_alert(&self) -> Option<&str> {
        self.last_alert.as_deref()
    }

    /// Samples decoded since start.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    fn absorb(&mut self) {
        let data = self.rx.take();
        self.pending.extend_from_slice(&data);
        let mut added = 0usize;
        while let Ok(Some(sample)) = self.codec.decode(&mut self.pending) {
            if self.cloud.append_sample(sample.angle_deg, sample.distance) {
                added += 1;
            }
        }
        self.samples += added as u64;
        debug!("decoded {added} samples ({} bytes carried)", self.pending.len());
    }
}

impl LinkListener for ScanView {
    fn on_status_changed(&mut self, link: LinkId, status: LinkStatus) {
        self.status = status;
        match status {
            LinkStatus::Received => self.absorb(),
            LinkStatus::Connecting => info!("link {link} connecting..."),
            LinkStatus::Connected => {
                self.lost = false;
                info!("link {link} connected");
            }
            LinkStatus::ConnectFailed | LinkStatus::ConnectionLost => {
                self.lost = status == LinkStatus::ConnectionLost;
                warn!("link {link} connection error ({status})");
            }
            LinkStatus::Closed => {
                self.pending.clear();
                info!("link {link} disconnected");
            }
            LinkStatus::DisconnectFailed | LinkStatus::SendFailed | LinkStatus::ReceiveFailed => {
                warn!("link {link} {status}");
            }
            _ => debug!("link {link} {status}"),
        }
    }

    fn on_progress(&mut self, link: LinkId, kind: ProgressKind, bytes: usize) {
        debug!("link {link} {kind:?}: {bytes} bytes");
    }

    fn on_alert(&mut self, link: LinkId, code: i32, message: &str) {
        warn!("link {link} alert {code}: {message}");
        self.last_alert = Some(message.to_string());
    }
}

// ── Controller ───────────────────────────────────────────────────

pub struct Controller {
    link: CommLink,
    events: EventReceiver,
    view: ScanView,
    config: ViewerConfig,
    demo_ridged: bool,
}

impl Controller {
    /// Build the link described by `config`. Must run inside a Tokio
    /// runtime.
    pub fn new(config: ViewerConfig) -> Result<Self, LinkError> {
        let (tx, events) = event_channel();
        let link = CommLink::new(0, config.link.kind, tx);
        let params = config.link.params();
        if !link.set_connection_params(params.clone()) {
            return Err(LinkError::InvalidParams(params.to_string()));
        }
        let t = &config.timeouts;
        link.configure_timeouts(
            t.watchdog,
            t.watchdog_interval_ms,
            t.connect,
            t.send,
            t.receive,
        );

        let cloud = PointCloud::new(config.cloud.resolution_deg, config.cloud.pixels_per_meter);
        Ok(Self {
            link,
            events,
            view: ScanView::new(cloud),
            config,
            demo_ridged: false,
        })
    }

    pub fn link(&self) -> &CommLink {
        &self.link
    }

    pub fn view(&self) -> &ScanView {
        &self.view
    }

    pub fn cloud(&self) -> &PointCloud {
        self.view.cloud()
    }

    pub async fn connect(&self) -> bool {
        self.link.connect(self.config.link.connect_timeout()).await
    }

    pub async fn close(&self) -> bool {
        self.link.close(self.config.link.connect_timeout()).await
    }

    /// One refresh: schedule a receive when the link is idle and has
    /// bytes waiting.
    pub async fn tick(&mut self) {
        if self.view.lost && self.config.link.auto_reconnect {
            self.view.lost = false;
            if self.link.reconnect().await {
                info!("link {} reconnected", self.link.id());
            }
        }

        if self.link.is_idle() && self.link.poll_inbox(Timeout::Immediate, IoMode::Sync).await {
            self.link
                .receive(&self.view.rx, self.config.poll.receive_timeout(), IoMode::Async)
                .await;
        } else if self.config.cloud.demo && !self.link.is_busy() {
            self.view.cloud.fill_demo(self.demo_ridged);
            self.demo_ridged = !self.demo_ridged;
        }
    }

    /// Dispatch every queued event; returns how many there were.
    pub fn pump_events(&mut self) -> usize {
        let mut n = 0;
        while let Ok(ev) = self.events.try_recv() {
            ev.dispatch(&mut self.view);
            n += 1;
        }
        n
    }

    /// Refresh and dispatch until `shutdown` fires, then close the link.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let period = Duration::from_millis(self.config.poll.interval_ms.max(1));
        let mut refresh = tokio::time::interval(period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = refresh.tick() => self.tick().await,
                Some(ev) = self.events.recv() => ev.dispatch(&mut self.view),
            }
        }

        info!("shutting down");
        if !self.link.is_on_error() {
            self.close().await;
        }
        self.pump_events();
    }
}
