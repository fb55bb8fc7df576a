//! Link notifications.
//!
//! A link never calls back into its owner directly. Every status change,
//! progress report and alert is queued on an unbounded channel in the
//! order it happened; the owner drains the queue on its own task and
//! hands each event to a [`LinkListener`].

use tokio::sync::mpsc;

use crate::state::LinkStatus;

/// Identifier a link stamps on every event it emits.
pub type LinkId = u32;

pub type EventSender = mpsc::UnboundedSender<LinkEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

/// Create the queue a link publishes on.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// What a progress report counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressKind {
    /// Bytes accepted by the transport.
    Sending,
    /// Bytes delivered by a receive.
    Receiving,
    /// Bytes waiting to be received.
    InboxReady,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Status {
        link: LinkId,
        status: LinkStatus,
    },
    Progress {
        link: LinkId,
        kind: ProgressKind,
        bytes: usize,
    },
    Alert {
        link: LinkId,
        code: i32,
        message: String,
    },
}

impl LinkEvent {
    pub fn link(&self) -> LinkId {
        match self {
            Self::Status { link, .. } | Self::Progress { link, .. } | Self::Alert { link, .. } => {
                *link
            }
        }
    }

    /// Deliver this event to `listener`.
    pub fn dispatch<L: LinkListener + ?Sized>(self, listener: &mut L) {
        match self {
            Self::Status { link, status } => listener.on_status_changed(link, status),
            Self::Progress { link, kind, bytes } => listener.on_progress(link, kind, bytes),
            Self::Alert {
                link,
                code,
                message,
            } => listener.on_alert(link, code, &message),
        }
    }
}

/// Receiver side of link notifications.
pub trait LinkListener {
    fn on_status_changed(&mut self, link: LinkId, status: LinkStatus);

    fn on_progress(&mut self, link: LinkId, kind: ProgressKind, bytes: usize) {
        let _ = (link, kind, bytes);
    }

    fn on_alert(&mut self, link: LinkId, code: i32, message: &str) {
        let _ = (link, code, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        statuses: Vec<LinkStatus>,
        progress: Vec<(ProgressKind, usize)>,
        alerts: Vec<i32>,
    }

    impl LinkListener for Recorder {
        fn on_status_changed(&mut self, _link: LinkId, status: LinkStatus) {
            self.statuses.push(status);
        }

        fn on_progress(&mut self, _link: LinkId, kind: ProgressKind, bytes: usize) {
            self.progress.push((kind, bytes));
        }

        fn on_alert(&mut self, _link: LinkId, code: i32, _message: &str) {
            self.alerts.push(code);
        }
    }

    #[test]
    fn dispatch_routes_by_variant() {
        let mut rec = Recorder::default();
        LinkEvent::Status {
            link: 1,
            status: LinkStatus::Connecting,
        }
        .dispatch(&mut rec);
        LinkEvent::Progress {
            link: 1,
            kind: ProgressKind::InboxReady,
            bytes: 42,
        }
        .dispatch(&mut rec);
        LinkEvent::Alert {
            link: 1,
            code: 9001,
            message: "bad".into(),
        }
        .dispatch(&mut rec);

        assert_eq!(rec.statuses, vec![LinkStatus::Connecting]);
        assert_eq!(rec.progress, vec![(ProgressKind::InboxReady, 42)]);
        assert_eq!(rec.alerts, vec![9001]);
    }

    #[tokio::test]
    async fn queue_preserves_order() {
        let (tx, mut rx) = event_channel();
        for status in [LinkStatus::Connecting, LinkStatus::Connected, LinkStatus::Ready] {
            tx.send(LinkEvent::Status { link: 7, status }).unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            assert_eq!(ev.link(), 7);
            if let LinkEvent::Status { status, .. } = ev {
                seen.push(status);
            }
        }
        assert_eq!(
            seen,
            vec![LinkStatus::Connecting, LinkStatus::Connected, LinkStatus::Ready]
        );
    }
}
