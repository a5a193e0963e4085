use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::state::InterestOps;

/// Lifecycle and data notifications published by a tunnel.
///
/// A tunnel that opens, binds, connects and closes emits `Open`, `Bound`,
/// `Connected`, then `Disconnected`, `Unbound` and `Closed`, in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Open,
    Bound(SocketAddr),
    Connected(SocketAddr),
    Message(Bytes),
    InterestChanged(InterestOps),
    WriteComplete(usize),
    Disconnected,
    Unbound,
    Closed,
    Error(String),
}

impl TunnelEvent {
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Open
                | Self::Bound(_)
                | Self::Connected(_)
                | Self::Disconnected
                | Self::Unbound
                | Self::Closed
        )
    }
}

pub type EventStream = mpsc::UnboundedReceiver<TunnelEvent>;

/// Sending half of a tunnel's event stream. Firing never blocks; events for
/// a consumer that went away are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TunnelEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn from_sender(tx: mpsc::UnboundedSender<TunnelEvent>) -> Self {
        Self { tx }
    }

    pub fn fire(&self, event: TunnelEvent) {
        if let Err(err) = self.tx.send(event) {
            trace!(event = ?err.0, "event consumer gone; dropping event");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
