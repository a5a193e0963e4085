use std::sync::Arc;

use http_tunnel_core::EventStream;
use tokio::sync::mpsc;

use crate::{accepted::AcceptedTunnel, error::ServerError};

/// Receives every tunnel the server accepts, together with its event
/// stream. Failing to attach closes the tunnel again.
pub trait PipelineFactory: Send + Sync + 'static {
    fn attach(&self, tunnel: Arc<AcceptedTunnel>, events: EventStream) -> Result<(), ServerError>;
}

impl<F> PipelineFactory for F
where
    F: Fn(Arc<AcceptedTunnel>, EventStream) -> Result<(), ServerError> + Send + Sync + 'static,
{
    fn attach(&self, tunnel: Arc<AcceptedTunnel>, events: EventStream) -> Result<(), ServerError> {
        self(tunnel, events)
    }
}

#[derive(Debug)]
pub struct Accepted {
    pub tunnel: Arc<AcceptedTunnel>,
    pub events: EventStream,
}

/// Pipeline that queues accepted tunnels for [`crate::TunnelServer::accept`].
#[derive(Clone)]
pub struct AcceptQueue {
    tx: mpsc::UnboundedSender<Accepted>,
}

impl AcceptQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Accepted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PipelineFactory for AcceptQueue {
    fn attach(&self, tunnel: Arc<AcceptedTunnel>, events: EventStream) -> Result<(), ServerError> {
        self.tx
            .send(Accepted { tunnel, events })
            .map_err(|_| ServerError::AcceptQueueClosed)
    }
}
