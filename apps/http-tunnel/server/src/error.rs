use std::{io, net::SocketAddr};

use http_tunnel_core::{TunnelError, TunnelId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("tunnel id {0} is already in use")]
    DuplicateTunnelId(TunnelId),
    #[error("accept queue closed")]
    AcceptQueueClosed,
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

impl ServerError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::DuplicateTunnelId(_) => "duplicate_id",
            Self::AcceptQueueClosed => "accept_queue_closed",
            Self::Tunnel(err) => err.metric_label(),
        }
    }
}
