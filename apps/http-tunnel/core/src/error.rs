use std::{io, sync::Arc};

use thiserror::Error;

use crate::config::ConfigError;

/// Failure surfaced by tunnel operations and write completions.
///
/// Errors are `Clone` so a single failure can be fanned out to every
/// completion waiting on it.
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    #[error("tunnel is not connected")]
    NotConnected,
    #[error("tunnel is closing")]
    Closing,
    #[error("tunnel closed")]
    Closed,
    #[error("tunnel is not bound")]
    NotBound,
    #[error("already bound or in the process of binding")]
    AlreadyBound,
    #[error("only one poll request at a time per tunnel allowed")]
    PollSlotOccupied,
    #[error("unknown tunnel id {0}")]
    UnknownTunnel(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("proxy authentication failed: {0}")]
    ProxyAuthentication(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(Arc<io::Error>),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl TunnelError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Whether a fresh connection to the same peer could plausibly succeed.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::NotBound => "not_bound",
            Self::AlreadyBound => "already_bound",
            Self::PollSlotOccupied => "poll_slot_occupied",
            Self::UnknownTunnel(_) => "unknown_tunnel",
            Self::Protocol(_) => "protocol",
            Self::ProxyAuthentication(_) => "proxy_auth",
            Self::Transport(_) => "transport",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
        }
    }
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<http::Error> for TunnelError {
    fn from(err: http::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
