//! Client end of the HTTP tunnel.

pub mod auth;
pub mod config;
mod connection;
mod poll;
mod send;
mod tunnel;

pub use auth::{ProxyAuthError, ProxyAuthNegotiator, ProxyCredentials};
pub use config::ClientConfig;
pub use tunnel::TunnelClient;
