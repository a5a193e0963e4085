//! Server side of the HTTP tunnel: accepts open/send/poll/close requests
//! from tunnel clients and exposes each tunnel as an [`AcceptedTunnel`].

mod accepted;
pub mod config;
mod error;
mod pipeline;
mod registry;
mod routes;
mod server;

pub use accepted::{AcceptedTunnel, TunnelSnapshot};
pub use config::ServerConfig;
pub use error::ServerError;
pub use pipeline::{AcceptQueue, Accepted, PipelineFactory};
pub use registry::TunnelRegistry;
pub use routes::router;
pub use server::TunnelServer;
