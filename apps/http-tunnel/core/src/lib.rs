//! Building blocks shared by both ends of an HTTP tunnel.
//!
//! A tunnel carries a full-duplex byte stream over plain HTTP 1.x: the client
//! pushes bytes with `send` requests and long-polls for bytes flowing the other
//! way. This crate holds the pieces both sides agree on (wire vocabulary,
//! configuration, flow control, inbound buffering and lifecycle events) so the
//! client and server crates only differ in how they drive the exchanges.

pub mod completion;
pub mod config;
pub mod error;
pub mod event;
pub mod incoming;
pub mod protocol;
pub mod saturation;
pub mod state;
pub mod tunnel_id;

pub use completion::{completion, Completer, Completion};
pub use config::{ConfigError, TunnelConfig, WaterMarks};
pub use error::TunnelError;
pub use event::{EventSink, EventStream, TunnelEvent};
pub use incoming::IncomingBuffer;
pub use saturation::{SaturationManager, SaturationStateChange};
pub use state::{BindState, ConnectState, InterestOps, StateCell};
pub use tunnel_id::{SequentialTunnelIdGenerator, TunnelId, TunnelIdGenerator};
