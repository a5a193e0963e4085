use std::{fmt, sync::Arc, time::Duration};

use http_tunnel_core::{
    config::parse_number,
    incoming::{DEFAULT_BOUNDS, DEFAULT_CAPACITY},
    ConfigError, SequentialTunnelIdGenerator, TunnelConfig, TunnelIdGenerator,
};

pub const OPTION_INCOMING_CAPACITY: &str = "incomingcapacity";
pub const OPTION_INCOMING_BOUNDS: &str = "incomingbounds";

/// Settings applied to every tunnel the server accepts. Changes affect
/// tunnels opened afterwards.
#[derive(Clone)]
pub struct ServerConfig {
    pub tunnel: TunnelConfig,
    pub incoming_capacity: usize,
    pub incoming_bounds: usize,
    pub shutdown_grace: Duration,
    id_generator: Arc<dyn TunnelIdGenerator>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tunnel: TunnelConfig::default(),
            incoming_capacity: DEFAULT_CAPACITY,
            incoming_bounds: DEFAULT_BOUNDS,
            shutdown_grace: Duration::from_secs(5),
            id_generator: Arc::new(SequentialTunnelIdGenerator::default()),
        }
    }
}

impl ServerConfig {
    pub fn new(tunnel: TunnelConfig) -> Self {
        Self {
            tunnel,
            ..Self::default()
        }
    }

    pub fn id_generator(&self) -> &Arc<dyn TunnelIdGenerator> {
        &self.id_generator
    }

    pub fn with_id_generator(mut self, generator: Arc<dyn TunnelIdGenerator>) -> Self {
        self.id_generator = generator;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn set_option(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        match key.to_ascii_lowercase().as_str() {
            OPTION_INCOMING_CAPACITY => {
                self.incoming_capacity = parse_number(key, value)? as usize;
                Ok(true)
            }
            OPTION_INCOMING_BOUNDS => {
                self.incoming_bounds = parse_number(key, value)? as usize;
                Ok(true)
            }
            _ => self.tunnel.set_option(key, value),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("tunnel", &self.tunnel)
            .field("incoming_capacity", &self.incoming_capacity)
            .field("incoming_bounds", &self.incoming_bounds)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}
