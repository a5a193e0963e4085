use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use http_tunnel_core::{ConfigError, EventSink, EventStream, TunnelId};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{
    accepted::{AcceptedTunnel, TunnelSnapshot},
    config::ServerConfig,
    error::ServerError,
    pipeline::PipelineFactory,
};

/// Live tunnels of one server, keyed by tunnel id.
#[derive(Clone)]
pub struct TunnelRegistry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    tunnels: DashMap<TunnelId, Arc<AcceptedTunnel>>,
    prefix: String,
    config: RwLock<ServerConfig>,
    pipeline: Arc<dyn PipelineFactory>,
    local_addr: RwLock<Option<SocketAddr>>,
    total_opened: AtomicU64,
}

impl RegistryInner {
    pub(crate) fn holds(&self, id: &TunnelId, tunnel: &AcceptedTunnel) -> bool {
        self.tunnels
            .get(id.as_str())
            .map_or(false, |entry| std::ptr::eq(Arc::as_ptr(entry.value()), tunnel))
    }

    pub(crate) fn remove(&self, id: &TunnelId, tunnel: &AcceptedTunnel) {
        let removed = self
            .tunnels
            .remove_if(id.as_str(), |_, current| {
                std::ptr::eq(Arc::as_ptr(current), tunnel)
            })
            .is_some();
        if removed {
            gauge!("http_tunnel_server_open_tunnels", self.tunnels.len() as f64);
            debug!(tunnel_id = %id, "tunnel removed from registry");
        }
    }
}

impl TunnelRegistry {
    pub fn new(config: ServerConfig, pipeline: Arc<dyn PipelineFactory>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tunnels: DashMap::new(),
                prefix: format!("{:x}", rand::random::<u64>()),
                config: RwLock::new(config),
                pipeline,
                local_addr: RwLock::new(None),
                total_opened: AtomicU64::new(0),
            }),
        }
    }

    /// Random per-server prefix of every tunnel id handed out.
    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    pub fn config(&self) -> ServerConfig {
        self.inner.config.read().clone()
    }

    /// Applies to tunnels opened after the call.
    pub fn set_option(&self, key: &str, value: &str) -> Result<bool, ConfigError> {
        self.inner.config.write().set_option(key, value)
    }

    pub fn user_agent(&self) -> String {
        self.inner.config.read().tunnel.user_agent().to_string()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read()
    }

    pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
        *self.inner.local_addr.write() = Some(addr);
    }

    pub fn get(&self, id: &str) -> Option<Arc<AcceptedTunnel>> {
        self.inner
            .tunnels
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.tunnels.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tunnels.is_empty()
    }

    pub fn total_opened(&self) -> u64 {
        self.inner.total_opened.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<TunnelSnapshot> {
        let mut tunnels: Vec<_> = self
            .inner
            .tunnels
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        tunnels.sort_by(|a, b| a.tunnel_id.cmp(&b.tunnel_id));
        tunnels
    }

    /// Opens a tunnel for a client at `remote` and hands it to the pipeline.
    pub fn open_tunnel(&self, remote: SocketAddr) -> Result<Arc<AcceptedTunnel>, ServerError> {
        let (tunnel, events) = self.create_tunnel(remote)?;
        if let Err(err) = self.inner.pipeline.attach(Arc::clone(&tunnel), events) {
            warn!(tunnel_id = %tunnel.id(), error = %err, "pipeline rejected tunnel");
            tunnel.close();
            return Err(err);
        }
        Ok(tunnel)
    }

    /// Registers a new tunnel and returns it with its event stream.
    pub(crate) fn create_tunnel(
        &self,
        remote: SocketAddr,
    ) -> Result<(Arc<AcceptedTunnel>, EventStream), ServerError> {
        let config = self.config();
        let id = TunnelId::from(format!(
            "{}_{}",
            self.inner.prefix,
            config.id_generator().generate_id()
        ));
        let local = self
            .local_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (sink, events) = EventSink::channel();
        let tunnel = AcceptedTunnel::new(
            id.clone(),
            remote,
            local,
            Arc::downgrade(&self.inner),
            &config,
            sink,
        );

        let inserted = match self.inner.tunnels.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&tunnel));
                true
            }
        };
        if !inserted {
            counter!("http_tunnel_server_open_failures_total", 1, "reason" => "duplicate_id");
            tunnel.close();
            return Err(ServerError::DuplicateTunnelId(id));
        }
        tunnel.fire_opened();
        tunnel.ping();

        self.inner.total_opened.fetch_add(1, Ordering::Relaxed);
        counter!("http_tunnel_server_tunnels_opened_total", 1);
        gauge!("http_tunnel_server_open_tunnels", self.len() as f64);
        info!(tunnel_id = %id, remote = %remote, "tunnel opened");
        Ok((tunnel, events))
    }

    /// Closes every live tunnel and returns how many were closed.
    pub fn close_all(&self) -> usize {
        let tunnels: Vec<_> = self
            .inner
            .tunnels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let count = tunnels.len();
        for tunnel in tunnels {
            tunnel.close();
        }
        count
    }
}
