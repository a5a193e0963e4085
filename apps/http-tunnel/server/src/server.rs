use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::Router;
use http_tunnel_core::{BindState, ConfigError, StateCell};
use parking_lot::Mutex;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    error::ServerError,
    pipeline::{AcceptQueue, Accepted, PipelineFactory},
    registry::TunnelRegistry,
    routes,
};

/// HTTP listener that accepts tunnels.
///
/// Tunnels opened by clients go to the pipeline given at bind time, or to
/// [`TunnelServer::accept`] when bound with [`TunnelServer::bind`].
pub struct TunnelServer {
    registry: TunnelRegistry,
    local_addr: SocketAddr,
    bind_state: StateCell<BindState>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    accepted: Option<AsyncMutex<mpsc::UnboundedReceiver<Accepted>>>,
    closed: AtomicBool,
    closed_notify: Notify,
    shutdown_grace: Duration,
}

impl TunnelServer {
    /// Binds `addr` and queues accepted tunnels for [`TunnelServer::accept`].
    pub async fn bind(addr: SocketAddr, config: ServerConfig) -> Result<Self, ServerError> {
        let (queue, accepted) = AcceptQueue::new();
        let mut server = Self::bind_with(addr, config, Arc::new(queue), Router::new()).await?;
        server.accepted = Some(AsyncMutex::new(accepted));
        Ok(server)
    }

    /// Binds `addr`, handing accepted tunnels to `pipeline` and serving
    /// `extra_routes` next to the tunnel endpoints.
    pub async fn bind_with(
        addr: SocketAddr,
        config: ServerConfig,
        pipeline: Arc<dyn PipelineFactory>,
        extra_routes: Router,
    ) -> Result<Self, ServerError> {
        let bind_state = StateCell::new(BindState::Binding);
        let shutdown_grace = config.shutdown_grace;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let registry = TunnelRegistry::new(config, pipeline);
        registry.set_local_addr(local_addr);
        let app = routes::router(registry.clone()).merge(extra_routes);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let serve_task = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                warn!(error = %err, "tunnel server stopped with error");
            }
        });
        bind_state.set(BindState::Bound);
        info!(%local_addr, "http tunnel server listening");

        Ok(Self {
            registry,
            local_addr,
            bind_state,
            shutdown: Mutex::new(Some(shutdown_tx)),
            serve_task: Mutex::new(Some(serve_task)),
            accepted: None,
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            shutdown_grace,
        })
    }

    /// Waits for the next tunnel. Returns `None` once the server is closed or
    /// when tunnels are routed to a custom pipeline.
    pub async fn accept(&self) -> Option<Accepted> {
        let accepted = self.accepted.as_ref()?;
        let closed = self.closed_notify.notified();
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let mut accepted = accepted.lock().await;
        tokio::select! {
            next = accepted.recv() => next,
            _ = closed => None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_bound(&self) -> bool {
        self.bind_state.is(BindState::Bound)
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    /// Changes settings for tunnels accepted from now on.
    pub fn set_option(&self, key: &str, value: &str) -> Result<bool, ConfigError> {
        self.registry.set_option(key, value)
    }

    /// Closes every open tunnel, then stops listening. Only the first call
    /// has any effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bind_state.set(BindState::Unbinding);
        let tunnels = self.registry.close_all();
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        self.closed_notify.notify_waiters();

        let serve_task = self.serve_task.lock().take();
        if let Some(mut serve_task) = serve_task {
            if tokio::time::timeout(self.shutdown_grace, &mut serve_task)
                .await
                .is_err()
            {
                warn!(
                    grace_seconds = self.shutdown_grace.as_secs_f64(),
                    "in-flight requests outlived the shutdown grace; aborting"
                );
                serve_task.abort();
            }
        }
        self.bind_state.set(BindState::Unbound);
        info!(local_addr = %self.local_addr, tunnels, "http tunnel server closed");
    }
}

impl Drop for TunnelServer {
    fn drop(&mut self) {
        if let Some(serve_task) = self.serve_task.get_mut().take() {
            serve_task.abort();
        }
    }
}
