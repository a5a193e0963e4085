use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use bytes::Bytes;
use futures_util::future::join_all;
use http_tunnel_core::{
    completion,
    protocol::{self, RequestTarget, ResponseKind, MAX_BODY_SIZE},
    BindState, Completion, ConfigError, ConnectState, EventSink, EventStream, IncomingBuffer,
    InterestOps, SaturationManager, SaturationStateChange, StateCell, TunnelError, TunnelEvent,
    TunnelId,
};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tokio::{
    net::TcpSocket,
    sync::{mpsc, oneshot, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    auth::ProxyAuthNegotiator,
    config::ClientConfig,
    connection::{bind_socket, Role, SubConnection},
    poll::PollWorker,
    send::{SendCommand, SendWorker},
};

/// Client end of an HTTP tunnel.
///
/// Behaves like a connected byte stream: [`connect`](Self::connect) opens
/// the tunnel, [`write`](Self::write) pushes bytes to the server and bytes
/// from the server arrive as [`TunnelEvent::Message`] on the event stream.
/// Underneath, one connection carries sends and a second keeps a receive
/// request parked on the server.
///
/// Handles are cheap to clone and share one tunnel. Must be created inside
/// a Tokio runtime.
#[derive(Clone)]
pub struct TunnelClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    config: RwLock<ClientConfig>,
    events: EventSink,
    open: AtomicBool,
    bind_state: StateCell<BindState>,
    connect_state: StateCell<ConnectState>,
    /// Serialises bind, connect, disconnect, unbind and close.
    lifecycle: tokio::sync::Mutex<()>,
    link: Mutex<Link>,
    saturation: Mutex<SaturationManager>,
    interest: Mutex<InterestOps>,
    incoming: IncomingBuffer<Bytes>,
    shutdown_requested: AtomicBool,
    /// Set once the first close has finished tearing down.
    closed: AtomicBool,
    closed_notify: Notify,
}

#[derive(Default)]
struct Link {
    send_local: Option<SocketAddr>,
    poll_local: Option<SocketAddr>,
    send_socket: Option<TcpSocket>,
    poll_socket: Option<TcpSocket>,
    remote: Option<SocketAddr>,
    tunnel_id: Option<TunnelId>,
    commands: Option<mpsc::UnboundedSender<SendCommand>>,
    send_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
}

struct Established {
    tunnel_id: TunnelId,
    target: RequestTarget,
    user_agent: String,
    send: SubConnection,
    poll: SubConnection,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> (Self, EventStream) {
        let (events, stream) = EventSink::channel();
        (Self::with_event_sink(config, events), stream)
    }

    pub fn with_event_sink(config: ClientConfig, events: EventSink) -> Self {
        let deliver = events.clone();
        let incoming = IncomingBuffer::new(move |data: Bytes| {
            deliver.fire(TunnelEvent::Message(data));
        });
        let saturation = SaturationManager::new(config.tunnel.water_marks());
        let inner = Arc::new(ClientInner {
            config: RwLock::new(config),
            events,
            open: AtomicBool::new(true),
            bind_state: StateCell::new(BindState::Unbound),
            connect_state: StateCell::new(ConnectState::Disconnected),
            lifecycle: tokio::sync::Mutex::new(()),
            link: Mutex::new(Link::default()),
            saturation: Mutex::new(saturation),
            interest: Mutex::new(InterestOps::default()),
            incoming,
            shutdown_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        });
        inner.events.fire(TunnelEvent::Open);
        Self { inner }
    }

    pub fn config(&self) -> ClientConfig {
        self.inner.config.read().clone()
    }

    /// Changes an option on the live tunnel; watermarks apply from the next
    /// write, proxy settings from the next connect.
    pub fn set_option(&self, key: &str, value: &str) -> Result<bool, ConfigError> {
        self.inner.config.write().set_option(key, value)
    }

    /// Binds both sub-connections: the send side to `local`, the poll side
    /// to an ephemeral port on the same address.
    pub async fn bind(&self, local: SocketAddr) -> Result<(), TunnelError> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.bind(local)
    }

    /// Opens the tunnel to `remote`. Binds implicitly when unbound. Does
    /// nothing when the tunnel is already connecting or connected.
    pub async fn connect(&self, remote: SocketAddr) -> Result<(), TunnelError> {
        let _guard = self.inner.lifecycle.lock().await;
        let inner = &self.inner;
        if !inner.is_open() {
            return Err(TunnelError::Closed);
        }
        if !inner
            .connect_state
            .compare_and_set(ConnectState::Disconnected, ConnectState::Connecting)
        {
            debug!(remote = %remote, "connect ignored; tunnel already connecting or connected");
            return Ok(());
        }
        if inner.bind_state.is(BindState::Unbound) {
            let any: std::net::IpAddr = match remote {
                SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
                SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
            };
            if let Err(err) = inner.bind(SocketAddr::new(any, 0)) {
                inner.fail_connect(&err);
                return Err(err);
            }
        }

        match inner.establish(remote).await {
            Ok(established) => {
                inner.start(remote, established);
                Ok(())
            }
            Err(err) => {
                inner.fail_connect(&err);
                Err(err)
            }
        }
    }

    /// Queues `data` for the server. The returned completion resolves once
    /// every fragment has been acknowledged, or with the first failure.
    pub fn write(&self, data: impl Into<Bytes>) -> Completion {
        self.inner.write(data.into())
    }

    /// Pauses or resumes delivery of inbound messages.
    pub fn set_readable(&self, readable: bool) {
        let ops = {
            let mut interest = self.inner.interest.lock();
            interest.readable = readable;
            *interest
        };
        self.inner.incoming.on_interest_ops_changed(readable);
        self.inner.events.fire(TunnelEvent::InterestChanged(ops));
    }

    /// Closes the tunnel on the server after flushing queued writes, then
    /// drops both sub-connections. The sockets stay bound.
    pub async fn disconnect(&self) -> Result<(), TunnelError> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.disconnect().await
    }

    pub async fn unbind(&self) -> Result<(), TunnelError> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.disconnect().await?;
        self.inner.unbind();
        Ok(())
    }

    /// Disconnects, unbinds and releases the tunnel. Only the first call
    /// does the work; concurrent and later calls resolve once it is done.
    pub async fn close(&self) -> Result<(), TunnelError> {
        self.inner.close().await
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub fn is_bound(&self) -> bool {
        self.inner.bind_state.is(BindState::Bound)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connect_state.is(ConnectState::Connected)
    }

    pub fn is_readable(&self) -> bool {
        self.inner.interest.lock().readable
    }

    pub fn is_writable(&self) -> bool {
        self.inner.interest.lock().writable
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.link.lock().send_local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.link.lock().remote
    }

    pub fn tunnel_id(&self) -> Option<TunnelId> {
        self.inner.link.lock().tunnel_id.clone()
    }

    pub fn queued_bytes(&self) -> i64 {
        self.inner.saturation.lock().queued()
    }
}

impl ClientInner {
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Whether a failed sub-connection is still worth re-establishing.
    pub(crate) fn is_active(&self) -> bool {
        matches!(
            self.connect_state.get(),
            ConnectState::Connecting | ConnectState::Connected
        )
    }

    fn bind(&self, local: SocketAddr) -> Result<(), TunnelError> {
        if !self.is_open() {
            return Err(TunnelError::Closed);
        }
        if !self
            .bind_state
            .compare_and_set(BindState::Unbound, BindState::Binding)
        {
            return Err(TunnelError::AlreadyBound);
        }
        let bound = (|| {
            let send = bind_socket(local)?;
            let send_local = send.local_addr()?;
            let poll = bind_socket(SocketAddr::new(local.ip(), 0))?;
            let poll_local = poll.local_addr()?;
            Ok::<_, std::io::Error>((send, send_local, poll, poll_local))
        })();
        let (send, send_local, poll, poll_local) = match bound {
            Ok(bound) => bound,
            Err(err) => {
                self.bind_state.set(BindState::Unbound);
                warn!(local = %local, error = %err, "failed to bind tunnel");
                return Err(err.into());
            }
        };
        {
            let mut link = self.link.lock();
            link.send_socket = Some(send);
            link.poll_socket = Some(poll);
            link.send_local = Some(send_local);
            link.poll_local = Some(poll_local);
        }
        self.bind_state.set(BindState::Bound);
        self.events.fire(TunnelEvent::Bound(send_local));
        debug!(send_local = %send_local, poll_local = %poll_local, "tunnel bound");
        Ok(())
    }

    /// Sockets bound earlier are used once; later connects rebind the same
    /// local endpoints.
    fn take_sockets(&self) -> Result<(TcpSocket, TcpSocket), TunnelError> {
        let mut link = self.link.lock();
        let send = match link.send_socket.take() {
            Some(socket) => socket,
            None => bind_socket(link.send_local.ok_or(TunnelError::NotBound)?)?,
        };
        let poll = match link.poll_socket.take() {
            Some(socket) => socket,
            None => bind_socket(link.poll_local.ok_or(TunnelError::NotBound)?)?,
        };
        Ok((send, poll))
    }

    async fn establish(&self, remote: SocketAddr) -> Result<Established, TunnelError> {
        let (send_socket, poll_socket) = self.take_sockets()?;
        let config = self.config.read().clone();
        let (target, peer) = match config.proxy_address() {
            Some(proxy) => (RequestTarget::via_proxy(remote), proxy),
            None => (RequestTarget::direct(remote), remote),
        };
        let user_agent = config.tunnel.user_agent().to_string();

        let mut send = SubConnection::connect(
            Role::Send,
            send_socket,
            peer,
            ProxyAuthNegotiator::new(config.proxy_credentials()),
        )
        .await?;
        let open = protocol::open_tunnel_request(&target, &user_agent)?;
        let tunnel_id = match protocol::classify_response(send.exchange(&open).await?) {
            ResponseKind::TunnelOpened(tunnel_id) => tunnel_id,
            ResponseKind::Rejected(reason) => return Err(TunnelError::Protocol(reason)),
            other => {
                return Err(TunnelError::protocol(format!(
                    "unexpected response to open request: {other:?}"
                )))
            }
        };
        let poll = SubConnection::connect(
            Role::Poll,
            poll_socket,
            peer,
            ProxyAuthNegotiator::new(config.proxy_credentials()),
        )
        .await?;

        Ok(Established {
            tunnel_id,
            target,
            user_agent,
            send,
            poll,
        })
    }

    fn start(self: &Arc<Self>, remote: SocketAddr, established: Established) {
        let Established {
            tunnel_id,
            target,
            user_agent,
            send,
            poll,
        } = established;
        let (commands, command_rx) = mpsc::unbounded_channel();
        {
            let mut link = self.link.lock();
            link.remote = Some(remote);
            link.tunnel_id = Some(tunnel_id.clone());
            link.commands = Some(commands);
        }
        self.shutdown_requested.store(false, Ordering::Release);
        self.connect_state.set(ConnectState::Connected);
        self.events.fire(TunnelEvent::Connected(remote));
        counter!("http_tunnel_client_connects_total", 1);
        info!(tunnel_id = %tunnel_id, remote = %remote, "tunnel connected");

        let send_worker = SendWorker {
            client: Arc::clone(self),
            connection: send,
            target: target.clone(),
            tunnel_id: tunnel_id.clone(),
            user_agent: user_agent.clone(),
        };
        let poll_worker = PollWorker {
            client: Arc::clone(self),
            connection: poll,
            target,
            tunnel_id,
            user_agent,
        };
        let send_task = tokio::spawn(send_worker.run(command_rx));
        let poll_task = tokio::spawn(poll_worker.run());
        let mut link = self.link.lock();
        link.send_task = Some(send_task);
        link.poll_task = Some(poll_task);
    }

    fn fail_connect(&self, err: &TunnelError) {
        counter!(
            "http_tunnel_client_connect_failures_total",
            1,
            "reason" => err.metric_label()
        );
        warn!(error = %err, "tunnel connect failed");
        {
            let mut link = self.link.lock();
            link.remote = None;
            link.tunnel_id = None;
        }
        self.connect_state.set(ConnectState::Disconnected);
        self.events.fire(TunnelEvent::Error(err.to_string()));
    }

    fn write(&self, data: Bytes) -> Completion {
        match self.connect_state.get() {
            ConnectState::Connected => {}
            ConnectState::Disconnecting => return Completion::failed(TunnelError::Closing),
            _ => return Completion::failed(TunnelError::NotConnected),
        }
        if self.shutdown_requested.load(Ordering::Acquire) {
            return Completion::failed(TunnelError::Closing);
        }
        if data.is_empty() {
            return Completion::succeeded();
        }
        let Some(commands) = self.link.lock().commands.clone() else {
            return Completion::failed(TunnelError::NotConnected);
        };

        let water_marks = self.config.read().tunnel.water_marks();
        self.saturation.lock().update_thresholds(water_marks);
        self.queue_size_changed(data.len() as i64);

        let queued_at = Instant::now();
        let parts = protocol::split_fragments(data, MAX_BODY_SIZE)
            .into_iter()
            .map(|fragment| {
                let (completer, done) = completion();
                if let Err(rejected) = commands.send(SendCommand::Data {
                    fragment,
                    completer,
                    queued_at,
                }) {
                    rejected.0.abandon(self, TunnelError::Closing);
                }
                done
            })
            .collect();
        Completion::all(parts)
    }

    fn queue_size_changed(&self, delta: i64) {
        let mut saturation = self.saturation.lock();
        let change = saturation.queue_size_changed(delta);
        gauge!("http_tunnel_client_queued_bytes", saturation.queued() as f64);
        let writable = match change {
            SaturationStateChange::NoChange => return,
            SaturationStateChange::Saturated => false,
            SaturationStateChange::Desaturated => true,
        };
        let ops = {
            let mut interest = self.interest.lock();
            interest.writable = writable;
            *interest
        };
        debug!(writable, queued = saturation.queued(), "send queue crossed a water mark");
        self.events.fire(TunnelEvent::InterestChanged(ops));
    }

    pub(crate) fn on_fragment_finished(&self, len: usize, delivered: bool) {
        self.queue_size_changed(-(len as i64));
        if delivered {
            self.events.fire(TunnelEvent::WriteComplete(len));
        }
    }

    pub(crate) fn on_message_received(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        if matches!(self.connect_state.get(), ConnectState::Disconnected) {
            warn!(bytes = data.len(), "dropping message received after disconnect");
            return;
        }
        counter!("http_tunnel_client_bytes_received_total", data.len() as u64);
        let len = data.len();
        if !self.incoming.offer(data) {
            counter!("http_tunnel_client_messages_dropped_total", 1);
            warn!(bytes = len, "incoming buffer full; dropping message");
            return;
        }
        if self.incoming.over_capacity() {
            debug!(queued = self.incoming.len(), "incoming buffer over capacity");
        }
    }

    /// The server closed the tunnel; follow with a local close.
    pub(crate) fn on_server_closed(self: &Arc<Self>) {
        if !self.connect_state.is(ConnectState::Connected) {
            return;
        }
        self.spawn_close();
    }

    /// A sub-connection failed beyond recovery; report it and close.
    pub(crate) fn fail_tunnel(self: &Arc<Self>, err: &TunnelError) {
        if !self.connect_state.is(ConnectState::Connected) {
            debug!(error = %err, "sub-connection ended while tunnel not connected");
            return;
        }
        counter!(
            "http_tunnel_client_failures_total",
            1,
            "reason" => err.metric_label()
        );
        warn!(error = %err, "tunnel failed; closing");
        self.events.fire(TunnelEvent::Error(err.to_string()));
        self.spawn_close();
    }

    fn spawn_close(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = inner.close().await {
                warn!(error = %err, "failed to close tunnel");
            }
        });
    }

    async fn disconnect(&self) -> Result<(), TunnelError> {
        if !self
            .connect_state
            .compare_and_set(ConnectState::Connected, ConnectState::Disconnecting)
        {
            return Ok(());
        }
        let (commands, send_task, poll_task, tunnel_id) = {
            let mut link = self.link.lock();
            (
                link.commands.take(),
                link.send_task.take(),
                link.poll_task.take(),
                link.tunnel_id.take(),
            )
        };

        if !self.shutdown_requested.swap(true, Ordering::AcqRel) {
            if let Some(commands) = commands {
                let (ack, acked) = oneshot::channel();
                if commands.send(SendCommand::Shutdown { ack }).is_ok() {
                    let _ = acked.await;
                }
            }
        }
        if let Some(poll_task) = &poll_task {
            poll_task.abort();
        }
        for result in join_all(send_task.into_iter().chain(poll_task)).await {
            if let Err(err) = result {
                if !err.is_cancelled() {
                    warn!(error = %err, "tunnel worker ended abnormally");
                }
            }
        }

        self.incoming.flush();
        self.link.lock().remote = None;
        self.connect_state.set(ConnectState::Disconnected);
        self.events.fire(TunnelEvent::Disconnected);
        match tunnel_id {
            Some(tunnel_id) => info!(tunnel_id = %tunnel_id, "tunnel disconnected"),
            None => info!("tunnel disconnected"),
        }
        Ok(())
    }

    fn unbind(&self) {
        if !self
            .bind_state
            .compare_and_set(BindState::Bound, BindState::Unbinding)
        {
            return;
        }
        {
            let mut link = self.link.lock();
            link.send_socket = None;
            link.poll_socket = None;
            link.send_local = None;
            link.poll_local = None;
        }
        self.bind_state.set(BindState::Unbound);
        self.events.fire(TunnelEvent::Unbound);
    }

    async fn close(&self) -> Result<(), TunnelError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            let notified = self.closed_notify.notified();
            if !self.closed.load(Ordering::Acquire) {
                notified.await;
            }
            return Ok(());
        }
        let result = {
            let _guard = self.lifecycle.lock().await;
            let result = self.disconnect().await;
            self.unbind();
            let dropped = self.incoming.close();
            if dropped > 0 {
                debug!(dropped, "discarded undelivered messages on close");
            }
            self.events.fire(TunnelEvent::Closed);
            result
        };
        self.closed.store(true, Ordering::Release);
        self.closed_notify.notify_waiters();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(10)]
    async fn messages_arriving_while_disconnecting_are_still_delivered() {
        let (client, mut events) = TunnelClient::new(ClientConfig::default());
        assert_eq!(events.recv().await, Some(TunnelEvent::Open));
        let inner = &client.inner;

        inner.connect_state.set(ConnectState::Disconnecting);
        inner.open.store(false, Ordering::Release);
        inner.on_message_received(Bytes::from_static(b"last words"));
        inner.incoming.flush();
        assert_eq!(
            events.recv().await,
            Some(TunnelEvent::Message(Bytes::from_static(b"last words")))
        );

        inner.connect_state.set(ConnectState::Disconnected);
        inner.on_message_received(Bytes::from_static(b"too late"));
        assert!(inner.incoming.is_empty());
    }
}
