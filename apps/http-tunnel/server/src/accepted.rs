use std::{
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use http::Response;
use http_tunnel_core::{
    completion,
    protocol::{self, MAX_BODY_SIZE},
    Completer, Completion, ConfigError, EventSink, IncomingBuffer, InterestOps,
    SaturationManager, SaturationStateChange, TunnelConfig, TunnelError, TunnelEvent, TunnelId,
};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tracing::{debug, info, trace, warn};

use crate::{config::ServerConfig, registry::RegistryInner};

/// Receives the response for a parked poll request.
pub type PollResponder = oneshot::Sender<Response<Bytes>>;

/// Server end of one tunnel.
///
/// Outbound data waits in a FIFO until the client parks a poll request,
/// which then carries exactly one fragment back. Inbound data from send
/// requests flows through an [`IncomingBuffer`] to the tunnel's event
/// stream. A tunnel that sees no request for twice the ping delay closes
/// itself.
pub struct AcceptedTunnel {
    id: TunnelId,
    remote_address: SocketAddr,
    local_address: SocketAddr,
    registry: Weak<RegistryInner>,
    config: RwLock<TunnelConfig>,
    events: EventSink,
    open: AtomicBool,
    state: Mutex<TunnelState>,
    incoming: IncomingBuffer<Bytes>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    /// Held for the whole teardown so a racing close returns after it.
    teardown: Mutex<()>,
}

struct TunnelState {
    poll_slot: Option<PollSlot>,
    queued: VecDeque<QueuedFragment>,
    saturation: SaturationManager,
    interest: InterestOps,
    deadline: Instant,
    ping_timer: Option<JoinHandle<()>>,
    polls_seen: u64,
}

struct PollSlot {
    responder: PollResponder,
    poll: u64,
}

struct QueuedFragment {
    data: Bytes,
    completer: Completer,
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub tunnel_id: String,
    pub remote_address: String,
    pub queued_bytes: i64,
    pub queued_fragments: usize,
    pub incoming_messages: usize,
    pub poll_parked: bool,
    pub readable: bool,
    pub writable: bool,
}

impl AcceptedTunnel {
    pub(crate) fn new(
        id: TunnelId,
        remote_address: SocketAddr,
        local_address: SocketAddr,
        registry: Weak<RegistryInner>,
        config: &ServerConfig,
        events: EventSink,
    ) -> Arc<Self> {
        let deliver = events.clone();
        let incoming = IncomingBuffer::with_limits(
            config.incoming_capacity,
            config.incoming_bounds,
            move |data: Bytes| deliver.fire(TunnelEvent::Message(data)),
        );
        let tunnel = Arc::new(Self {
            id,
            remote_address,
            local_address,
            registry,
            config: RwLock::new(config.tunnel.clone()),
            events,
            open: AtomicBool::new(true),
            state: Mutex::new(TunnelState {
                poll_slot: None,
                queued: VecDeque::new(),
                saturation: SaturationManager::new(config.tunnel.water_marks()),
                interest: InterestOps::default(),
                deadline: Instant::now() + liveness_window(config.tunnel.ping_delay()),
                ping_timer: None,
                polls_seen: 0,
            }),
            incoming,
            watchdog: Mutex::new(None),
            teardown: Mutex::new(()),
        });
        let watchdog = tokio::spawn(watch_liveness(Arc::downgrade(&tunnel)));
        *tunnel.watchdog.lock() = Some(watchdog);
        tunnel
    }

    pub(crate) fn fire_opened(&self) {
        self.events.fire(TunnelEvent::Open);
        self.events.fire(TunnelEvent::Bound(self.local_address));
        self.events.fire(TunnelEvent::Connected(self.remote_address));
    }

    pub fn id(&self) -> &TunnelId {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// True exactly while the tunnel is registered with its server.
    pub fn is_connected(&self) -> bool {
        self.registry
            .upgrade()
            .map_or(false, |registry| registry.holds(&self.id, self))
    }

    pub fn is_bound(&self) -> bool {
        self.is_connected()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.is_connected().then_some(self.local_address)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.is_connected().then_some(self.remote_address)
    }

    pub fn is_readable(&self) -> bool {
        self.state.lock().interest.readable
    }

    pub fn is_writable(&self) -> bool {
        self.state.lock().interest.writable
    }

    pub fn set_readable(&self, readable: bool) {
        let ops = {
            let mut state = self.state.lock();
            state.interest.readable = readable;
            state.interest
        };
        self.incoming.on_interest_ops_changed(readable);
        self.events.fire(TunnelEvent::InterestChanged(ops));
    }

    /// Watermark changes apply from the next send.
    pub fn set_option(&self, key: &str, value: &str) -> Result<bool, ConfigError> {
        self.config.write().set_option(key, value)
    }

    pub fn queued_bytes(&self) -> i64 {
        self.state.lock().saturation.queued()
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        let state = self.state.lock();
        TunnelSnapshot {
            tunnel_id: self.id.to_string(),
            remote_address: self.remote_address.to_string(),
            queued_bytes: state.saturation.queued(),
            queued_fragments: state.queued.len(),
            incoming_messages: self.incoming.len(),
            poll_parked: state.poll_slot.is_some(),
            readable: state.interest.readable,
            writable: state.interest.writable,
        }
    }

    /// Queues `data` for the client, split into fragments no larger than a
    /// single poll response. The completion resolves once every fragment
    /// has been handed to a poll response.
    pub fn send_message(self: &Arc<Self>, data: impl Into<Bytes>) -> Completion {
        let data = data.into();
        if !self.is_connected() {
            return Completion::failed(TunnelError::NotConnected);
        }
        if data.is_empty() {
            return Completion::succeeded();
        }
        let water_marks = self.config.read().water_marks();

        let mut state = self.state.lock();
        if !self.is_open() {
            return Completion::failed(TunnelError::NotConnected);
        }
        state.saturation.update_thresholds(water_marks);
        self.queue_size_changed(&mut state, data.len() as i64);
        let parts = protocol::split_fragments(data, MAX_BODY_SIZE)
            .into_iter()
            .map(|data| {
                let (completer, done) = completion();
                state.queued.push_back(QueuedFragment { data, completer });
                done
            })
            .collect();
        self.send_queued_data(&mut state);
        Completion::all(parts)
    }

    pub(crate) fn receive_message(&self, data: Bytes) {
        if !self.is_open() {
            warn!(tunnel_id = %self.id, bytes = data.len(), "dropping data for closed tunnel");
            return;
        }
        let len = data.len();
        counter!("http_tunnel_server_bytes_received_total", len as u64);
        if !self.incoming.offer(data) {
            counter!("http_tunnel_server_messages_dropped_total", 1);
            warn!(tunnel_id = %self.id, bytes = len, "incoming buffer full; dropping data");
            return;
        }
        if self.incoming.over_capacity() {
            debug!(
                tunnel_id = %self.id,
                queued = self.incoming.len(),
                "incoming buffer over capacity"
            );
        }
    }

    /// Parks a poll request. Queued data answers it immediately; otherwise
    /// it is answered by the next send or by a ping after the ping delay.
    pub(crate) fn poll_queued_data(
        self: &Arc<Self>,
        responder: PollResponder,
    ) -> Result<(), TunnelError> {
        let mut state = self.state.lock();
        if !self.is_open() {
            return Err(TunnelError::Closed);
        }
        if let Some(parked) = &state.poll_slot {
            if !parked.responder.is_closed() {
                return Err(TunnelError::PollSlotOccupied);
            }
            debug!(tunnel_id = %self.id, "replacing abandoned poll request");
        }
        state.polls_seen += 1;
        let poll = state.polls_seen;
        state.poll_slot = Some(PollSlot { responder, poll });
        self.send_queued_data(&mut state);
        if state.poll_slot.is_some() {
            self.arm_ping_timer(&mut state, poll);
        }
        Ok(())
    }

    /// Records client activity, pushing back the liveness deadline.
    pub(crate) fn ping(&self) {
        let window = liveness_window(self.config.read().ping_delay());
        self.state.lock().deadline = Instant::now() + window;
    }

    /// Closes the tunnel from the server side; a parked poll learns of it.
    ///
    /// Synchronous: the tunnel is out of the registry and its closing events
    /// are published when this returns, also for a caller that lost the race
    /// to another close.
    pub fn close(self: &Arc<Self>) {
        self.internal_close(true);
    }

    pub(crate) fn close_from_client(self: &Arc<Self>) {
        self.internal_close(false);
    }

    fn send_queued_data(&self, state: &mut TunnelState) {
        let Some(slot) = state.poll_slot.take() else {
            return;
        };
        let Some(fragment) = state.queued.pop_front() else {
            state.poll_slot = Some(slot);
            return;
        };
        if let Some(timer) = state.ping_timer.take() {
            timer.abort();
        }
        let len = fragment.data.len();
        match slot
            .responder
            .send(protocol::receive_data_response(fragment.data.clone()))
        {
            Ok(()) => {
                self.queue_size_changed(state, -(len as i64));
                fragment.completer.succeed();
                counter!("http_tunnel_server_bytes_sent_total", len as u64);
                self.events.fire(TunnelEvent::WriteComplete(len));
            }
            Err(_) => {
                debug!(tunnel_id = %self.id, "poll request went away; keeping fragment queued");
                state.queued.push_front(fragment);
            }
        }
    }

    fn queue_size_changed(&self, state: &mut TunnelState, delta: i64) {
        let writable = match state.saturation.queue_size_changed(delta) {
            SaturationStateChange::NoChange => return,
            SaturationStateChange::Saturated => false,
            SaturationStateChange::Desaturated => true,
        };
        state.interest.writable = writable;
        debug!(
            tunnel_id = %self.id,
            writable,
            queued = state.saturation.queued(),
            "send queue crossed a water mark"
        );
        self.events.fire(TunnelEvent::InterestChanged(state.interest));
    }

    fn arm_ping_timer(self: &Arc<Self>, state: &mut TunnelState, poll: u64) {
        if let Some(timer) = state.ping_timer.take() {
            timer.abort();
        }
        let delay = self.config.read().ping_delay();
        let tunnel = Arc::downgrade(self);
        state.ping_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tunnel) = tunnel.upgrade() {
                tunnel.send_ping(poll);
            }
        }));
    }

    fn send_ping(&self, poll: u64) {
        let mut state = self.state.lock();
        let parked = state
            .poll_slot
            .as_ref()
            .map_or(false, |slot| slot.poll == poll);
        if !parked || !state.queued.is_empty() {
            return;
        }
        state.ping_timer = None;
        if let Some(slot) = state.poll_slot.take() {
            if slot.responder.send(protocol::ping_response()).is_ok() {
                trace!(tunnel_id = %self.id, "ping");
            }
        }
    }

    /// Releases the tunnel. Only the first call has any effect.
    fn internal_close(self: &Arc<Self>, send_close_response: bool) -> bool {
        let _teardown = self.teardown.lock();
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id, self);
        }
        let (slot, queued, ping_timer) = {
            let mut state = self.state.lock();
            (
                state.poll_slot.take(),
                std::mem::take(&mut state.queued),
                state.ping_timer.take(),
            )
        };
        if let Some(timer) = ping_timer {
            timer.abort();
        }
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }
        if let Some(slot) = slot {
            if send_close_response {
                let _ = slot.responder.send(protocol::tunnel_closed_response());
            }
        }
        let undelivered = queued.len();
        for fragment in queued {
            fragment.completer.fail(TunnelError::Closed);
        }
        let dropped = self.incoming.close();

        self.events.fire(TunnelEvent::Disconnected);
        self.events.fire(TunnelEvent::Unbound);
        self.events.fire(TunnelEvent::Closed);

        let initiator = if send_close_response { "server" } else { "client" };
        counter!("http_tunnel_server_tunnels_closed_total", 1, "initiator" => initiator);
        info!(
            tunnel_id = %self.id,
            remote = %self.remote_address,
            initiator,
            undelivered,
            dropped,
            "tunnel closed"
        );
        true
    }
}

impl fmt::Debug for AcceptedTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptedTunnel")
            .field("id", &self.id)
            .field("remote_address", &self.remote_address)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Drop for AcceptedTunnel {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.get_mut().take() {
            watchdog.abort();
        }
        if let Some(timer) = self.state.get_mut().ping_timer.take() {
            timer.abort();
        }
    }
}

fn liveness_window(ping_delay: Duration) -> Duration {
    ping_delay * 2
}

async fn watch_liveness(tunnel: Weak<AcceptedTunnel>) {
    loop {
        let deadline = match tunnel.upgrade() {
            Some(tunnel) if tunnel.is_open() => {
                let deadline = tunnel.state.lock().deadline;
                deadline
            }
            _ => return,
        };
        tokio::time::sleep_until(deadline).await;

        let Some(tunnel) = tunnel.upgrade() else {
            return;
        };
        if !tunnel.is_open() {
            return;
        }
        let expired = Instant::now() >= tunnel.state.lock().deadline;
        if expired {
            counter!("http_tunnel_server_ping_timeouts_total", 1);
            warn!(tunnel_id = %tunnel.id, "no requests within ping timeout; closing tunnel");
            tunnel.internal_close(true);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::StatusCode;
    use http_tunnel_core::{EventStream, TunnelConfig};

    use super::*;
    use crate::{pipeline::AcceptQueue, registry::TunnelRegistry};

    fn registry_with(tunnel: TunnelConfig) -> TunnelRegistry {
        let (queue, _accepted) = AcceptQueue::new();
        TunnelRegistry::new(ServerConfig::new(tunnel), Arc::new(queue))
    }

    fn open(registry: &TunnelRegistry) -> (Arc<AcceptedTunnel>, EventStream) {
        registry
            .create_tunnel("127.0.0.1:40000".parse().unwrap())
            .unwrap()
    }

    fn registry() -> TunnelRegistry {
        registry_with(TunnelConfig::default())
    }

    async fn next_event(events: &mut EventStream) -> Option<TunnelEvent> {
        tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .ok()
            .flatten()
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn single_poll_slot_per_tunnel() {
        let registry = registry();
        let (tunnel, _events) = open(&registry);

        let (first, _first_rx) = oneshot::channel();
        tunnel.poll_queued_data(first).unwrap();
        let (second, _second_rx) = oneshot::channel();
        assert!(matches!(
            tunnel.poll_queued_data(second),
            Err(TunnelError::PollSlotOccupied)
        ));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn abandoned_poll_can_be_replaced() {
        let registry = registry();
        let (tunnel, _events) = open(&registry);

        let (first, first_rx) = oneshot::channel();
        tunnel.poll_queued_data(first).unwrap();
        drop(first_rx);

        let (second, second_rx) = oneshot::channel();
        tunnel.poll_queued_data(second).unwrap();
        let sent = tunnel.send_message(Bytes::from_static(b"payload"));
        let response = second_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from_static(b"payload"));
        assert!(sent.await.is_ok());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn fragments_leave_in_order_one_per_poll() {
        let registry = registry();
        let (tunnel, _events) = open(&registry);
        let mut payload = vec![1u8; MAX_BODY_SIZE];
        payload.extend_from_slice(&[2u8; 10]);
        let sent = tunnel.send_message(payload);
        let tail = tunnel.send_message(Bytes::from_static(b"tail"));
        assert_eq!(tunnel.queued_bytes(), (MAX_BODY_SIZE + 14) as i64);

        let mut bodies = Vec::new();
        for _ in 0..3 {
            let (responder, rx) = oneshot::channel();
            tunnel.poll_queued_data(responder).unwrap();
            bodies.push(rx.await.unwrap().into_body());
        }
        assert_eq!(bodies[0].len(), MAX_BODY_SIZE);
        assert_eq!(bodies[1], Bytes::from_static(&[2u8; 10]));
        assert_eq!(bodies[2], Bytes::from_static(b"tail"));
        assert!(sent.await.is_ok());
        assert!(tail.await.is_ok());
        assert_eq!(tunnel.queued_bytes(), 0);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn parked_poll_is_answered_with_ping() {
        let registry =
            registry_with(TunnelConfig::default().with_ping_delay(Duration::from_secs(1)).unwrap());
        let (tunnel, _events) = open(&registry);
        let (responder, rx) = oneshot::channel();
        tunnel.poll_queued_data(responder).unwrap();
        let response = rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(tunnel.is_connected());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn silent_tunnel_times_out() {
        let registry =
            registry_with(TunnelConfig::default().with_ping_delay(Duration::from_secs(1)).unwrap());
        let (tunnel, mut events) = open(&registry);
        assert!(registry.contains(tunnel.id().as_str()));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!tunnel.is_connected());
        assert!(!registry.contains(tunnel.id().as_str()));

        let mut lifecycle = Vec::new();
        while let Some(event) = next_event(&mut events).await {
            if event.is_lifecycle() {
                lifecycle.push(event.clone());
            }
            if event == TunnelEvent::Closed {
                break;
            }
        }
        assert_eq!(
            lifecycle[3..],
            [
                TunnelEvent::Disconnected,
                TunnelEvent::Unbound,
                TunnelEvent::Closed
            ]
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn close_is_idempotent_and_answers_parked_poll() {
        let registry = registry();
        let (tunnel, mut events) = open(&registry);
        let (responder, rx) = oneshot::channel();
        tunnel.poll_queued_data(responder).unwrap();

        tunnel.close();
        tunnel.close();
        let response = rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::RESET_CONTENT);
        assert!(matches!(
            tunnel.send_message(Bytes::from_static(b"late")).await,
            Err(TunnelError::NotConnected)
        ));

        let mut closed = 0;
        while let Some(event) = next_event(&mut events).await {
            if event == TunnelEvent::Closed {
                closed += 1;
                break;
            }
        }
        assert_eq!(closed, 1);
        assert!(tokio::time::timeout(Duration::from_millis(100), events.recv())
            .await
            .map_or(true, |event| event.is_none()));
    }

    #[test_timeout::tokio_timeout_test(10, multi_thread)]
    async fn racing_closes_both_return_after_teardown() {
        let registry = registry();
        for _ in 0..20 {
            let (tunnel, mut events) = open(&registry);
            let id = tunnel.id().clone();
            let closers: Vec<_> = (0..2)
                .map(|_| {
                    let tunnel = Arc::clone(&tunnel);
                    let registry = registry.clone();
                    let id = id.clone();
                    tokio::spawn(async move {
                        tunnel.close();
                        registry.contains(id.as_str())
                    })
                })
                .collect();
            for closer in closers {
                assert!(!closer.await.unwrap(), "close returned before deregistering");
            }
            let mut closed = 0;
            while let Ok(event) = events.try_recv() {
                if event == TunnelEvent::Closed {
                    closed += 1;
                }
            }
            assert_eq!(closed, 1);
        }
        assert!(registry.is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn writability_follows_water_marks() {
        let registry =
            registry_with(TunnelConfig::default().with_water_marks(10, 20).unwrap());
        let (tunnel, _events) = open(&registry);
        assert!(tunnel.is_writable());
        let pending = tunnel.send_message(vec![0u8; 25]);
        assert!(!tunnel.is_writable());

        let (responder, rx) = oneshot::channel();
        tunnel.poll_queued_data(responder).unwrap();
        rx.await.unwrap();
        assert!(pending.await.is_ok());
        assert!(tunnel.is_writable());
    }
}
