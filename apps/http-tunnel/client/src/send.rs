use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use http_tunnel_core::{
    protocol::{self, RequestTarget, ResponseKind},
    Completer, TunnelError, TunnelId,
};
use metrics::{counter, histogram};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{connection::SubConnection, tunnel::ClientInner};

pub(crate) enum SendCommand {
    Data {
        fragment: Bytes,
        completer: Completer,
        queued_at: Instant,
    },
    /// Sends the close request once everything queued ahead of it is out.
    Shutdown { ack: oneshot::Sender<()> },
}

impl SendCommand {
    pub(crate) fn abandon(self, client: &ClientInner, err: TunnelError) {
        match self {
            Self::Data {
                fragment,
                completer,
                ..
            } => {
                client.on_fragment_finished(fragment.len(), false);
                completer.fail(err);
            }
            Self::Shutdown { ack } => {
                let _ = ack.send(());
            }
        }
    }
}

/// Records how long an acknowledged fragment spent between `write` and the
/// server's answer, along with its size.
fn record_acknowledged(len: usize, queued_at: Instant) -> Duration {
    let latency = queued_at.elapsed();
    histogram!(
        "http_tunnel_client_send_latency_ms",
        latency.as_secs_f64() * 1000.0
    );
    histogram!("http_tunnel_client_request_size_bytes", len as f64);
    latency
}

/// Drives the send sub-connection: one request in flight at a time, in the
/// order writes were issued.
pub(crate) struct SendWorker {
    pub(crate) client: Arc<ClientInner>,
    pub(crate) connection: SubConnection,
    pub(crate) target: RequestTarget,
    pub(crate) tunnel_id: TunnelId,
    pub(crate) user_agent: String,
}

impl SendWorker {
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SendCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                SendCommand::Data {
                    fragment,
                    completer,
                    queued_at,
                } => {
                    let len = fragment.len();
                    match self.send_fragment(fragment).await {
                        Ok(()) => {
                            record_acknowledged(len, queued_at);
                            self.client.on_fragment_finished(len, true);
                            completer.succeed();
                        }
                        Err(err) => {
                            self.client.on_fragment_finished(len, false);
                            completer.fail(err.clone());
                            commands.close();
                            while let Ok(pending) = commands.try_recv() {
                                pending.abandon(&self.client, err.clone());
                            }
                            if matches!(err, TunnelError::Closed) {
                                self.client.on_server_closed();
                            } else {
                                self.client.fail_tunnel(&err);
                            }
                            return;
                        }
                    }
                }
                SendCommand::Shutdown { ack } => {
                    self.send_close().await;
                    let _ = ack.send(());
                    return;
                }
            }
        }
    }

    async fn send_fragment(&mut self, fragment: Bytes) -> Result<(), TunnelError> {
        let len = fragment.len();
        let request =
            protocol::send_data_request(&self.target, &self.tunnel_id, fragment, &self.user_agent)?;
        let response = self
            .connection
            .exchange_or_reconnect(&request, self.client.is_active())
            .await?;
        match protocol::classify_response(response) {
            ResponseKind::Data(_) => {
                counter!("http_tunnel_client_bytes_sent_total", len as u64);
                Ok(())
            }
            ResponseKind::TunnelClosed => Err(TunnelError::Closed),
            ResponseKind::Rejected(reason) => Err(TunnelError::Protocol(reason)),
            other => Err(TunnelError::protocol(format!(
                "unexpected response to send request: {other:?}"
            ))),
        }
    }

    async fn send_close(&mut self) {
        let request =
            match protocol::close_tunnel_request(&self.target, &self.tunnel_id, &self.user_agent) {
                Ok(request) => request,
                Err(err) => {
                    warn!(tunnel_id = %self.tunnel_id, error = %err, "failed to build close request");
                    return;
                }
            };
        match self.connection.exchange(&request).await {
            Ok(response) => match protocol::classify_response(response) {
                ResponseKind::TunnelClosed => {
                    debug!(tunnel_id = %self.tunnel_id, "server acknowledged close")
                }
                other => debug!(
                    tunnel_id = %self.tunnel_id,
                    response = ?other,
                    "unexpected response to close request"
                ),
            },
            Err(err) => debug!(tunnel_id = %self.tunnel_id, error = %err, "close request failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acknowledged_latency_counts_from_enqueue() {
        let queued_at = Instant::now() - Duration::from_millis(40);
        let latency = record_acknowledged(1024, queued_at);
        assert!(latency >= Duration::from_millis(40));
    }
}
