use std::sync::Arc;

use http_tunnel_core::{
    protocol::{self, RequestTarget, ResponseKind},
    TunnelError, TunnelId,
};
use metrics::counter;
use tracing::{debug, info, trace};

use crate::{connection::SubConnection, tunnel::ClientInner};

/// Keeps exactly one receive request outstanding, re-polling as soon as
/// each response arrives.
pub(crate) struct PollWorker {
    pub(crate) client: Arc<ClientInner>,
    pub(crate) connection: SubConnection,
    pub(crate) target: RequestTarget,
    pub(crate) tunnel_id: TunnelId,
    pub(crate) user_agent: String,
}

impl PollWorker {
    pub(crate) async fn run(mut self) {
        loop {
            let request = match protocol::receive_data_request(
                &self.target,
                &self.tunnel_id,
                &self.user_agent,
            ) {
                Ok(request) => request,
                Err(err) => {
                    self.client.fail_tunnel(&err);
                    return;
                }
            };
            counter!("http_tunnel_client_polls_total", 1);
            let response = match self
                .connection
                .exchange_or_reconnect(&request, self.client.is_active())
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    self.client.fail_tunnel(&err);
                    return;
                }
            };
            match protocol::classify_response(response) {
                ResponseKind::Data(data) => self.client.on_message_received(data),
                ResponseKind::Ping => trace!(tunnel_id = %self.tunnel_id, "ping"),
                ResponseKind::TunnelClosed => {
                    info!(tunnel_id = %self.tunnel_id, "server closed tunnel");
                    self.client.on_server_closed();
                    return;
                }
                other => {
                    debug!(tunnel_id = %self.tunnel_id, response = ?other, "unexpected poll response");
                    self.client.fail_tunnel(&TunnelError::protocol(format!(
                        "unexpected response to poll request: {other:?}"
                    )));
                    return;
                }
            }
        }
    }
}
