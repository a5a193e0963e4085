use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use http_tunnel_core::{
    protocol::{self, RequestKind, MAX_BODY_SIZE},
    TunnelError,
};
use metrics::counter;
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    accepted::{AcceptedTunnel, TunnelSnapshot},
    registry::TunnelRegistry,
};

#[derive(Debug, Serialize)]
struct StatsResponse {
    open_tunnels: usize,
    total_opened: u64,
    tunnels: Vec<TunnelSnapshot>,
}

/// Tunnel endpoints plus `/healthz` and `/debug/stats`. Anything that is not
/// a well-formed tunnel request is rejected with a 400.
pub fn router(registry: TunnelRegistry) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .fallback(dispatch)
        .with_state(registry)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(registry): State<TunnelRegistry>) -> impl IntoResponse {
    Json(StatsResponse {
        open_tunnels: registry.len(),
        total_opened: registry.total_opened(),
        tunnels: registry.snapshot(),
    })
}

async fn dispatch(
    State(registry): State<TunnelRegistry>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let user_agent = registry.user_agent();
    let Some(kind) =
        protocol::classify_request(&parts.method, &parts.uri, &parts.headers, &user_agent)
    else {
        counter!("http_tunnel_server_requests_rejected_total", 1, "reason" => "not_tunnel_request");
        debug!(
            remote = %remote,
            method = %parts.method,
            uri = %parts.uri,
            "rejecting non-tunnel request"
        );
        return into_axum(protocol::rejection_response("not a tunnel request"));
    };
    counter!("http_tunnel_server_requests_total", 1, "kind" => kind.metric_label());

    let span = info_span!("tunnel_request", kind = kind.metric_label(), remote = %remote);
    let response = async move {
        let body = match to_bytes(body, MAX_BODY_SIZE).await {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "failed to read request body");
                return protocol::rejection_response("unreadable request body");
            }
        };
        handle(&registry, kind, remote, &parts.headers, body).await
    }
    .instrument(span)
    .await;
    into_axum(response)
}

async fn handle(
    registry: &TunnelRegistry,
    kind: RequestKind,
    remote: SocketAddr,
    headers: &HeaderMap,
    body: Bytes,
) -> http::Response<Bytes> {
    if kind == RequestKind::OpenTunnel {
        return match registry.open_tunnel(remote) {
            Ok(tunnel) => match protocol::tunnel_opened_response(tunnel.id()) {
                Ok(response) => response,
                Err(err) => {
                    warn!(error = %err, "failed to build open response");
                    tunnel.close();
                    protocol::rejection_response(err.to_string())
                }
            },
            Err(err) => {
                counter!("http_tunnel_server_open_failures_total", 1, "reason" => err.metric_label());
                warn!(error = %err, "failed to open tunnel");
                protocol::rejection_response(err.to_string())
            }
        };
    }

    let tunnel = match lookup(registry, headers) {
        Ok(tunnel) => tunnel,
        Err(response) => return response,
    };
    tunnel.ping();

    match kind {
        RequestKind::SendData => {
            if body.is_empty() {
                return protocol::rejection_response("Send data requests must contain data");
            }
            tunnel.receive_message(body);
            protocol::send_data_accepted_response()
        }
        RequestKind::ReceiveData => poll(&tunnel).await,
        RequestKind::CloseTunnel => {
            tunnel.close_from_client();
            protocol::tunnel_closed_response()
        }
        RequestKind::OpenTunnel => protocol::rejection_response("unexpected open request"),
    }
}

async fn poll(tunnel: &Arc<AcceptedTunnel>) -> http::Response<Bytes> {
    let (responder, response) = oneshot::channel();
    match tunnel.poll_queued_data(responder) {
        Ok(()) => {}
        Err(err @ TunnelError::PollSlotOccupied) => {
            counter!("http_tunnel_server_requests_rejected_total", 1, "reason" => "poll_slot_occupied");
            warn!(tunnel_id = %tunnel.id(), "second concurrent poll request");
            return protocol::rejection_response(err.to_string());
        }
        Err(_) => return protocol::tunnel_closed_response(),
    }
    // A dropped responder means the tunnel went away without answering.
    response
        .await
        .unwrap_or_else(|_| protocol::tunnel_closed_response())
}

fn lookup(
    registry: &TunnelRegistry,
    headers: &HeaderMap,
) -> Result<Arc<AcceptedTunnel>, http::Response<Bytes>> {
    let Some(id) = protocol::extract_tunnel_id(headers) else {
        counter!("http_tunnel_server_requests_rejected_total", 1, "reason" => "missing_tunnel_id");
        return Err(protocol::rejection_response(
            "no tunnel id specified in request",
        ));
    };
    match registry.get(id.as_str()) {
        Some(tunnel) => Ok(tunnel),
        None => {
            debug!(tunnel_id = %id, "request for unknown tunnel");
            Err(protocol::tunnel_closed_response())
        }
    }
}

fn into_axum(response: http::Response<Bytes>) -> Response {
    response.map(Body::from)
}
