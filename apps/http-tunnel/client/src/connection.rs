use std::{io, net::SocketAddr};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use http_tunnel_core::TunnelError;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use metrics::counter;
use tokio::{net::TcpSocket, task::JoinHandle};
use tracing::{debug, warn};

use crate::auth::ProxyAuthNegotiator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Send,
    Poll,
}

impl Role {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Poll => "poll",
        }
    }
}

pub(crate) fn bind_socket(local: SocketAddr) -> io::Result<TcpSocket> {
    let socket = if local.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(local)?;
    Ok(socket)
}

/// One of the two HTTP/1.1 connections backing a client tunnel.
///
/// Requests go out strictly one at a time. A failed connection can be
/// re-established from the same local endpoint to the same peer while
/// keeping its proxy authentication state.
pub(crate) struct SubConnection {
    role: Role,
    local: SocketAddr,
    peer: SocketAddr,
    sender: SendRequest<Full<Bytes>>,
    driver: JoinHandle<()>,
    negotiator: ProxyAuthNegotiator,
}

impl SubConnection {
    pub(crate) async fn connect(
        role: Role,
        socket: TcpSocket,
        peer: SocketAddr,
        negotiator: ProxyAuthNegotiator,
    ) -> Result<Self, TunnelError> {
        let local = socket.local_addr()?;
        let (sender, driver) = open(role, socket, peer).await?;
        debug!(role = role.as_str(), local = %local, peer = %peer, "sub-connection established");
        Ok(Self {
            role,
            local,
            peer,
            sender,
            driver,
            negotiator,
        })
    }

    pub(crate) async fn reconnect(&mut self) -> Result<(), TunnelError> {
        self.driver.abort();
        let socket = bind_socket(self.local)?;
        let (sender, driver) = open(self.role, socket, self.peer).await?;
        self.sender = sender;
        self.driver = driver;
        counter!("http_tunnel_client_reconnects_total", 1, "role" => self.role.as_str());
        debug!(role = self.role.as_str(), peer = %self.peer, "sub-connection re-established");
        Ok(())
    }

    /// Sends `request`, answering at most one proxy challenge for it.
    pub(crate) async fn exchange(
        &mut self,
        request: &Request<Bytes>,
    ) -> Result<Response<Bytes>, TunnelError> {
        let mut attempt = self.negotiator.decorate(request)?;
        loop {
            let response = self.round_trip(attempt).await?;
            if response.status() != StatusCode::PROXY_AUTHENTICATION_REQUIRED {
                self.negotiator.on_response();
                return Ok(response);
            }
            if let Err(err) = self.negotiator.on_challenge(response.headers()) {
                counter!(
                    "http_tunnel_client_proxy_auth_failures_total",
                    1,
                    "reason" => err.metric_label()
                );
                warn!(role = self.role.as_str(), error = %err, "proxy authentication failed");
                return Err(err.into());
            }
            debug!(
                role = self.role.as_str(),
                scheme = self.negotiator.scheme_name().unwrap_or("none"),
                "answering proxy challenge"
            );
            attempt = self.negotiator.decorate(request)?;
        }
    }

    /// Like [`exchange`](Self::exchange), but a transport failure triggers a
    /// single reconnect and resend when `may_reconnect` holds.
    pub(crate) async fn exchange_or_reconnect(
        &mut self,
        request: &Request<Bytes>,
        may_reconnect: bool,
    ) -> Result<Response<Bytes>, TunnelError> {
        match self.exchange(request).await {
            Err(err) if err.is_transport() && may_reconnect => {
                warn!(
                    role = self.role.as_str(),
                    error = %err,
                    "sub-connection failed; reconnecting"
                );
                self.reconnect().await?;
                self.exchange(request).await
            }
            other => other,
        }
    }

    async fn round_trip(&mut self, request: Request<Bytes>) -> Result<Response<Bytes>, TunnelError> {
        self.sender.ready().await.map_err(TunnelError::transport)?;
        let response = self
            .sender
            .send_request(request.map(Full::new))
            .await
            .map_err(TunnelError::transport)?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(TunnelError::transport)?
            .to_bytes();
        Ok(Response::from_parts(parts, body))
    }
}

impl Drop for SubConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn open(
    role: Role,
    socket: TcpSocket,
    peer: SocketAddr,
) -> Result<(SendRequest<Full<Bytes>>, JoinHandle<()>), TunnelError> {
    let stream = socket.connect(peer).await?;
    stream.set_nodelay(true)?;
    let (sender, connection) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(TunnelError::transport)?;
    let driver = tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(role = role.as_str(), error = %err, "sub-connection ended with error");
        }
    });
    Ok((sender, driver))
}
