//! Tunnels through a forward proxy that demands authentication.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use http_tunnel_client::{ClientConfig, TunnelClient};
use http_tunnel_core::{EventStream, TunnelError, TunnelEvent};
use http_tunnel_server::{ServerConfig, TunnelServer};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};

const WAIT: Duration = Duration::from_secs(5);
const BASIC_CHALLENGE: &str = r#"Basic realm="tunnel-proxy""#;
const DIGEST_CHALLENGE: &str = r#"Digest realm="tunnel-proxy", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", qop="auth", algorithm=MD5, opaque="5ccc069c403ebaf9f0171e9517f40e41""#;

#[derive(Clone, Copy)]
enum Scheme {
    Basic,
    Digest,
}

struct TestProxy {
    upstream: SocketAddr,
    scheme: Scheme,
    challenges: AtomicUsize,
    forwarded: AtomicUsize,
}

impl TestProxy {
    fn challenge(&self) -> &'static str {
        match self.scheme {
            Scheme::Basic => BASIC_CHALLENGE,
            Scheme::Digest => DIGEST_CHALLENGE,
        }
    }

    fn accepts(&self, authorization: &str) -> bool {
        match self.scheme {
            Scheme::Basic => authorization == "Basic dXNlcjpzZWNyZXQ=",
            Scheme::Digest => {
                authorization.starts_with("Digest ")
                    && authorization.contains(r#"username="user""#)
                    && authorization.contains(r#"realm="tunnel-proxy""#)
                    && authorization.contains(r#"opaque="5ccc069c403ebaf9f0171e9517f40e41""#)
                    && authorization.contains("qop=auth")
                    && authorization.contains("response=")
            }
        }
    }
}

async fn start_proxy(upstream: SocketAddr, scheme: Scheme) -> (SocketAddr, Arc<TestProxy>) {
    let proxy = Arc::new(TestProxy {
        upstream,
        scheme,
        challenges: AtomicUsize::new(0),
        forwarded: AtomicUsize::new(0),
    });
    let app = Router::new()
        .fallback(proxy_handler)
        .with_state(Arc::clone(&proxy));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, proxy)
}

async fn proxy_handler(State(proxy): State<Arc<TestProxy>>, request: Request) -> Response {
    let authorized = request
        .headers()
        .get(header::PROXY_AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| proxy.accepts(value));
    if !authorized {
        proxy.challenges.fetch_add(1, Ordering::SeqCst);
        return (
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            [(header::PROXY_AUTHENTICATE, proxy.challenge())],
        )
            .into_response();
    }
    proxy.forwarded.fetch_add(1, Ordering::SeqCst);
    forward(proxy.upstream, request).await
}

async fn forward(upstream: SocketAddr, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();
    let body = to_bytes(body, usize::MAX).await.unwrap();
    let path = parts
        .uri
        .path_and_query()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    parts.uri = path.parse().unwrap();
    parts.headers.remove(header::PROXY_AUTHORIZATION);

    let stream = TcpStream::connect(upstream).await.unwrap();
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(connection);
    let response = sender
        .send_request(http::Request::from_parts(parts, Full::new(body)))
        .await
        .unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    Response::from_parts(parts, Body::from(body))
}

async fn next_message(events: &mut EventStream) -> Bytes {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for message")
            .expect("event stream ended");
        if let TunnelEvent::Message(data) = event {
            return data;
        }
    }
}

async fn exchange_through_proxy(scheme: Scheme) {
    let server = TunnelServer::bind("127.0.0.1:0".parse().unwrap(), ServerConfig::default())
        .await
        .unwrap();
    let (proxy_addr, proxy) = start_proxy(server.local_addr(), scheme).await;

    let config = ClientConfig::default()
        .with_proxy(proxy_addr)
        .with_proxy_credentials("user", "secret");
    let (client, mut client_events) = TunnelClient::new(config);
    client.connect(server.local_addr()).await.expect("connect via proxy");
    let mut accepted = tokio::time::timeout(WAIT, server.accept())
        .await
        .unwrap()
        .unwrap();

    client.write("through the proxy").await.unwrap();
    assert_eq!(
        next_message(&mut accepted.events).await,
        Bytes::from_static(b"through the proxy")
    );
    accepted.tunnel.send_message("and back").await.unwrap();
    assert_eq!(
        next_message(&mut client_events).await,
        Bytes::from_static(b"and back")
    );

    // One challenge per sub-connection; later requests carry credentials.
    assert_eq!(proxy.challenges.load(Ordering::SeqCst), 2);
    assert!(proxy.forwarded.load(Ordering::SeqCst) >= 3);

    client.close().await.unwrap();
    server.close().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn basic_proxy_authentication() {
    exchange_through_proxy(Scheme::Basic).await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn digest_proxy_authentication() {
    exchange_through_proxy(Scheme::Digest).await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn rejected_credentials_fail_the_connect() {
    let server = TunnelServer::bind("127.0.0.1:0".parse().unwrap(), ServerConfig::default())
        .await
        .unwrap();
    let (proxy_addr, proxy) = start_proxy(server.local_addr(), Scheme::Basic).await;

    let config = ClientConfig::default()
        .with_proxy(proxy_addr)
        .with_proxy_credentials("user", "wrong");
    let (client, _events) = TunnelClient::new(config);
    let err = client.connect(server.local_addr()).await.unwrap_err();
    assert!(matches!(err, TunnelError::ProxyAuthentication(_)));
    assert_eq!(proxy.challenges.load(Ordering::SeqCst), 2);
    assert!(!client.is_connected());
    assert!(server.registry().is_empty());

    server.close().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn challenge_without_credentials_fails_the_connect() {
    let server = TunnelServer::bind("127.0.0.1:0".parse().unwrap(), ServerConfig::default())
        .await
        .unwrap();
    let (proxy_addr, _proxy) = start_proxy(server.local_addr(), Scheme::Digest).await;

    let (client, _events) = TunnelClient::new(ClientConfig::default().with_proxy(proxy_addr));
    let err = client.connect(server.local_addr()).await.unwrap_err();
    assert!(matches!(err, TunnelError::ProxyAuthentication(_)));

    server.close().await;
}
