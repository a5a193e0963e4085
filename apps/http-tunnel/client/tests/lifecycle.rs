use std::time::Duration;

use http_tunnel_client::{ClientConfig, TunnelClient};
use http_tunnel_core::{EventStream, TunnelError, TunnelEvent};
use tokio::net::TcpListener;

async fn drain_until_closed(events: &mut EventStream) -> Vec<TunnelEvent> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
        let closed = event == TunnelEvent::Closed;
        seen.push(event);
        if closed {
            break;
        }
    }
    seen
}

#[test_timeout::tokio_timeout_test(10)]
async fn writes_before_connect_fail() {
    let (client, _events) = TunnelClient::new(ClientConfig::default());
    assert!(client.is_open());
    assert!(!client.is_connected());
    assert!(matches!(
        client.write("early").await,
        Err(TunnelError::NotConnected)
    ));
}

#[test_timeout::tokio_timeout_test(10)]
async fn binding_twice_is_refused() {
    let (client, mut events) = TunnelClient::new(ClientConfig::default());
    client.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    assert!(client.is_bound());
    let local = client.local_addr().unwrap();
    assert_ne!(local.port(), 0);

    assert!(matches!(
        client.bind("127.0.0.1:0".parse().unwrap()).await,
        Err(TunnelError::AlreadyBound)
    ));

    client.unbind().await.unwrap();
    assert!(!client.is_bound());
    assert_eq!(events.recv().await, Some(TunnelEvent::Open));
    assert_eq!(events.recv().await, Some(TunnelEvent::Bound(local)));
    assert_eq!(events.recv().await, Some(TunnelEvent::Unbound));
}

#[test_timeout::tokio_timeout_test(10)]
async fn refused_connect_reports_error_and_stays_usable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (client, mut events) = TunnelClient::new(ClientConfig::default());
    let err = client.connect(addr).await.unwrap_err();
    assert!(err.is_transport());
    assert!(!client.is_connected());
    assert!(client.is_bound());
    assert!(client.is_open());

    client.close().await.unwrap();
    client.close().await.unwrap();
    assert!(!client.is_open());

    let seen = drain_until_closed(&mut events).await;
    assert_eq!(seen[0], TunnelEvent::Open);
    assert!(matches!(seen[1], TunnelEvent::Bound(_)));
    assert!(seen
        .iter()
        .any(|event| matches!(event, TunnelEvent::Error(_))));
    assert_eq!(
        seen[seen.len() - 2..],
        [TunnelEvent::Unbound, TunnelEvent::Closed]
    );
    assert!(matches!(
        client.connect(addr).await,
        Err(TunnelError::Closed)
    ));
}

#[test_timeout::tokio_timeout_test(10)]
async fn options_apply_to_live_tunnel() {
    let (client, _events) = TunnelClient::new(ClientConfig::default());
    assert!(client.set_option("writeBufferHighWaterMark", "4096").is_err());
    assert!(client.set_option("writeBufferLowWaterMark", "1024").unwrap());
    assert!(client.set_option("writeBufferHighWaterMark", "4096").unwrap());
    assert!(client.set_option("proxyAddress", "127.0.0.1:3128").unwrap());
    assert!(!client.set_option("noSuchOption", "1").unwrap());
    assert!(client.set_option("writeBufferHighWaterMark", "lots").is_err());

    let config = client.config();
    assert_eq!(config.tunnel.water_marks().high(), 4096);
    assert_eq!(config.tunnel.water_marks().low(), 1024);
    assert_eq!(config.proxy_address(), Some("127.0.0.1:3128".parse().unwrap()));
}
