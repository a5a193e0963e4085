use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use clap::Parser;
use http_tunnel_core::{EventStream, TunnelConfig, TunnelEvent};
use http_tunnel_server::{AcceptedTunnel, ServerConfig, ServerError, TunnelServer};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{debug, info, warn};

mod telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "http-tunnel-server",
    author,
    version,
    about = "HTTP tunnel server that echoes every tunnel's data back to its client"
)]
struct Cli {
    /// Address to accept tunnel requests on.
    #[arg(long, env = "HTTP_TUNNEL_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    listen_addr: String,

    /// Seconds a poll request is parked before it is answered with a ping.
    #[arg(long, env = "HTTP_TUNNEL_PING_DELAY_SECS", default_value_t = 5)]
    ping_delay_secs: u64,

    #[arg(long, env = "HTTP_TUNNEL_LOW_WATER_MARK", default_value_t = 32 * 1024)]
    low_water_mark: u64,

    #[arg(long, env = "HTTP_TUNNEL_HIGH_WATER_MARK", default_value_t = 64 * 1024)]
    high_water_mark: u64,

    /// User agent clients must present.
    #[arg(long, env = "HTTP_TUNNEL_USER_AGENT")]
    user_agent: Option<String>,

    /// Grace period for in-flight requests during shutdown.
    #[arg(long, env = "HTTP_TUNNEL_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,
}

struct Settings {
    listen_addr: SocketAddr,
    server: ServerConfig,
}

impl TryFrom<Cli> for Settings {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let mut tunnel = TunnelConfig::default()
            .with_water_marks(cli.low_water_mark, cli.high_water_mark)
            .context("invalid water marks")?
            .with_ping_delay(Duration::from_secs(cli.ping_delay_secs))
            .context("invalid ping delay")?;
        if let Some(user_agent) = cli.user_agent {
            tunnel.set_user_agent(user_agent);
        }
        let server = ServerConfig::new(tunnel)
            .with_shutdown_grace(Duration::from_secs(cli.shutdown_grace_secs));
        Ok(Self {
            listen_addr,
            server,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let settings = Settings::try_from(Cli::parse())?;
    info!(
        listen_addr = %settings.listen_addr,
        ping_delay_secs = settings.server.tunnel.ping_delay().as_secs(),
        "starting http-tunnel server"
    );

    run(settings, telemetry.metrics_handle()).await
}

async fn run(settings: Settings, metrics: PrometheusHandle) -> Result<()> {
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    let server = TunnelServer::bind_with(
        settings.listen_addr,
        settings.server,
        Arc::new(echo_pipeline),
        metrics_routes,
    )
    .await
    .context("failed to start tunnel server")?;

    let _ = signal::ctrl_c().await;
    info!("shutdown signal received");
    server.close().await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn metrics_handler(State(metrics): State<PrometheusHandle>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], metrics.render())
}

fn echo_pipeline(tunnel: Arc<AcceptedTunnel>, events: EventStream) -> Result<(), ServerError> {
    tokio::spawn(echo(tunnel, events));
    Ok(())
}

async fn echo(tunnel: Arc<AcceptedTunnel>, mut events: EventStream) {
    while let Some(event) = events.recv().await {
        match event {
            TunnelEvent::Message(data) => {
                let sent = tunnel.send_message(data);
                let tunnel_id = tunnel.id().clone();
                tokio::spawn(async move {
                    if let Err(err) = sent.await {
                        debug!(%tunnel_id, error = %err, "echo not delivered");
                    }
                });
            }
            TunnelEvent::Error(message) => {
                warn!(tunnel_id = %tunnel.id(), error = %message, "tunnel error");
            }
            TunnelEvent::Closed => break,
            _ => {}
        }
    }
    debug!(tunnel_id = %tunnel.id(), "echo finished");
}
