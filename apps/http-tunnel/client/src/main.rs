use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use http_tunnel_client::{ClientConfig, TunnelClient};
use http_tunnel_core::{TunnelConfig, TunnelEvent};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    signal,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "http-tunnel-client",
    author,
    version,
    about = "Pipes stdin through an HTTP tunnel and prints what comes back"
)]
struct Cli {
    /// Tunnel server to connect to.
    #[arg(long, env = "HTTP_TUNNEL_SERVER_ADDR", default_value = "127.0.0.1:8080")]
    server: String,

    /// Forward proxy both sub-connections go through.
    #[arg(long, env = "HTTP_TUNNEL_PROXY_ADDR")]
    proxy: Option<String>,

    #[arg(long, env = "HTTP_TUNNEL_PROXY_USERNAME", requires = "proxy_password")]
    proxy_username: Option<String>,

    #[arg(long, env = "HTTP_TUNNEL_PROXY_PASSWORD", requires = "proxy_username")]
    proxy_password: Option<String>,

    /// User agent the server expects on tunnel requests.
    #[arg(long, env = "HTTP_TUNNEL_USER_AGENT")]
    user_agent: Option<String>,

    /// Local address for the send connection.
    #[arg(long, env = "HTTP_TUNNEL_BIND_ADDR")]
    bind: Option<String>,

    #[arg(long, env = "HTTP_TUNNEL_LOW_WATER_MARK", default_value_t = 32 * 1024)]
    low_water_mark: u64,

    #[arg(long, env = "HTTP_TUNNEL_HIGH_WATER_MARK", default_value_t = 64 * 1024)]
    high_water_mark: u64,

    /// Seconds to wait for the tunnel to open before giving up.
    #[arg(long, env = "HTTP_TUNNEL_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    connect_timeout_secs: u64,
}

struct Settings {
    server: SocketAddr,
    bind: Option<SocketAddr>,
    client: ClientConfig,
    connect_timeout: Duration,
}

impl TryFrom<Cli> for Settings {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let server: SocketAddr = cli
            .server
            .parse()
            .with_context(|| format!("invalid server address: {}", cli.server))?;
        let bind = cli
            .bind
            .map(|raw| {
                raw.parse::<SocketAddr>()
                    .with_context(|| format!("invalid bind address: {raw}"))
            })
            .transpose()?;

        let mut tunnel = TunnelConfig::default()
            .with_water_marks(cli.low_water_mark, cli.high_water_mark)
            .context("invalid water marks")?;
        if let Some(user_agent) = cli.user_agent {
            tunnel.set_user_agent(user_agent);
        }
        let mut client = ClientConfig::new(tunnel);
        if let Some(raw) = cli.proxy {
            let proxy: SocketAddr = raw
                .parse()
                .with_context(|| format!("invalid proxy address: {raw}"))?;
            client = client.with_proxy(proxy);
        }
        if let (Some(username), Some(password)) = (cli.proxy_username, cli.proxy_password) {
            client = client.with_proxy_credentials(username, password);
        }
        if cli.connect_timeout_secs == 0 {
            anyhow::bail!("connect timeout must be greater than zero");
        }
        Ok(Self {
            server,
            bind,
            client,
            connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    let settings = Settings::try_from(Cli::parse())?;
    info!(
        server = %settings.server,
        proxy = ?settings.client.proxy_address(),
        "starting http-tunnel client"
    );
    run(settings).await
}

async fn open_tunnel(tunnel: &TunnelClient, server: SocketAddr, deadline: Duration) -> Result<()> {
    match tokio::time::timeout(deadline, tunnel.connect(server)).await {
        Ok(result) => result.context("failed to open tunnel"),
        Err(_) => {
            let _ = tunnel.close().await;
            anyhow::bail!("timed out opening tunnel to {server} after {deadline:?}")
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    let (tunnel, mut events) = TunnelClient::new(settings.client);
    if let Some(local) = settings.bind {
        tunnel.bind(local).await.context("failed to bind tunnel")?;
    }
    open_tunnel(&tunnel, settings.server, settings.connect_timeout).await?;

    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = events.recv().await {
            match event {
                TunnelEvent::Message(data) => {
                    if stdout.write_all(&data).await.is_err() || stdout.flush().await.is_err() {
                        break;
                    }
                }
                TunnelEvent::Error(message) => warn!(error = %message, "tunnel reported an error"),
                TunnelEvent::Closed => break,
                _ => {}
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("failed to read stdin")? {
                    Some(mut line) => {
                        line.push('\n');
                        if let Err(err) = tunnel.write(line).await {
                            warn!(error = %err, "write failed");
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = signal::ctrl_c() => break,
        }
    }

    // Give in-flight replies a moment before tearing the tunnel down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    tunnel.close().await.context("failed to close tunnel")?;
    let _ = printer.await;
    info!("tunnel closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test_timeout::tokio_timeout_test(10)]
    async fn silent_server_fails_the_connect_after_the_deadline() {
        // Accepts at the TCP level through the backlog but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = listener.local_addr().unwrap();

        let (tunnel, _events) = TunnelClient::new(ClientConfig::default());
        let err = open_tunnel(&tunnel, server, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err:#}");
        assert!(!tunnel.is_connected());
        drop(listener);
    }

    #[test]
    fn zero_connect_timeout_is_refused() {
        let cli = Cli::parse_from(["http-tunnel-client", "--connect-timeout-secs", "0"]);
        assert!(Settings::try_from(cli).is_err());
    }
}
