//! PT tunnel client
//!
//! Runs a pluggable transport client subprocess and exposes each
//! configured tunnel as a plain TCP listener: anything that connects to
//! the listener is carried, obfuscated, to the remote PT server.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use ptproxy::config::{parse_hostport, ClientTunnel, Config};
use ptproxy::{relay, ClientAdapter};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// PT tunnel client - forward local TCP through a pluggable transport
#[derive(Parser, Debug)]
#[command(name = "ptproxy-client")]
#[command(about = "Tunnel local TCP connections through a pluggable transport client")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    if args.example_config {
        let example = ptproxy::config::generate_example_config();
        print!("{}", toml::to_string_pretty(&example)?);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    let client_config = config
        .client
        .clone()
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;
    if client_config.tunnels.is_empty() {
        return Err(anyhow!("No tunnels configured"));
    }

    info!("Starting PT: {}", client_config.exec.join(" "));
    let adapter = ClientAdapter::start(client_config.adapter_config(config.timeouts.to_timeouts()))
        .await
        .context("PT client failed to start")?;
    let adapter = Arc::new(adapter);

    // One accept loop per tunnel. Connection setup (SOCKS dial through
    // the PT) happens inline; it is bounded by the connect timeout.
    let shutdown = CancellationToken::new();
    let mut tunnels = JoinSet::new();
    for tunnel in client_config.tunnels {
        let adapter = Arc::clone(&adapter);
        let shutdown = shutdown.clone();
        tunnels.spawn(async move {
            if let Err(e) = run_tunnel(&tunnel, adapter, shutdown).await {
                error!(listen = %tunnel.listen, "Tunnel failed: {e:#}");
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
        _ = tunnels.join_next() => {
            error!("Tunnel task exited");
        }
    }

    // Ends in-flight relay pairs as well as the accept loops.
    shutdown.cancel();
    tunnels.shutdown().await;
    match Arc::into_inner(adapter) {
        Some(mut adapter) => adapter.stop().await,
        // Should not happen once every tunnel task is gone; the PT is
        // still killed on drop.
        None => warn!("Adapter still shared at shutdown"),
    }

    Ok(())
}

/// Accept plaintext connections and forward each through the transport.
async fn run_tunnel(
    tunnel: &ClientTunnel,
    adapter: Arc<ClientAdapter>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (host, port) = parse_hostport(&tunnel.upstream)?;
    let listener = TcpListener::bind(&tunnel.listen)
        .await
        .with_context(|| format!("Failed to bind {}", tunnel.listen))?;
    info!(
        transport = %tunnel.transport,
        listen = %tunnel.listen,
        upstream = %tunnel.upstream,
        "Tunnel ready",
    );

    loop {
        let (local, peer) = listener.accept().await?;
        debug!(%peer, upstream = %tunnel.upstream, "Accepted connection");

        let remote = match adapter
            .open_connection(&tunnel.transport, &host, port, &tunnel.options)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                warn!(upstream = %tunnel.upstream, "Failed to open PT connection: {e}");
                continue;
            }
        };

        let conn_shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = conn_shutdown.cancelled() => debug!(%peer, "Relay pair aborted by shutdown"),
                res = relay::relay(local, remote) => match res {
                    Ok(stats) => debug!(
                        %peer,
                        sent = stats.a_to_b,
                        received = stats.b_to_a,
                        "Connection closed",
                    ),
                    Err(e) => debug!(%peer, "Relay error: {e}"),
                },
            }
        });
    }
}
