//! PT tunnel server
//!
//! Runs a pluggable transport server subprocess. Obfuscated connections
//! arriving at the PT's listeners are de-obfuscated and delivered to the
//! configured forward address. With `extended = true` the Extended ORPort
//! is used instead of a plain one, so the original client address and
//! transport name are recovered and logged per connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use ptproxy::config::Config;
use ptproxy::{relay, ClientInfo, ExtServerAdapter, ServerAdapter};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// PT tunnel server - receive pluggable-transport traffic as plain TCP
#[derive(Parser, Debug)]
#[command(name = "ptproxy-server")]
#[command(about = "Terminate pluggable-transport connections and forward them as plain TCP")]
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
    let server_config = config
        .server
        .clone()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;
    if server_config.transports.is_empty() {
        return Err(anyhow!("No transports configured"));
    }

    let timeouts = config.timeouts.to_timeouts();
    let adapter_config = server_config.adapter_config(timeouts);
    info!("Starting PT: {}", server_config.exec.join(" "));

    if server_config.extended {
        let forward = server_config.forward.clone();
        let connect_timeout = timeouts.connect;
        let handler: ptproxy::adapter::ConnectHandler = Arc::new(move |stream, info| {
            let forward = forward.clone();
            Box::pin(forward_connection(stream, info, forward, connect_timeout))
        });

        let mut adapter = ExtServerAdapter::start(adapter_config, None, handler)
            .await
            .context("PT server failed to start")?;
        log_listeners(adapter.registry());
        info!(forward = %server_config.forward, "Forwarding with client address recovery");

        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");
        adapter.stop().await;
    } else {
        let mut adapter = ServerAdapter::start(adapter_config)
            .await
            .context("PT server failed to start")?;
        log_listeners(adapter.registry());
        info!(forward = %server_config.forward, "Forwarding");

        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");
        adapter.stop().await;
    }

    Ok(())
}

fn log_listeners(result: &Arc<ptproxy::HandshakeResult>) {
    for entry in result.registry.iter() {
        match &entry.endpoint {
            Some(endpoint) => info!(
                transport = %entry.name,
                listen = %endpoint.addr,
                "Transport listening",
            ),
            None => warn!(
                transport = %entry.name,
                error = entry.error.as_deref().unwrap_or("unknown"),
                "Transport failed",
            ),
        }
    }
}

/// Deliver one authenticated connection to the forward address.
async fn forward_connection(
    stream: TcpStream,
    info: ClientInfo,
    forward: String,
    connect_timeout: Duration,
) {
    let upstream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&forward)).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => {
            warn!(%forward, "Connecting to forward target failed: {e}");
            return;
        }
        Err(_) => {
            warn!(%forward, "Connecting to forward target timed out");
            return;
        }
    };

    match relay::relay(stream, upstream).await {
        Ok(stats) => debug!(
            client = %info.peer,
            transport = %info.transport,
            received = stats.a_to_b,
            sent = stats.b_to_a,
            "Connection closed",
        ),
        Err(e) => debug!(client = %info.peer, "Relay error: {e}"),
    }
}
