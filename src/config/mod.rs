//! Configuration for the standalone tunnel binaries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::adapter::{self, Timeouts};
use crate::process::ServerTransport;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client-end tunnel configuration
    pub client: Option<ClientSection>,
    /// Server-end tunnel configuration
    pub server: Option<ServerSection>,
    /// Operational timeouts (seconds)
    #[serde(default)]
    pub timeouts: TimeoutsSection,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Client end: run the PT locally, listen for plaintext connections and
/// tunnel them to PT servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// PT executable and arguments
    pub exec: Vec<String>,
    /// PT state directory (temporary if unset)
    pub state: Option<PathBuf>,
    /// Upstream proxy URL the PT must use
    pub proxy: Option<String>,
    /// Tunnels to establish
    pub tunnels: Vec<ClientTunnel>,
}

/// One client tunnel: a local listener forwarded through a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTunnel {
    /// Transport name (e.g. "obfs4")
    pub transport: String,
    /// Local address to listen on for plaintext connections
    pub listen: String,
    /// The remote PT server, as host:port
    pub upstream: String,
    /// Per-connection transport arguments (e.g. obfs4 "cert")
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl ClientSection {
    /// The adapter configuration for this section.
    pub fn adapter_config(&self, timeouts: Timeouts) -> adapter::ClientConfig {
        let mut transports: Vec<String> =
            self.tunnels.iter().map(|t| t.transport.clone()).collect();
        transports.sort_unstable();
        transports.dedup();

        adapter::ClientConfig {
            exec: self.exec.clone(),
            state_dir: self.state.clone(),
            transports,
            upstream_proxy: self.proxy.clone(),
            timeouts,
        }
    }
}

/// Server end: run the PT locally, accept obfuscated connections and
/// deliver plaintext to the forward address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// PT executable and arguments
    pub exec: Vec<String>,
    /// PT state directory (temporary if unset)
    pub state: Option<PathBuf>,
    /// Where to deliver de-obfuscated traffic, as host:port
    pub forward: String,
    /// Use the Extended ORPort to learn client addresses
    #[serde(default)]
    pub extended: bool,
    /// Transports the PT should serve
    pub transports: Vec<ServerTransportSection>,
}

/// One server transport listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTransportSection {
    /// Transport name
    pub name: String,
    /// Address the PT should listen on for obfuscated traffic
    pub listen: Option<String>,
    /// Transport options passed through the PT environment
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl ServerSection {
    pub fn adapter_config(&self, timeouts: Timeouts) -> adapter::ServerConfig {
        let transports = self
            .transports
            .iter()
            .map(|t| {
                let mut options: Vec<(String, String)> = t
                    .options
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                options.sort_unstable();
                ServerTransport {
                    name: t.name.clone(),
                    bindaddr: t.listen.clone(),
                    options,
                }
            })
            .collect();

        adapter::ServerConfig {
            exec: self.exec.clone(),
            state_dir: self.state.clone(),
            transports,
            forward: self.forward.clone(),
            timeouts,
        }
    }
}

/// Timeout overrides, all in seconds. Unset fields keep their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub handshake: u64,
    pub auth: u64,
    pub cookie: u64,
    pub connect: u64,
    pub stop_grace: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        let t = Timeouts::default();
        Self {
            handshake: t.handshake.as_secs(),
            auth: t.auth.as_secs(),
            cookie: t.cookie.as_secs(),
            connect: t.connect.as_secs(),
            stop_grace: t.stop_grace.as_secs(),
        }
    }
}

impl TimeoutsSection {
    pub fn to_timeouts(&self) -> Timeouts {
        use std::time::Duration;
        Timeouts {
            handshake: Duration::from_secs(self.handshake),
            auth: Duration::from_secs(self.auth),
            cookie: Duration::from_secs(self.cookie),
            connect: Duration::from_secs(self.connect),
            stop_grace: Duration::from_secs(self.stop_grace),
        }
    }
}

/// Split "host:port" into host and port. IPv6 hosts are bracketed.
pub fn parse_hostport(hostport: &str) -> Result<(String, u16), crate::Error> {
    let bad = || crate::Error::Config(format!("invalid host:port {hostport:?}"));

    if let Some(rest) = hostport.strip_prefix('[') {
        // [v6]:port
        let (host, port) = rest.split_once("]:").ok_or_else(bad)?;
        let port = port.parse().map_err(|_| bad())?;
        return Ok((host.to_string(), port));
    }
    let (host, port) = hostport.rsplit_once(':').ok_or_else(bad)?;
    if host.is_empty() || host.contains(':') {
        return Err(bad());
    }
    let port = port.parse().map_err(|_| bad())?;
    Ok((host.to_string(), port))
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        client: Some(ClientSection {
            exec: vec!["/usr/bin/obfs4proxy".to_string()],
            state: None,
            proxy: None,
            tunnels: vec![ClientTunnel {
                transport: "obfs4".to_string(),
                listen: "127.0.0.1:8000".to_string(),
                upstream: "192.0.2.1:1984".to_string(),
                options: HashMap::from([(
                    "cert".to_string(),
                    "<obfs4 certificate>".to_string(),
                )]),
            }],
        }),
        server: Some(ServerSection {
            exec: vec!["/usr/bin/obfs4proxy".to_string()],
            state: Some(PathBuf::from("/var/lib/ptproxy")),
            forward: "127.0.0.1:8080".to_string(),
            extended: false,
            transports: vec![ServerTransportSection {
                name: "obfs4".to_string(),
                listen: Some("0.0.0.0:1984".to_string()),
                options: HashMap::new(),
            }],
        }),
        timeouts: TimeoutsSection::default(),
    }
}
