//! Adapters: run a PT subprocess and expose it as a usable client or
//! server endpoint.
//!
//! Each adapter owns exactly one subprocess. `start()` spawns the PT,
//! drives the stdout handshake to completion (with a bounded timeout) and
//! publishes the transport registry; a fatal handshake error stops the
//! subprocess and is returned synchronously. `stop()` cancels every
//! listener and in-flight session, then terminates the subprocess, and is
//! idempotent.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::ChildStdout;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::extorport::{self, ClientInfo};
use crate::process::{
    client_env, server_env, OrPort, PtProcess, ServerTransport, StateDir,
};
use crate::protocol::{validate_transport_name, Handshake, Progress, Role};
use crate::registry::HandshakeResult;
use crate::relay;
use crate::socks;
use crate::{Error, Result};

/// Cookie file name inside the PT state directory.
const COOKIE_FILE_NAME: &str = "extorport_cookie";

/// Operational timeouts. None of these are protocol constants; tune as
/// needed.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Whole stdout handshake, spawn to completion marker.
    pub handshake: Duration,
    /// One Extended ORPort session, auth through DONE.
    pub auth: Duration,
    /// Wait for the PT to write its auth cookie file.
    pub cookie: Duration,
    /// TCP connect to the PT's SOCKS port or the forward target.
    pub connect: Duration,
    /// Grace between closing the PT's stdin and killing it.
    pub stop_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(30),
            auth: Duration::from_secs(10),
            cookie: Duration::from_secs(10),
            connect: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Future type returned by connection handlers.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
/// Takes ownership of an authenticated server connection.
pub type ConnectHandler = Arc<dyn Fn(TcpStream, ClientInfo) -> BoxFuture + Send + Sync>;
/// May reject a connection before any data is relayed.
pub type PreConnectCheck = Arc<dyn Fn(&ClientInfo) -> bool + Send + Sync>;

fn make_state_dir(path: Option<PathBuf>) -> Result<StateDir> {
    Ok(match path {
        Some(p) => StateDir::provided(p)?,
        None => StateDir::temp()?,
    })
}

fn check_transport_names<'a, I: IntoIterator<Item = &'a str>>(names: I) -> Result<()> {
    for name in names {
        if !validate_transport_name(name) {
            return Err(Error::Config(format!("invalid transport name {name:?}")));
        }
    }
    Ok(())
}

/// Feed stdout lines into the handshake FSM until it completes, fails, or
/// the timeout expires. On failure of any kind the subprocess is stopped.
async fn drive_handshake(
    process: &mut PtProcess,
    role: Role,
    transports: &[String],
    timeouts: &Timeouts,
) -> Result<(HandshakeResult, Lines<BufReader<ChildStdout>>)> {
    let stdout = process
        .take_stdout()
        .ok_or_else(|| Error::Config("PT stdout already taken".to_string()))?;
    let mut lines = BufReader::new(stdout).lines();

    let mut handshake = Handshake::new(role, transports);
    let driven = async {
        loop {
            let line = lines
                .next_line()
                .await?
                .ok_or(crate::protocol::ProtocolError::StdoutClosed)?;
            debug!(target: "pt_stdout", "{line}");
            if handshake.feed(&line)? == Progress::Complete {
                return Ok::<_, Error>(handshake.finish());
            }
        }
    };

    let outcome = match tokio::time::timeout(timeouts.handshake, driven).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::HandshakeTimeout),
    };
    match outcome {
        Ok(result) => Ok((result, lines)),
        Err(e) => {
            warn!("PT handshake failed: {e}");
            process.stop(timeouts.stop_grace).await;
            Err(e)
        }
    }
}

/// Keep draining post-handshake stdout to the log so the child never
/// blocks on a full pipe.
fn spawn_stdout_drain(mut lines: Lines<BufReader<ChildStdout>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "pt_stdout", "{line}");
        }
    })
}

/// Configuration for [`ClientAdapter`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// PT executable and arguments.
    pub exec: Vec<String>,
    /// State directory; a private temporary one if `None`.
    pub state_dir: Option<PathBuf>,
    /// Transport names to enable.
    pub transports: Vec<String>,
    /// Upstream proxy URL for the PT (`TOR_PT_PROXY`).
    pub upstream_proxy: Option<String>,
    pub timeouts: Timeouts,
}

/// Runs a PT client subprocess and opens obfuscated connections through
/// its SOCKS port.
#[derive(Debug)]
pub struct ClientAdapter {
    process: PtProcess,
    result: Arc<HandshakeResult>,
    timeouts: Timeouts,
    stdout_drain: Option<JoinHandle<()>>,
}

impl ClientAdapter {
    /// Spawn the PT and complete the client handshake.
    pub async fn start(config: ClientConfig) -> Result<Self> {
        check_transport_names(config.transports.iter().map(String::as_str))?;
        let state_dir = make_state_dir(config.state_dir)?;
        let env = client_env(
            state_dir.path(),
            &config.transports,
            config.upstream_proxy.as_deref(),
        );
        let mut process = PtProcess::spawn(&config.exec, env, state_dir)?;

        let (result, lines) =
            drive_handshake(&mut process, Role::Client, &config.transports, &config.timeouts)
                .await?;
        info!(ready = ?result.registry.all_ready(), "PT client adapter ready");

        Ok(Self {
            process,
            result: Arc::new(result),
            timeouts: config.timeouts,
            stdout_drain: Some(spawn_stdout_drain(lines)),
        })
    }

    /// The published handshake result.
    pub fn registry(&self) -> &Arc<HandshakeResult> {
        &self.result
    }

    /// Open an obfuscated connection to `host:port` through `transport`.
    ///
    /// `args` are the per-connection transport arguments (e.g. the obfs4
    /// `cert`), passed through the SOCKS auth fields. Independent calls
    /// may run concurrently; no retry is performed here.
    pub async fn open_connection(
        &self,
        transport: &str,
        host: &str,
        port: u16,
        args: &HashMap<String, String>,
    ) -> Result<TcpStream> {
        let wrap = |source: Error| Error::Connect {
            transport: transport.to_string(),
            source: Box::new(source),
        };

        let endpoint = self.result.registry.endpoint_for(transport)?;
        let protocol = endpoint.protocol.ok_or_else(|| {
            Error::Config(format!("transport {transport} has no SOCKS protocol"))
        })?;

        let mut stream = tokio::time::timeout(self.timeouts.connect, TcpStream::connect(endpoint.addr))
            .await
            .map_err(|_| {
                wrap(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connecting to PT timed out",
                )))
            })?
            .map_err(|e| wrap(Error::Io(e)))?;

        socks::negotiate(&mut stream, protocol, host, port, args)
            .await
            .map_err(|e| wrap(Error::Socks(e)))?;
        Ok(stream)
    }

    /// Terminate the PT. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(task) = self.stdout_drain.take() {
            task.abort();
        }
        self.process.stop(self.timeouts.stop_grace).await;
    }
}

/// Configuration for [`ServerAdapter`] and [`ExtServerAdapter`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub exec: Vec<String>,
    pub state_dir: Option<PathBuf>,
    /// Transports the PT should listen for, with bind addresses and
    /// options.
    pub transports: Vec<ServerTransport>,
    /// Where de-obfuscated traffic is ultimately delivered.
    pub forward: String,
    pub timeouts: Timeouts,
}

impl ServerConfig {
    fn transport_names(&self) -> Vec<String> {
        self.transports.iter().map(|t| t.name.clone()).collect()
    }
}

/// Runs a PT server subprocess in plain ORPort mode.
///
/// The adapter binds a loopback ORPort listener, points the PT at it, and
/// relays every forwarded connection to the configured destination.
#[derive(Debug)]
pub struct ServerAdapter {
    process: PtProcess,
    result: Arc<HandshakeResult>,
    orport_addr: SocketAddr,
    shutdown: CancellationToken,
    timeouts: Timeouts,
    stdout_drain: Option<JoinHandle<()>>,
}

impl ServerAdapter {
    pub async fn start(config: ServerConfig) -> Result<Self> {
        check_transport_names(config.transports.iter().map(|t| t.name.as_str()))?;
        let state_dir = make_state_dir(config.state_dir.clone())?;

        // Bound before spawning so the address can go into the
        // environment.
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let orport_addr = listener.local_addr()?;

        let env = server_env(
            state_dir.path(),
            &config.transports,
            &OrPort::Plain(orport_addr.to_string()),
        );
        let mut process = PtProcess::spawn(&config.exec, env, state_dir)?;

        let names = config.transport_names();
        let (result, lines) =
            drive_handshake(&mut process, Role::Server, &names, &config.timeouts).await?;
        info!(ready = ?result.registry.all_ready(), %orport_addr, "PT server adapter ready");

        let shutdown = CancellationToken::new();
        spawn_plain_accept_loop(listener, config.forward.clone(), config.timeouts, shutdown.clone());

        Ok(Self {
            process,
            result: Arc::new(result),
            orport_addr,
            shutdown,
            timeouts: config.timeouts,
            stdout_drain: Some(spawn_stdout_drain(lines)),
        })
    }

    pub fn registry(&self) -> &Arc<HandshakeResult> {
        &self.result
    }

    /// The loopback address the PT delivers de-obfuscated traffic to.
    pub fn orport_addr(&self) -> SocketAddr {
        self.orport_addr
    }

    /// Cancel all relays and terminate the PT. Idempotent.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.stdout_drain.take() {
            task.abort();
        }
        self.process.stop(self.timeouts.stop_grace).await;
    }
}

fn spawn_plain_accept_loop(
    listener: TcpListener,
    forward: String,
    timeouts: Timeouts,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("ORPort accept loop shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("ORPort accept failed: {e}");
                            continue;
                        }
                    };
                    debug!(%peer, "PT delivered a connection");
                    let forward = forward.clone();
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let upstream = match tokio::time::timeout(
                            timeouts.connect,
                            TcpStream::connect(&forward),
                        )
                        .await
                        {
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
                        tokio::select! {
                            _ = conn_shutdown.cancelled() => debug!("Relay pair aborted by shutdown"),
                            res = relay::relay(stream, upstream) => if let Err(e) = res {
                                warn!("Relay pair ended with error: {e}");
                            },
                        }
                    });
                }
            }
        }
    });
}

/// Runs a PT server subprocess in Extended ORPort mode.
///
/// Each forwarded connection is authenticated with SAFE-COOKIE and its
/// recovered client info handed to the connect callback along with the
/// stream.
#[derive(Debug)]
pub struct ExtServerAdapter {
    process: PtProcess,
    result: Arc<HandshakeResult>,
    ext_addr: SocketAddr,
    shutdown: CancellationToken,
    timeouts: Timeouts,
    stdout_drain: Option<JoinHandle<()>>,
}

impl ExtServerAdapter {
    pub async fn start(
        config: ServerConfig,
        pre_connect: Option<PreConnectCheck>,
        handler: ConnectHandler,
    ) -> Result<Self> {
        check_transport_names(config.transports.iter().map(|t| t.name.as_str()))?;
        let state_dir = make_state_dir(config.state_dir.clone())?;
        let cookie_path = state_dir.path().join(COOKIE_FILE_NAME);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let ext_addr = listener.local_addr()?;

        let env = server_env(
            state_dir.path(),
            &config.transports,
            &OrPort::Extended {
                addr: ext_addr.to_string(),
                cookie_file: cookie_path.clone(),
            },
        );
        let mut process = PtProcess::spawn(&config.exec, env, state_dir)?;

        let names = config.transport_names();
        let (result, lines) =
            drive_handshake(&mut process, Role::Server, &names, &config.timeouts).await?;

        // The PT creates the cookie on startup; without it no session can
        // authenticate, so treat its absence like a failed handshake.
        let cookie = match extorport::wait_for_cookie(&cookie_path, config.timeouts.cookie).await {
            Ok(cookie) => cookie,
            Err(e) => {
                warn!("Extended ORPort cookie unavailable: {e}");
                process.stop(config.timeouts.stop_grace).await;
                return Err(e.into());
            }
        };
        info!(ready = ?result.registry.all_ready(), %ext_addr, "PT extended server adapter ready");

        let shutdown = CancellationToken::new();
        spawn_ext_accept_loop(
            listener,
            cookie,
            pre_connect,
            handler,
            config.timeouts,
            shutdown.clone(),
        );

        Ok(Self {
            process,
            result: Arc::new(result),
            ext_addr,
            shutdown,
            timeouts: config.timeouts,
            stdout_drain: Some(spawn_stdout_drain(lines)),
        })
    }

    pub fn registry(&self) -> &Arc<HandshakeResult> {
        &self.result
    }

    /// The loopback Extended ORPort address the PT connects back to.
    pub fn extorport_addr(&self) -> SocketAddr {
        self.ext_addr
    }

    /// Cancel all sessions and terminate the PT. Idempotent.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.stdout_drain.take() {
            task.abort();
        }
        self.process.stop(self.timeouts.stop_grace).await;
    }
}

fn spawn_ext_accept_loop(
    listener: TcpListener,
    cookie: [u8; extorport::COOKIE_LEN],
    pre_connect: Option<PreConnectCheck>,
    handler: ConnectHandler,
    timeouts: Timeouts,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Extended ORPort accept loop shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (mut stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Extended ORPort accept failed: {e}");
                            continue;
                        }
                    };
                    let pre_connect = pre_connect.clone();
                    let handler = handler.clone();
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let session = tokio::time::timeout(timeouts.auth, async {
                            extorport::handshake(&mut stream, &cookie, |info| {
                                pre_connect.as_ref().map_or(true, |check| check(info))
                            })
                            .await
                        });
                        let info = tokio::select! {
                            _ = conn_shutdown.cancelled() => return,
                            outcome = session => match outcome {
                                Ok(Ok(info)) => info,
                                Ok(Err(e)) => {
                                    warn!(%peer, "Extended ORPort session failed: {e}");
                                    return;
                                }
                                Err(_) => {
                                    warn!(%peer, "Extended ORPort session timed out");
                                    return;
                                }
                            },
                        };
                        info!(transport = %info.transport, client = %info.peer, "Connection authenticated");
                        tokio::select! {
                            _ = conn_shutdown.cancelled() => debug!("Session aborted by shutdown"),
                            _ = handler(stream, info) => {}
                        }
                    });
                }
            }
        }
    });
}
