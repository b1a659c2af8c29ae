//! PT subprocess supervision.
//!
//! Owns the child process, its three standard pipes and the state
//! directory. The environment passed to the child is the bit-exact
//! contract of pt-spec §3.2; nothing else from our own environment leaks
//! through.
//!
//! Shutdown follows the managed-proxy convention: close stdin first
//! (`TOR_PT_EXIT_ON_STDIN_CLOSE=1` makes a well-behaved PT exit on that),
//! wait out a grace period, then kill.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Supervisor errors
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn PT executable: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to prepare state directory: {0}")]
    StateDir(#[source] std::io::Error),

    #[error("PT executable path is empty")]
    EmptyCommand,
}

/// The PT's state directory: caller-provided (kept) or auto-created
/// temporary (deleted when the supervisor stops).
#[derive(Debug)]
pub enum StateDir {
    Provided(PathBuf),
    Temp(tempfile::TempDir),
}

impl StateDir {
    /// Use `path`, creating it if missing. Never deleted.
    pub fn provided(path: impl Into<PathBuf>) -> Result<Self, ProcessError> {
        let path = path.into();
        std::fs::create_dir_all(&path).map_err(ProcessError::StateDir)?;
        Ok(StateDir::Provided(path))
    }

    /// Create a private temporary directory, removed on drop.
    pub fn temp() -> Result<Self, ProcessError> {
        let dir = tempfile::Builder::new()
            .prefix("ptproxy-state-")
            .tempdir()
            .map_err(ProcessError::StateDir)?;
        Ok(StateDir::Temp(dir))
    }

    pub fn path(&self) -> &Path {
        match self {
            StateDir::Provided(p) => p,
            StateDir::Temp(d) => d.path(),
        }
    }
}

/// Environment variables common to both roles.
pub fn common_env(state_dir: &Path) -> Vec<(String, String)> {
    vec![
        (
            "TOR_PT_MANAGED_TRANSPORT_VER".to_string(),
            crate::MANAGED_TRANSPORT_VER.to_string(),
        ),
        (
            "TOR_PT_STATE_LOCATION".to_string(),
            state_dir.to_string_lossy().into_owned(),
        ),
        ("TOR_PT_EXIT_ON_STDIN_CLOSE".to_string(), "1".to_string()),
    ]
}

/// Client-role environment: the transports to enable and an optional
/// upstream proxy URL.
pub fn client_env(
    state_dir: &Path,
    transports: &[String],
    upstream_proxy: Option<&str>,
) -> Vec<(String, String)> {
    let mut env = common_env(state_dir);
    env.push((
        "TOR_PT_CLIENT_TRANSPORTS".to_string(),
        transports.join(","),
    ));
    if let Some(proxy) = upstream_proxy {
        env.push(("TOR_PT_PROXY".to_string(), proxy.to_string()));
    }
    env
}

/// Where the PT server should deliver de-obfuscated traffic.
#[derive(Debug, Clone)]
pub enum OrPort {
    /// Plain ORPort: `TOR_PT_ORPORT`.
    Plain(String),
    /// Extended ORPort: `TOR_PT_EXTENDED_SERVER_PORT` plus the
    /// authentication cookie location.
    Extended { addr: String, cookie_file: PathBuf },
}

/// One server transport to enable.
#[derive(Debug, Clone)]
pub struct ServerTransport {
    pub name: String,
    /// `addr:port` the PT should listen on for obfuscated traffic.
    pub bindaddr: Option<String>,
    /// `k=v` options forwarded through `TOR_PT_SERVER_TRANSPORT_OPTIONS`.
    pub options: Vec<(String, String)>,
}

/// Escape a server transport option key or value.
///
/// pt-spec §3.2.3: colons, semicolons and backslashes MUST be escaped
/// with a backslash.
fn escape_server_option(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '\\' | ':' | ';') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Server-role environment.
pub fn server_env(
    state_dir: &Path,
    transports: &[ServerTransport],
    orport: &OrPort,
) -> Vec<(String, String)> {
    let mut env = common_env(state_dir);

    let names: Vec<&str> = transports.iter().map(|t| t.name.as_str()).collect();
    env.push(("TOR_PT_SERVER_TRANSPORTS".to_string(), names.join(",")));

    let bindaddrs: Vec<String> = transports
        .iter()
        .filter_map(|t| t.bindaddr.as_ref().map(|a| format!("{}-{}", t.name, a)))
        .collect();
    if !bindaddrs.is_empty() {
        env.push(("TOR_PT_SERVER_BINDADDR".to_string(), bindaddrs.join(",")));
    }

    let options: Vec<String> = transports
        .iter()
        .flat_map(|t| {
            t.options.iter().map(|(k, v)| {
                format!(
                    "{}:{}={}",
                    t.name,
                    escape_server_option(k),
                    escape_server_option(v)
                )
            })
        })
        .collect();
    if !options.is_empty() {
        env.push((
            "TOR_PT_SERVER_TRANSPORT_OPTIONS".to_string(),
            options.join(";"),
        ));
    }

    match orport {
        OrPort::Plain(addr) => env.push(("TOR_PT_ORPORT".to_string(), addr.clone())),
        OrPort::Extended { addr, cookie_file } => {
            env.push(("TOR_PT_EXTENDED_SERVER_PORT".to_string(), addr.clone()));
            env.push((
                "TOR_PT_AUTH_COOKIE_FILE".to_string(),
                cookie_file.to_string_lossy().into_owned(),
            ));
        }
    }
    env
}

/// A running PT subprocess.
///
/// Exactly one per adapter instance; owns the child, the state directory
/// and the stderr-draining task.
#[derive(Debug)]
pub struct PtProcess {
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<()>>,
    state_dir: Option<StateDir>,
}

impl PtProcess {
    /// Spawn the PT executable with the given argv and environment.
    ///
    /// `exec[0]` is the executable; the rest are its arguments. The
    /// child's environment contains exactly `env`.
    pub fn spawn(
        exec: &[String],
        env: Vec<(String, String)>,
        state_dir: StateDir,
    ) -> Result<Self, ProcessError> {
        let (program, args) = exec.split_first().ok_or(ProcessError::EmptyCommand)?;

        debug!(?exec, ?env, "Starting PT executable");
        let mut child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ProcessError::Spawn)?;
        info!(pid = child.id(), "PT executable started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Drain stderr for the process lifetime so the child can never
        // block on a full pipe.
        let stderr_task = stderr.map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "pt_stderr", "{line}");
                }
            })
        });

        Ok(Self {
            child: Some(child),
            stdout,
            stderr_task,
            state_dir: Some(state_dir),
        })
    }

    /// Hand the stdout pipe to the handshake driver. Returns `None` on the
    /// second call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn state_path(&self) -> Option<&Path> {
        self.state_dir.as_ref().map(|d| d.path())
    }

    /// Whether the child has not yet been reaped.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Terminate the child: close stdin, wait `grace`, then kill.
    ///
    /// Idempotent; an auto-created state directory is removed afterwards.
    pub async fn stop(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        debug!("Attempting to terminate PT by closing stdin");
        drop(child.stdin.take());
        drop(self.stdout.take());

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "PT terminated"),
            Ok(Err(e)) => {
                warn!("Failed waiting for PT: {e}");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill PT: {e}");
                }
            }
            Err(_) => {
                debug!("PT did not exit after closing stdin, killing it");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill PT: {e}");
                }
                info!("PT killed");
            }
        }

        if let Some(task) = self.stderr_task.take() {
            // stderr hits EOF once the child is gone.
            let _ = task.await;
        }
        if let Some(StateDir::Temp(dir)) = self.state_dir.take() {
            debug!(path = %dir.path().display(), "Removing temporary state directory");
            if let Err(e) = dir.close() {
                warn!("Failed to remove temporary state directory: {e}");
            }
        }
    }
}
