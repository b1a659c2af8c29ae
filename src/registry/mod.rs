//! Transport registry
//!
//! The product of a successful PT handshake: one entry per configured
//! transport, recording whether the PT brought it up and where it listens.
//! The handshake driver is the only writer; once the handshake completes
//! the registry is published immutably behind an `Arc` and lookups are
//! lock-free.

use std::collections::HashMap;
use std::net::SocketAddr;

use thiserror::Error;
use tracing::warn;

use crate::socks::SocksProtocol;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Transport {0} is not configured")]
    UnknownTransport(String),

    #[error("Transport {0} is not ready: {1}")]
    NotReady(String, String),
}

/// Lifecycle of one configured transport during the handshake.
///
/// A terminal state (`Ready` or `Failed`) is written exactly once; further
/// writes are logged and ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    Pending,
    Ready,
    Failed,
}

/// The usable endpoint of a ready transport.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Address the PT is actually listening on.
    pub addr: SocketAddr,
    /// SOCKS protocol to speak to it (client transports only).
    pub protocol: Option<SocksProtocol>,
}

/// One configured transport's registry entry.
#[derive(Debug, Clone)]
pub struct TransportEntry {
    pub name: String,
    pub state: TransportState,
    pub endpoint: Option<Endpoint>,
    /// Out-of-band parameters the PT advertised (server `ARGS:` options).
    pub args: HashMap<String, String>,
    pub error: Option<String>,
}

impl TransportEntry {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: TransportState::Pending,
            endpoint: None,
            args: HashMap::new(),
            error: None,
        }
    }
}

/// Mapping from transport name to its handshake outcome.
#[derive(Debug, Default)]
pub struct TransportRegistry {
    entries: HashMap<String, TransportEntry>,
}

impl TransportRegistry {
    /// Create a registry with a pending entry per configured transport.
    pub fn new<I, S>(transports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = transports
            .into_iter()
            .map(|t| (t.as_ref().to_string(), TransportEntry::new(t.as_ref())))
            .collect();
        Self { entries }
    }

    /// Whether `name` is one of the configured transports.
    pub fn is_configured(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Mark a transport ready at `addr`. Returns false if the transport is
    /// not configured or already reached a terminal state.
    pub fn mark_ready(
        &mut self,
        name: &str,
        addr: SocketAddr,
        protocol: Option<SocksProtocol>,
        args: HashMap<String, String>,
    ) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) if entry.state == TransportState::Pending => {
                entry.state = TransportState::Ready;
                entry.endpoint = Some(Endpoint { addr, protocol });
                entry.args = args;
                true
            }
            Some(entry) => {
                warn!(
                    transport = name,
                    state = ?entry.state,
                    "Ignoring duplicate method line for terminal transport"
                );
                false
            }
            None => false,
        }
    }

    /// Mark a transport failed with the PT-supplied reason.
    pub fn mark_failed(&mut self, name: &str, reason: &str) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) if entry.state == TransportState::Pending => {
                entry.state = TransportState::Failed;
                entry.error = Some(reason.to_string());
                true
            }
            Some(entry) => {
                warn!(
                    transport = name,
                    state = ?entry.state,
                    "Ignoring duplicate method-error line for terminal transport"
                );
                false
            }
            None => false,
        }
    }

    /// Fail every transport still pending. Called when the PT signals
    /// handshake completion without mentioning them.
    pub fn fail_remaining_pending(&mut self, reason: &str) {
        for entry in self.entries.values_mut() {
            if entry.state == TransportState::Pending {
                warn!(transport = %entry.name, "Transport never reported by PT: {reason}");
                entry.state = TransportState::Failed;
                entry.error = Some(reason.to_string());
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&TransportEntry> {
        self.entries.get(name)
    }

    /// Endpoint of a ready transport, or why it cannot be used.
    pub fn endpoint_for(&self, name: &str) -> Result<&Endpoint, RegistryError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| RegistryError::UnknownTransport(name.to_string()))?;
        match (&entry.state, &entry.endpoint) {
            (TransportState::Ready, Some(endpoint)) => Ok(endpoint),
            (TransportState::Failed, _) => Err(RegistryError::NotReady(
                name.to_string(),
                entry.error.clone().unwrap_or_else(|| "failed".to_string()),
            )),
            _ => Err(RegistryError::NotReady(
                name.to_string(),
                "handshake still pending".to_string(),
            )),
        }
    }

    /// Names of all transports that came up ready.
    pub fn all_ready(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .entries
            .values()
            .filter(|e| e.state == TransportState::Ready)
            .map(|e| e.name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransportEntry> {
        self.entries.values()
    }
}

/// Immutable aggregate published once the handshake reaches a terminal
/// state for every configured transport.
#[derive(Debug)]
pub struct HandshakeResult {
    pub registry: TransportRegistry,
    /// Managed-transport spec version the PT negotiated.
    pub version: String,
}
