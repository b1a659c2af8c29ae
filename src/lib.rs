//! # ptproxy
//!
//! Runs a Tor pluggable transport (PT) executable as a standalone,
//! controllable TCP tunnel client or server, independent of Tor itself.
//!
//! A PT is an external program that obfuscates network traffic. This crate
//! speaks the managed-proxy control protocol over the PT's stdout to learn
//! which transports are ready and where they listen, then exposes them:
//!
//! - **Client side**: open obfuscated connections through the PT's SOCKS
//!   port, with per-connection arguments carried in the SOCKS auth fields.
//! - **Server side**: accept the de-obfuscated connections the PT forwards,
//!   optionally over the Extended ORPort protocol, which recovers the real
//!   client address and transport name via cookie-based (SAFE-COOKIE)
//!   authentication.
//! - **Relay engine**: bridge each accepted connection with its counterpart
//!   until both directions close, with TCP half-close semantics.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │            Adapters (client / server)             │
//! │     handshake driving, listeners, callbacks       │
//! ├─────────────┬───────────────┬─────────────────────┤
//! │  registry   │     socks     │      extorport      │
//! │  transport  │   SOCKS4/5    │  SAFE-COOKIE auth,  │
//! │  endpoints  │  negotiation  │   command records   │
//! ├─────────────┴───────┬───────┴─────────────────────┤
//! │      protocol       │            relay            │
//! │  stdout line FSM    │    bidirectional copying    │
//! ├─────────────────────┴─────────────────────────────┤
//! │                     process                       │
//! │    PT subprocess, env contract, state directory   │
//! └───────────────────────────────────────────────────┘
//! ```

pub mod adapter;
pub mod config;
pub mod extorport;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod socks;

pub use adapter::{ClientAdapter, ExtServerAdapter, ServerAdapter, Timeouts};
pub use config::Config;
pub use extorport::ClientInfo;
pub use registry::{HandshakeResult, TransportRegistry, TransportState};

/// Managed transport protocol version this crate speaks.
pub const MANAGED_TRANSPORT_VER: &str = "1";

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process error: {0}")]
    Process(#[from] process::ProcessError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Registry error: {0}")]
    Registry(#[from] registry::RegistryError),

    #[error("SOCKS error: {0}")]
    Socks(#[from] socks::SocksError),

    #[error("Extended ORPort error: {0}")]
    ExtOrPort(#[from] extorport::ExtOrPortError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connect through transport {transport} failed: {source}")]
    Connect {
        transport: String,
        #[source]
        source: Box<Error>,
    },

    #[error("PT handshake timed out")]
    HandshakeTimeout,
}
