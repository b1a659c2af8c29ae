//! PT managed-proxy control protocol (pt-spec §3.3).
//!
//! The PT child reports readiness over stdout as keyword-prefixed lines:
//!
//! ```text
//! VERSION 1
//! CMETHOD obfs4 socks5 127.0.0.1:9050
//! CMETHODS DONE
//! ```
//!
//! [`classify`] turns one line into a typed [`Line`]; [`Handshake`] is the
//! state machine that consumes them. The machine is synchronous on purpose:
//! the async driver suspends only at the read-next-line boundary, so the
//! whole handshake can be tested against canned line sequences.
//!
//! Parsing is tolerant. PTs emit informational text alongside protocol
//! lines, so anything that does not match the grammar is a log line, never
//! an error.

use std::collections::HashMap;
use std::net::SocketAddr;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::registry::{HandshakeResult, TransportRegistry};
use crate::socks::SocksProtocol;

/// Control-protocol errors. All of these are fatal to the handshake.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("PT version negotiation failed: {0}")]
    Version(String),

    #[error("PT environment error: {0}")]
    Env(String),

    #[error("PT upstream proxy error: {0}")]
    Proxy(String),

    #[error("PT closed stdout before completing the handshake")]
    StdoutClosed,
}

/// Which family of method lines the handshake expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// One classified stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Version(String),
    VersionError(String),
    EnvError(String),
    ProxyDone,
    ProxyError(String),
    CMethod {
        name: String,
        protocol: SocksProtocol,
        addr: SocketAddr,
    },
    CMethodError {
        name: String,
        reason: String,
    },
    CMethodsDone,
    SMethod {
        name: String,
        addr: SocketAddr,
        args: HashMap<String, String>,
    },
    SMethodError {
        name: String,
        reason: String,
    },
    SMethodsDone,
    /// A `LOG` line, or anything that failed to parse as protocol.
    Log(String),
}

/// Classify one stdout line by its leading keyword.
pub fn classify(line: &str) -> Line {
    let (kw, args) = match line.split_once(' ') {
        Some((kw, rest)) => (kw, rest),
        None => (line, ""),
    };

    match kw {
        "VERSION" if !args.is_empty() => Line::Version(args.to_string()),
        "VERSION-ERROR" => Line::VersionError(line.to_string()),
        "ENV-ERROR" => Line::EnvError(args.to_string()),
        "PROXY" if args == "DONE" => Line::ProxyDone,
        "PROXY-ERROR" => Line::ProxyError(args.to_string()),
        "CMETHOD" if args != "DONE" => {
            let mut parts = args.splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(name), Some(proto), Some(addr)) => {
                    match (SocksProtocol::from_token(proto), addr.parse()) {
                        (Some(protocol), Ok(addr)) => Line::CMethod {
                            name: name.to_string(),
                            protocol,
                            addr,
                        },
                        _ => Line::Log(line.to_string()),
                    }
                }
                _ => Line::Log(line.to_string()),
            }
        }
        "CMETHOD-ERROR" => match args.split_once(' ') {
            Some((name, reason)) => Line::CMethodError {
                name: name.to_string(),
                reason: reason.to_string(),
            },
            None => Line::Log(line.to_string()),
        },
        "CMETHODS" if args == "DONE" => Line::CMethodsDone,
        "SMETHOD" if args != "DONE" => {
            let mut parts = args.splitn(3, ' ');
            match (parts.next(), parts.next()) {
                (Some(name), Some(addr)) => match addr.parse() {
                    Ok(addr) => {
                        let args = parts
                            .next()
                            .and_then(parse_smethod_options)
                            .unwrap_or_default();
                        Line::SMethod {
                            name: name.to_string(),
                            addr,
                            args,
                        }
                    }
                    Err(_) => Line::Log(line.to_string()),
                },
                _ => Line::Log(line.to_string()),
            }
        }
        "SMETHOD-ERROR" => match args.split_once(' ') {
            Some((name, reason)) => Line::SMethodError {
                name: name.to_string(),
                reason: reason.to_string(),
            },
            None => Line::Log(line.to_string()),
        },
        "SMETHODS" if args == "DONE" => Line::SMethodsDone,
        _ => Line::Log(line.to_string()),
    }
}

/// Parse the option tokens of an SMETHOD line, keeping only `ARGS:`.
///
/// pt-spec §3.3.3: `ARGS:[<Key>=<Value>,]+` with equal signs and commas
/// escaped by backslash. These are parameters clients need to connect,
/// e.g. the obfs4 certificate.
fn parse_smethod_options(options: &str) -> Option<HashMap<String, String>> {
    for token in options.split(' ') {
        if let Some(rest) = token.strip_prefix("ARGS:") {
            return Some(parse_args_list(rest));
        }
    }
    None
}

fn parse_args_list(input: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut escaped = false;

    let mut push = |key: &mut String, value: &mut String, in_value: &mut bool| {
        if !key.is_empty() {
            out.insert(std::mem::take(key), std::mem::take(value));
        } else {
            key.clear();
            value.clear();
        }
        *in_value = false;
    };

    for c in input.chars() {
        if escaped {
            if in_value { &mut value } else { &mut key }.push(c);
            escaped = false;
        } else {
            match c {
                '\\' => escaped = true,
                '=' if !in_value => in_value = true,
                ',' => push(&mut key, &mut value, &mut in_value),
                _ => if in_value { &mut value } else { &mut key }.push(c),
            }
        }
    }
    push(&mut key, &mut value, &mut in_value);
    out
}

/// Validate a transport name (pt-spec §3.1: a valid C identifier).
pub fn validate_transport_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingVersion,
    NegotiatingMethods,
    Complete,
}

/// What a fed line did to the handshake.
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    /// More lines needed.
    Pending,
    /// The completion marker arrived; call [`Handshake::finish`].
    Complete,
}

/// The handshake state machine.
///
/// `awaiting_version → negotiating_methods → complete`, failing out of any
/// state on a fatal line. Per-transport terminal states are applied to the
/// registry in line order; the machine is the registry's only writer.
#[derive(Debug)]
pub struct Handshake {
    role: Role,
    stage: Stage,
    version: Option<String>,
    registry: TransportRegistry,
}

impl Handshake {
    pub fn new<I, S>(role: Role, transports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            role,
            stage: Stage::AwaitingVersion,
            version: None,
            registry: TransportRegistry::new(transports),
        }
    }

    /// Feed one stdout line. Fatal protocol lines return an error and
    /// poison nothing: the caller is expected to stop the subprocess.
    pub fn feed(&mut self, raw: &str) -> Result<Progress, ProtocolError> {
        debug_assert_ne!(self.stage, Stage::Complete, "fed after completion");

        let line = classify(raw);
        match line {
            Line::VersionError(msg) => return Err(ProtocolError::Version(msg)),
            Line::EnvError(msg) => return Err(ProtocolError::Env(msg)),
            Line::ProxyError(msg) => return Err(ProtocolError::Proxy(msg)),
            Line::Version(v) => {
                if v.split(' ').any(|t| t == crate::MANAGED_TRANSPORT_VER) {
                    debug!(version = %v, "PT negotiated managed transport version");
                    self.version = Some(v);
                    self.stage = Stage::NegotiatingMethods;
                } else {
                    return Err(ProtocolError::Version(format!(
                        "unsupported version {v:?}"
                    )));
                }
            }
            Line::ProxyDone => debug!("PT accepted upstream proxy"),
            Line::Log(msg) => debug!(target: "pt_stdout", "{msg}"),
            // Everything below is a method line and requires a negotiated
            // version first.
            _ if self.stage == Stage::AwaitingVersion => {
                return Err(ProtocolError::Version(format!(
                    "method line before VERSION: {raw:?}"
                )));
            }
            Line::CMethod {
                name,
                protocol,
                addr,
            } if self.role == Role::Client => {
                if self.registry.is_configured(&name) {
                    info!(transport = %name, %addr, ?protocol, "PT client transport ready");
                    self.registry
                        .mark_ready(&name, addr, Some(protocol), HashMap::new());
                } else {
                    warn!(transport = %name, "PT reported unconfigured transport, ignoring");
                }
            }
            Line::CMethodError { name, reason } if self.role == Role::Client => {
                warn!(transport = %name, %reason, "PT client transport failed");
                self.registry.mark_failed(&name, &reason);
            }
            Line::CMethodsDone if self.role == Role::Client => {
                info!("PT client initialization complete");
                self.registry.fail_remaining_pending("not reported by PT");
                self.stage = Stage::Complete;
                return Ok(Progress::Complete);
            }
            Line::SMethod { name, addr, args } if self.role == Role::Server => {
                if self.registry.is_configured(&name) {
                    info!(transport = %name, %addr, "PT server transport ready");
                    self.registry.mark_ready(&name, addr, None, args);
                } else {
                    warn!(transport = %name, "PT reported unconfigured transport, ignoring");
                }
            }
            Line::SMethodError { name, reason } if self.role == Role::Server => {
                warn!(transport = %name, %reason, "PT server transport failed");
                self.registry.mark_failed(&name, &reason);
            }
            Line::SMethodsDone if self.role == Role::Server => {
                info!("PT server initialization complete");
                self.registry.fail_remaining_pending("not reported by PT");
                self.stage = Stage::Complete;
                return Ok(Progress::Complete);
            }
            // Method lines of the wrong family for our role.
            other => warn!("Unexpected PT stdout line for role {:?}: {other:?}", self.role),
        }
        Ok(Progress::Pending)
    }

    /// Finalize into the published handshake result.
    ///
    /// Must only be called after [`Progress::Complete`].
    pub fn finish(self) -> HandshakeResult {
        debug_assert_eq!(self.stage, Stage::Complete);
        HandshakeResult {
            registry: self.registry,
            version: self.version.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TransportState;

    fn drive(role: Role, transports: &[&str], lines: &[&str]) -> Result<Handshake, ProtocolError> {
        let mut hs = Handshake::new(role, transports.iter().copied());
        for line in lines {
            hs.feed(line)?;
        }
        Ok(hs)
    }

    #[test]
    fn test_classify_cmethod() {
        let line = classify("CMETHOD obfs4 socks5 127.0.0.1:9050");
        assert_eq!(
            line,
            Line::CMethod {
                name: "obfs4".to_string(),
                protocol: SocksProtocol::Socks5,
                addr: "127.0.0.1:9050".parse().unwrap(),
            }
        );
    }

    #[test]
    fn test_classify_junk_is_log() {
        assert!(matches!(classify("hello world"), Line::Log(_)));
        assert!(matches!(classify("CMETHOD obfs4"), Line::Log(_)));
        assert!(matches!(
            classify("CMETHOD obfs4 socks5 notanaddress"),
            Line::Log(_)
        ));
        assert!(matches!(classify(""), Line::Log(_)));
    }

    #[test]
    fn test_classify_smethod_args() {
        match classify("SMETHOD obfs4 0.0.0.0:1984 ARGS:cert=abc\\,def,iat-mode=0") {
            Line::SMethod { name, args, .. } => {
                assert_eq!(name, "obfs4");
                assert_eq!(args.get("cert").map(String::as_str), Some("abc,def"));
                assert_eq!(args.get("iat-mode").map(String::as_str), Some("0"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_client_handshake_success() {
        let mut hs = Handshake::new(Role::Client, ["obfs4"]);
        assert_eq!(hs.feed("VERSION 1").unwrap(), Progress::Pending);
        assert_eq!(
            hs.feed("CMETHOD obfs4 socks5 127.0.0.1:9050").unwrap(),
            Progress::Pending
        );
        assert_eq!(hs.feed("CMETHODS DONE").unwrap(), Progress::Complete);

        let result = hs.finish();
        assert_eq!(result.version, "1");
        let endpoint = result.registry.endpoint_for("obfs4").unwrap();
        assert_eq!(endpoint.addr, "127.0.0.1:9050".parse().unwrap());
        assert_eq!(endpoint.protocol, Some(SocksProtocol::Socks5));
    }

    #[test]
    fn test_method_before_version_is_fatal() {
        let mut hs = Handshake::new(Role::Client, ["obfs4"]);
        let err = hs.feed("CMETHOD obfs4 socks5 127.0.0.1:9050").unwrap_err();
        assert!(matches!(err, ProtocolError::Version(_)));
    }

    #[test]
    fn test_unsupported_version_is_fatal() {
        let mut hs = Handshake::new(Role::Client, ["obfs4"]);
        let err = hs.feed("VERSION 2").unwrap_err();
        assert!(matches!(err, ProtocolError::Version(_)));
    }

    #[test]
    fn test_version_error_line_is_fatal() {
        let mut hs = Handshake::new(Role::Client, ["obfs4"]);
        assert!(matches!(
            hs.feed("VERSION-ERROR no-version"),
            Err(ProtocolError::Version(_))
        ));
    }

    #[test]
    fn test_env_error_line_is_fatal() {
        let mut hs = Handshake::new(Role::Server, ["obfs4"]);
        assert!(matches!(
            hs.feed("ENV-ERROR No TOR_PT_ORPORT environment variable"),
            Err(ProtocolError::Env(_))
        ));
    }

    #[test]
    fn test_method_error_is_not_fatal() {
        let hs = drive(
            Role::Client,
            &["obfs4", "meek"],
            &[
                "VERSION 1",
                "CMETHOD-ERROR obfs4 no such transport is supported",
                "CMETHOD meek socks5 127.0.0.1:2000",
                "CMETHODS DONE",
            ],
        )
        .unwrap();
        let result = hs.finish();
        assert_eq!(result.registry.all_ready(), vec!["meek"]);
        let entry = result.registry.get("obfs4").unwrap();
        assert_eq!(entry.state, TransportState::Failed);
        assert!(entry.error.as_deref().unwrap().contains("no such transport"));
    }

    #[test]
    fn test_done_before_method_leaves_transport_failed() {
        let hs = drive(Role::Client, &["obfs4"], &["VERSION 1", "CMETHODS DONE"]).unwrap();
        let result = hs.finish();
        let entry = result.registry.get("obfs4").unwrap();
        assert_eq!(entry.state, TransportState::Failed);
        assert!(result.registry.all_ready().is_empty());
    }

    #[test]
    fn test_no_entry_left_pending_after_done() {
        let hs = drive(
            Role::Server,
            &["a", "b", "c"],
            &[
                "VERSION 1",
                "SMETHOD a 0.0.0.0:1984",
                "SMETHOD-ERROR b bind failed",
                "SMETHODS DONE",
            ],
        )
        .unwrap();
        let result = hs.finish();
        for entry in result.registry.iter() {
            assert_ne!(entry.state, TransportState::Pending, "{}", entry.name);
        }
    }

    #[test]
    fn test_unconfigured_method_line_ignored() {
        let hs = drive(
            Role::Client,
            &["obfs4"],
            &[
                "VERSION 1",
                "CMETHOD meek socks4 127.0.0.1:3000",
                "CMETHOD obfs4 socks5 127.0.0.1:9050",
                "CMETHODS DONE",
            ],
        )
        .unwrap();
        let result = hs.finish();
        assert_eq!(result.registry.all_ready(), vec!["obfs4"]);
        assert!(result.registry.get("meek").is_none());
    }

    #[test]
    fn test_junk_lines_tolerated_mid_handshake() {
        let hs = drive(
            Role::Client,
            &["obfs4"],
            &[
                "VERSION 1",
                "2024/01/01 12:00:00 obfs4proxy starting up",
                "LOG SEVERITY=debug MESSAGE=listening",
                "CMETHOD obfs4 socks5 127.0.0.1:9050",
                "CMETHODS DONE",
            ],
        )
        .unwrap();
        assert_eq!(hs.finish().registry.all_ready(), vec!["obfs4"]);
    }

    #[test]
    fn test_wrong_family_method_line_is_ignored() {
        let hs = drive(
            Role::Client,
            &["obfs4"],
            &[
                "VERSION 1",
                "SMETHOD obfs4 0.0.0.0:1984",
                "CMETHOD obfs4 socks5 127.0.0.1:9050",
                "CMETHODS DONE",
            ],
        )
        .unwrap();
        let result = hs.finish();
        let endpoint = result.registry.endpoint_for("obfs4").unwrap();
        assert_eq!(endpoint.addr, "127.0.0.1:9050".parse().unwrap());
    }

    #[test]
    fn test_validate_transport_name() {
        assert!(validate_transport_name("obfs4"));
        assert!(validate_transport_name("_meek_lite"));
        assert!(!validate_transport_name("4obfs"));
        assert!(!validate_transport_name("bad-name"));
        assert!(!validate_transport_name(""));
    }
}
