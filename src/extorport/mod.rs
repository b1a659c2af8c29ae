//! Extended ORPort endpoint.
//!
//! When the PT server forwards a de-obfuscated connection over the
//! Extended ORPort, the plain stream is preceded by a SAFE-COOKIE
//! authentication exchange and a short command phase that reveals the true
//! client address and transport name. The shared secret is a cookie file
//! the PT writes into its state directory.
//!
//! Wire format (all integers big-endian):
//!
//! ```text
//! auth:     types... 0x00 | selection | nonce[32] | hash[32] nonce[32]
//!           | hash[32] | status
//! commands: u16 type, u16 length, body
//! ```
//!
//! Session state machine per accepted connection:
//! `awaiting_nonce → awaiting_server_reply → sending_client_hash →
//! authenticated → reading_commands → dispatched`, failing terminally at
//! any step. A failed session drops only its own connection.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// First 32 bytes of the cookie file.
pub const COOKIE_HEADER: &[u8; 32] = b"! Extended ORPort Auth Cookie !\x0a";
/// Length of the shared secret following the header.
pub const COOKIE_LEN: usize = 32;
const NONCE_LEN: usize = 32;
const HASH_LEN: usize = 32;

const SERVER_HASH_CONTEXT: &[u8] = b"ExtORPort authentication server-to-client hash";
const CLIENT_HASH_CONTEXT: &[u8] = b"ExtORPort authentication client-to-server hash";

const AUTH_TYPE_END: u8 = 0x00;
const AUTH_TYPE_SAFE_COOKIE: u8 = 0x01;

const CMD_DONE: u16 = 0x0000;
const CMD_USERADDR: u16 = 0x0001;
const CMD_TRANSPORT: u16 = 0x0002;
const REPLY_OKAY: u16 = 0x1000;
const REPLY_DENY: u16 = 0x1001;

/// Extended ORPort errors. Fatal only to the one session they occur on.
#[derive(Debug, Error)]
pub enum ExtOrPortError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Authentication cookie file {} did not appear in time", .0.display())]
    CookieTimeout(PathBuf),

    #[error("Malformed authentication cookie file: {0}")]
    CookieFormat(String),

    #[error("Peer offers no SAFE-COOKIE authentication")]
    NoSafeCookie,

    #[error("SAFE-COOKIE authentication failed: {0}")]
    Auth(&'static str),

    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    #[error("Connection rejected by pre-connect check")]
    Rejected,
}

/// The recovered origin of a forwarded connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Transport the client used to reach the PT.
    pub transport: String,
    /// The client's real address as seen by the PT.
    pub peer: SocketAddr,
}

/// Parse a cookie file's contents into the shared secret.
pub fn parse_cookie(data: &[u8]) -> Result<[u8; COOKIE_LEN], ExtOrPortError> {
    if data.len() != COOKIE_HEADER.len() + COOKIE_LEN {
        return Err(ExtOrPortError::CookieFormat(format!(
            "expected {} bytes, got {}",
            COOKIE_HEADER.len() + COOKIE_LEN,
            data.len()
        )));
    }
    if &data[..COOKIE_HEADER.len()] != COOKIE_HEADER {
        return Err(ExtOrPortError::CookieFormat(
            "bad static header".to_string(),
        ));
    }
    let mut cookie = [0u8; COOKIE_LEN];
    cookie.copy_from_slice(&data[COOKIE_HEADER.len()..]);
    Ok(cookie)
}

/// Wait for the PT to write its cookie file, then read the secret.
///
/// The PT creates the file on first run, so there is a window where it
/// does not exist yet; poll until `timeout` expires.
pub async fn wait_for_cookie(
    path: &Path,
    timeout: Duration,
) -> Result<[u8; COOKIE_LEN], ExtOrPortError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::fs::read(path).await {
            Ok(data) => return parse_cookie(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(ExtOrPortError::CookieTimeout(path.to_path_buf()));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn write_command<S>(stream: &mut S, command: u16, body: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u16(command);
    buf.put_u16(body.len() as u16);
    buf.put_slice(body);
    stream.write_all(&buf).await
}

async fn read_command<S>(stream: &mut S) -> Result<(u16, Vec<u8>), ExtOrPortError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let mut header = &header[..];
    let command = header.get_u16();
    let len = header.get_u16() as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok((command, body))
}

/// Run the SAFE-COOKIE authentication against the peer.
///
/// We initiate the nonce: read the peer's supported auth types, select
/// SAFE-COOKIE, send our nonce, verify the peer's hash over both nonces
/// and answer with ours. Any digest mismatch terminates the session.
async fn authenticate<S>(stream: &mut S, cookie: &[u8; COOKIE_LEN]) -> Result<(), ExtOrPortError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // awaiting_nonce: the peer lists its auth types, one byte each,
    // terminated by 0x00.
    let mut offers_safe_cookie = false;
    let mut byte = [0u8; 1];
    for _ in 0..=u8::MAX {
        stream.read_exact(&mut byte).await?;
        match byte[0] {
            AUTH_TYPE_END => break,
            AUTH_TYPE_SAFE_COOKIE => offers_safe_cookie = true,
            other => debug!("Peer offers unknown auth type {other:#04x}"),
        }
    }
    if !offers_safe_cookie {
        return Err(ExtOrPortError::NoSafeCookie);
    }
    stream.write_all(&[AUTH_TYPE_SAFE_COOKIE]).await?;

    let mut client_nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut client_nonce)
        .map_err(|_| ExtOrPortError::Auth("nonce generation failed"))?;
    stream.write_all(&client_nonce).await?;

    // awaiting_server_reply
    let mut reply = [0u8; HASH_LEN + NONCE_LEN];
    stream.read_exact(&mut reply).await?;
    let (server_hash, server_nonce) = reply.split_at(HASH_LEN);

    let key = hmac::Key::new(hmac::HMAC_SHA256, cookie);
    let mut msg = Vec::with_capacity(SERVER_HASH_CONTEXT.len() + NONCE_LEN * 2);
    msg.extend_from_slice(SERVER_HASH_CONTEXT);
    msg.extend_from_slice(&client_nonce);
    msg.extend_from_slice(server_nonce);
    hmac::verify(&key, &msg, server_hash)
        .map_err(|_| ExtOrPortError::Auth("server hash mismatch"))?;

    // sending_client_hash
    let mut msg = Vec::with_capacity(CLIENT_HASH_CONTEXT.len() + NONCE_LEN * 2);
    msg.extend_from_slice(CLIENT_HASH_CONTEXT);
    msg.extend_from_slice(&client_nonce);
    msg.extend_from_slice(server_nonce);
    let client_hash = hmac::sign(&key, &msg);
    stream.write_all(client_hash.as_ref()).await?;

    stream.read_exact(&mut byte).await?;
    if byte[0] == 0 {
        return Err(ExtOrPortError::Auth("peer rejected our hash"));
    }
    Ok(())
}

/// Run one full Extended ORPort session on an accepted connection.
///
/// After authentication, the command phase recovers the client info.
/// Unknown command types are skipped by their declared length for forward
/// compatibility. `accept` is consulted on DONE; rejection answers DENY
/// and ends the session before any payload data is touched.
pub async fn handshake<S, F>(
    stream: &mut S,
    cookie: &[u8; COOKIE_LEN],
    accept: F,
) -> Result<ClientInfo, ExtOrPortError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&ClientInfo) -> bool,
{
    authenticate(stream, cookie).await?;

    // reading_commands
    let mut peer: Option<SocketAddr> = None;
    let mut transport: Option<String> = None;
    loop {
        let (command, body) = read_command(stream).await?;
        match command {
            CMD_USERADDR => {
                let text = std::str::from_utf8(&body).map_err(|_| {
                    ExtOrPortError::MalformedCommand("USERADDR is not UTF-8".to_string())
                })?;
                peer = Some(text.parse().map_err(|_| {
                    ExtOrPortError::MalformedCommand(format!("bad USERADDR {text:?}"))
                })?);
            }
            CMD_TRANSPORT => {
                let name = std::str::from_utf8(&body).map_err(|_| {
                    ExtOrPortError::MalformedCommand("TRANSPORT is not UTF-8".to_string())
                })?;
                if !crate::protocol::validate_transport_name(name) {
                    return Err(ExtOrPortError::MalformedCommand(format!(
                        "bad TRANSPORT name {name:?}"
                    )));
                }
                transport = Some(name.to_string());
            }
            CMD_DONE => break,
            other => debug!("Skipping unknown ExtOrPort command {other:#06x} ({} bytes)", body.len()),
        }
    }

    let info = match (transport, peer) {
        (Some(transport), Some(peer)) => ClientInfo { transport, peer },
        _ => {
            return Err(ExtOrPortError::MalformedCommand(
                "DONE before USERADDR and TRANSPORT".to_string(),
            ))
        }
    };

    if !accept(&info) {
        warn!(?info, "Connection rejected by pre-connect check");
        write_command(stream, REPLY_DENY, &[]).await?;
        return Err(ExtOrPortError::Rejected);
    }
    write_command(stream, REPLY_OKAY, &[]).await?;
    // dispatched
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const COOKIE: [u8; COOKIE_LEN] = [0x42; COOKIE_LEN];

    /// Drive the PT's side of the exchange: serve the auth, optionally
    /// corrupt the server hash, then send the given commands.
    async fn mock_pt_side<S>(
        stream: &mut S,
        corrupt_hash: bool,
        commands: &[(u16, Vec<u8>)],
    ) -> Option<(u16, Vec<u8>)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream
            .write_all(&[AUTH_TYPE_SAFE_COOKIE, AUTH_TYPE_END])
            .await
            .unwrap();

        let mut selection = [0u8; 1];
        stream.read_exact(&mut selection).await.unwrap();
        assert_eq!(selection[0], AUTH_TYPE_SAFE_COOKIE);

        let mut client_nonce = [0u8; NONCE_LEN];
        stream.read_exact(&mut client_nonce).await.unwrap();

        let server_nonce = [0x77u8; NONCE_LEN];
        let key = hmac::Key::new(hmac::HMAC_SHA256, &COOKIE);
        let mut msg = Vec::new();
        msg.extend_from_slice(SERVER_HASH_CONTEXT);
        msg.extend_from_slice(&client_nonce);
        msg.extend_from_slice(&server_nonce);
        let mut server_hash = hmac::sign(&key, &msg).as_ref().to_vec();
        if corrupt_hash {
            server_hash[0] ^= 0xFF;
        }
        stream.write_all(&server_hash).await.unwrap();
        stream.write_all(&server_nonce).await.unwrap();
        if corrupt_hash {
            // The session ends here; nothing more to serve.
            return None;
        }

        let mut client_hash = [0u8; HASH_LEN];
        stream.read_exact(&mut client_hash).await.unwrap();
        let mut msg = Vec::new();
        msg.extend_from_slice(CLIENT_HASH_CONTEXT);
        msg.extend_from_slice(&client_nonce);
        msg.extend_from_slice(&server_nonce);
        hmac::verify(&key, &msg, &client_hash).unwrap();
        stream.write_all(&[1]).await.unwrap();

        for (command, body) in commands {
            write_command(stream, *command, body).await.unwrap();
        }
        Some(read_command(stream).await.unwrap())
    }

    #[test]
    fn test_parse_cookie() {
        let mut data = Vec::new();
        data.extend_from_slice(COOKIE_HEADER);
        data.extend_from_slice(&COOKIE);
        assert_eq!(parse_cookie(&data).unwrap(), COOKIE);

        assert!(matches!(
            parse_cookie(&data[..40]),
            Err(ExtOrPortError::CookieFormat(_))
        ));
        let mut bad = data.clone();
        bad[0] = b'?';
        assert!(matches!(
            parse_cookie(&bad),
            Err(ExtOrPortError::CookieFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_cookie_appears_late() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extorport_cookie");

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let mut data = Vec::new();
            data.extend_from_slice(COOKIE_HEADER);
            data.extend_from_slice(&COOKIE);
            tokio::fs::write(&writer_path, &data).await.unwrap();
        });

        let cookie = wait_for_cookie(&path, Duration::from_secs(5)).await.unwrap();
        assert_eq!(cookie, COOKIE);
    }

    #[tokio::test]
    async fn test_wait_for_cookie_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never_written");
        let err = wait_for_cookie(&path, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtOrPortError::CookieTimeout(_)));
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let (mut ours, mut theirs) = duplex(4096);

        let pt = tokio::spawn(async move {
            mock_pt_side(
                &mut theirs,
                false,
                &[
                    (CMD_USERADDR, b"5.6.7.8:4321".to_vec()),
                    (CMD_TRANSPORT, b"obfs3".to_vec()),
                    (CMD_DONE, vec![]),
                ],
            )
            .await
        });

        let info = handshake(&mut ours, &COOKIE, |_| true).await.unwrap();
        assert_eq!(info.transport, "obfs3");
        assert_eq!(info.peer, "5.6.7.8:4321".parse().unwrap());

        let reply = pt.await.unwrap().unwrap();
        assert_eq!(reply.0, REPLY_OKAY);
        assert!(reply.1.is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_server_hash_fails_auth() {
        let (mut ours, mut theirs) = duplex(4096);

        let pt = tokio::spawn(async move { mock_pt_side(&mut theirs, true, &[]).await });

        let mut accept_called = false;
        let err = handshake(&mut ours, &COOKIE, |_| {
            accept_called = true;
            true
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ExtOrPortError::Auth(_)));
        assert!(!accept_called, "callback must not run on auth failure");
        pt.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_commands_are_skipped() {
        let (mut ours, mut theirs) = duplex(4096);

        let pt = tokio::spawn(async move {
            mock_pt_side(
                &mut theirs,
                false,
                &[
                    (0x00F0, vec![1, 2, 3, 4, 5]),
                    (CMD_USERADDR, b"[2001:db8::1]:443".to_vec()),
                    (0x7FFF, vec![]),
                    (CMD_TRANSPORT, b"obfs4".to_vec()),
                    (CMD_DONE, vec![]),
                ],
            )
            .await
        });

        let info = handshake(&mut ours, &COOKIE, |_| true).await.unwrap();
        assert_eq!(info.peer, "[2001:db8::1]:443".parse().unwrap());
        assert_eq!(info.transport, "obfs4");
        pt.await.unwrap();
    }

    #[tokio::test]
    async fn test_pre_connect_rejection_sends_deny() {
        let (mut ours, mut theirs) = duplex(4096);

        let pt = tokio::spawn(async move {
            mock_pt_side(
                &mut theirs,
                false,
                &[
                    (CMD_USERADDR, b"9.9.9.9:1000".to_vec()),
                    (CMD_TRANSPORT, b"obfs4".to_vec()),
                    (CMD_DONE, vec![]),
                ],
            )
            .await
        });

        let err = handshake(&mut ours, &COOKIE, |info| info.peer.port() != 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtOrPortError::Rejected));

        let reply = pt.await.unwrap().unwrap();
        assert_eq!(reply.0, REPLY_DENY);
    }

    #[tokio::test]
    async fn test_done_without_useraddr_is_malformed() {
        let (mut ours, mut theirs) = duplex(4096);

        let pt = tokio::spawn(async move {
            mock_pt_side(&mut theirs, false, &[(CMD_DONE, vec![])]).await
        });

        let err = handshake(&mut ours, &COOKIE, |_| true).await.unwrap_err();
        assert!(matches!(err, ExtOrPortError::MalformedCommand(_)));
        // The peer's read of our reply fails since we dropped the session.
        drop(ours);
        let _ = pt.await;
    }
}
