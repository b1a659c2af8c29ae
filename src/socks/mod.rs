//! SOCKS client negotiation against the PT's advertised proxy port.
//!
//! PT clients expose each transport as a local SOCKS4 or SOCKS5 proxy.
//! The true destination goes in the SOCKS request, and per-connection
//! transport arguments are smuggled through the authentication fields:
//! the SOCKS5 username/password or the SOCKS4 userid (pt-spec §3.5).

use std::collections::HashMap;
use std::net::IpAddr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS4_VERSION: u8 = 0x04;

/// SOCKS5 authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
}

/// SOCKS5 address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = SocksError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(SocksError::UnsupportedAddressType(value)),
        }
    }
}

/// Proxy protocol a PT client transport advertised in its CMETHOD line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksProtocol {
    Socks4,
    Socks5,
}

impl SocksProtocol {
    /// Parse the protocol token of a CMETHOD line.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "socks4" => Some(SocksProtocol::Socks4),
            "socks5" => Some(SocksProtocol::Socks5),
            _ => None,
        }
    }
}

/// SOCKS negotiation errors
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version from proxy: {0}")]
    InvalidVersion(u8),

    #[error("Proxy rejected authentication method, returned {0:#04x}")]
    AuthMethodRejected(u8),

    #[error("Proxy rejected username/password, status {0:#04x}")]
    AuthFailed(u8),

    #[error("Proxy rejected connection, reply code {0:#04x}")]
    ConnectRejected(u8),

    #[error("Address type not supported: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("Encoded per-connection args too long ({0} bytes, max 510)")]
    ArgsTooLong(usize),

    #[error("Hostname too long ({0} bytes, max 255)")]
    HostnameTooLong(usize),

    #[error("SOCKS4 requires an IPv4 destination, got {0:?}")]
    Socks4RequiresIpv4(String),
}

/// Escape one key or value of a per-connection argument.
///
/// pt-spec §3.5: backslash, equal sign and semicolon characters MUST be
/// escaped with a backslash.
fn escape_arg(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '\\' | '=' | ';') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Encode per-connection args as `k=v;k=v` with keys sorted for a stable
/// wire form.
pub fn encode_args(args: &HashMap<String, String>) -> Vec<u8> {
    let mut pairs: Vec<(&String, &String)> = args.iter().collect();
    pairs.sort_unstable_by_key(|(k, _)| k.as_str());
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", escape_arg(k), escape_arg(v)))
        .collect::<Vec<_>>()
        .join(";")
        .into_bytes()
}

/// Negotiate with the PT's proxy port in the protocol it advertised.
///
/// On success the stream carries the obfuscated connection to
/// `host:port` and all proxy framing is consumed.
pub async fn negotiate<S>(
    stream: &mut S,
    protocol: SocksProtocol,
    host: &str,
    port: u16,
    args: &HashMap<String, String>,
) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match protocol {
        SocksProtocol::Socks4 => negotiate_socks4(stream, host, port, args).await,
        SocksProtocol::Socks5 => negotiate_socks5(stream, host, port, args).await,
    }
}

async fn negotiate_socks5<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    args: &HashMap<String, String>,
) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];

    if args.is_empty() {
        stream
            .write_all(&[SOCKS5_VERSION, 1, AuthMethod::NoAuth as u8])
            .await?;
        stream.read_exact(&mut buf).await?;
        if buf[0] != SOCKS5_VERSION {
            return Err(SocksError::InvalidVersion(buf[0]));
        }
        if buf[1] != AuthMethod::NoAuth as u8 {
            return Err(SocksError::AuthMethodRejected(buf[1]));
        }
    } else {
        let encoded = encode_args(args);
        // Both fields are length-prefixed with one byte each.
        if encoded.len() > 255 * 2 {
            return Err(SocksError::ArgsTooLong(encoded.len()));
        }
        let username = &encoded[..encoded.len().min(255)];
        let password: &[u8] = if encoded.len() > 255 {
            &encoded[255..]
        } else {
            b"\0"
        };

        stream
            .write_all(&[SOCKS5_VERSION, 1, AuthMethod::UsernamePassword as u8])
            .await?;
        stream.read_exact(&mut buf).await?;
        if buf[0] != SOCKS5_VERSION {
            return Err(SocksError::InvalidVersion(buf[0]));
        }
        if buf[1] != AuthMethod::UsernamePassword as u8 {
            return Err(SocksError::AuthMethodRejected(buf[1]));
        }

        // Username/password sub-negotiation, version 1 (RFC 1929).
        let mut req = Vec::with_capacity(3 + username.len() + password.len());
        req.push(0x01);
        req.push(username.len() as u8);
        req.extend_from_slice(username);
        req.push(password.len() as u8);
        req.extend_from_slice(password);
        stream.write_all(&req).await?;

        stream.read_exact(&mut buf).await?;
        if buf[1] != 0 {
            return Err(SocksError::AuthFailed(buf[1]));
        }
    }

    // CONNECT request
    let mut req = vec![SOCKS5_VERSION, 0x01, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            req.push(AddressType::Ipv4 as u8);
            req.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            req.push(AddressType::Ipv6 as u8);
            req.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let host_bytes = host.as_bytes();
            if host_bytes.len() > 255 {
                return Err(SocksError::HostnameTooLong(host_bytes.len()));
            }
            req.push(AddressType::Domain as u8);
            req.push(host_bytes.len() as u8);
            req.extend_from_slice(host_bytes);
        }
    }
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await?;

    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT. The bound address is
    // consumed and discarded.
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(SocksError::InvalidVersion(head[0]));
    }
    let remaining = match AddressType::try_from(head[3])? {
        AddressType::Ipv4 => 4 + 2,
        AddressType::Ipv6 => 16 + 2,
        AddressType::Domain => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;

    if head[1] != 0 {
        return Err(SocksError::ConnectRejected(head[1]));
    }
    Ok(())
}

async fn negotiate_socks4<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    args: &HashMap<String, String>,
) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ip: std::net::Ipv4Addr = host
        .parse()
        .map_err(|_| SocksError::Socks4RequiresIpv4(host.to_string()))?;

    let mut req = vec![SOCKS4_VERSION, 0x01];
    req.extend_from_slice(&port.to_be_bytes());
    req.extend_from_slice(&ip.octets());
    if !args.is_empty() {
        req.extend_from_slice(&encode_args(args));
    }
    req.push(0x00);
    stream.write_all(&req).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0 {
        return Err(SocksError::InvalidVersion(reply[0]));
    }
    if reply[1] != 0x5A {
        return Err(SocksError::ConnectRejected(reply[1]));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_encode_args_escaping() {
        let encoded = encode_args(&args(&[("cert", "ab=cd;ef\\gh")]));
        assert_eq!(encoded, b"cert=ab\\=cd\\;ef\\\\gh".to_vec());
    }

    #[test]
    fn test_encode_args_sorted() {
        let encoded = encode_args(&args(&[("b", "2"), ("a", "1")]));
        assert_eq!(encoded, b"a=1;b=2".to_vec());
    }

    #[tokio::test]
    async fn test_socks5_noauth_connect() {
        let (mut client, mut server) = duplex(1024);

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            server.read_exact(&mut head).await.unwrap();
            assert_eq!(head, [0x05, 0x01, 0x00, 0x01]); // CONNECT, IPv4
            let mut rest = [0u8; 6];
            server.read_exact(&mut rest).await.unwrap();
            assert_eq!(rest, [1, 2, 3, 4, 0x01, 0xBB]); // 1.2.3.4:443

            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        negotiate(&mut client, SocksProtocol::Socks5, "1.2.3.4", 443, &HashMap::new())
            .await
            .unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_userpass_carries_args() {
        let (mut client, mut server) = duplex(1024);
        let conn_args = args(&[("key", "value")]);

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x02]);
            server.write_all(&[0x05, 0x02]).await.unwrap();

            let mut head = [0u8; 2];
            server.read_exact(&mut head).await.unwrap();
            assert_eq!(head[0], 0x01);
            let ulen = head[1] as usize;
            let mut username = vec![0u8; ulen];
            server.read_exact(&mut username).await.unwrap();
            assert_eq!(username, b"key=value");

            let mut plen = [0u8; 1];
            server.read_exact(&mut plen).await.unwrap();
            let mut password = vec![0u8; plen[0] as usize];
            server.read_exact(&mut password).await.unwrap();
            assert_eq!(password, b"\0");

            server.write_all(&[0x01, 0x00]).await.unwrap();

            let mut req = [0u8; 4];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(req[3], 0x03); // domain
            let mut len = [0u8; 1];
            server.read_exact(&mut len).await.unwrap();
            let mut body = vec![0u8; len[0] as usize + 2];
            server.read_exact(&mut body).await.unwrap();
            assert_eq!(&body[..len[0] as usize], b"example.com");

            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        negotiate(&mut client, SocksProtocol::Socks5, "example.com", 8080, &conn_args)
            .await
            .unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_connect_rejected() {
        let (mut client, mut server) = duplex(1024);

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut req = [0u8; 10];
            server.read_exact(&mut req).await.unwrap();
            // Host unreachable
            server
                .write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = negotiate(&mut client, SocksProtocol::Socks5, "10.0.0.1", 80, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SocksError::ConnectRejected(0x04)));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks4_connect() {
        let (mut client, mut server) = duplex(1024);
        let conn_args = args(&[("shared-secret", "s3kr1t")]);

        let server_task = tokio::spawn(async move {
            let mut head = [0u8; 8];
            server.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..2], &[0x04, 0x01]);
            assert_eq!(u16::from_be_bytes([head[2], head[3]]), 1984);
            assert_eq!(&head[4..8], &[192, 0, 2, 1]);

            let mut userid = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                server.read_exact(&mut byte).await.unwrap();
                if byte[0] == 0 {
                    break;
                }
                userid.push(byte[0]);
            }
            assert_eq!(userid, b"shared-secret=s3kr1t");

            server
                .write_all(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        negotiate(&mut client, SocksProtocol::Socks4, "192.0.2.1", 1984, &conn_args)
            .await
            .unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks4_rejects_hostname() {
        let (mut client, _server) = duplex(64);
        let err = negotiate(&mut client, SocksProtocol::Socks4, "example.com", 80, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SocksError::Socks4RequiresIpv4(_)));
    }
}
