//! SOCKS5 ingress frontend (RFC 1928, CONNECT only, no authentication).
//!
//! The handshake produces a canonical `host:port` target which is handed to
//! the egress core; the client sees the standard reply codes and nothing
//! else of the dispatch machinery.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::egress::connect_via;
use crate::error::{Error, Result};
use crate::proxy::relay;
use crate::server::Core;

pub const VERSION: u8 = 0x05;

const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply codes used by this frontend.
pub mod reply {
    pub const SUCCESS: u8 = 0x00;
    pub const SERVER_FAILURE: u8 = 0x01;
    pub const NETWORK_UNREACHABLE: u8 = 0x03;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRTYPE_NOT_SUPPORTED: u8 = 0x08;
}

/// Write the fixed-shape reply `05 <code> 00 01 0.0.0.0:0`.
pub async fn send_reply<S>(stream: &mut S, code: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

/// Run the client greeting and CONNECT request, returning the canonical
/// `host:port` target (IPv6 bracketed).
///
/// Error replies are written before returning where the protocol calls for
/// them; the caller only has to close the stream.
pub async fn handshake<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Client greeting: version, method count, methods.
    let mut head = [0u8; 2];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| Error::handshake("greeting", e.to_string()))?;
    if head[0] != VERSION {
        return Err(Error::handshake(
            "greeting",
            format!("unsupported SOCKS version {}", head[0]),
        ));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(|e| Error::handshake("greeting", e.to_string()))?;

    // Method selection: no authentication.
    stream
        .write_all(&[VERSION, 0x00])
        .await
        .map_err(|e| Error::handshake("method selection", e.to_string()))?;

    // Connection request: version, command, reserved, address type.
    let mut header = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut header).await {
        let _ = send_reply(stream, reply::SERVER_FAILURE).await;
        return Err(Error::handshake("request", e.to_string()));
    }
    if header[0] != VERSION {
        let _ = send_reply(stream, reply::SERVER_FAILURE).await;
        return Err(Error::handshake(
            "request",
            format!("unsupported SOCKS version {}", header[0]),
        ));
    }
    if header[1] != CMD_CONNECT {
        let _ = send_reply(stream, reply::COMMAND_NOT_SUPPORTED).await;
        return Err(Error::UnsupportedCommand(header[1]));
    }

    match header[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            if let Err(e) = stream.read_exact(&mut buf).await {
                let _ = send_reply(stream, reply::SERVER_FAILURE).await;
                return Err(Error::handshake("request", e.to_string()));
            }
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok(format!("{ip}:{port}"))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            if let Err(e) = stream.read_exact(&mut len).await {
                let _ = send_reply(stream, reply::SERVER_FAILURE).await;
                return Err(Error::handshake("request", e.to_string()));
            }
            let mut buf = vec![0u8; len[0] as usize + 2];
            if let Err(e) = stream.read_exact(&mut buf).await {
                let _ = send_reply(stream, reply::SERVER_FAILURE).await;
                return Err(Error::handshake("request", e.to_string()));
            }
            let port = u16::from_be_bytes([buf[len[0] as usize], buf[len[0] as usize + 1]]);
            let domain = match String::from_utf8(buf[..len[0] as usize].to_vec()) {
                Ok(d) => d,
                Err(_) => {
                    let _ = send_reply(stream, reply::SERVER_FAILURE).await;
                    return Err(Error::handshake("request", "domain is not valid UTF-8"));
                }
            };
            Ok(format!("{domain}:{port}"))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            if let Err(e) = stream.read_exact(&mut buf).await {
                let _ = send_reply(stream, reply::SERVER_FAILURE).await;
                return Err(Error::handshake("request", e.to_string()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = Ipv6Addr::from(octets);
            if ip.is_unspecified() || ip.is_loopback() {
                let _ = send_reply(stream, reply::HOST_UNREACHABLE).await;
                return Err(Error::handshake(
                    "request",
                    format!("unroutable IPv6 target {ip}"),
                ));
            }
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok(format!("[{ip}]:{port}"))
        }
        other => {
            let _ = send_reply(stream, reply::ADDRTYPE_NOT_SUPPORTED).await;
            Err(Error::UnsupportedAddrType(other))
        }
    }
}

/// Handle one accepted SOCKS5 client: handshake, egress connect with
/// fail-over, reply, relay.
pub async fn handle(core: &Core, mut client: TcpStream, peer: SocketAddr) -> Result<()> {
    let target = match timeout(core.limits.handshake_timeout, handshake(&mut client)).await {
        Ok(Ok(target)) => target,
        Ok(Err(err)) => return Err(err),
        Err(_) => {
            return Err(Error::handshake(
                "deadline",
                "no complete request within the handshake timeout",
            ))
        }
    };
    debug!(%peer, dest = %target, "SOCKS5 handshake complete");

    match connect_via(&core.registry, &core.dialer, peer.ip(), &target).await {
        Ok((remote, selection)) => {
            send_reply(&mut client, reply::SUCCESS)
                .await
                .map_err(|e| Error::handshake("reply", e.to_string()))?;
            relay::run(core, client, remote, peer, &target, selection).await;
            Ok(())
        }
        Err(err) => {
            let _ = send_reply(&mut client, reply::NETWORK_UNREACHABLE).await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn run_handshake(client_bytes: &[u8]) -> (Result<String>, Vec<u8>) {
        let (mut client, mut server) = duplex(512);
        let task = tokio::spawn(async move {
            let result = handshake(&mut server).await;
            (result, server)
        });

        client.write_all(client_bytes).await.unwrap();
        let (result, server) = task.await.unwrap();
        drop(server);

        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.ok();
        (result, replies)
    }

    #[tokio::test]
    async fn test_ipv4_connect_request() {
        let mut bytes = vec![0x05, 0x01, 0x00]; // greeting, no-auth
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50]);
        let (result, replies) = run_handshake(&bytes).await;
        assert_eq!(result.unwrap(), "93.184.216.34:80");
        assert_eq!(replies, [0x05, 0x00]); // method selection only
    }

    #[tokio::test]
    async fn test_domain_connect_request() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 0x0b]);
        bytes.extend_from_slice(b"example.com");
        bytes.extend_from_slice(&[0x00, 0x50]);
        let (result, _) = run_handshake(&bytes).await;
        assert_eq!(result.unwrap(), "example.com:80");
    }

    #[tokio::test]
    async fn test_ipv6_connect_request() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x04]);
        let ip: Ipv6Addr = "2001:db8::1".parse().unwrap();
        bytes.extend_from_slice(&ip.octets());
        bytes.extend_from_slice(&[0x01, 0xbb]);
        let (result, _) = run_handshake(&bytes).await;
        assert_eq!(result.unwrap(), "[2001:db8::1]:443");
    }

    #[tokio::test]
    async fn test_ipv6_loopback_rejected() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x04]);
        bytes.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        bytes.extend_from_slice(&[0x00, 0x50]);
        let (result, replies) = run_handshake(&bytes).await;
        assert!(matches!(result, Err(Error::Handshake { .. })));
        assert_eq!(replies[..2], [0x05, 0x00]);
        assert_eq!(replies[2..], [0x05, reply::HOST_UNREACHABLE, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_non_connect_command_rejected() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50]); // BIND
        let (result, replies) = run_handshake(&bytes).await;
        assert!(matches!(result, Err(Error::UnsupportedCommand(0x02))));
        assert_eq!(replies[2..4], [0x05, reply::COMMAND_NOT_SUPPORTED]);
    }

    #[tokio::test]
    async fn test_unknown_address_type_rejected() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x05]);
        let (result, replies) = run_handshake(&bytes).await;
        assert!(matches!(result, Err(Error::UnsupportedAddrType(0x05))));
        assert_eq!(replies[2..4], [0x05, reply::ADDRTYPE_NOT_SUPPORTED]);
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let (result, replies) = run_handshake(&[0x04, 0x01, 0x00]).await;
        assert!(matches!(result, Err(Error::Handshake { stage: "greeting", .. })));
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_request_fails_server_failure() {
        let (mut client, mut server) = duplex(512);
        let task = tokio::spawn(async move { handshake(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();
        assert_eq!(selection, [0x05, 0x00]);

        // Close after two request bytes; read_exact on the header fails.
        client.write_all(&[0x05, 0x01]).await.unwrap();
        drop(client);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Handshake { stage: "request", .. })));
    }
}
