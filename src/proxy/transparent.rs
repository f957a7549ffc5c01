//! Transparent redirect ingress frontend (Linux only).
//!
//! Connections arrive via an iptables REDIRECT; the original pre-redirect
//! destination is recovered with the `SO_ORIGINAL_DST` socket option and
//! the session proceeds exactly like a SOCKS5 CONNECT, minus any client
//! reply.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::AsRawFd;

use tokio::net::TcpStream;
use tracing::debug;

use crate::egress::connect_via;
use crate::error::{Error, Result};
use crate::proxy::relay;
use crate::server::Core;

/// Recover the original destination of a kernel-redirected connection.
pub fn original_destination(stream: &TcpStream) -> Result<SocketAddr> {
    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            libc::SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    if addr.sin_family != libc::AF_INET as libc::sa_family_t {
        return Err(Error::handshake(
            "original destination",
            "redirected connection is not IPv4",
        ));
    }
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddr::new(ip.into(), port))
}

/// Handle one redirected client: recover the destination, connect through
/// the egress core, relay. The client never sees a protocol reply; dial
/// failure is a silent close.
pub async fn handle(core: &Core, client: TcpStream, peer: SocketAddr) -> Result<()> {
    let dest = original_destination(&client)?;
    let target = dest.to_string();
    debug!(%peer, %dest, "transparent redirect");

    let (remote, selection) = connect_via(&core.registry, &core.dialer, peer.ip(), &target).await?;
    relay::run(core, client, remote, peer, &target, selection).await;
    Ok(())
}
