//! Outbound connect path.
//!
//! In dispatch mode the dialer binds the outbound socket to the egress's
//! local IPv4 (and, on Linux, to its network interface) before connecting to
//! the target. In tunnel mode the egress itself is the destination and the
//! target is discarded. [`connect_via`] drives selection with fail-over
//! until a dial succeeds or the whole egress set has been crossed off.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::registry::{EgressSnapshot, Registry};
use super::selector::{ExcludeSet, Selection};
use crate::error::{Error, Result};

/// How egress addresses are interpreted, fixed per process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressMode {
    /// `address` is a local IPv4 to source-bind; targets come from clients.
    Dispatch,
    /// `address` is an upstream relay `host:port`; targets are ignored.
    Tunnel,
}

/// Opens outbound connections through a chosen egress.
#[derive(Debug, Clone)]
pub struct Dialer {
    mode: EgressMode,
    timeout: Duration,
}

impl Dialer {
    pub fn new(mode: EgressMode, timeout: Duration) -> Self {
        Self { mode, timeout }
    }

    pub fn mode(&self) -> EgressMode {
        self.mode
    }

    /// Dial `target` through `egress`. The whole attempt (resolve plus
    /// connect) is bounded by the dial timeout.
    pub async fn dial(&self, egress: &EgressSnapshot, target: &str) -> Result<TcpStream> {
        let attempt = async {
            match self.mode {
                EgressMode::Dispatch => dial_dispatch(egress, target).await,
                EgressMode::Tunnel => dial_tunnel(egress).await,
            }
        };
        match timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                let destination = match self.mode {
                    EgressMode::Dispatch => target,
                    EgressMode::Tunnel => egress.address.as_str(),
                };
                Err(Error::Connect {
                    target: destination.to_string(),
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("dial timed out after {:?}", self.timeout),
                    ),
                })
            }
        }
    }
}

async fn dial_dispatch(egress: &EgressSnapshot, target: &str) -> Result<TcpStream> {
    let local_ip: IpAddr = egress.address.parse().map_err(|_| {
        Error::invalid(format!("egress address {} is not an IP", egress.address))
    })?;

    let resolved: Vec<SocketAddr> = lookup_host(target)
        .await
        .map_err(|e| Error::Resolve {
            target: target.to_string(),
            source: e,
        })?
        .collect();
    if resolved.is_empty() {
        return Err(Error::Resolve {
            target: target.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
        });
    }

    // Prefer the egress's address family; fall back to the full resolved
    // set when the preferred family yields nothing.
    let preferred: Vec<SocketAddr> = resolved
        .iter()
        .copied()
        .filter(|a| a.is_ipv4() == local_ip.is_ipv4())
        .collect();
    let candidates = if preferred.is_empty() { resolved } else { preferred };

    let mut last_err = None;
    for addr in candidates {
        match connect_bound(local_ip, &egress.interface, addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.expect("at least one candidate address"))
}

async fn connect_bound(local_ip: IpAddr, interface: &str, addr: SocketAddr) -> Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket
        .bind(SocketAddr::new(local_ip, 0))
        .map_err(|e| Error::Connect {
            target: addr.to_string(),
            source: e,
        })?;
    bind_to_device(&socket, interface);
    let stream = socket.connect(addr).await.map_err(|e| Error::Connect {
        target: addr.to_string(),
        source: e,
    })?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

async fn dial_tunnel(egress: &EgressSnapshot) -> Result<TcpStream> {
    let resolved: Vec<SocketAddr> = lookup_host(&egress.address)
        .await
        .map_err(|e| Error::Resolve {
            target: egress.address.clone(),
            source: e,
        })?
        .collect();
    if resolved.is_empty() {
        return Err(Error::Resolve {
            target: egress.address.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
        });
    }

    let mut last_err = None;
    for addr in resolved {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) => {
                last_err = Some(Error::Connect {
                    target: egress.address.clone(),
                    source: e,
                })
            }
        }
    }
    Err(last_err.expect("at least one resolved address"))
}

/// Bind the not-yet-connected socket to the egress's network interface.
/// Requires CAP_NET_RAW; the non-Linux build is a no-op. A failed bind
/// does not abort the dial: the attempt proceeds unbound, logged at warn.
#[cfg(target_os = "linux")]
fn bind_to_device(socket: &TcpSocket, interface: &str) {
    use std::os::fd::AsRawFd;

    if interface.is_empty() {
        return;
    }
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            interface.as_ptr() as *const libc::c_void,
            interface.len() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let err = Error::InterfaceBind {
            interface: interface.to_string(),
            source: io::Error::last_os_error(),
        };
        warn!(error = %err, "interface bind failed, dialing unbound");
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_to_device(_socket: &TcpSocket, _interface: &str) {}

/// Select an egress for `source_ip` and dial `target` through it, failing
/// over across the egress set until a dial succeeds.
///
/// Every failed index is crossed off and reported to the registry; after
/// the whole set has failed the caller sees [`Error::AllEgressesFailed`].
/// Only retryable dial errors fail over; anything else (a malformed egress
/// address from a tampered store) surfaces immediately.
pub async fn connect_via(
    registry: &Registry,
    dialer: &Dialer,
    source_ip: IpAddr,
    target: &str,
) -> Result<(TcpStream, Selection)> {
    let total = registry.len();
    let mut excluded = ExcludeSet::new(total);
    let mut selection = registry.select(source_ip)?;

    loop {
        match dialer.dial(&selection.egress, target).await {
            Ok(stream) => {
                registry.record_success(selection.egress.id);
                debug!(
                    dest = target,
                    egress = %selection.egress.address,
                    index = selection.index,
                    source = %source_ip,
                    "egress connected"
                );
                return Ok((stream, selection));
            }
            Err(err) => {
                registry.record_failure(selection.egress.id);
                warn!(
                    dest = target,
                    egress = %selection.egress.address,
                    index = selection.index,
                    source = %source_ip,
                    error = %err,
                    "egress dial failed"
                );
                if !err.is_retryable_dial() {
                    return Err(err);
                }
                // Each turn crosses off a new index or gives up, so the
                // loop runs at most `total` times even when the
                // all-disabled fallback keeps returning the same index.
                if !excluded.insert(selection.index) || excluded.is_full() {
                    return Err(Error::AllEgressesFailed(total));
                }
                selection = registry.select_excluding(source_ip, &excluded)?;
            }
        }
    }
}
