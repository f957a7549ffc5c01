//! Bidirectional relay between a client and its egress connection.
//!
//! Two copy tasks shuttle 32 KiB buffers, refreshing the idle deadline on
//! every read and posting byte counts to the connection table, the traffic
//! accountant, and the per-egress counters once per buffer-ful. The first
//! direction to settle tears down both sockets; each socket closes exactly
//! once and the connection is retired to history exactly once.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::egress::{EgressId, Registry, Selection};
use crate::error::{Error, Result};
use crate::server::conntrack::{ConnId, ConnState, ConnectionTable};
use crate::server::traffic::TrafficAccountant;
use crate::server::Core;
use crate::COPY_BUFFER_SIZE;

/// Relay direction, seen from the client: inbound is egress to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Fans one relay's byte counts out to the accounting surfaces.
pub(crate) struct Monitor {
    pub(crate) table: Arc<ConnectionTable>,
    pub(crate) traffic: Arc<TrafficAccountant>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) conn_id: ConnId,
    pub(crate) egress_id: EgressId,
    pub(crate) source_ip: IpAddr,
}

impl Monitor {
    fn on_transfer(&self, direction: Direction, bytes: usize) {
        let n = bytes as u64;
        match direction {
            Direction::Inbound => {
                self.table.add_traffic(self.conn_id, n, 0);
                self.registry.add_bytes(self.egress_id, n, 0);
            }
            Direction::Outbound => {
                self.table.add_traffic(self.conn_id, 0, n);
                self.registry.add_bytes(self.egress_id, 0, n);
            }
        }
        self.traffic.record_transfer(self.source_ip, direction, n);
    }
}

/// Track the connection and relay until either direction ends, then retire
/// it to the history ring.
pub async fn run(
    core: &Core,
    client: TcpStream,
    remote: TcpStream,
    peer: SocketAddr,
    target: &str,
    selection: Selection,
) {
    let (dest_ip, dest_port) = super::split_host_port(target);
    let conn_id = core
        .table
        .insert(peer, dest_ip, dest_port, &selection.egress, selection.index);
    core.traffic.record_connection();

    let monitor = Monitor {
        table: Arc::clone(&core.table),
        traffic: Arc::clone(&core.traffic),
        registry: Arc::clone(&core.registry),
        conn_id,
        egress_id: selection.egress.id,
        source_ip: peer.ip(),
    };
    pipe(client, remote, &monitor, core.limits.idle_timeout).await;
    core.table.retire(conn_id, ConnState::Closed);
}

async fn pipe(client: TcpStream, remote: TcpStream, monitor: &Monitor, idle_timeout: Duration) {
    let started = Instant::now();
    let (direction, result) = {
        let (client_r, client_w) = client.into_split();
        let (remote_r, remote_w) = remote.into_split();
        let outbound = copy_monitored(client_r, remote_w, Direction::Outbound, monitor, idle_timeout);
        let inbound = copy_monitored(remote_r, client_w, Direction::Inbound, monitor, idle_timeout);
        tokio::pin!(outbound, inbound);
        tokio::select! {
            r = &mut outbound => (Direction::Outbound, r),
            r = &mut inbound => (Direction::Inbound, r),
        }
        // Both copy futures drop here, so both sockets close together no
        // matter which direction settled first.
    };
    match result {
        Ok(copied) => debug!(
            conn = monitor.conn_id,
            ?direction,
            copied,
            elapsed = ?started.elapsed(),
            "relay closed"
        ),
        Err(err) if err.is_idle() => debug!(
            conn = monitor.conn_id,
            ?direction,
            elapsed = ?started.elapsed(),
            "relay idle, torn down"
        ),
        Err(err) => debug!(
            conn = monitor.conn_id,
            ?direction,
            error = %err,
            elapsed = ?started.elapsed(),
            "relay ended"
        ),
    }
}

/// Copy one direction, bounded by the idle deadline per read.
///
/// EOF is a normal close. The byte count posted per buffer-ful is the count
/// actually written, so counters conserve bytes modulo the last partial
/// buffer on error.
async fn copy_monitored<R, W>(
    mut src: R,
    mut dst: W,
    direction: Direction,
    monitor: &Monitor,
    idle_timeout: Duration,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match timeout(idle_timeout, src.read(&mut buf)).await {
            Err(_) => return Err(Error::Idle(idle_timeout)),
            Ok(Ok(0)) => return Ok(total),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
        };
        if let Err(e) = dst.write_all(&buf[..n]).await {
            return Err(if e.kind() == io::ErrorKind::WriteZero {
                Error::ShortWrite {
                    written: 0,
                    expected: n,
                }
            } else {
                e.into()
            });
        }
        total += n as u64;
        monitor.on_transfer(direction, n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::registry::Egress;
    use crate::server::conntrack::ConnectionTable;
    use tokio::net::TcpListener;

    fn test_monitor(registry: &Arc<Registry>, table: &Arc<ConnectionTable>, conn_id: ConnId) -> Monitor {
        Monitor {
            table: Arc::clone(table),
            traffic: Arc::new(TrafficAccountant::new()),
            registry: Arc::clone(registry),
            conn_id,
            egress_id: 1,
            source_ip: "10.0.0.1".parse().unwrap(),
        }
    }

    async fn connected_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_pipe_conserves_bytes_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client_far, client_near) = connected_pair(&listener).await;
        let (remote_near, remote_far) = connected_pair(&listener).await;

        let registry = Arc::new(Registry::new(vec![Egress::new(1, "127.0.0.1", "", 1)]));
        let table = Arc::new(ConnectionTable::new(10, Duration::from_secs(60)));
        let conn_id = table.insert(
            "10.0.0.1:4000".parse().unwrap(),
            "127.0.0.1".into(),
            80,
            &registry.list()[0],
            0,
        );
        let monitor = test_monitor(&registry, &table, conn_id);

        let relay = tokio::spawn(async move {
            pipe(client_near, remote_near, &monitor, Duration::from_secs(60)).await;
        });

        // Drive traffic through the relay in both directions.
        let mut client_far = client_far;
        let mut remote_far = remote_far;
        let request = vec![0xAB; 4096];
        client_far.write_all(&request).await.unwrap();
        let mut seen = vec![0u8; 4096];
        remote_far.read_exact(&mut seen).await.unwrap();
        assert_eq!(seen, request);

        let response = vec![0xCD; 1024];
        remote_far.write_all(&response).await.unwrap();
        let mut echoed = vec![0u8; 1024];
        client_far.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, response);

        // Half-close from the client ends the outbound direction and tears
        // down the relay.
        drop(client_far);
        relay.await.unwrap();

        let snaps = registry.list();
        assert_eq!(snaps[0].bytes_out, 4096);
        assert_eq!(snaps[0].bytes_in, 1024);
    }

    #[tokio::test]
    async fn test_idle_deadline_tears_down_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client_far, client_near) = connected_pair(&listener).await;
        let (remote_near, remote_far) = connected_pair(&listener).await;

        let registry = Arc::new(Registry::new(vec![Egress::new(1, "127.0.0.1", "", 1)]));
        let table = Arc::new(ConnectionTable::new(10, Duration::from_secs(60)));
        let conn_id = table.insert(
            "10.0.0.1:4000".parse().unwrap(),
            "127.0.0.1".into(),
            80,
            &registry.list()[0],
            0,
        );
        let monitor = test_monitor(&registry, &table, conn_id);

        let start = Instant::now();
        pipe(client_near, remote_near, &monitor, Duration::from_millis(100)).await;
        assert!(start.elapsed() >= Duration::from_millis(100));

        // Both peers observe the teardown as EOF.
        let mut buf = [0u8; 1];
        assert_eq!(read_eof(client_far, &mut buf).await, 0);
        assert_eq!(read_eof(remote_far, &mut buf).await, 0);
    }

    async fn read_eof(mut stream: TcpStream, buf: &mut [u8]) -> usize {
        stream.read(buf).await.unwrap()
    }
}
