//! Connection tracking.
//!
//! A bounded index of active sessions plus a capped history ring of retired
//! ones. One reader-writer lock protects both; relay traffic updates take
//! the write lock once per buffer-ful, not per byte.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::egress::{EgressId, EgressSnapshot};

/// Opaque connection identifier, unique per process.
pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Active,
    Closing,
    Closed,
    Expired,
}

/// One tracked session. The egress address is copied in so retired entries
/// never dangle when the egress set changes.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveConnection {
    pub id: ConnId,
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub dest_ip: String,
    pub dest_port: u16,
    pub egress_address: String,
    pub egress_id: EgressId,
    pub egress_index: usize,
    #[serde(skip)]
    pub started_at: Instant,
    #[serde(skip)]
    pub last_activity: Instant,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub state: ConnState,
}

impl ActiveConnection {
    /// Seconds since the session started.
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }
}

struct TableInner {
    active: HashMap<ConnId, ActiveConnection>,
    history: VecDeque<ActiveConnection>,
}

pub struct ConnectionTable {
    inner: RwLock<TableInner>,
    max_connections: usize,
    idle_timeout: Duration,
    next_id: AtomicU64,
}

impl ConnectionTable {
    pub fn new(max_connections: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(TableInner {
                active: HashMap::new(),
                history: VecDeque::with_capacity(max_connections),
            }),
            max_connections,
            idle_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// Track a new session. When the table is full the reaper runs inline
    /// to evict idle entries first.
    pub fn insert(
        &self,
        peer: SocketAddr,
        dest_ip: String,
        dest_port: u16,
        egress: &EgressSnapshot,
        egress_index: usize,
    ) -> ConnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let conn = ActiveConnection {
            id,
            source_ip: peer.ip(),
            source_port: peer.port(),
            dest_ip,
            dest_port,
            egress_address: egress.address.clone(),
            egress_id: egress.id,
            egress_index,
            started_at: now,
            last_activity: now,
            bytes_in: 0,
            bytes_out: 0,
            state: ConnState::Active,
        };

        let mut inner = self.inner.write();
        if inner.active.len() >= self.max_connections {
            let evicted = reap_locked(&mut inner, now, self.idle_timeout, self.max_connections);
            debug!(evicted, "connection table full, reaped inline");
        }
        inner.active.insert(id, conn);
        id
    }

    /// Credit relayed bytes to a session and refresh its activity stamp.
    pub fn add_traffic(&self, id: ConnId, bytes_in: u64, bytes_out: u64) {
        let mut inner = self.inner.write();
        if let Some(conn) = inner.active.get_mut(&id) {
            conn.bytes_in += bytes_in;
            conn.bytes_out += bytes_out;
            conn.last_activity = Instant::now();
        }
    }

    /// Move a session to the history ring with a terminal state. Retiring
    /// an already-retired id is a no-op.
    pub fn retire(&self, id: ConnId, state: ConnState) {
        let mut inner = self.inner.write();
        if let Some(mut conn) = inner.active.remove(&id) {
            conn.state = state;
            if inner.history.len() >= self.max_connections {
                inner.history.pop_front();
            }
            inner.history.push_back(conn);
        }
    }

    /// Point-in-time snapshot of active sessions, filtered by substring
    /// match on source or destination IP. A zero limit means no limit.
    pub fn list(&self, source_filter: &str, dest_filter: &str, limit: usize) -> Vec<ActiveConnection> {
        let inner = self.inner.read();
        let mut result = Vec::new();
        for conn in inner.active.values() {
            if !source_filter.is_empty() && !conn.source_ip.to_string().contains(source_filter) {
                continue;
            }
            if !dest_filter.is_empty() && !conn.dest_ip.contains(dest_filter) {
                continue;
            }
            result.push(conn.clone());
            if limit > 0 && result.len() >= limit {
                break;
            }
        }
        result
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().active.len()
    }

    pub fn history_count(&self) -> usize {
        self.inner.read().history.len()
    }

    /// Recently retired sessions, oldest first.
    pub fn history(&self) -> Vec<ActiveConnection> {
        self.inner.read().history.iter().cloned().collect()
    }

    /// Evict sessions idle past the deadline into history as `Expired`.
    pub fn reap_idle(&self) -> usize {
        let mut inner = self.inner.write();
        reap_locked(&mut inner, Instant::now(), self.idle_timeout, self.max_connections)
    }

    /// Background sweep loop.
    pub async fn run_reaper(&self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let evicted = self.reap_idle();
            if evicted > 0 {
                debug!(evicted, "reaped idle connections");
            }
        }
    }
}

fn reap_locked(
    inner: &mut TableInner,
    now: Instant,
    idle_timeout: Duration,
    max_connections: usize,
) -> usize {
    let idle: Vec<ConnId> = inner
        .active
        .iter()
        .filter(|(_, c)| now.duration_since(c.last_activity) >= idle_timeout)
        .map(|(id, _)| *id)
        .collect();

    for id in &idle {
        if let Some(mut conn) = inner.active.remove(id) {
            conn.state = ConnState::Expired;
            inner.history.push_back(conn);
        }
    }

    // A bulk burst may overshoot the ring; trim it back from the front.
    if inner.history.len() > max_connections * 2 {
        let excess = inner.history.len() - max_connections;
        inner.history.drain(..excess);
    }

    idle.len()
}
