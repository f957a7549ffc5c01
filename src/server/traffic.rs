//! Traffic accounting.
//!
//! Global byte counters are monotonic atomics updated on the relay hot
//! path; per-source cumulative counters live in a parallel map keyed by
//! source IP. A background tick appends `(timestamp, cumulative)` samples
//! to bounded rings, from which current bytes-per-second figures fall out
//! as `Δcum / Δt`.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::egress::{EgressId, Registry};
use crate::proxy::relay::Direction;
use crate::{SAMPLE_RING_CAPACITY, SAMPLE_RING_MAX_AGE};

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    cum_in: u64,
    cum_out: u64,
}

/// Bounded ring of cumulative-counter samples.
#[derive(Debug, Default)]
pub(crate) struct SampleRing {
    samples: VecDeque<Sample>,
}

impl SampleRing {
    fn push(&mut self, at: Instant, cum_in: u64, cum_out: u64) {
        self.samples.push_back(Sample { at, cum_in, cum_out });
        while self.samples.len() > SAMPLE_RING_CAPACITY {
            self.samples.pop_front();
        }
        while let Some(front) = self.samples.front() {
            if at.duration_since(front.at) > SAMPLE_RING_MAX_AGE && self.samples.len() > 1 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current `(bytes_in, bytes_out)` per second; zero until the ring
    /// spans a measurable interval.
    fn rate(&self) -> (u64, u64) {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return (0, 0);
        };
        let dt = last.at.duration_since(first.at).as_secs_f64();
        if dt <= 0.0 {
            return (0, 0);
        }
        let rate_in = (last.cum_in.saturating_sub(first.cum_in)) as f64 / dt;
        let rate_out = (last.cum_out.saturating_sub(first.cum_out)) as f64 / dt;
        (rate_in as u64, rate_out as u64)
    }
}

#[derive(Debug, Default)]
struct SourceTraffic {
    bytes_in: u64,
    bytes_out: u64,
    ring: SampleRing,
}

/// Global, per-source, and per-egress traffic counters with sliding-window
/// rate estimation.
pub struct TrafficAccountant {
    started_at: Instant,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    total: AtomicU64,
    total_connections: AtomicU64,
    per_source: RwLock<HashMap<IpAddr, SourceTraffic>>,
    per_egress: Mutex<HashMap<EgressId, SampleRing>>,
    global_ring: Mutex<SampleRing>,
}

impl TrafficAccountant {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            total: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            per_source: RwLock::new(HashMap::new()),
            per_egress: Mutex::new(HashMap::new()),
            global_ring: Mutex::new(SampleRing::default()),
        }
    }

    pub fn record_connection(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Credit one relay buffer-ful to the global and per-source counters.
    pub fn record_transfer(&self, source_ip: IpAddr, direction: Direction, bytes: u64) {
        match direction {
            Direction::Inbound => self.bytes_in.fetch_add(bytes, Ordering::Relaxed),
            Direction::Outbound => self.bytes_out.fetch_add(bytes, Ordering::Relaxed),
        };
        self.total.fetch_add(bytes, Ordering::Relaxed);

        let mut sources = self.per_source.write();
        let entry = sources.entry(source_ip).or_default();
        match direction {
            Direction::Inbound => entry.bytes_in += bytes,
            Direction::Outbound => entry.bytes_out += bytes,
        }
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Append one sample to every ring. Driven by the sampler tick; the
    /// tick task is the only writer.
    pub fn tick(&self, registry: &Registry) {
        let now = Instant::now();
        self.global_ring
            .lock()
            .push(now, self.bytes_in(), self.bytes_out());

        {
            let mut sources = self.per_source.write();
            for traffic in sources.values_mut() {
                let (cum_in, cum_out) = (traffic.bytes_in, traffic.bytes_out);
                traffic.ring.push(now, cum_in, cum_out);
            }
        }

        let mut rings = self.per_egress.lock();
        for egress in registry.list() {
            rings
                .entry(egress.id)
                .or_default()
                .push(now, egress.bytes_in, egress.bytes_out);
        }
    }

    /// Background tick loop.
    pub async fn run_sampler(&self, registry: Arc<Registry>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            self.tick(&registry);
        }
    }

    /// Current per-second rate for one egress.
    pub fn egress_rate(&self, id: EgressId) -> (u64, u64) {
        self.per_egress
            .lock()
            .get(&id)
            .map(SampleRing::rate)
            .unwrap_or((0, 0))
    }

    /// Cumulative and per-second figures for the admin surface.
    pub fn snapshot(&self) -> TrafficSnapshot {
        let (rate_in, rate_out) = self.global_ring.lock().rate();
        let sources = self
            .per_source
            .read()
            .iter()
            .map(|(ip, t)| {
                let (src_in, src_out) = t.ring.rate();
                SourceTrafficSnapshot {
                    source_ip: *ip,
                    bytes_in: t.bytes_in,
                    bytes_out: t.bytes_out,
                    bytes_in_per_sec: src_in,
                    bytes_out_per_sec: src_out,
                }
            })
            .collect();

        TrafficSnapshot {
            uptime_secs: self.uptime_secs(),
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
            total: self.total(),
            total_connections: self.total_connections(),
            bytes_in_per_sec: rate_in,
            bytes_out_per_sec: rate_out,
            sources,
        }
    }
}

impl Default for TrafficAccountant {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of all traffic counters.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficSnapshot {
    pub uptime_secs: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub total: u64,
    pub total_connections: u64,
    pub bytes_in_per_sec: u64,
    pub bytes_out_per_sec: u64,
    pub sources: Vec<SourceTrafficSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceTrafficSnapshot {
    pub source_ip: IpAddr,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub bytes_in_per_sec: u64,
    pub bytes_out_per_sec: u64,
}
