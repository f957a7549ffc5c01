//! # dispatchd
//!
//! A multi-egress TCP dispatch proxy. Client sessions accepted on a single
//! ingress are forwarded over one of several configured egress endpoints,
//! selected by a per-source weighted round-robin with fail-over.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Ingress                               │
//! │   SOCKS5 listener · tunnel listener · transparent (Linux)    │
//! ├──────────────────────────────────────────────────────────────┤
//! │   Admission (task semaphore, handshake deadlines)            │
//! ├──────────────────────────────────────────────────────────────┤
//! │   Egress core                                                │
//! │   • Registry: egress set, weights, per-source rules          │
//! │   • Selector: weighted round-robin + fail-over exclusion     │
//! │   • Dialer: source-IP / interface bound outbound connect     │
//! ├──────────────────────────────────────────────────────────────┤
//! │   Relay: bidirectional copy with byte accounting             │
//! │   Connection table · traffic accountant · SQLite store      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! An egress is either a local IPv4 address bound to a network interface
//! (dispatch mode) or an upstream relay `host:port` (tunnel mode). One mode
//! per process instance.

#![warn(rust_2018_idioms)]

use std::time::Duration;

pub mod egress;
pub mod error;
pub mod proxy;
pub mod server;
pub mod store;

pub use error::{Error, Result};
pub use server::{Core, Server};

/// Cap on tracked active connections; the reaper runs inline above it.
pub const MAX_CONNECTIONS: usize = 500;

/// Cap on concurrent connection tasks. The admission semaphore holds half of
/// this many permits.
pub const MAX_TASKS: usize = 1000;

/// Copy buffer for each relay direction.
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Deadline for the whole ingress handshake, from accept.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a single egress dial attempt (resolve + connect).
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// A relay direction with no reads for this long is torn down.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How often the reaper sweeps idle connections.
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// How often traffic sample rings are appended to.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// How often live counters and a statistics snapshot go to the store.
pub const STORE_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How often the resource monitor samples task utilization.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum entries kept in a traffic sample ring.
pub const SAMPLE_RING_CAPACITY: usize = 10;

/// Samples older than this are dropped from the ring.
pub const SAMPLE_RING_MAX_AGE: Duration = Duration::from_secs(5);
