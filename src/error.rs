//! Error types for the dispatch proxy.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running the proxy.
#[derive(Error, Debug)]
pub enum Error {
    /// An egress with the same address already exists
    #[error("duplicate egress address: {0}")]
    Duplicate(String),

    /// A named egress or rule does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// A configuration value failed validation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Target hostname resolution failed
    #[error("resolve failed for {target}: {source}")]
    Resolve { target: String, source: io::Error },

    /// The outbound TCP connect failed or timed out
    #[error("connect to {target} failed: {source}")]
    Connect { target: String, source: io::Error },

    /// Binding the outbound socket to the egress interface failed
    #[error("bind to interface {interface} failed: {source}")]
    InterfaceBind { interface: String, source: io::Error },

    /// The ingress handshake failed or timed out
    #[error("handshake failed during {stage}: {reason}")]
    Handshake { stage: &'static str, reason: String },

    /// SOCKS5 command other than CONNECT
    #[error("unsupported SOCKS command {0:#04x}")]
    UnsupportedCommand(u8),

    /// SOCKS5 address type outside IPv4/DOMAIN/IPv6
    #[error("unsupported SOCKS address type {0:#04x}")]
    UnsupportedAddrType(u8),

    /// A relay write made no progress
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// A relay direction saw no reads within the idle deadline
    #[error("connection idle for {0:?}")]
    Idle(Duration),

    /// Fail-over exhausted the whole egress set
    #[error("all {0} egresses failed")]
    AllEgressesFailed(usize),

    /// The connection semaphore was full at accept time
    #[error("admission rejected: connection limit reached")]
    AdmissionRejected,

    /// Persistent store failure
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Other network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a new handshake error.
    pub fn handshake(stage: &'static str, reason: impl Into<String>) -> Self {
        Error::Handshake {
            stage,
            reason: reason.into(),
        }
    }

    /// Create a new invalid-argument error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Dial errors recovered by selector fail-over.
    pub fn is_retryable_dial(&self) -> bool {
        matches!(
            self,
            Error::Resolve { .. } | Error::Connect { .. } | Error::InterfaceBind { .. }
        )
    }

    /// Whether this error ends a relay direction without being noteworthy.
    pub fn is_idle(&self) -> bool {
        matches!(self, Error::Idle(_))
    }
}
