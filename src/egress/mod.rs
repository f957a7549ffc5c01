//! Egress endpoint management.
//!
//! The [`Registry`] owns the ordered egress set, its per-source rules, and
//! all selection state behind a single lock. Selection (weighted round-robin
//! with fail-over exclusion) lives in [`selector`]; the outbound connect path
//! with source-IP and interface binding lives in [`dialer`].

pub mod dialer;
pub mod registry;
pub mod selector;

pub use dialer::{connect_via, Dialer, EgressMode};
pub use registry::{Egress, EgressId, EgressSnapshot, Registry, SourceRule};
pub use selector::{ExcludeSet, Selection};
