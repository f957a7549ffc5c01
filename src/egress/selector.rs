//! Weighted round-robin egress selection.
//!
//! Selection is parameterized by client source IP: every source gets its own
//! cursor (seeded from the global cursor on first sight) and its own run
//! counters, so a per-source weight override only affects that source.
//!
//! Two cursors advance on every selection. The per-source cursor advances
//! when the run reaches the *effective* weight (rule override or default);
//! the global cursor advances on the selected egress's *default* weight.
//! The global cursor therefore drifts independently of overrides; it only
//! seeds the starting position of source IPs not seen before.

use std::net::IpAddr;

use tracing::warn;

use super::registry::{EgressSnapshot, Inner, Registry};
use crate::error::{Error, Result};

/// Indices crossed off during fail-over.
#[derive(Debug, Clone)]
pub struct ExcludeSet {
    bits: Vec<bool>,
    count: usize,
}

impl ExcludeSet {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![false; len],
            count: 0,
        }
    }

    /// Mark an index as failed. Returns false if it was already marked.
    pub fn insert(&mut self, index: usize) -> bool {
        if self.bits[index] {
            return false;
        }
        self.bits[index] = true;
        self.count += 1;
        true
    }

    pub fn contains(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Every index in the egress set has failed.
    pub fn is_full(&self) -> bool {
        self.count == self.bits.len()
    }
}

/// Outcome of one selection: the chosen index and a by-value snapshot the
/// dialer can use without holding the registry lock.
#[derive(Debug, Clone)]
pub struct Selection {
    pub index: usize,
    pub egress: EgressSnapshot,
}

impl Registry {
    /// Select the next egress for `source_ip` under weighted round-robin.
    ///
    /// Advances selection state and increments the chosen egress's
    /// `selections` counter.
    pub fn select(&self, source_ip: IpAddr) -> Result<Selection> {
        let mut inner = self.inner.lock();
        if inner.egresses.is_empty() {
            return Err(Error::NotFound("no egresses configured".into()));
        }
        Ok(inner.select(source_ip, None))
    }

    /// Like [`select`](Registry::select) but skipping indices that already
    /// failed during the current request. Used by fail-over.
    pub fn select_excluding(&self, source_ip: IpAddr, excluded: &ExcludeSet) -> Result<Selection> {
        let mut inner = self.inner.lock();
        if inner.egresses.is_empty() {
            return Err(Error::NotFound("no egresses configured".into()));
        }
        Ok(inner.select(source_ip, Some(excluded)))
    }
}

impl Inner {
    pub(super) fn select(&mut self, source_ip: IpAddr, excluded: Option<&ExcludeSet>) -> Selection {
        let n = self.egresses.len();
        let mut i = *self
            .source_cursors
            .entry(source_ip)
            .or_insert(self.global_cursor);

        if let Some(ex) = excluded {
            debug_assert!(!ex.is_full(), "caller must stop before exhausting the set");
        }

        // Advance past excluded and disabled entries, re-checking both
        // predicates on every step: a disabled entry may sit between two
        // excluded ones. Crossing an excluded index discards that source's
        // in-flight run. If a full cycle finds nothing selectable, fall
        // back to index 0; the caller treats the inevitable dial failure
        // normally.
        let mut steps = 0;
        while excluded.map_or(false, |ex| ex.contains(i)) || !self.egresses[i].enabled {
            if excluded.map_or(false, |ex| ex.contains(i)) {
                self.egresses[i].source_runs.remove(&source_ip);
            }
            i = (i + 1) % n;
            self.source_cursors.insert(source_ip, i);
            steps += 1;
            if steps >= n {
                warn!(source = %source_ip, "no selectable egress, falling back to first");
                return Selection {
                    index: 0,
                    egress: self.egresses[0].snapshot(),
                };
            }
        }

        let effective = self.egresses[i].effective_weight(&source_ip);
        let default_weight = self.egresses[i].weight;

        let egress = &mut self.egresses[i];
        egress.selections += 1;
        let run = egress.source_runs.entry(source_ip).or_insert(0);
        *run += 1;
        let advance_source = *run >= effective;
        if advance_source {
            *run = 0;
        }
        let snapshot = egress.snapshot();

        if advance_source {
            self.source_cursors.insert(source_ip, (i + 1) % n);
        }

        self.global_run += 1;
        if self.global_run >= default_weight {
            self.global_run = 0;
            self.global_cursor = (self.global_cursor + 1) % n;
        }

        Selection { index: i, egress: snapshot }
    }
}
