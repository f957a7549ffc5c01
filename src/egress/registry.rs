//! Canonical egress set: addresses, weights, enable bits, counters, and
//! per-source weight overrides.
//!
//! All mutations serialize through one registry lock. Readers copy out
//! by-value snapshots so no lock is ever held across I/O.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Store-assigned stable identifier of an egress.
pub type EgressId = i64;

/// Per-(egress, source IP) weight override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRule {
    pub source_ip: IpAddr,
    pub weight: u32,
    #[serde(default)]
    pub description: String,
}

/// A configured egress endpoint.
///
/// `address` is a local IPv4 in dispatch mode or a relay `host:port` in
/// tunnel mode; `interface` is only meaningful for the former.
#[derive(Debug)]
pub struct Egress {
    pub id: EgressId,
    pub address: String,
    pub interface: String,
    pub weight: u32,
    pub enabled: bool,
    pub selections: u64,
    pub success: u64,
    pub failure: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Byte total carried over from previous runs via the store.
    pub bytes_prior: u64,
    /// Per-source weight overrides, keyed by source IP.
    pub(super) rules: HashMap<IpAddr, SourceRule>,
    /// Consecutive selections of this egress per source IP.
    pub(super) source_runs: HashMap<IpAddr, u32>,
}

impl Egress {
    pub fn new(id: EgressId, address: impl Into<String>, interface: impl Into<String>, weight: u32) -> Self {
        Self {
            id,
            address: address.into(),
            interface: interface.into(),
            weight,
            enabled: true,
            selections: 0,
            success: 0,
            failure: 0,
            bytes_in: 0,
            bytes_out: 0,
            bytes_prior: 0,
            rules: HashMap::new(),
            source_runs: HashMap::new(),
        }
    }

    /// Attach a per-source rule directly; used when loading from the store.
    pub fn set_rule(&mut self, rule: SourceRule) {
        self.rules.insert(rule.source_ip, rule);
    }

    /// The weight that applies to `source_ip`: the rule override if one
    /// exists, the egress default otherwise.
    pub(super) fn effective_weight(&self, source_ip: &IpAddr) -> u32 {
        self.rules.get(source_ip).map(|r| r.weight).unwrap_or(self.weight)
    }

    pub(crate) fn snapshot(&self) -> EgressSnapshot {
        EgressSnapshot {
            id: self.id,
            address: self.address.clone(),
            interface: self.interface.clone(),
            weight: self.weight,
            enabled: self.enabled,
            selections: self.selections,
            success: self.success,
            failure: self.failure,
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            bytes_total: self.bytes_prior + self.bytes_in + self.bytes_out,
            rule_count: self.rules.len(),
        }
    }
}

/// By-value copy of an egress handed out by the selector and the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct EgressSnapshot {
    pub id: EgressId,
    pub address: String,
    pub interface: String,
    pub weight: u32,
    pub enabled: bool,
    pub selections: u64,
    pub success: u64,
    pub failure: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Lifetime byte total including previous runs.
    pub bytes_total: u64,
    pub rule_count: usize,
}

impl EgressSnapshot {
    /// Fraction of dial attempts that succeeded.
    pub fn success_rate(&self) -> f64 {
        let total = self.success + self.failure;
        if total == 0 {
            0.0
        } else {
            self.success as f64 / total as f64
        }
    }
}

pub(super) struct Inner {
    pub(super) egresses: Vec<Egress>,
    /// Default starting cursor for source IPs not seen before.
    pub(super) global_cursor: usize,
    /// Consecutive selections against the global cursor.
    pub(super) global_run: u32,
    /// Per-source round-robin position.
    pub(super) source_cursors: HashMap<IpAddr, usize>,
}

/// Ordered egress list plus all selection state, behind one lock.
pub struct Registry {
    pub(super) inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(egresses: Vec<Egress>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                egresses,
                global_cursor: 0,
                global_run: 0,
                source_cursors: HashMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().egresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the whole egress set, in order.
    pub fn list(&self) -> Vec<EgressSnapshot> {
        self.inner.lock().egresses.iter().map(Egress::snapshot).collect()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.inner.lock().egresses.iter().any(|e| e.address == address)
    }

    /// Look up the store id of an egress by address.
    pub fn id_of(&self, address: &str) -> Result<EgressId> {
        let inner = self.inner.lock();
        inner
            .egresses
            .iter()
            .find(|e| e.address == address)
            .map(|e| e.id)
            .ok_or_else(|| Error::NotFound(format!("egress {address}")))
    }

    /// Append a new egress. Fails with `Duplicate` if the address exists.
    pub fn add(&self, egress: Egress) -> Result<()> {
        if egress.weight == 0 {
            return Err(Error::invalid("egress weight must be at least 1"));
        }
        let mut inner = self.inner.lock();
        if inner.egresses.iter().any(|e| e.address == egress.address) {
            return Err(Error::Duplicate(egress.address));
        }
        inner.egresses.push(egress);
        Ok(())
    }

    /// Remove an egress and its rules. Selection cursors are reset because
    /// indices shift when the set changes.
    pub fn remove(&self, address: &str) -> Result<EgressId> {
        let mut inner = self.inner.lock();
        let idx = inner
            .egresses
            .iter()
            .position(|e| e.address == address)
            .ok_or_else(|| Error::NotFound(format!("egress {address}")))?;
        let removed = inner.egresses.remove(idx);
        inner.global_cursor = 0;
        inner.global_run = 0;
        inner.source_cursors.clear();
        for e in &mut inner.egresses {
            e.source_runs.clear();
        }
        Ok(removed.id)
    }

    pub fn set_enabled(&self, address: &str, enabled: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let egress = find_mut(&mut inner.egresses, address)?;
        egress.enabled = enabled;
        Ok(())
    }

    pub fn set_weight(&self, address: &str, weight: u32) -> Result<()> {
        if weight == 0 {
            return Err(Error::invalid("egress weight must be at least 1"));
        }
        let mut inner = self.inner.lock();
        let egress = find_mut(&mut inner.egresses, address)?;
        egress.weight = weight;
        Ok(())
    }

    /// Insert or replace the per-source override for `(address, source_ip)`.
    ///
    /// A weight change is not retroactive: the in-flight run counter keeps
    /// its value and the new weight applies from the next selection.
    pub fn upsert_rule(&self, address: &str, source_ip: IpAddr, weight: u32, description: impl Into<String>) -> Result<()> {
        if weight == 0 {
            return Err(Error::invalid("rule weight must be at least 1"));
        }
        let mut inner = self.inner.lock();
        let egress = find_mut(&mut inner.egresses, address)?;
        egress.rules.insert(
            source_ip,
            SourceRule {
                source_ip,
                weight,
                description: description.into(),
            },
        );
        Ok(())
    }

    pub fn delete_rule(&self, address: &str, source_ip: IpAddr) -> Result<()> {
        let mut inner = self.inner.lock();
        let egress = find_mut(&mut inner.egresses, address)?;
        egress
            .rules
            .remove(&source_ip)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("rule for {source_ip} on {address}")))
    }

    /// All rules, paired with their egress address. Used by the rules-file
    /// export and the store sync.
    pub fn all_rules(&self) -> Vec<(String, SourceRule)> {
        let inner = self.inner.lock();
        inner
            .egresses
            .iter()
            .flat_map(|e| e.rules.values().map(move |r| (e.address.clone(), r.clone())))
            .collect()
    }

    pub fn record_success(&self, id: EgressId) {
        let mut inner = self.inner.lock();
        if let Some(e) = inner.egresses.iter_mut().find(|e| e.id == id) {
            e.success += 1;
        }
    }

    pub fn record_failure(&self, id: EgressId) {
        let mut inner = self.inner.lock();
        if let Some(e) = inner.egresses.iter_mut().find(|e| e.id == id) {
            e.failure += 1;
        }
    }

    /// Credit relayed bytes to an egress. Called once per relay buffer-ful.
    pub fn add_bytes(&self, id: EgressId, bytes_in: u64, bytes_out: u64) {
        let mut inner = self.inner.lock();
        if let Some(e) = inner.egresses.iter_mut().find(|e| e.id == id) {
            e.bytes_in += bytes_in;
            e.bytes_out += bytes_out;
        }
    }
}

fn find_mut<'a>(egresses: &'a mut [Egress], address: &str) -> Result<&'a mut Egress> {
    egresses
        .iter_mut()
        .find(|e| e.address == address)
        .ok_or_else(|| Error::NotFound(format!("egress {address}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_of(addrs: &[&str]) -> Registry {
        Registry::new(
            addrs
                .iter()
                .enumerate()
                .map(|(i, a)| Egress::new(i as EgressId + 1, *a, "", 1))
                .collect(),
        )
    }

    #[test]
    fn test_add_rejects_duplicate_address() {
        let registry = registry_of(&["10.0.0.1"]);
        let err = registry.add(Egress::new(9, "10.0.0.1", "", 1)).unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_rejects_zero_weight() {
        let registry = registry_of(&[]);
        let err = registry.add(Egress::new(1, "10.0.0.1", "", 0)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let registry = registry_of(&["10.0.0.1"]);
        assert!(matches!(registry.remove("10.0.0.2"), Err(Error::NotFound(_))));
        assert_eq!(registry.remove("10.0.0.1").unwrap(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_disable_keeps_counters() {
        let registry = registry_of(&["10.0.0.1"]);
        registry.record_success(1);
        registry.record_failure(1);
        registry.add_bytes(1, 100, 50);
        registry.set_enabled("10.0.0.1", false).unwrap();

        let snap = &registry.list()[0];
        assert!(!snap.enabled);
        assert_eq!(snap.success, 1);
        assert_eq!(snap.failure, 1);
        assert_eq!(snap.bytes_in, 100);
        assert_eq!(snap.bytes_out, 50);
    }

    #[test]
    fn test_success_rate() {
        let registry = registry_of(&["10.0.0.1"]);
        assert_eq!(registry.list()[0].success_rate(), 0.0);

        registry.record_success(1);
        registry.record_success(1);
        registry.record_success(1);
        registry.record_failure(1);
        assert!((registry.list()[0].success_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rule_upsert_and_delete() {
        let registry = registry_of(&["10.0.0.1"]);
        let src: IpAddr = "192.168.1.5".parse().unwrap();

        assert!(matches!(
            registry.upsert_rule("10.0.0.1", src, 0, ""),
            Err(Error::InvalidArgument(_))
        ));

        registry.upsert_rule("10.0.0.1", src, 3, "lab subnet").unwrap();
        registry.upsert_rule("10.0.0.1", src, 4, "lab subnet").unwrap();
        assert_eq!(registry.list()[0].rule_count, 1);

        registry.delete_rule("10.0.0.1", src).unwrap();
        assert!(matches!(
            registry.delete_rule("10.0.0.1", src),
            Err(Error::NotFound(_))
        ));
    }
}
