//! Capability registry: the read-mostly directory of specialist kinds.
//!
//! Readers work against an immutable snapshot; admin operations publish a
//! new snapshot. Matching is capability-set containment.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::{CapabilitySet, WorkerLayer};

/// Per-kind routing and approval policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindPolicies {
    pub approval_required: bool,
    pub rate_limit_per_min: Option<u32>,
    pub allowed_layers: Vec<WorkerLayer>,
}

impl Default for KindPolicies {
    fn default() -> Self {
        Self {
            approval_required: false,
            rate_limit_per_min: None,
            allowed_layers: WorkerLayer::ALL.to_vec(),
        }
    }
}

/// Admin-facing registration input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindSpec {
    pub kind: String,
    pub capabilities: CapabilitySet,
    pub cost_hint: f64,
    pub min_instances: usize,
    pub max_instances: usize,
    pub policies: KindPolicies,
}

impl KindSpec {
    /// A kind whose capability set is exactly the given tags.
    pub fn exact(kind: impl Into<String>, capabilities: &[&str]) -> Self {
        Self {
            kind: kind.into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            cost_hint: 1.0,
            min_instances: 0,
            max_instances: 8,
            policies: KindPolicies::default(),
        }
    }

    pub fn with_cost(mut self, cost_hint: f64) -> Self {
        self.cost_hint = cost_hint;
        self
    }

    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    pub fn with_policies(mut self, policies: KindPolicies) -> Self {
        self.policies = policies;
        self
    }
}

/// One registered kind plus its registration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindRecord {
    pub kind: String,
    pub capabilities: CapabilitySet,
    pub cost_hint: f64,
    pub min_instances: usize,
    pub max_instances: usize,
    pub policies: KindPolicies,
    /// Monotonic registration sequence, kept across re-registration.
    pub seq: u64,
}

impl KindRecord {
    pub fn satisfies(&self, required: &CapabilitySet) -> bool {
        required.is_subset(&self.capabilities)
    }

    fn is_strict_superset(&self, required: &CapabilitySet) -> bool {
        self.satisfies(required) && self.capabilities.len() > required.len()
    }
}

/// Immutable view over all registered kinds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    kinds: BTreeMap<String, KindRecord>,
}

impl RegistrySnapshot {
    pub fn lookup(&self, kind: &str) -> Option<&KindRecord> {
        self.kinds.get(kind)
    }

    pub fn list(&self) -> Vec<&KindRecord> {
        self.kinds.values().collect()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Kinds satisfying the required set, ranked strict-superset first,
    /// then lower cost hint, then earlier registration.
    pub fn match_capabilities(&self, required: &CapabilitySet) -> Vec<&KindRecord> {
        let mut matches: Vec<&KindRecord> = self
            .kinds
            .values()
            .filter(|r| r.satisfies(required))
            .collect();
        matches.sort_by(|a, b| {
            b.is_strict_superset(required)
                .cmp(&a.is_strict_superset(required))
                .then(
                    a.cost_hint
                        .partial_cmp(&b.cost_hint)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.seq.cmp(&b.seq))
        });
        matches
    }
}

/// Static plus dynamic catalog of specialist kinds.
///
/// Lock-free on the read path: `snapshot()` returns the current immutable
/// view and is what routing and decomposition should hold onto for the
/// duration of one decision.
pub struct CapabilityRegistry {
    current: ArcSwap<RegistrySnapshot>,
    write_lock: parking_lot::Mutex<()>,
    next_seq: AtomicU64,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RegistrySnapshot::default()),
            write_lock: parking_lot::Mutex::new(()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    /// Register a kind. Idempotent by `kind`: re-registering replaces the
    /// record but keeps the original registration sequence.
    pub fn register(&self, spec: KindSpec) {
        let _guard = self.write_lock.lock();
        let mut next = (**self.current.load()).clone();
        let seq = match next.kinds.get(&spec.kind) {
            Some(existing) => existing.seq,
            None => self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        tracing::info!(
            kind = %spec.kind,
            capabilities = ?spec.capabilities,
            max_instances = spec.max_instances,
            "kind registered"
        );
        next.kinds.insert(
            spec.kind.clone(),
            KindRecord {
                kind: spec.kind,
                capabilities: spec.capabilities,
                cost_hint: spec.cost_hint,
                min_instances: spec.min_instances,
                max_instances: spec.max_instances,
                policies: spec.policies,
                seq,
            },
        );
        self.current.store(Arc::new(next));
    }

    pub fn deregister(&self, kind: &str) {
        let _guard = self.write_lock.lock();
        let mut next = (**self.current.load()).clone();
        if next.kinds.remove(kind).is_some() {
            tracing::info!(kind = %kind, "kind deregistered");
            self.current.store(Arc::new(next));
        }
    }

    pub fn lookup(&self, kind: &str) -> Option<KindRecord> {
        self.current.load().lookup(kind).cloned()
    }

    pub fn list(&self) -> Vec<KindRecord> {
        self.current.load().list().into_iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(tags: &[&str]) -> CapabilitySet {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn register_is_idempotent_by_kind() {
        let registry = CapabilityRegistry::new();
        registry.register(KindSpec::exact("writer", &["write"]));
        registry.register(KindSpec::exact("writer", &["write", "edit"]));

        let record = registry.lookup("writer").unwrap();
        assert_eq!(record.capabilities, caps(&["write", "edit"]));
        assert_eq!(registry.snapshot().len(), 1);
        assert_eq!(record.seq, 0);
    }

    #[test]
    fn match_ranks_strict_superset_then_cost_then_order() {
        let registry = CapabilityRegistry::new();
        registry.register(KindSpec::exact("exact", &["analyze"]).with_cost(1.0));
        registry.register(KindSpec::exact("broad-costly", &["analyze", "write"]).with_cost(5.0));
        registry.register(KindSpec::exact("broad-cheap", &["analyze", "plan"]).with_cost(2.0));
        registry.register(KindSpec::exact("unrelated", &["paint"]));

        let snapshot = registry.snapshot();
        let ranked: Vec<&str> = snapshot
            .match_capabilities(&caps(&["analyze"]))
            .into_iter()
            .map(|r| r.kind.as_str())
            .collect();
        assert_eq!(ranked, vec!["broad-cheap", "broad-costly", "exact"]);
    }

    #[test]
    fn ties_broken_by_registration_order() {
        let registry = CapabilityRegistry::new();
        registry.register(KindSpec::exact("first", &["x"]).with_cost(1.0));
        registry.register(KindSpec::exact("second", &["x"]).with_cost(1.0));

        let snapshot = registry.snapshot();
        let ranked: Vec<&str> = snapshot
            .match_capabilities(&caps(&["x"]))
            .into_iter()
            .map(|r| r.kind.as_str())
            .collect();
        assert_eq!(ranked, vec!["first", "second"]);
    }

    #[test]
    fn snapshot_is_stable_across_admin_ops() {
        let registry = CapabilityRegistry::new();
        registry.register(KindSpec::exact("a", &["x"]));
        let before = registry.snapshot();
        registry.deregister("a");
        assert!(before.lookup("a").is_some());
        assert!(registry.snapshot().lookup("a").is_none());
    }

    #[test]
    fn no_match_for_unsatisfiable_set() {
        let registry = CapabilityRegistry::new();
        registry.register(KindSpec::exact("a", &["x"]));
        let snapshot = registry.snapshot();
        assert!(snapshot.match_capabilities(&caps(&["x", "y"])).is_empty());
    }
}
