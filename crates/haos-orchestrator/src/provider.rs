//! AI provider facade consumed by the decomposer.
//!
//! A provider proposes a free-form DAG sketch; the decomposer validates and
//! normalizes it. Invalid proposals are rejected, never patched.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{CapabilitySet, Priority, ResourceEstimate};
use crate::HaosError;

/// One node of a proposed decomposition, referenced by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SketchNode {
    pub name: String,
    pub kind: String,
    pub required_capabilities: CapabilitySet,
    pub depends_on: Vec<String>,
    pub inputs: serde_json::Value,
    pub priority: Priority,
    pub estimate: ResourceEstimate,
    /// Optional tasks allow partial success; defaults to required.
    pub required: bool,
    pub max_attempts: Option<u32>,
}

impl SketchNode {
    pub fn new(name: impl Into<String>, capability: impl Into<String>) -> Self {
        let capability = capability.into();
        Self {
            name: name.into(),
            kind: capability.clone(),
            required_capabilities: [capability].into_iter().collect(),
            depends_on: Vec::new(),
            inputs: serde_json::json!({}),
            priority: Priority::Normal,
            estimate: ResourceEstimate::default(),
            required: true,
            max_attempts: None,
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_estimate(mut self, estimate: ResourceEstimate) -> Self {
        self.estimate = estimate;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

/// Candidate decomposition as proposed by a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DagSketch {
    pub nodes: Vec<SketchNode>,
}

impl DagSketch {
    pub fn linear(capabilities: &[&str]) -> Self {
        let mut nodes = Vec::new();
        let mut prev: Option<String> = None;
        for (i, cap) in capabilities.iter().enumerate() {
            let name = format!("t{}", i + 1);
            let mut node = SketchNode::new(&name, *cap);
            if let Some(p) = &prev {
                node.depends_on = vec![p.clone()];
            }
            prev = Some(name);
            nodes.push(node);
        }
        Self { nodes }
    }
}

/// Facade over whatever model backend proposes decompositions.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn propose(&self, request: &str) -> Result<DagSketch, HaosError>;
}

/// Deterministic provider backed by a request-to-sketch table. Used by the
/// tests and by embedders that precompute plans.
#[derive(Default)]
pub struct ScriptedProvider {
    sketches: Mutex<HashMap<String, DagSketch>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, request: impl Into<String>, sketch: DagSketch) {
        self.sketches.lock().insert(request.into(), sketch);
    }
}

#[async_trait]
impl AiProvider for ScriptedProvider {
    async fn propose(&self, request: &str) -> Result<DagSketch, HaosError> {
        self.sketches
            .lock()
            .get(request)
            .cloned()
            .ok_or_else(|| HaosError::ProviderUnavailable(format!("no plan for `{request}`")))
    }
}
