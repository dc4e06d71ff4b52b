//! Task decomposer: turns an opaque request into a validated workflow DAG.
//!
//! The AI provider proposes a sketch; this module normalizes it, verifies
//! capability satisfiability, acyclicity and size bounds, allocates
//! deterministic task ids and annotates the critical path. An invalid
//! proposal is rejected, never patched.

use chrono::Utc;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::Principal;
use crate::provider::{AiProvider, DagSketch};
use crate::registry::RegistrySnapshot;
use crate::types::{Budgets, Task, TaskState, Workflow, WorkflowStatus};
use crate::HaosError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposerConfig {
    pub max_depth: usize,
    pub max_width: usize,
    /// Seed for the deterministic task-id allocator.
    pub seed: u64,
    pub propose_timeout: Duration,
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self {
            max_depth: 16,
            max_width: 32,
            seed: 0,
            propose_timeout: Duration::from_secs(10),
        }
    }
}

/// Defaults applied to tasks that do not declare their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefaults {
    pub step_deadline: Duration,
    pub max_attempts: u32,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            step_deadline: Duration::from_secs(120),
            max_attempts: 3,
        }
    }
}

pub struct Decomposer {
    provider: Arc<dyn AiProvider>,
    config: DecomposerConfig,
    defaults: TaskDefaults,
}

impl Decomposer {
    pub fn new(
        provider: Arc<dyn AiProvider>,
        config: DecomposerConfig,
        defaults: TaskDefaults,
    ) -> Self {
        Self {
            provider,
            config,
            defaults,
        }
    }

    /// Consult the provider and materialize its sketch into a workflow.
    pub async fn decompose(
        &self,
        request: &str,
        principal: Principal,
        budgets: Budgets,
        registry: &RegistrySnapshot,
    ) -> Result<Workflow, HaosError> {
        validate_budgets(&budgets)?;
        let sketch = tokio::time::timeout(
            self.config.propose_timeout,
            self.provider.propose(request),
        )
        .await
        .map_err(|_| HaosError::ProviderUnavailable("proposal timed out".to_string()))??;
        self.materialize(request, principal, budgets, registry, &sketch)
    }

    /// Normalize and validate a sketch without consulting the provider.
    ///
    /// For an identical `(sketch, registry snapshot, seed)` the resulting
    /// DAG topology and task ids are identical.
    pub fn materialize(
        &self,
        request: &str,
        principal: Principal,
        budgets: Budgets,
        registry: &RegistrySnapshot,
        sketch: &DagSketch,
    ) -> Result<Workflow, HaosError> {
        validate_budgets(&budgets)?;
        if sketch.nodes.is_empty() {
            return Err(HaosError::InvalidDecomposition(
                "plan contains no tasks".to_string(),
            ));
        }

        let mut by_name: HashMap<&str, usize> = HashMap::new();
        for (i, node) in sketch.nodes.iter().enumerate() {
            if by_name.insert(node.name.as_str(), i).is_some() {
                return Err(HaosError::InvalidDecomposition(format!(
                    "duplicate task name `{}`",
                    node.name
                )));
            }
        }

        for node in &sketch.nodes {
            if registry.match_capabilities(&node.required_capabilities).is_empty() {
                return Err(HaosError::UnsatisfiableCapability(
                    node.required_capabilities.clone(),
                ));
            }
        }

        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let indices: Vec<NodeIndex> = (0..sketch.nodes.len()).map(|i| graph.add_node(i)).collect();
        for (i, node) in sketch.nodes.iter().enumerate() {
            for dep in &node.depends_on {
                let Some(&j) = by_name.get(dep.as_str()) else {
                    return Err(HaosError::InvalidDecomposition(format!(
                        "task `{}` depends on unknown task `{dep}`",
                        node.name
                    )));
                };
                if i == j {
                    return Err(HaosError::InvalidDecomposition(format!(
                        "task `{}` depends on itself",
                        node.name
                    )));
                }
                graph.add_edge(indices[j], indices[i], ());
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(HaosError::InvalidDecomposition(
                "plan contains a dependency cycle".to_string(),
            ));
        }

        // Safe after the cycle check.
        let topo = toposort(&graph, None)
            .map_err(|_| HaosError::InvalidDecomposition("plan contains a cycle".to_string()))?;

        // Depth and width from topological levels.
        let mut level: Vec<usize> = vec![1; sketch.nodes.len()];
        for &nx in &topo {
            let i = graph[nx];
            let dep_max = graph
                .neighbors_directed(nx, petgraph::Direction::Incoming)
                .map(|p| level[graph[p]])
                .max()
                .unwrap_or(0);
            level[i] = dep_max + 1;
        }
        let depth = level.iter().copied().max().unwrap_or(1);
        let mut per_level: BTreeMap<usize, usize> = BTreeMap::new();
        for l in &level {
            *per_level.entry(*l).or_insert(0) += 1;
        }
        let width = per_level.values().copied().max().unwrap_or(1);
        if depth > self.config.max_depth || width > self.config.max_width {
            return Err(HaosError::DecompositionTooLarge {
                depth,
                max_depth: self.config.max_depth,
                width,
                max_width: self.config.max_width,
            });
        }

        // Deterministic id allocation: ids depend only on the configured
        // seed, the request and the sketch order.
        let mut hasher = DefaultHasher::new();
        request.hash(&mut hasher);
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ hasher.finish());
        let workflow_id = Uuid::from_u128(rng.gen());
        let task_ids: Vec<Uuid> = (0..sketch.nodes.len())
            .map(|_| Uuid::from_u128(rng.gen()))
            .collect();

        // Critical path: longest chain by expected wall.
        let mut best: Vec<f64> = vec![0.0; sketch.nodes.len()];
        let mut pred: Vec<Option<usize>> = vec![None; sketch.nodes.len()];
        for &nx in &topo {
            let i = graph[nx];
            let own = sketch.nodes[i].estimate.expected_wall.as_secs_f64();
            let mut from_dep = 0.0;
            for p in graph.neighbors_directed(nx, petgraph::Direction::Incoming) {
                let j = graph[p];
                if best[j] > from_dep {
                    from_dep = best[j];
                    pred[i] = Some(j);
                }
            }
            best[i] = from_dep + own;
        }
        let mut critical_path = Vec::new();
        if let Some((end, _)) = best
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        {
            let mut cursor = Some(end);
            while let Some(i) = cursor {
                critical_path.push(task_ids[i]);
                cursor = pred[i];
            }
            critical_path.reverse();
        }
        let critical: BTreeSet<Uuid> = critical_path.iter().copied().collect();

        let mut tasks = BTreeMap::new();
        for (i, node) in sketch.nodes.iter().enumerate() {
            let depends_on: BTreeSet<Uuid> = node
                .depends_on
                .iter()
                .map(|d| task_ids[by_name[d.as_str()]])
                .collect();
            let id = task_ids[i];
            tasks.insert(
                id,
                Task {
                    id,
                    workflow_id,
                    kind: node.kind.clone(),
                    inputs: node.inputs.clone(),
                    required_capabilities: node.required_capabilities.clone(),
                    depends_on,
                    priority: node.priority,
                    attempt: 0,
                    max_attempts: node.max_attempts.unwrap_or(self.defaults.max_attempts),
                    step_deadline: self.defaults.step_deadline,
                    state: TaskState::Blocked,
                    required: node.required,
                    estimate: node.estimate.clone(),
                    on_critical_path: critical.contains(&id),
                    ready_at: None,
                    started_at: None,
                    last_error: None,
                    output: None,
                },
            );
        }

        tracing::info!(
            workflow_id = %workflow_id,
            tasks = tasks.len(),
            depth,
            width,
            critical_path_len = critical_path.len(),
            "request decomposed"
        );

        Ok(Workflow {
            id: workflow_id,
            request_ref: request.to_string(),
            created_at: Utc::now(),
            status: WorkflowStatus::Pending,
            tasks,
            budgets,
            principal,
            critical_path,
            failed_tasks: BTreeSet::new(),
            started_at: None,
            finished_at: None,
        })
    }
}

fn validate_budgets(budgets: &Budgets) -> Result<(), HaosError> {
    if budgets.max_workers == 0 {
        return Err(HaosError::BudgetExceeded(
            "max_workers budget must be positive".to_string(),
        ));
    }
    if budgets.max_wall.is_zero() {
        return Err(HaosError::BudgetExceeded(
            "max_wall budget must be positive".to_string(),
        ));
    }
    Ok(())
}
