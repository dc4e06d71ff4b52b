//! Hierarchical Agent Orchestration System
//!
//! This crate provides a coordination runtime that turns an opaque user
//! request into a dependency graph of sub-tasks and drives it to completion:
//! - Task decomposition into validated, bounded DAGs
//! - A four-layer agent pool with spawn, retire, health-check and replace
//! - Capability-based routing with load balancing and rate limits
//! - A typed, priority, deadline-bearing message bus
//! - Per-workflow serialized execution with quality gates and retries
//! - Supervision with heartbeat tracking, replacement and circuit breaking

pub mod auth;
pub mod bus;
pub mod decomposer;
pub mod events;
pub mod executor;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod provider;
pub mod quality;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod types;

pub use auth::{AllowAll, Authorizer, Principal, RoleAuthorizer};
pub use bus::{BusConfig, BusReceiver, MessageBus};
pub use decomposer::{Decomposer, DecomposerConfig};
pub use events::{AuditEvent, EventSink, MemoryEventSink};
pub use executor::{
    AssignmentLedger, AssignmentRecord, CapabilityHelpPolicy, HelpPolicy, PendingReview,
    WorkflowEventStream, WorkflowExecutor, WorkflowHandle,
};
pub use metrics::HaosMetrics;
pub use orchestrator::{Orchestrator, OrchestratorDeps};
pub use pool::{AgentPool, PoolConfig, RuntimeFactory, TaskExecution, TaskRuntime};
pub use provider::{AiProvider, DagSketch, ScriptedProvider, SketchNode};
pub use quality::{
    CheckOutcome, QualityCheck, QualityEngine, QualityVerdict, ReviewDecision, ReviewPolicy,
    ScoreReviewPolicy,
};
pub use registry::{CapabilityRegistry, KindPolicies, KindRecord, KindSpec, RegistrySnapshot};
pub use router::{EffectivePriority, RouteOutcome, Router};
pub use supervisor::{BreakerConfig, BreakerDecision, CircuitBreakers, Supervisor};
pub use types::{
    Address, Budgets, CapabilitySet, Message, MessageBody, Priority, ResourceEstimate,
    ResultDisposition, Task, TaskSnapshot, TaskState, Workflow, WorkflowEvent, WorkflowSnapshot,
    WorkflowStatus, WorkerInfo, WorkerLayer, WorkerState,
};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use types::CapabilitySet as Caps;
use uuid::Uuid;

/// Errors surfaced by the orchestration core.
#[derive(Error, Debug)]
pub enum HaosError {
    #[error("principal `{principal}` is not authorized: {reason}")]
    UnauthorizedPrincipal { principal: String, reason: String },

    #[error("no registered kind satisfies capabilities {0:?}")]
    UnsatisfiableCapability(Caps),

    #[error("decomposition exceeds bounds: depth {depth}/{max_depth}, width {width}/{max_width}")]
    DecompositionTooLarge {
        depth: usize,
        max_depth: usize,
        width: usize,
        max_width: usize,
    },

    #[error("invalid decomposition: {0}")]
    InvalidDecomposition(String),

    #[error("budget rejected: {0}")]
    BudgetExceeded(String),

    #[error("no worker available for kind `{0}`")]
    NoWorkerAvailable(String),

    #[error("assignment timed out for task {0}")]
    AssignmentTimeout(Uuid),

    #[error("quality check timed out for task {0}")]
    QualityCheckTimeout(Uuid),

    #[error("task {task_id} failed after {attempts} attempts")]
    TaskFailed { task_id: Uuid, attempts: u32 },

    #[error("worker {0} stopped heartbeating")]
    HeartbeatLost(Uuid),

    #[error("task {0} exceeded its step deadline")]
    StepTimeout(Uuid),

    #[error("circuit open for kind `{0}`")]
    CircuitOpen(String),

    #[error("no healthy kind satisfies capabilities {0:?}")]
    NoHealthyKind(Caps),

    #[error("message bus overloaded at {0:?}")]
    BusOverload(types::Address),

    #[error("AI provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl HaosError {
    /// Stable kind tag for reports, events and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            HaosError::UnauthorizedPrincipal { .. } => "unauthorized_principal",
            HaosError::UnsatisfiableCapability(_) => "unsatisfiable_capability",
            HaosError::DecompositionTooLarge { .. } => "decomposition_too_large",
            HaosError::InvalidDecomposition(_) => "invalid_decomposition",
            HaosError::BudgetExceeded(_) => "budget_exceeded",
            HaosError::NoWorkerAvailable(_) => "no_worker_available",
            HaosError::AssignmentTimeout(_) => "assignment_timeout",
            HaosError::QualityCheckTimeout(_) => "quality_check_timeout",
            HaosError::TaskFailed { .. } => "task_failed",
            HaosError::HeartbeatLost(_) => "heartbeat_lost",
            HaosError::StepTimeout(_) => "step_timeout",
            HaosError::CircuitOpen(_) => "circuit_open",
            HaosError::NoHealthyKind(_) => "no_healthy_kind",
            HaosError::BusOverload(_) => "bus_overload",
            HaosError::ProviderUnavailable(_) => "provider_unavailable",
            HaosError::WorkflowNotFound(_) => "workflow_not_found",
            HaosError::InvariantViolation(_) => "invariant_violation",
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            HaosError::NoWorkerAvailable(_)
                | HaosError::AssignmentTimeout(_)
                | HaosError::QualityCheckTimeout(_)
                | HaosError::CircuitOpen(_)
                | HaosError::BusOverload(_)
                | HaosError::ProviderUnavailable(_)
        )
    }

    /// User-visible projection carrying the ids the error relates to.
    pub fn report(&self, workflow_id: Option<Uuid>, task_id: Option<Uuid>) -> ErrorReport {
        ErrorReport {
            kind: self.kind().to_string(),
            workflow_id,
            task_id,
            retriable: self.retriable(),
            message: self.to_string(),
        }
    }
}

/// The shape every user-visible error reduces to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: String,
    pub workflow_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub retriable: bool,
    pub message: String,
}

/// Backoff applied when a ready task cannot be assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            multiplier: 2.0,
            max: Duration::from_secs(5),
        }
    }
}

/// The full recognized configuration surface of the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaosConfig {
    /// Missing heartbeats for longer than this mark a worker failed.
    pub heartbeat_timeout: Duration,
    /// How often workers emit heartbeats.
    pub heartbeat_interval: Duration,
    /// Bus messages older than this are evicted by the sweeper.
    pub message_ttl: Duration,
    /// Step deadline applied to tasks that do not declare their own.
    pub step_deadline_default: Duration,
    pub max_attempts_default: u32,
    /// Upper bound on concurrent in-flight tasks per workflow; the effective
    /// bound is the minimum of this and the workflow budget.
    pub per_workflow_max_workers: usize,
    /// Process-wide bound on concurrent in-flight tasks.
    pub global_max_inflight: usize,
    /// Process-wide bound on live workers across all kinds.
    pub global_max_workers: usize,
    pub circuit_breaker: supervisor::BreakerConfig,
    pub decomposer: decomposer::DecomposerConfig,
    pub supervisor_tick: Duration,
    /// Grace period between a cancel request and forced release.
    pub cancel_grace: Duration,
    pub assignment_backoff: BackoffConfig,
    /// Bounded wait inside `AgentPool::acquire` before giving up.
    pub acquire_wait: Duration,
    /// Per-mailbox queue bound; beyond it `publish` fails with `BusOverload`.
    pub mailbox_capacity: usize,
    /// Concurrent assignments a single worker accepts; feeds its load figure.
    pub max_tasks_per_worker: usize,
    /// Review score at or above which the default lead policy approves.
    pub review_score_threshold: f64,
}

impl Default for HaosConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(2),
            message_ttl: Duration::from_secs(300),
            step_deadline_default: Duration::from_secs(120),
            max_attempts_default: 3,
            per_workflow_max_workers: 16,
            global_max_inflight: 256,
            global_max_workers: 64,
            circuit_breaker: supervisor::BreakerConfig::default(),
            decomposer: decomposer::DecomposerConfig::default(),
            supervisor_tick: Duration::from_millis(500),
            cancel_grace: Duration::from_secs(5),
            assignment_backoff: BackoffConfig::default(),
            acquire_wait: Duration::from_secs(2),
            mailbox_capacity: 10_000,
            max_tasks_per_worker: 4,
            review_score_threshold: 0.6,
        }
    }
}

/// Install a tracing subscriber honoring `RUST_LOG`. Safe to call twice.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
