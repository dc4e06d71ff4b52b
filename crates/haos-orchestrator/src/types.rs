//! Core data model: workflows, tasks, workers and bus messages.
//!
//! Everything here is plain data. Workflow and task records are mutated only
//! through the executor, worker records only through the agent pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;
use uuid::Uuid;

use crate::auth::Principal;

/// Finite string tags declaring what a worker kind can do.
pub type CapabilitySet = BTreeSet<String>;

/// The four agent layers, ordered bottom to top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerLayer {
    Exec,
    Mgmt,
    Lead,
    Executive,
}

impl WorkerLayer {
    pub const ALL: [WorkerLayer; 4] = [
        WorkerLayer::Exec,
        WorkerLayer::Mgmt,
        WorkerLayer::Lead,
        WorkerLayer::Executive,
    ];

    /// The layer escalations travel to. `Executive` has nothing above it.
    pub fn above(self) -> Option<WorkerLayer> {
        match self {
            WorkerLayer::Exec => Some(WorkerLayer::Mgmt),
            WorkerLayer::Mgmt => Some(WorkerLayer::Lead),
            WorkerLayer::Lead => Some(WorkerLayer::Executive),
            WorkerLayer::Executive => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerLayer::Exec => "exec",
            WorkerLayer::Mgmt => "mgmt",
            WorkerLayer::Lead => "lead",
            WorkerLayer::Executive => "executive",
        }
    }
}

/// Priority shared by tasks and bus messages. Strict classes, higher wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const CLASSES: usize = 4;

    /// One step up, saturating at `Critical`.
    pub fn bump(self) -> Priority {
        match self {
            Priority::Low => Priority::Normal,
            Priority::Normal => Priority::High,
            Priority::High | Priority::Critical => Priority::Critical,
        }
    }

    /// Index into per-class queues, `Low = 0`.
    pub fn class(self) -> usize {
        self as usize
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Blocked,
    Ready,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    NeedsReview,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// States in which the task has a live assignment to a worker.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskState::Assigned | TaskState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Blocked => "blocked",
            TaskState::Ready => "ready",
            TaskState::Assigned => "assigned",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::NeedsReview => "needs_review",
        }
    }
}

/// Decomposer-supplied hints. The executor never trusts these for safety.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEstimate {
    pub expected_wall: Duration,
    pub expected_retries: u32,
    pub cost_hint: f64,
}

impl Default for ResourceEstimate {
    fn default() -> Self {
        Self {
            expected_wall: Duration::from_secs(30),
            expected_retries: 0,
            cost_hint: 1.0,
        }
    }
}

/// One node of a workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Capability tag describing what this task is, for logs and routing.
    pub kind: String,
    pub inputs: serde_json::Value,
    pub required_capabilities: CapabilitySet,
    pub depends_on: BTreeSet<Uuid>,
    pub priority: Priority,
    pub attempt: u32,
    pub max_attempts: u32,
    pub step_deadline: Duration,
    pub state: TaskState,
    /// A failed required task fails the whole workflow; optional tasks allow
    /// partial success.
    pub required: bool,
    pub estimate: ResourceEstimate,
    pub on_critical_path: bool,
    pub ready_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub output: Option<serde_json::Value>,
}

impl Task {
    /// Annotate the task inputs with a rework hint before a retry.
    pub fn apply_rework_hint(&mut self, hint: &str) {
        if let serde_json::Value::Object(map) = &mut self.inputs {
            map.insert(
                "rework_hint".to_string(),
                serde_json::Value::String(hint.to_string()),
            );
        } else {
            self.inputs = serde_json::json!({
                "payload": self.inputs.clone(),
                "rework_hint": hint,
            });
        }
    }

    /// Merge a helper task's output into this task's inputs.
    pub fn merge_helper_output(&mut self, helper_id: Uuid, output: serde_json::Value) {
        if let serde_json::Value::Object(map) = &mut self.inputs {
            map.insert(format!("helper:{helper_id}"), output);
        } else {
            let mut map = serde_json::Map::new();
            map.insert("payload".to_string(), self.inputs.clone());
            map.insert(format!("helper:{helper_id}"), output);
            self.inputs = serde_json::Value::Object(map);
        }
    }
}

/// Workflow lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelling,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Succeeded | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Succeeded => "succeeded",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelling => "cancelling",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

/// Per-workflow resource ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budgets {
    pub max_wall: Duration,
    pub max_workers: usize,
    pub max_cost: f64,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_wall: Duration::from_secs(3600),
            max_workers: 8,
            max_cost: 1000.0,
        }
    }
}

/// A user request materialized as a DAG of tasks with shared budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub request_ref: String,
    pub created_at: DateTime<Utc>,
    pub status: WorkflowStatus,
    /// DAG nodes keyed by task id; edges live in each task's `depends_on`.
    pub tasks: BTreeMap<Uuid, Task>,
    pub budgets: Budgets,
    pub principal: Principal,
    /// Longest chain by expected wall, computed at decomposition.
    pub critical_path: Vec<Uuid>,
    /// Tasks that exhausted their attempts.
    pub failed_tasks: BTreeSet<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Direct dependents of `task_id` within this workflow.
    pub fn dependents_of(&self, task_id: Uuid) -> Vec<Uuid> {
        self.tasks
            .values()
            .filter(|t| t.depends_on.contains(&task_id))
            .map(|t| t.id)
            .collect()
    }

    /// Transitive dependents of `task_id`, excluding the task itself.
    pub fn descendants_of(&self, task_id: Uuid) -> BTreeSet<Uuid> {
        let mut out = BTreeSet::new();
        let mut frontier = vec![task_id];
        while let Some(current) = frontier.pop() {
            for dep in self.dependents_of(current) {
                if out.insert(dep) {
                    frontier.push(dep);
                }
            }
        }
        out
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.state.is_terminal())
    }

    /// Fraction of tasks in a terminal state.
    pub fn progress(&self) -> f64 {
        if self.tasks.is_empty() {
            return 0.0;
        }
        let done = self.tasks.values().filter(|t| t.state.is_terminal()).count();
        done as f64 / self.tasks.len() as f64
    }
}

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    Idle,
    Busy,
    Draining,
    Failed,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Draining => "draining",
            WorkerState::Failed => "failed",
        }
    }
}

/// Shared read-only view of a worker. Mutable fields are updated only by the
/// agent pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: Uuid,
    pub layer: WorkerLayer,
    pub kind: String,
    pub capabilities: CapabilitySet,
    pub state: WorkerState,
    /// Tasks currently assigned to this worker and not yet terminal on its side.
    pub in_flight: HashSet<Uuid>,
    /// Utilization in `0..=1`.
    pub load: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub idle_since: DateTime<Utc>,
}

/// Addressable endpoints on the message bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    Worker(Uuid),
    Executor,
    Pool,
    Supervisor,
    /// Broadcast group for one agent layer.
    Layer(WorkerLayer),
}

/// How a worker classified its own result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultDisposition {
    Succeeded,
    Failed,
    NeedsReview,
}

/// The exhaustive set of message kinds moving over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageBody {
    /// Executor hands a task to a worker.
    Assignment { task: Task },
    /// Worker reports a task outcome back to the executor. Never dropped.
    Result {
        task_id: Uuid,
        disposition: ResultDisposition,
        payload: serde_json::Value,
        wall: Duration,
    },
    /// Worker liveness signal to the pool.
    Heartbeat { worker_id: Uuid, load: f64 },
    /// Worker asks for a specialist subtask to be spawned.
    HelpRequest {
        task_ref: Uuid,
        capability_wanted: String,
        urgency: Priority,
    },
    /// Worker shares context with a group.
    ContextShare {
        scope: String,
        payload: serde_json::Value,
    },
    /// Send a task result upward for review.
    Escalation { task_ref: Uuid, reason: String },
    /// Executor or supervisor tells a worker to stop a task.
    Cancel { task_ref: Uuid, reason: String },
    /// Supervisor revokes an assignment. Never dropped.
    Reassign { task_ref: Uuid },
    /// Quality engine or reviewer verdict for a task.
    QualityVerdict { verdict: crate::quality::QualityVerdict },
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Assignment { .. } => "assignment",
            MessageBody::Result { .. } => "result",
            MessageBody::Heartbeat { .. } => "heartbeat",
            MessageBody::HelpRequest { .. } => "help_request",
            MessageBody::ContextShare { .. } => "context_share",
            MessageBody::Escalation { .. } => "escalation",
            MessageBody::Cancel { .. } => "cancel",
            MessageBody::Reassign { .. } => "reassign",
            MessageBody::QualityVerdict { .. } => "quality_verdict",
        }
    }

    /// Whether the bus may drop this message once its deadline has passed.
    pub fn droppable(&self) -> bool {
        !matches!(
            self,
            MessageBody::Result { .. } | MessageBody::Reassign { .. }
        )
    }
}

/// Immutable bus envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub from: Address,
    pub to: Address,
    pub priority: Priority,
    pub deadline: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub body: MessageBody,
    pub published_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        from: Address,
        to: Address,
        priority: Priority,
        deadline: DateTime<Utc>,
        correlation_id: Uuid,
        body: MessageBody,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            priority,
            deadline,
            correlation_id,
            body,
            published_at: Utc::now(),
        }
    }
}

/// Per-task slice of a status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub state: TaskState,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Point-in-time view of a workflow, served by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: Uuid,
    pub status: WorkflowStatus,
    pub progress: f64,
    pub tasks: Vec<TaskSnapshot>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowSnapshot {
    pub fn of(workflow: &Workflow) -> Self {
        Self {
            id: workflow.id,
            status: workflow.status,
            progress: workflow.progress(),
            tasks: workflow
                .tasks
                .values()
                .map(|t| TaskSnapshot {
                    id: t.id,
                    state: t.state,
                    attempts: t.attempt,
                    last_error: t.last_error.clone(),
                })
                .collect(),
            started_at: workflow.started_at,
            finished_at: workflow.finished_at,
        }
    }
}

/// Events published on a workflow's subscription stream. The stream ends with
/// exactly one `Finished` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkflowEvent {
    TaskStateChanged {
        workflow_id: Uuid,
        task_id: Uuid,
        state: TaskState,
        attempt: u32,
    },
    QualityVerdict {
        workflow_id: Uuid,
        task_id: Uuid,
        passes: bool,
        score: f64,
    },
    Escalated {
        workflow_id: Uuid,
        task_id: Uuid,
        layer: WorkerLayer,
    },
    HelperSpawned {
        workflow_id: Uuid,
        requester: Uuid,
        helper: Uuid,
    },
    CircuitBlocked {
        workflow_id: Uuid,
        task_id: Uuid,
        kind: String,
    },
    Finished {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },
}
