//! Workflow executor: drives a workflow from submission to completion.
//!
//! Each workflow is owned by one task acting as a single-owner state
//! machine; every task-state transition happens inside it, so per-workflow
//! transitions are linearizable. Messages from workers, the supervisor and
//! the lead layer arrive through a dispatcher that routes them onto the
//! owning workflow's command channel.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use priority_queue::PriorityQueue;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::Authorizer;
use crate::bus::MessageBus;
use crate::events::{AuditEvent, EventSeverity, EventSink};
use crate::metrics::HaosMetrics;
use crate::pool::AgentPool;
use crate::quality::{QualityEngine, QualityVerdict, TaskResult};
use crate::registry::{CapabilityRegistry, RegistrySnapshot};
use crate::router::{EffectivePriority, RouteOutcome, Router};
use crate::types::{
    Address, Message, MessageBody, Priority, ResultDisposition, Task, TaskState, Workflow,
    WorkflowEvent, WorkflowSnapshot, WorkflowStatus, WorkerLayer,
};
use crate::{HaosConfig, HaosError};

/// One live assignment, visible to the supervisor for deadline tracking.
#[derive(Debug, Clone)]
pub struct AssignmentRecord {
    pub workflow_id: Uuid,
    pub worker_id: Uuid,
    pub kind: String,
    pub correlation_id: Uuid,
    pub deadline_at: DateTime<Utc>,
}

/// The task-to-worker mapping owned by the executor. At most one record per
/// task at any time.
#[derive(Default)]
pub struct AssignmentLedger {
    inner: DashMap<Uuid, AssignmentRecord>,
}

impl AssignmentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task_id: Uuid, record: AssignmentRecord) {
        self.inner.insert(task_id, record);
    }

    pub fn remove(&self, task_id: Uuid) -> Option<AssignmentRecord> {
        self.inner.remove(&task_id).map(|(_, r)| r)
    }

    pub fn get(&self, task_id: Uuid) -> Option<AssignmentRecord> {
        self.inner.get(&task_id).map(|r| r.clone())
    }

    pub fn overdue(&self, now: DateTime<Utc>) -> Vec<(Uuid, AssignmentRecord)> {
        self.inner
            .iter()
            .filter(|r| r.deadline_at < now)
            .map(|r| (*r.key(), r.clone()))
            .collect()
    }

    pub fn for_workflow(&self, workflow_id: Uuid) -> Vec<(Uuid, AssignmentRecord)> {
        self.inner
            .iter()
            .filter(|r| r.workflow_id == workflow_id)
            .map(|r| (*r.key(), r.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Decides whether a worker's help request deserves a helper subtask.
pub trait HelpPolicy: Send + Sync {
    fn admissible(&self, requester: &Task, capability: &str, registry: &RegistrySnapshot) -> bool;
}

/// Admits a help request when some registered kind covers the wanted
/// capability.
pub struct CapabilityHelpPolicy;

impl HelpPolicy for CapabilityHelpPolicy {
    fn admissible(&self, _requester: &Task, capability: &str, registry: &RegistrySnapshot) -> bool {
        let wanted: crate::types::CapabilitySet = [capability.to_string()].into_iter().collect();
        !registry.match_capabilities(&wanted).is_empty()
    }
}

/// Escalated task parked until the lead layer rules on it.
#[derive(Debug, Clone)]
pub struct PendingReview {
    pub task: Task,
    pub verdict: QualityVerdict,
    pub payload: serde_json::Value,
}

/// Lazy, finite, non-restartable stream of workflow events. Yields until
/// the single terminal `Finished` event, then ends.
pub struct WorkflowEventStream {
    rx: mpsc::UnboundedReceiver<WorkflowEvent>,
    done: bool,
}

impl futures::Stream for WorkflowEventStream {
    type Item = WorkflowEvent;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<WorkflowEvent>> {
        let this = self.get_mut();
        if this.done {
            return std::task::Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            std::task::Poll::Ready(Some(event)) => {
                if matches!(event, WorkflowEvent::Finished { .. }) {
                    this.done = true;
                }
                std::task::Poll::Ready(Some(event))
            }
            std::task::Poll::Ready(None) => {
                this.done = true;
                std::task::Poll::Ready(None)
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

enum Cmd {
    Dispatch,
    Requeue(Uuid),
    Incoming(Message),
    Cancel { reason: String },
    FinalizeCancel,
}

/// Shared per-workflow handle: snapshot access, command channel,
/// subscriptions and the pending-review table the lead layer reads.
pub struct WorkflowHandle {
    pub id: Uuid,
    wf: Arc<RwLock<Workflow>>,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<WorkflowEvent>>>,
    reviews: Mutex<HashMap<Uuid, PendingReview>>,
}

impl WorkflowHandle {
    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot::of(&self.wf.read())
    }

    /// Full copy of the workflow record.
    pub fn workflow(&self) -> Workflow {
        self.wf.read().clone()
    }

    pub fn status(&self) -> WorkflowStatus {
        self.wf.read().status
    }

    /// Attach a lazy, finite event stream. Ends with exactly one terminal
    /// event; subscribing to a finished workflow yields just that event.
    pub fn subscribe(&self) -> WorkflowEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let status = self.status();
        if status.is_terminal() {
            let _ = tx.send(WorkflowEvent::Finished {
                workflow_id: self.id,
                status,
            });
        } else {
            self.subscribers.lock().push(tx);
        }
        WorkflowEventStream { rx, done: false }
    }

    pub fn pending_review(&self, task_id: Uuid) -> Option<PendingReview> {
        self.reviews.lock().get(&task_id).cloned()
    }

    fn emit(&self, event: WorkflowEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn finish_stream(&self, status: WorkflowStatus) {
        let mut subs = self.subscribers.lock();
        for tx in subs.iter() {
            let _ = tx.send(WorkflowEvent::Finished {
                workflow_id: self.id,
                status,
            });
        }
        subs.clear();
    }
}

pub(crate) struct ExecutorInner {
    pub router: Arc<Router>,
    pub pool: Arc<AgentPool>,
    pub bus: Arc<MessageBus>,
    pub quality: Arc<QualityEngine>,
    pub breakers: Arc<crate::supervisor::CircuitBreakers>,
    pub registry: Arc<CapabilityRegistry>,
    pub events: Arc<dyn EventSink>,
    pub metrics: Arc<HaosMetrics>,
    pub auth: Arc<dyn Authorizer>,
    pub help_policy: Arc<dyn HelpPolicy>,
    pub config: Arc<HaosConfig>,
    workflows: DashMap<Uuid, Arc<WorkflowHandle>>,
    task_index: DashMap<Uuid, Uuid>,
    assignments: Arc<AssignmentLedger>,
    inflight_global: Arc<Semaphore>,
}

/// Public executor facade. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowExecutor {
    inner: Arc<ExecutorInner>,
}

impl WorkflowExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<Router>,
        pool: Arc<AgentPool>,
        bus: Arc<MessageBus>,
        quality: Arc<QualityEngine>,
        breakers: Arc<crate::supervisor::CircuitBreakers>,
        registry: Arc<CapabilityRegistry>,
        events: Arc<dyn EventSink>,
        metrics: Arc<HaosMetrics>,
        auth: Arc<dyn Authorizer>,
        help_policy: Arc<dyn HelpPolicy>,
        config: Arc<HaosConfig>,
    ) -> Self {
        let inflight_global = Arc::new(Semaphore::new(config.global_max_inflight));
        Self {
            inner: Arc::new(ExecutorInner {
                router,
                pool,
                bus,
                quality,
                breakers,
                registry,
                events,
                metrics,
                auth,
                help_policy,
                config,
                workflows: DashMap::new(),
                task_index: DashMap::new(),
                assignments: Arc::new(AssignmentLedger::new()),
                inflight_global,
            }),
        }
    }

    /// The assignment ledger shared with the supervisor.
    pub fn assignments(&self) -> Arc<AssignmentLedger> {
        Arc::clone(&self.inner.assignments)
    }

    /// Route executor-bound bus traffic onto per-workflow command channels.
    pub fn start_dispatcher(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let rx = inner.bus.subscribe(Address::Executor);
        tokio::spawn(async move {
            loop {
                let msg = rx.recv().await;
                let task_ref = match &msg.body {
                    MessageBody::Result { task_id, .. } => Some(*task_id),
                    MessageBody::HelpRequest { task_ref, .. } => Some(*task_ref),
                    MessageBody::Reassign { task_ref } => Some(*task_ref),
                    MessageBody::Escalation { task_ref, .. } => Some(*task_ref),
                    MessageBody::QualityVerdict { verdict } => Some(verdict.task_id),
                    MessageBody::ContextShare { .. } => None,
                    _ => None,
                };
                let Some(task_ref) = task_ref else {
                    continue;
                };
                let Some(workflow_id) = inner.task_index.get(&task_ref).map(|w| *w) else {
                    tracing::debug!(
                        task_id = %task_ref,
                        kind = %msg.body.kind(),
                        "message for unknown task dropped"
                    );
                    continue;
                };
                if let Some(handle) = inner.workflows.get(&workflow_id) {
                    let _ = handle.cmd_tx.send(Cmd::Incoming(msg));
                }
            }
        })
    }

    /// Submit a decomposed workflow and start driving it.
    pub async fn submit(&self, workflow: Workflow) -> Result<Uuid, HaosError> {
        self.submit_with_events(workflow).await.map(|(id, _rx)| id)
    }

    /// Submit and atomically attach an event stream, so no early event is
    /// missed between submission and subscription.
    pub async fn submit_with_events(
        &self,
        workflow: Workflow,
    ) -> Result<(Uuid, WorkflowEventStream), HaosError> {
        if workflow.tasks.is_empty() {
            return Err(HaosError::InvalidDecomposition(
                "workflow has no tasks".to_string(),
            ));
        }
        let workflow_id = workflow.id;
        if self.inner.workflows.contains_key(&workflow_id) {
            return Err(HaosError::InvalidDecomposition(format!(
                "workflow {workflow_id} was already submitted"
            )));
        }
        let principal = workflow.principal.subject.clone();
        let max_wall = workflow.budgets.max_wall;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(WorkflowHandle {
            id: workflow_id,
            wf: Arc::new(RwLock::new(workflow)),
            cmd_tx,
            subscribers: Mutex::new(Vec::new()),
            reviews: Mutex::new(HashMap::new()),
        });
        {
            let wf = handle.wf.read();
            for task_id in wf.tasks.keys() {
                self.inner.task_index.insert(*task_id, workflow_id);
            }
        }
        self.inner.workflows.insert(workflow_id, Arc::clone(&handle));

        self.inner.metrics.workflows_started.inc();
        self.inner
            .events
            .append(
                AuditEvent::new("workflow_submitted")
                    .workflow(workflow_id)
                    .principal_name(principal),
            )
            .await;

        let events_rx = handle.subscribe();
        let run = WorkflowRun::new(Arc::clone(&self.inner), Arc::clone(&handle));
        tokio::spawn(run.drive(cmd_rx));

        // Wall budget watchdog.
        let cancel_tx = handle.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(max_wall).await;
            let _ = cancel_tx.send(Cmd::Cancel {
                reason: "wall budget exhausted".to_string(),
            });
        });

        let _ = handle.cmd_tx.send(Cmd::Dispatch);
        Ok((workflow_id, events_rx))
    }

    pub fn status(&self, workflow_id: Uuid) -> Result<WorkflowSnapshot, HaosError> {
        self.inner
            .workflows
            .get(&workflow_id)
            .map(|h| h.snapshot())
            .ok_or(HaosError::WorkflowNotFound(workflow_id))
    }

    pub fn cancel(&self, workflow_id: Uuid, reason: impl Into<String>) -> Result<(), HaosError> {
        let handle = self
            .inner
            .workflows
            .get(&workflow_id)
            .map(|h| Arc::clone(&h))
            .ok_or(HaosError::WorkflowNotFound(workflow_id))?;
        let _ = handle.cmd_tx.send(Cmd::Cancel {
            reason: reason.into(),
        });
        Ok(())
    }

    pub fn subscribe(&self, workflow_id: Uuid) -> Result<WorkflowEventStream, HaosError> {
        self.inner
            .workflows
            .get(&workflow_id)
            .map(|h| h.subscribe())
            .ok_or(HaosError::WorkflowNotFound(workflow_id))
    }

    pub fn handle(&self, workflow_id: Uuid) -> Option<Arc<WorkflowHandle>> {
        self.inner.workflows.get(&workflow_id).map(|h| Arc::clone(&h))
    }

    /// Look up a parked review by task id, for the lead layer.
    pub fn pending_review(&self, task_id: Uuid) -> Option<PendingReview> {
        let workflow_id = self.inner.task_index.get(&task_id).map(|w| *w)?;
        self.inner
            .workflows
            .get(&workflow_id)
            .and_then(|h| h.pending_review(task_id))
    }
}

/// The single-owner state machine for one workflow.
struct WorkflowRun {
    inner: Arc<ExecutorInner>,
    handle: Arc<WorkflowHandle>,
    ready: PriorityQueue<Uuid, EffectivePriority>,
    permits: HashMap<Uuid, OwnedSemaphorePermit>,
    processed_results: HashSet<Uuid>,
    helper_of: HashMap<Uuid, Uuid>,
    backoffs: HashMap<Uuid, Duration>,
    shared_context: serde_json::Map<String, serde_json::Value>,
    cancelling: bool,
    cost_spent: f64,
}

impl WorkflowRun {
    fn new(inner: Arc<ExecutorInner>, handle: Arc<WorkflowHandle>) -> Self {
        Self {
            inner,
            handle,
            ready: PriorityQueue::new(),
            permits: HashMap::new(),
            processed_results: HashSet::new(),
            helper_of: HashMap::new(),
            backoffs: HashMap::new(),
            shared_context: serde_json::Map::new(),
            cancelling: false,
            cost_spent: 0.0,
        }
    }

    async fn drive(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>) {
        self.initialize().await;
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Cmd::Dispatch => self.dispatch_ready().await,
                Cmd::Requeue(task_id) => {
                    self.requeue_if_ready(task_id);
                    self.dispatch_ready().await;
                }
                Cmd::Incoming(msg) => {
                    self.handle_incoming(msg).await;
                    self.dispatch_ready().await;
                }
                Cmd::Cancel { reason } => self.begin_cancel(reason).await,
                Cmd::FinalizeCancel => {
                    self.finalize_cancel().await;
                    break;
                }
            }
            let all_terminal = !self.cancelling && self.handle.wf.read().all_tasks_terminal();
            if all_terminal {
                let status = self.terminal_status();
                self.finish(status).await;
                break;
            }
        }
        self.teardown();
    }

    async fn initialize(&mut self) {
        let mut initial_events = Vec::new();
        {
            let mut wf = self.handle.wf.write();
            wf.status = WorkflowStatus::Running;
            wf.started_at = Some(Utc::now());
            let workflow_id = wf.id;
            for task in wf.tasks.values_mut() {
                if task.depends_on.is_empty() {
                    task.state = TaskState::Ready;
                    task.ready_at = Some(Utc::now());
                    self.ready.push(task.id, EffectivePriority::of(task));
                } else {
                    task.state = TaskState::Blocked;
                }
                initial_events.push(WorkflowEvent::TaskStateChanged {
                    workflow_id,
                    task_id: task.id,
                    state: task.state,
                    attempt: task.attempt,
                });
            }
        }
        for event in initial_events {
            self.handle.emit(event);
        }
        self.audit(AuditEvent::new("workflow_started").workflow(self.handle.id))
            .await;
    }

    /// Pop ready tasks in effective-priority order and hand them to the
    /// router, within per-workflow and global bounds.
    async fn dispatch_ready(&mut self) {
        if self.cancelling {
            return;
        }
        loop {
            let cap = {
                let wf = self.handle.wf.read();
                wf.budgets
                    .max_workers
                    .min(self.inner.config.per_workflow_max_workers)
            };
            if self.permits.len() >= cap {
                return;
            }
            let Some((task_id, _)) = self.ready.pop() else {
                return;
            };
            let task = {
                let wf = self.handle.wf.read();
                match wf.tasks.get(&task_id) {
                    Some(t) if t.state == TaskState::Ready => t.clone(),
                    _ => continue,
                }
            };
            if let Err(violation) = self.check_ready_invariant(&task) {
                self.halt(violation).await;
                return;
            }
            let (max_cost, workflow_id) = {
                let wf = self.handle.wf.read();
                (wf.budgets.max_cost, wf.id)
            };
            if self.cost_spent + task.estimate.cost_hint > max_cost {
                tracing::warn!(workflow_id = %workflow_id, "cost budget exhausted");
                self.begin_cancel("cost budget exhausted".to_string()).await;
                return;
            }

            let permit = match Arc::clone(&self.inner.inflight_global).try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    self.ready.push(task_id, EffectivePriority::of(&task));
                    self.schedule_requeue(task_id);
                    return;
                }
            };

            let mut outbound = task.clone();
            if !self.shared_context.is_empty() {
                if let serde_json::Value::Object(map) = &mut outbound.inputs {
                    map.insert(
                        "shared_context".to_string(),
                        serde_json::Value::Object(self.shared_context.clone()),
                    );
                }
            }

            match self.inner.router.assign(&outbound).await {
                Ok(RouteOutcome::Assigned {
                    worker_id,
                    kind,
                    correlation_id,
                }) => {
                    self.permits.insert(task_id, permit);
                    self.backoffs.remove(&task_id);
                    let deadline_at = Utc::now()
                        + chrono::Duration::from_std(task.step_deadline).unwrap_or_default();
                    self.inner.assignments.insert(
                        task_id,
                        AssignmentRecord {
                            workflow_id,
                            worker_id,
                            kind,
                            correlation_id,
                            deadline_at,
                        },
                    );
                    self.inner.metrics.inflight_tasks.inc();
                    self.cost_spent += task.estimate.cost_hint;
                    self.transition(task_id, TaskState::Assigned);
                    self.transition(task_id, TaskState::Running);
                    {
                        let mut wf = self.handle.wf.write();
                        if let Some(t) = wf.tasks.get_mut(&task_id) {
                            t.started_at = Some(Utc::now());
                        }
                    }
                    self.audit(
                        AuditEvent::new("task_assigned")
                            .workflow(workflow_id)
                            .task(task_id)
                            .worker(worker_id),
                    )
                    .await;
                }
                Ok(RouteOutcome::NotAssignable { blocked_by_circuit }) => {
                    drop(permit);
                    if let Some(kind) = blocked_by_circuit {
                        self.handle.emit(WorkflowEvent::CircuitBlocked {
                            workflow_id,
                            task_id,
                            kind: kind.clone(),
                        });
                        self.audit(
                            AuditEvent::new("assignment_blocked_by_circuit")
                                .workflow(workflow_id)
                                .task(task_id),
                        )
                        .await;
                    }
                    self.schedule_requeue(task_id);
                }
                Err(err) => {
                    drop(permit);
                    tracing::error!(
                        workflow_id = %workflow_id,
                        task_id = %task_id,
                        error = %err,
                        "routing failed"
                    );
                    self.fail_task(task_id, err.to_string()).await;
                }
            }
        }
    }

    /// A task may only be dispatched when all its dependencies succeeded.
    fn check_ready_invariant(&self, task: &Task) -> Result<(), String> {
        let wf = self.handle.wf.read();
        for dep in &task.depends_on {
            match wf.tasks.get(dep) {
                Some(d) if d.state == TaskState::Succeeded => {}
                Some(d) => {
                    return Err(format!(
                        "task {} is ready but dependency {} is {:?}",
                        task.id, dep, d.state
                    ));
                }
                None => {
                    return Err(format!(
                        "task {} depends on {} which is not in the workflow",
                        task.id, dep
                    ));
                }
            }
        }
        Ok(())
    }

    fn schedule_requeue(&mut self, task_id: Uuid) {
        let backoff_cfg = &self.inner.config.assignment_backoff;
        let current = self
            .backoffs
            .get(&task_id)
            .copied()
            .unwrap_or(backoff_cfg.initial);
        let next = Duration::from_secs_f64(
            (current.as_secs_f64() * backoff_cfg.multiplier)
                .min(backoff_cfg.max.as_secs_f64()),
        );
        self.backoffs.insert(task_id, next);
        let jitter = 1.0 + rand::random::<f64>() * 0.1;
        let delay = Duration::from_secs_f64(current.as_secs_f64() * jitter);
        let tx = self.handle.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Cmd::Requeue(task_id));
        });
    }

    fn requeue_if_ready(&mut self, task_id: Uuid) {
        let wf = self.handle.wf.read();
        if let Some(task) = wf.tasks.get(&task_id) {
            if task.state == TaskState::Ready {
                self.ready.push(task_id, EffectivePriority::of(task));
            }
        }
    }

    async fn handle_incoming(&mut self, msg: Message) {
        match msg.body.clone() {
            MessageBody::Result {
                task_id,
                disposition,
                payload,
                wall,
            } => {
                self.handle_result(msg.correlation_id, task_id, disposition, payload, wall)
                    .await;
            }
            MessageBody::HelpRequest {
                task_ref,
                capability_wanted,
                urgency,
            } => {
                self.handle_help_request(task_ref, capability_wanted, urgency)
                    .await;
            }
            MessageBody::Reassign { task_ref } => self.handle_reassign(task_ref).await,
            MessageBody::QualityVerdict { verdict } => self.handle_review_verdict(verdict).await,
            MessageBody::ContextShare { scope, payload } => {
                self.shared_context.insert(scope, payload);
            }
            MessageBody::Escalation { task_ref, reason } => {
                tracing::debug!(
                    task_id = %task_ref,
                    reason = %reason,
                    "escalation echo ignored by executor"
                );
            }
            other => {
                tracing::debug!(kind = %other.kind(), "unexpected message at executor");
            }
        }
    }

    async fn handle_result(
        &mut self,
        correlation_id: Uuid,
        task_id: Uuid,
        disposition: ResultDisposition,
        payload: serde_json::Value,
        wall: Duration,
    ) {
        // Idempotent by correlation id: replays leave the snapshot unchanged.
        if self.processed_results.contains(&correlation_id) {
            tracing::debug!(task_id = %task_id, "duplicate result ignored");
            return;
        }
        let Some(record) = self.inner.assignments.get(task_id) else {
            tracing::debug!(task_id = %task_id, "result for unassigned task ignored");
            return;
        };
        if record.correlation_id != correlation_id {
            tracing::debug!(task_id = %task_id, "result from stale attempt ignored");
            return;
        }
        self.processed_results.insert(correlation_id);
        self.inner.assignments.remove(task_id);
        self.permits.remove(&task_id);
        self.inner.metrics.inflight_tasks.dec();
        self.inner.metrics.task_wall.observe(wall.as_secs_f64());

        if self.cancelling {
            self.transition(task_id, TaskState::Cancelled);
            return;
        }

        let task = {
            let wf = self.handle.wf.read();
            match wf.tasks.get(&task_id) {
                Some(t) => t.clone(),
                None => return,
            }
        };

        let result = TaskResult {
            task_id,
            disposition,
            payload: payload.clone(),
        };
        let started = std::time::Instant::now();
        let verdict = self.inner.quality.evaluate(&task, &result);
        self.inner
            .metrics
            .quality_check_latency
            .observe(started.elapsed().as_secs_f64());
        self.handle.emit(WorkflowEvent::QualityVerdict {
            workflow_id: self.handle.id,
            task_id,
            passes: verdict.passes,
            score: verdict.score,
        });
        self.audit(
            AuditEvent::new("quality_verdict")
                .workflow(self.handle.id)
                .task(task_id)
                .payload(&payload),
        )
        .await;

        if verdict.passes {
            self.inner.breakers.record_success(&record.kind);
            let needs_approval = self
                .inner
                .registry
                .lookup(&record.kind)
                .map(|k| k.policies.approval_required)
                .unwrap_or(false);
            if needs_approval {
                self.escalate(task, verdict, payload).await;
            } else {
                self.complete_task(task_id, payload).await;
            }
        } else if verdict.needs_review {
            self.escalate(task, verdict, payload).await;
        } else {
            if self.inner.breakers.record_failure(&record.kind) {
                self.audit(AuditEvent::new("circuit_opened").workflow(self.handle.id))
                    .await;
            }
            self.rework_or_fail(task_id, &verdict).await;
        }
    }

    async fn complete_task(&mut self, task_id: Uuid, output: serde_json::Value) {
        let mut newly_ready = Vec::new();
        let mut resumed_requester = None;
        {
            let mut wf = self.handle.wf.write();
            if let Some(task) = wf.tasks.get_mut(&task_id) {
                task.state = TaskState::Succeeded;
                task.output = Some(output.clone());
            }
            // A finished helper hands its output to the parked requester.
            if let Some(requester_id) = self.helper_of.remove(&task_id) {
                if let Some(requester) = wf.tasks.get_mut(&requester_id) {
                    requester.merge_helper_output(task_id, output.clone());
                    if requester.state == TaskState::NeedsReview {
                        requester.state = TaskState::Ready;
                        requester.ready_at = Some(Utc::now());
                        resumed_requester = Some((requester_id, EffectivePriority::of(requester)));
                    }
                }
            }
            for dep_id in wf.dependents_of(task_id) {
                let all_done = wf.tasks[&dep_id]
                    .depends_on
                    .iter()
                    .all(|d| wf.tasks.get(d).map(|t| t.state == TaskState::Succeeded) == Some(true));
                if let Some(dep) = wf.tasks.get_mut(&dep_id) {
                    if dep.state == TaskState::Blocked && all_done {
                        dep.state = TaskState::Ready;
                        dep.ready_at = Some(Utc::now());
                        newly_ready.push((dep_id, EffectivePriority::of(dep)));
                    }
                }
            }
        }
        self.inner.metrics.task_transition(TaskState::Succeeded);
        self.emit_task_state(task_id).await;
        self.audit(
            AuditEvent::new("task_succeeded")
                .workflow(self.handle.id)
                .task(task_id),
        )
        .await;
        if let Some((requester_id, prio)) = resumed_requester {
            self.ready.push(requester_id, prio);
            self.inner.metrics.task_transition(TaskState::Ready);
            self.emit_task_state(requester_id).await;
        }
        for (dep_id, prio) in newly_ready {
            self.ready.push(dep_id, prio);
            self.inner.metrics.task_transition(TaskState::Ready);
            self.emit_task_state(dep_id).await;
        }
    }

    async fn rework_or_fail(&mut self, task_id: Uuid, verdict: &QualityVerdict) {
        let retry = {
            let mut wf = self.handle.wf.write();
            let Some(task) = wf.tasks.get_mut(&task_id) else {
                return;
            };
            task.last_error = Some(verdict.reasons.join("; "));
            if task.attempt + 1 < task.max_attempts {
                task.attempt += 1;
                if let Some(hint) = &verdict.rework_hint {
                    task.apply_rework_hint(hint);
                }
                task.state = TaskState::Ready;
                task.ready_at = Some(Utc::now());
                Some(EffectivePriority::of(task))
            } else {
                None
            }
        };
        match retry {
            Some(prio) => {
                self.ready.push(task_id, prio);
                self.inner.metrics.task_transition(TaskState::Ready);
                self.emit_task_state(task_id).await;
                self.audit(
                    AuditEvent::new("task_retry")
                        .workflow(self.handle.id)
                        .task(task_id),
                )
                .await;
            }
            None => {
                let reason = verdict.reasons.join("; ");
                self.fail_task(task_id, reason).await;
            }
        }
    }

    /// Exhausted task: mark failed, cancel descendants that can never run.
    /// A failed helper releases its parked requester, without the merged
    /// output a successful helper would have contributed.
    async fn fail_task(&mut self, task_id: Uuid, reason: String) {
        let (cancelled, resumed_requester) = {
            let mut wf = self.handle.wf.write();
            match wf.tasks.get_mut(&task_id) {
                Some(task) => {
                    task.state = TaskState::Failed;
                    task.last_error = Some(reason.clone());
                }
                None => return,
            }
            wf.failed_tasks.insert(task_id);
            let mut resumed = None;
            if let Some(requester_id) = self.helper_of.remove(&task_id) {
                if let Some(requester) = wf.tasks.get_mut(&requester_id) {
                    if requester.state == TaskState::NeedsReview {
                        requester.state = TaskState::Ready;
                        requester.ready_at = Some(Utc::now());
                        resumed = Some((requester_id, EffectivePriority::of(requester)));
                    }
                }
            }
            let descendants = wf.descendants_of(task_id);
            let mut cancelled = Vec::new();
            for id in descendants {
                if let Some(t) = wf.tasks.get_mut(&id) {
                    if !t.state.is_terminal() {
                        t.state = TaskState::Cancelled;
                        t.last_error = Some(format!("dependency {task_id} failed"));
                        cancelled.push(id);
                    }
                }
            }
            (cancelled, resumed)
        };
        tracing::warn!(
            workflow_id = %self.handle.id,
            task_id = %task_id,
            reason = %reason,
            cancelled_descendants = cancelled.len(),
            "task failed permanently"
        );
        self.inner.metrics.task_transition(TaskState::Failed);
        self.emit_task_state(task_id).await;
        self.audit(
            AuditEvent::new("task_failed")
                .workflow(self.handle.id)
                .task(task_id),
        )
        .await;
        if let Some((requester_id, prio)) = resumed_requester {
            tracing::warn!(
                workflow_id = %self.handle.id,
                helper = %task_id,
                requester = %requester_id,
                "helper failed, resuming requester without its output"
            );
            self.ready.push(requester_id, prio);
            self.inner.metrics.task_transition(TaskState::Ready);
            self.emit_task_state(requester_id).await;
        }
        for id in cancelled {
            self.inner.metrics.task_transition(TaskState::Cancelled);
            self.emit_task_state(id).await;
        }
    }

    async fn escalate(&mut self, task: Task, verdict: QualityVerdict, payload: serde_json::Value) {
        let principal = self.handle.wf.read().principal.clone();
        if let Err(err) = self.inner.auth.authorize_escalation(&principal).await {
            tracing::warn!(
                workflow_id = %self.handle.id,
                task_id = %task.id,
                error = %err,
                "escalation not authorized"
            );
            self.audit(
                AuditEvent::new("escalation_denied")
                    .workflow(self.handle.id)
                    .task(task.id)
                    .severity(EventSeverity::Warning),
            )
            .await;
            self.rework_or_fail(task.id, &verdict).await;
            return;
        }

        let task_id = task.id;
        self.transition(task_id, TaskState::NeedsReview);
        self.handle.reviews.lock().insert(
            task_id,
            PendingReview {
                task: task.clone(),
                verdict: verdict.clone(),
                payload,
            },
        );
        let msg = Message::new(
            Address::Executor,
            Address::Layer(WorkerLayer::Lead),
            task.priority.bump(),
            Utc::now() + chrono::Duration::seconds(60),
            task_id,
            MessageBody::Escalation {
                task_ref: task_id,
                reason: verdict.reasons.join("; "),
            },
        );
        let _ = self.inner.bus.publish(msg);
        self.handle.emit(WorkflowEvent::Escalated {
            workflow_id: self.handle.id,
            task_id,
            layer: WorkerLayer::Lead,
        });
        self.audit(
            AuditEvent::new("task_escalated")
                .workflow(self.handle.id)
                .task(task_id),
        )
        .await;
    }

    /// A lead layer ruling for a task parked in review.
    async fn handle_review_verdict(&mut self, verdict: QualityVerdict) {
        let Some(pending) = self.handle.reviews.lock().remove(&verdict.task_id) else {
            tracing::debug!(task_id = %verdict.task_id, "verdict without pending review ignored");
            return;
        };
        if verdict.passes {
            self.complete_task(verdict.task_id, pending.payload).await;
        } else {
            self.rework_or_fail(verdict.task_id, &verdict).await;
        }
    }

    async fn handle_help_request(
        &mut self,
        requester_id: Uuid,
        capability: String,
        urgency: Priority,
    ) {
        let requester = {
            let wf = self.handle.wf.read();
            match wf.tasks.get(&requester_id) {
                Some(t) => t.clone(),
                None => return,
            }
        };
        let registry = self.inner.registry.snapshot();
        if !self
            .inner
            .help_policy
            .admissible(&requester, &capability, &registry)
        {
            tracing::info!(
                workflow_id = %self.handle.id,
                task_id = %requester_id,
                capability = %capability,
                "help request not admissible"
            );
            self.audit(
                AuditEvent::new("help_rejected")
                    .workflow(self.handle.id)
                    .task(requester_id),
            )
            .await;
            return;
        }

        // Abandon the requester's current attempt without burning it.
        if let Some(record) = self.inner.assignments.remove(requester_id) {
            self.permits.remove(&requester_id);
            self.inner.metrics.inflight_tasks.dec();
            let cancel = Message::new(
                Address::Executor,
                Address::Worker(record.worker_id),
                Priority::High,
                Utc::now() + chrono::Duration::seconds(30),
                Uuid::new_v4(),
                MessageBody::Cancel {
                    task_ref: requester_id,
                    reason: "parked awaiting helper".to_string(),
                },
            );
            let _ = self.inner.bus.publish(cancel);
        }

        let helper_id = Uuid::new_v4();
        let helper_priority = requester.priority.bump().max(urgency);
        {
            let mut wf = self.handle.wf.write();
            let helper = Task {
                id: helper_id,
                workflow_id: wf.id,
                kind: capability.clone(),
                inputs: requester.inputs.clone(),
                required_capabilities: [capability.clone()].into_iter().collect(),
                depends_on: Default::default(),
                priority: helper_priority,
                attempt: 0,
                max_attempts: self.inner.config.max_attempts_default,
                step_deadline: self.inner.config.step_deadline_default,
                state: TaskState::Ready,
                required: false,
                estimate: Default::default(),
                on_critical_path: requester.on_critical_path,
                ready_at: Some(Utc::now()),
                started_at: None,
                last_error: None,
                output: None,
            };
            self.ready.push(helper_id, EffectivePriority::of(&helper));
            wf.tasks.insert(helper_id, helper);
            if let Some(req) = wf.tasks.get_mut(&requester_id) {
                req.state = TaskState::NeedsReview;
                self.inner.metrics.task_transition(TaskState::NeedsReview);
            }
        }
        self.inner.task_index.insert(helper_id, self.handle.id);
        self.helper_of.insert(helper_id, requester_id);
        // A split decision supersedes the parked review.
        self.handle.reviews.lock().remove(&requester_id);
        self.handle.emit(WorkflowEvent::HelperSpawned {
            workflow_id: self.handle.id,
            requester: requester_id,
            helper: helper_id,
        });
        self.emit_task_state(requester_id).await;
        self.audit(
            AuditEvent::new("helper_spawned")
                .workflow(self.handle.id)
                .task(helper_id),
        )
        .await;
        tracing::info!(
            workflow_id = %self.handle.id,
            requester = %requester_id,
            helper = %helper_id,
            capability = %capability,
            "helper task inserted"
        );
    }

    /// Supervisor-driven reassignment: the worker was lost, not the task.
    /// The attempt counter stays untouched.
    async fn handle_reassign(&mut self, task_id: Uuid) {
        let in_flight = {
            let wf = self.handle.wf.read();
            wf.tasks
                .get(&task_id)
                .map(|t| t.state.is_in_flight())
                .unwrap_or(false)
        };
        if !in_flight {
            return;
        }
        self.inner.assignments.remove(task_id);
        self.permits.remove(&task_id);
        self.inner.metrics.inflight_tasks.dec();
        let prio = {
            let mut wf = self.handle.wf.write();
            let Some(task) = wf.tasks.get_mut(&task_id) else {
                return;
            };
            task.state = TaskState::Ready;
            task.ready_at = Some(Utc::now());
            EffectivePriority::of(task)
        };
        self.ready.push(task_id, prio);
        self.inner.metrics.task_transition(TaskState::Ready);
        self.emit_task_state(task_id).await;
        self.audit(
            AuditEvent::new("task_reassigned")
                .workflow(self.handle.id)
                .task(task_id),
        )
        .await;
    }

    async fn begin_cancel(&mut self, reason: String) {
        if self.cancelling || self.handle.wf.read().status.is_terminal() {
            return;
        }
        self.cancelling = true;
        {
            let mut wf = self.handle.wf.write();
            wf.status = WorkflowStatus::Cancelling;
        }
        tracing::info!(workflow_id = %self.handle.id, reason = %reason, "workflow cancelling");
        self.audit(
            AuditEvent::new("workflow_cancelling").workflow(self.handle.id),
        )
        .await;
        let grace = self.inner.config.cancel_grace;
        let deadline = Utc::now() + chrono::Duration::from_std(grace).unwrap_or_default();
        for (task_id, record) in self.inner.assignments.for_workflow(self.handle.id) {
            let cancel = Message::new(
                Address::Executor,
                Address::Worker(record.worker_id),
                Priority::High,
                deadline,
                Uuid::new_v4(),
                MessageBody::Cancel {
                    task_ref: task_id,
                    reason: reason.clone(),
                },
            );
            let _ = self.inner.bus.publish(cancel);
        }
        self.ready.clear();
        let tx = self.handle.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(Cmd::FinalizeCancel);
        });
    }

    async fn finalize_cancel(&mut self) {
        let cancelled: Vec<Uuid> = {
            let mut wf = self.handle.wf.write();
            let mut ids = Vec::new();
            for task in wf.tasks.values_mut() {
                if !task.state.is_terminal() {
                    task.state = TaskState::Cancelled;
                    ids.push(task.id);
                }
            }
            ids
        };
        for (task_id, record) in self.inner.assignments.for_workflow(self.handle.id) {
            self.inner.assignments.remove(task_id);
            self.inner.pool.finish_task(record.worker_id, task_id);
            self.inner.pool.release(record.worker_id);
        }
        for _ in self.permits.drain() {
            self.inner.metrics.inflight_tasks.dec();
        }
        for task_id in cancelled {
            self.inner.metrics.task_transition(TaskState::Cancelled);
            self.emit_task_state(task_id).await;
        }
        self.finish(WorkflowStatus::Cancelled).await;
    }

    fn terminal_status(&self) -> WorkflowStatus {
        let wf = self.handle.wf.read();
        let failed_required = wf
            .tasks
            .values()
            .any(|t| t.required && matches!(t.state, TaskState::Failed | TaskState::Cancelled));
        if failed_required {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Succeeded
        }
    }

    async fn finish(&mut self, status: WorkflowStatus) {
        {
            let mut wf = self.handle.wf.write();
            wf.status = status;
            wf.finished_at = Some(Utc::now());
        }
        self.inner.metrics.workflows_finished.inc();
        if status == WorkflowStatus::Failed {
            self.inner.metrics.workflows_failed.inc();
        }
        tracing::info!(
            workflow_id = %self.handle.id,
            status = %status.as_str(),
            "workflow finished"
        );
        self.audit(AuditEvent::new("workflow_finished").workflow(self.handle.id))
            .await;
        self.handle.finish_stream(status);
    }

    /// Halt on a detected invariant breach; never silently masked.
    async fn halt(&mut self, violation: String) {
        let err = HaosError::InvariantViolation(violation.clone());
        tracing::error!(
            workflow_id = %self.handle.id,
            error = %err,
            "workflow halted"
        );
        self.audit(
            AuditEvent::new("invariant_violation")
                .workflow(self.handle.id)
                .severity(EventSeverity::High),
        )
        .await;
        {
            let mut wf = self.handle.wf.write();
            for task in wf.tasks.values_mut() {
                if !task.state.is_terminal() {
                    task.state = TaskState::Cancelled;
                }
            }
        }
        self.finish(WorkflowStatus::Failed).await;
    }

    fn transition(&self, task_id: Uuid, state: TaskState) {
        let (event, recorded) = {
            let mut wf = self.handle.wf.write();
            let workflow_id = wf.id;
            match wf.tasks.get_mut(&task_id) {
                Some(task) => {
                    task.state = state;
                    (
                        Some(WorkflowEvent::TaskStateChanged {
                            workflow_id,
                            task_id,
                            state,
                            attempt: task.attempt,
                        }),
                        true,
                    )
                }
                None => (None, false),
            }
        };
        if recorded {
            self.inner.metrics.task_transition(state);
        }
        if let Some(event) = event {
            self.handle.emit(event);
        }
    }

    async fn emit_task_state(&self, task_id: Uuid) {
        let event = {
            let wf = self.handle.wf.read();
            wf.tasks.get(&task_id).map(|task| WorkflowEvent::TaskStateChanged {
                workflow_id: wf.id,
                task_id,
                state: task.state,
                attempt: task.attempt,
            })
        };
        if let Some(event) = event {
            self.handle.emit(event);
        }
    }

    async fn audit(&self, event: AuditEvent) {
        self.inner.events.append(event).await;
    }

    fn teardown(&mut self) {
        let wf = self.handle.wf.read();
        for task_id in wf.tasks.keys() {
            self.inner.task_index.remove(task_id);
            self.inner.assignments.remove(*task_id);
        }
        self.handle.reviews.lock().clear();
    }
}
