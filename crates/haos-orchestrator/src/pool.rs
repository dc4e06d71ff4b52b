//! Agent pool: worker lifecycle per layer.
//!
//! Workers are spawned on demand under per-kind and global caps, execute
//! assignments received over the bus through a `TaskRuntime`, heartbeat to
//! the pool, and are retired or replaced by the supervisor. Worker records
//! are mutated only here.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{BusReceiver, MessageBus};
use crate::events::{AuditEvent, EventSink};
use crate::metrics::HaosMetrics;
use crate::registry::KindRecord;
use crate::types::{
    Address, Message, MessageBody, Priority, ResultDisposition, Task, WorkerInfo, WorkerLayer,
    WorkerState,
};
use crate::HaosError;

/// Outcome of one task execution on a worker.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub disposition: ResultDisposition,
    pub payload: serde_json::Value,
}

impl TaskExecution {
    pub fn succeeded(payload: serde_json::Value) -> Self {
        Self {
            disposition: ResultDisposition::Succeeded,
            payload,
        }
    }

    pub fn failed(payload: serde_json::Value) -> Self {
        Self {
            disposition: ResultDisposition::Failed,
            payload,
        }
    }
}

/// Uniform execution interface workers are polymorphic over.
#[async_trait]
pub trait TaskRuntime: Send + Sync {
    async fn execute(&self, task: &Task) -> TaskExecution;

    /// Liveness gate: a wedged runtime stops the worker's heartbeats.
    fn responsive(&self) -> bool {
        true
    }
}

/// Builds the runtime backing each spawned worker.
pub trait RuntimeFactory: Send + Sync {
    fn build(&self, kind: &KindRecord) -> Arc<dyn TaskRuntime>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Bounded wait inside `acquire` before `NoWorkerAvailable`.
    pub acquire_wait: Duration,
    pub global_max_workers: usize,
    /// Concurrent assignments one worker accepts; feeds its load figure.
    pub max_tasks_per_worker: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(10),
            acquire_wait: Duration::from_secs(2),
            global_max_workers: 64,
            max_tasks_per_worker: 4,
        }
    }
}

pub struct WorkerEntry {
    pub info: parking_lot::RwLock<WorkerInfo>,
    pub kind_record: KindRecord,
    runtime: Arc<dyn TaskRuntime>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerEntry {
    pub fn id(&self) -> Uuid {
        self.info.read().id
    }

    pub fn layer(&self) -> WorkerLayer {
        self.info.read().layer
    }
}

/// Dynamic worker pool with load balancing and health tracking.
pub struct AgentPool {
    workers: DashMap<Uuid, Arc<WorkerEntry>>,
    bus: Arc<MessageBus>,
    factory: Arc<dyn RuntimeFactory>,
    config: PoolConfig,
    metrics: Arc<HaosMetrics>,
    events: Arc<dyn EventSink>,
    released: Notify,
}

impl AgentPool {
    pub fn new(
        bus: Arc<MessageBus>,
        factory: Arc<dyn RuntimeFactory>,
        config: PoolConfig,
        metrics: Arc<HaosMetrics>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            workers: DashMap::new(),
            bus,
            factory,
            config,
            metrics,
            events,
            released: Notify::new(),
        })
    }

    /// Consume heartbeat messages addressed to the pool.
    pub fn start_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let rx = self.bus.subscribe(Address::Pool);
        tokio::spawn(async move {
            loop {
                let msg = rx.recv().await;
                if let MessageBody::Heartbeat { worker_id, load } = msg.body {
                    pool.heartbeat(worker_id, load);
                }
            }
        })
    }

    /// Spawn the minimum instances each registered kind declares.
    pub async fn warm(self: &Arc<Self>, kinds: &[KindRecord]) {
        for kind in kinds {
            while self.count_of_kind(&kind.kind) < kind.min_instances {
                if self.spawn(kind).await.is_err() {
                    break;
                }
            }
        }
    }

    /// An existing idle worker of the kind, a fresh one if under caps, or a
    /// bounded wait for one to free up.
    pub async fn acquire(
        self: &Arc<Self>,
        kind: &KindRecord,
    ) -> Result<Arc<WorkerEntry>, HaosError> {
        let deadline = tokio::time::Instant::now() + self.config.acquire_wait;
        loop {
            if let Some(entry) = self.pick_idle(&kind.kind) {
                return Ok(entry);
            }
            if self.count_of_kind(&kind.kind) < kind.max_instances
                && self.workers.len() < self.config.global_max_workers
            {
                return self.spawn(kind).await;
            }
            if tokio::time::timeout_at(deadline, self.released.notified())
                .await
                .is_err()
            {
                return Err(HaosError::NoWorkerAvailable(kind.kind.clone()));
            }
        }
    }

    /// Lowest load first, ties broken by longest idle. Never DRAINING or
    /// FAILED.
    fn pick_idle(&self, kind: &str) -> Option<Arc<WorkerEntry>> {
        let mut best: Option<(f64, chrono::DateTime<Utc>, Arc<WorkerEntry>)> = None;
        for entry in self.workers.iter() {
            let info = entry.info.read();
            if info.kind != kind || info.state != WorkerState::Idle {
                continue;
            }
            let key = (info.load, info.idle_since);
            match &best {
                Some((load, idle, _)) if (*load, *idle) <= key => {}
                _ => best = Some((key.0, key.1, Arc::clone(&entry))),
            }
        }
        best.map(|(_, _, e)| e)
    }

    async fn spawn(self: &Arc<Self>, kind: &KindRecord) -> Result<Arc<WorkerEntry>, HaosError> {
        let id = Uuid::new_v4();
        let layer = kind
            .policies
            .allowed_layers
            .first()
            .copied()
            .unwrap_or(WorkerLayer::Exec);
        let now = Utc::now();
        let info = WorkerInfo {
            id,
            layer,
            kind: kind.kind.clone(),
            capabilities: kind.capabilities.clone(),
            state: WorkerState::Idle,
            in_flight: Default::default(),
            load: 0.0,
            last_heartbeat: now,
            created_at: now,
            idle_since: now,
        };
        let runtime = self.factory.build(kind);
        let entry = Arc::new(WorkerEntry {
            info: parking_lot::RwLock::new(info),
            kind_record: kind.clone(),
            runtime: Arc::clone(&runtime),
            handles: parking_lot::Mutex::new(Vec::new()),
        });
        self.workers.insert(id, Arc::clone(&entry));
        self.metrics.worker_gauge(layer, WorkerState::Idle, 1);

        let rx = self.bus.subscribe(Address::Worker(id));
        let loop_handle = tokio::spawn(worker_loop(Arc::clone(self), Arc::clone(&entry), rx));
        let hb_handle = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.bus),
            Arc::clone(&entry),
            self.config.heartbeat_interval,
            self.config.max_tasks_per_worker,
        ));
        entry.handles.lock().extend([loop_handle, hb_handle]);

        tracing::info!(
            worker_id = %id,
            kind = %kind.kind,
            layer = ?layer,
            "worker spawned"
        );
        self.events
            .append(AuditEvent::new("worker_spawned").worker(id))
            .await;
        Ok(entry)
    }

    /// Reserve one assignment slot on a worker. Fails if the worker is
    /// draining, failed or saturated.
    pub fn reserve(&self, worker_id: Uuid, task_id: Uuid) -> bool {
        let Some(entry) = self.workers.get(&worker_id) else {
            return false;
        };
        let mut info = entry.info.write();
        match info.state {
            WorkerState::Draining | WorkerState::Failed => return false,
            WorkerState::Idle | WorkerState::Busy => {}
        }
        if info.in_flight.len() >= self.config.max_tasks_per_worker {
            return false;
        }
        info.in_flight.insert(task_id);
        info.load = info.in_flight.len() as f64 / self.config.max_tasks_per_worker as f64;
        if info.state == WorkerState::Idle {
            self.metrics.worker_gauge(info.layer, WorkerState::Idle, -1);
            self.metrics.worker_gauge(info.layer, WorkerState::Busy, 1);
            info.state = WorkerState::Busy;
        }
        true
    }

    /// Drop a task from a worker's in-flight set, from completion, cancel
    /// acknowledgement or assignment revocation.
    pub fn finish_task(&self, worker_id: Uuid, task_id: Uuid) {
        let Some(entry) = self.workers.get(&worker_id).map(|e| Arc::clone(&e)) else {
            return;
        };
        let destroy = {
            let mut info = entry.info.write();
            info.in_flight.remove(&task_id);
            info.load = info.in_flight.len() as f64 / self.config.max_tasks_per_worker as f64;
            match info.state {
                WorkerState::Busy if info.in_flight.is_empty() => {
                    self.metrics.worker_gauge(info.layer, WorkerState::Busy, -1);
                    self.metrics.worker_gauge(info.layer, WorkerState::Idle, 1);
                    info.state = WorkerState::Idle;
                    info.idle_since = Utc::now();
                    false
                }
                WorkerState::Draining if info.in_flight.is_empty() => true,
                _ => false,
            }
        };
        if destroy {
            self.destroy(worker_id);
        }
        self.released.notify_waiters();
    }

    pub fn heartbeat(&self, worker_id: Uuid, load: f64) {
        if let Some(entry) = self.workers.get(&worker_id) {
            let mut info = entry.info.write();
            info.last_heartbeat = Utc::now();
            info.load = load;
        }
    }

    /// Back to IDLE if healthy, FAILED otherwise.
    pub fn release(&self, worker_id: Uuid) {
        let Some(entry) = self.workers.get(&worker_id).map(|e| Arc::clone(&e)) else {
            return;
        };
        let healthy = {
            let info = entry.info.read();
            let cutoff =
                chrono::Duration::from_std(self.config.heartbeat_timeout).unwrap_or_default();
            Utc::now() - info.last_heartbeat <= cutoff
        };
        if healthy {
            self.finish_all(worker_id);
        } else {
            self.mark_failed(worker_id);
        }
    }

    fn finish_all(&self, worker_id: Uuid) {
        let tasks: Vec<Uuid> = self
            .workers
            .get(&worker_id)
            .map(|e| e.info.read().in_flight.iter().copied().collect())
            .unwrap_or_default();
        for task in tasks {
            self.finish_task(worker_id, task);
        }
    }

    /// Graceful retirement: stop accepting work, drain, then destroy.
    pub async fn retire(&self, worker_id: Uuid) {
        let Some(entry) = self.workers.get(&worker_id).map(|e| Arc::clone(&e)) else {
            return;
        };
        let empty = {
            let mut info = entry.info.write();
            if info.state == WorkerState::Failed {
                return;
            }
            self.metrics.worker_gauge(info.layer, info.state, -1);
            self.metrics.worker_gauge(info.layer, WorkerState::Draining, 1);
            info.state = WorkerState::Draining;
            info.in_flight.is_empty()
        };
        tracing::info!(worker_id = %worker_id, "worker draining");
        if empty {
            self.destroy(worker_id);
        }
        while self.workers.contains_key(&worker_id) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn mark_failed(&self, worker_id: Uuid) {
        if let Some(entry) = self.workers.get(&worker_id) {
            let mut info = entry.info.write();
            if info.state != WorkerState::Failed {
                self.metrics.worker_gauge(info.layer, info.state, -1);
                self.metrics.worker_gauge(info.layer, WorkerState::Failed, 1);
                info.state = WorkerState::Failed;
            }
        }
    }

    /// Immediate replacement: fail the worker, hand back its in-flight
    /// tasks for reassignment and spawn a same-kind substitute under caps.
    pub async fn replace(self: &Arc<Self>, worker_id: Uuid) -> Vec<Uuid> {
        let Some(entry) = self.workers.get(&worker_id).map(|e| Arc::clone(&e)) else {
            return Vec::new();
        };
        self.mark_failed(worker_id);
        let (kind_record, orphaned) = {
            let info = entry.info.read();
            (
                entry.kind_record.clone(),
                info.in_flight.iter().copied().collect::<Vec<_>>(),
            )
        };
        self.destroy(worker_id);
        self.metrics.worker_replacements.inc();
        self.events
            .append(AuditEvent::new("worker_replaced").worker(worker_id))
            .await;

        if self.count_of_kind(&kind_record.kind) < kind_record.max_instances
            && self.workers.len() < self.config.global_max_workers
        {
            if let Err(err) = self.spawn(&kind_record).await {
                tracing::warn!(
                    kind = %kind_record.kind,
                    error = %err,
                    "failed to spawn replacement worker"
                );
            }
        }
        tracing::warn!(
            worker_id = %worker_id,
            kind = %kind_record.kind,
            orphaned = orphaned.len(),
            "worker replaced"
        );
        orphaned
    }

    fn destroy(&self, worker_id: Uuid) {
        if let Some((_, entry)) = self.workers.remove(&worker_id) {
            let info = entry.info.read();
            self.metrics.worker_gauge(info.layer, info.state, -1);
            drop(info);
            for handle in entry.handles.lock().drain(..) {
                handle.abort();
            }
            tracing::info!(worker_id = %worker_id, "worker destroyed");
            self.released.notify_waiters();
        }
    }

    pub fn count_of_kind(&self, kind: &str) -> usize {
        self.workers
            .iter()
            .filter(|e| {
                let info = e.info.read();
                info.kind == kind && info.state != WorkerState::Failed
            })
            .count()
    }

    pub fn total_workers(&self) -> usize {
        self.workers.len()
    }

    /// Snapshot of every worker record.
    pub fn worker_infos(&self) -> Vec<WorkerInfo> {
        self.workers.iter().map(|e| e.info.read().clone()).collect()
    }

    pub fn worker_info(&self, worker_id: Uuid) -> Option<WorkerInfo> {
        self.workers.get(&worker_id).map(|e| e.info.read().clone())
    }

    pub fn worker_has_task(&self, worker_id: Uuid, task_id: Uuid) -> bool {
        self.workers
            .get(&worker_id)
            .map(|e| e.info.read().in_flight.contains(&task_id))
            .unwrap_or(false)
    }
}

/// Main worker loop: execute assignments, observe cancels between steps.
async fn worker_loop(pool: Arc<AgentPool>, entry: Arc<WorkerEntry>, rx: BusReceiver) {
    let worker_id = entry.info.read().id;
    let mut pending: VecDeque<Message> = VecDeque::new();
    loop {
        let msg = match pending.pop_front() {
            Some(m) => m,
            None => rx.recv().await,
        };
        match msg.body {
            MessageBody::Assignment { task } => {
                run_assignment(&pool, &entry, &rx, &mut pending, msg.correlation_id, task).await;
            }
            MessageBody::Cancel { task_ref, .. } => {
                // Cancels for work already finished on this side.
                tracing::debug!(worker_id = %worker_id, task_id = %task_ref, "stale cancel");
            }
            MessageBody::ContextShare { .. } => {}
            other => {
                tracing::debug!(worker_id = %worker_id, kind = %other.kind(), "unhandled message");
            }
        }
    }
}

async fn run_assignment(
    pool: &Arc<AgentPool>,
    entry: &Arc<WorkerEntry>,
    rx: &BusReceiver,
    pending: &mut VecDeque<Message>,
    correlation_id: Uuid,
    task: Task,
) {
    let worker_id = entry.info.read().id;
    tracing::debug!(worker_id = %worker_id, task_id = %task.id, "assignment accepted");
    let started = tokio::time::Instant::now();
    let exec = entry.runtime.execute(&task);
    tokio::pin!(exec);
    let outcome = loop {
        tokio::select! {
            out = &mut exec => break Some(out),
            msg = rx.recv() => {
                match &msg.body {
                    MessageBody::Cancel { task_ref, reason } if *task_ref == task.id => {
                        tracing::info!(
                            worker_id = %worker_id,
                            task_id = %task.id,
                            reason = %reason,
                            "assignment cancelled mid-step"
                        );
                        break None;
                    }
                    _ => pending.push_back(msg),
                }
            }
        }
    };
    pool.finish_task(worker_id, task.id);

    if let Some(execution) = outcome {
        let wall = started.elapsed();
        let result = Message::new(
            Address::Worker(worker_id),
            Address::Executor,
            task.priority,
            Utc::now() + chrono::Duration::seconds(60),
            correlation_id,
            MessageBody::Result {
                task_id: task.id,
                disposition: execution.disposition,
                payload: execution.payload,
                wall,
            },
        );
        if let Err(err) = pool.bus.publish(result) {
            tracing::error!(
                worker_id = %worker_id,
                task_id = %task.id,
                error = %err,
                "failed to publish result"
            );
        }
    }
}

/// Periodic liveness signal. A non-responsive runtime suppresses it.
async fn heartbeat_loop(
    bus: Arc<MessageBus>,
    entry: Arc<WorkerEntry>,
    interval: Duration,
    max_tasks: usize,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if !entry.runtime.responsive() {
            continue;
        }
        let (worker_id, load, failed) = {
            let info = entry.info.read();
            (
                info.id,
                info.in_flight.len() as f64 / max_tasks as f64,
                info.state == WorkerState::Failed,
            )
        };
        if failed {
            return;
        }
        let msg = Message::new(
            Address::Worker(worker_id),
            Address::Pool,
            Priority::Normal,
            Utc::now() + chrono::Duration::from_std(interval * 2).unwrap_or_default(),
            Uuid::new_v4(),
            MessageBody::Heartbeat { worker_id, load },
        );
        let _ = bus.publish(msg);
    }
}
