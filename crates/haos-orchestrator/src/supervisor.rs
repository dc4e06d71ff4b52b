//! Supervisor: liveness sweeps, replacement and circuit breaking.
//!
//! The supervisor handles worker failure classes only. Task logic failures
//! are the executor's business and never trigger replacement by themselves.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::events::{AuditEvent, EventSink};
use crate::executor::AssignmentLedger;
use crate::metrics::HaosMetrics;
use crate::pool::AgentPool;
use crate::types::{Address, Message, MessageBody, Priority};

/// Rolling-window circuit breaker configuration, per kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub window: Duration,
    pub threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// What the router may do with a kind right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow,
    /// Half-open: exactly one probe assignment goes through.
    AllowProbe,
    Block,
}

enum BreakerState {
    Closed,
    Open { since: DateTime<Utc> },
    HalfOpen { probe_inflight: bool },
}

struct KindBreaker {
    state: BreakerState,
    failures: VecDeque<DateTime<Utc>>,
}

/// Per-kind circuit breakers keyed by worker kind.
pub struct CircuitBreakers {
    config: BreakerConfig,
    kinds: DashMap<String, KindBreaker>,
    metrics: Arc<HaosMetrics>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig, metrics: Arc<HaosMetrics>) -> Self {
        Self {
            config,
            kinds: DashMap::new(),
            metrics,
        }
    }

    pub fn check(&self, kind: &str) -> BreakerDecision {
        let mut entry = self.kinds.entry(kind.to_string()).or_insert(KindBreaker {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
        });
        match entry.state {
            BreakerState::Closed => BreakerDecision::Allow,
            BreakerState::Open { since } => {
                let cooldown =
                    chrono::Duration::from_std(self.config.cooldown).unwrap_or_default();
                if Utc::now() - since >= cooldown {
                    entry.state = BreakerState::HalfOpen {
                        probe_inflight: true,
                    };
                    tracing::info!(kind = %kind, "circuit half-open, probing");
                    BreakerDecision::AllowProbe
                } else {
                    BreakerDecision::Block
                }
            }
            BreakerState::HalfOpen {
                ref mut probe_inflight,
            } => {
                if *probe_inflight {
                    BreakerDecision::Block
                } else {
                    *probe_inflight = true;
                    BreakerDecision::AllowProbe
                }
            }
        }
    }

    pub fn record_success(&self, kind: &str) {
        if let Some(mut entry) = self.kinds.get_mut(kind) {
            if !matches!(entry.state, BreakerState::Closed) {
                tracing::info!(kind = %kind, "circuit closed");
            }
            entry.state = BreakerState::Closed;
            entry.failures.clear();
        }
    }

    /// Record a failure; returns true when this opened the circuit.
    pub fn record_failure(&self, kind: &str) -> bool {
        let mut entry = self.kinds.entry(kind.to_string()).or_insert(KindBreaker {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
        });
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.config.window).unwrap_or_default();
        entry.failures.push_back(now);
        while let Some(front) = entry.failures.front() {
            if now - *front > window {
                entry.failures.pop_front();
            } else {
                break;
            }
        }
        let opened = match entry.state {
            BreakerState::HalfOpen { .. } => true,
            BreakerState::Closed => entry.failures.len() as u32 >= self.config.threshold,
            BreakerState::Open { .. } => false,
        };
        if opened {
            entry.state = BreakerState::Open { since: now };
            self.metrics.circuit_breaker_opens.inc();
            tracing::warn!(
                kind = %kind,
                failures = entry.failures.len(),
                "circuit opened"
            );
        }
        opened
    }

    pub fn is_open(&self, kind: &str) -> bool {
        self.kinds
            .get(kind)
            .map(|e| matches!(e.state, BreakerState::Open { .. }))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub tick: Duration,
    pub heartbeat_timeout: Duration,
    pub cancel_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            heartbeat_timeout: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

struct PendingCancel {
    worker_id: Uuid,
    requested_at: DateTime<Utc>,
}

/// Periodic sweep over workers and running tasks.
pub struct Supervisor {
    pool: Arc<AgentPool>,
    bus: Arc<MessageBus>,
    assignments: Arc<AssignmentLedger>,
    config: SupervisorConfig,
    events: Arc<dyn EventSink>,
    pending_cancels: Mutex<HashMap<Uuid, PendingCancel>>,
}

impl Supervisor {
    pub fn new(
        pool: Arc<AgentPool>,
        bus: Arc<MessageBus>,
        assignments: Arc<AssignmentLedger>,
        config: SupervisorConfig,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            bus,
            assignments,
            config,
            events,
            pending_cancels: Mutex::new(HashMap::new()),
        })
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.config.tick);
            loop {
                ticker.tick().await;
                supervisor.sweep().await;
            }
        })
    }

    pub async fn sweep(&self) {
        let now = Utc::now();
        self.check_heartbeats(now).await;
        self.check_step_deadlines(now).await;
        self.settle_pending_cancels(now).await;
    }

    async fn check_heartbeats(&self, now: DateTime<Utc>) {
        let cutoff = chrono::Duration::from_std(self.config.heartbeat_timeout).unwrap_or_default();
        for info in self.pool.worker_infos() {
            if info.state == crate::types::WorkerState::Failed {
                continue;
            }
            if now - info.last_heartbeat <= cutoff {
                continue;
            }
            tracing::warn!(
                worker_id = %info.id,
                last_heartbeat = %info.last_heartbeat,
                "heartbeat lost"
            );
            self.events
                .append(AuditEvent::new("heartbeat_lost").worker(info.id))
                .await;
            self.replace_and_reassign(info.id).await;
        }
    }

    async fn check_step_deadlines(&self, now: DateTime<Utc>) {
        for (task_id, record) in self.assignments.overdue(now) {
            let already_pending = self.pending_cancels.lock().contains_key(&task_id);
            if already_pending {
                continue;
            }
            tracing::warn!(
                task_id = %task_id,
                worker_id = %record.worker_id,
                "step deadline exceeded, cancelling"
            );
            self.events
                .append(
                    AuditEvent::new("step_timeout")
                        .workflow(record.workflow_id)
                        .task(task_id)
                        .worker(record.worker_id),
                )
                .await;
            let grace = chrono::Duration::from_std(self.config.cancel_grace).unwrap_or_default();
            let cancel = Message::new(
                Address::Supervisor,
                Address::Worker(record.worker_id),
                Priority::High,
                now + grace,
                Uuid::new_v4(),
                MessageBody::Cancel {
                    task_ref: task_id,
                    reason: "step deadline exceeded".to_string(),
                },
            );
            let _ = self.bus.publish(cancel);
            self.pending_cancels.lock().insert(
                task_id,
                PendingCancel {
                    worker_id: record.worker_id,
                    requested_at: now,
                },
            );
        }
    }

    async fn settle_pending_cancels(&self, now: DateTime<Utc>) {
        let grace = chrono::Duration::from_std(self.config.cancel_grace).unwrap_or_default();
        let pending: Vec<(Uuid, Uuid, DateTime<Utc>)> = self
            .pending_cancels
            .lock()
            .iter()
            .map(|(task, pc)| (*task, pc.worker_id, pc.requested_at))
            .collect();
        for (task_id, worker_id, requested_at) in pending {
            if self.assignments.get(task_id).is_none() {
                // Result or reassignment already settled the task.
                self.pending_cancels.lock().remove(&task_id);
                continue;
            }
            if !self.pool.worker_has_task(worker_id, task_id) {
                // Worker observed the cancel; hand the task back.
                self.publish_reassign(task_id);
                self.pending_cancels.lock().remove(&task_id);
                continue;
            }
            if now - requested_at > grace {
                // No acknowledgement within grace: dead-worker path.
                self.events
                    .append(AuditEvent::new("cancel_unacknowledged").worker(worker_id).task(task_id))
                    .await;
                self.replace_and_reassign(worker_id).await;
                self.pending_cancels.lock().remove(&task_id);
            }
        }
    }

    async fn replace_and_reassign(&self, worker_id: Uuid) {
        let orphaned = self.pool.replace(worker_id).await;
        let mut pending = self.pending_cancels.lock();
        for task_id in &orphaned {
            pending.remove(task_id);
        }
        drop(pending);
        for task_id in orphaned {
            self.publish_reassign(task_id);
        }
    }

    fn publish_reassign(&self, task_id: Uuid) {
        let msg = Message::new(
            Address::Supervisor,
            Address::Executor,
            Priority::Critical,
            Utc::now() + chrono::Duration::seconds(60),
            Uuid::new_v4(),
            MessageBody::Reassign { task_ref: task_id },
        );
        if let Err(err) = self.bus.publish(msg) {
            tracing::error!(task_id = %task_id, error = %err, "failed to publish reassignment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakers(threshold: u32, cooldown: Duration) -> CircuitBreakers {
        CircuitBreakers::new(
            BreakerConfig {
                window: Duration::from_secs(60),
                threshold,
                cooldown,
            },
            Arc::new(HaosMetrics::new()),
        )
    }

    #[test]
    fn opens_after_threshold_within_window() {
        let cb = breakers(3, Duration::from_secs(30));
        assert!(!cb.record_failure("k"));
        assert!(!cb.record_failure("k"));
        assert!(cb.record_failure("k"));
        assert!(cb.is_open("k"));
        assert_eq!(cb.check("k"), BreakerDecision::Block);
    }

    #[test]
    fn success_closes_the_circuit() {
        let cb = breakers(1, Duration::from_secs(30));
        assert!(cb.record_failure("k"));
        cb.record_success("k");
        assert!(!cb.is_open("k"));
        assert_eq!(cb.check("k"), BreakerDecision::Allow);
    }

    #[test]
    fn half_open_allows_single_probe_after_cooldown() {
        let cb = breakers(1, Duration::from_millis(0));
        assert!(cb.record_failure("k"));
        assert_eq!(cb.check("k"), BreakerDecision::AllowProbe);
        assert_eq!(cb.check("k"), BreakerDecision::Block);
    }

    #[test]
    fn probe_failure_reopens() {
        let cb = breakers(1, Duration::from_millis(0));
        assert!(cb.record_failure("k"));
        assert_eq!(cb.check("k"), BreakerDecision::AllowProbe);
        assert!(cb.record_failure("k"));
        assert!(cb.is_open("k"));
    }

    #[test]
    fn unknown_kind_allows() {
        let cb = breakers(3, Duration::from_secs(30));
        assert_eq!(cb.check("unseen"), BreakerDecision::Allow);
    }
}
