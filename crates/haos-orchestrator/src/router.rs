//! Router: picks a worker for each ready task.
//!
//! Kinds come ordered from the capability registry; the pool supplies the
//! least-loaded worker of a kind. Per-layer allowlists, per-kind rate
//! limits and open circuit breakers are honored here.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::metrics::HaosMetrics;
use crate::pool::AgentPool;
use crate::registry::{CapabilityRegistry, KindRecord};
use crate::supervisor::{BreakerDecision, CircuitBreakers};
use crate::types::{Address, Message, MessageBody, Task};
use crate::HaosError;

/// Combined scheduler priority: task priority plus criticality and retry
/// bonuses. Higher wins; ties broken by earliest ready time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectivePriority {
    pub score: u32,
    pub ready_at: DateTime<Utc>,
}

impl EffectivePriority {
    pub fn of(task: &Task) -> Self {
        let mut score = (task.priority as u32) * 100;
        if task.on_critical_path {
            score += 50;
        }
        if task.attempt > 0 {
            score += 25;
        }
        Self {
            score,
            ready_at: task.ready_at.unwrap_or_else(Utc::now),
        }
    }
}

impl Ord for EffectivePriority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .cmp(&other.score)
            .then(other.ready_at.cmp(&self.ready_at))
    }
}

impl PartialOrd for EffectivePriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// What the router decided for one task.
#[derive(Debug, Clone)]
pub enum RouteOutcome {
    Assigned {
        worker_id: Uuid,
        kind: String,
        correlation_id: Uuid,
    },
    /// No worker right now; the executor re-queues with backoff.
    NotAssignable { blocked_by_circuit: Option<String> },
}

struct RateWindow {
    minute: i64,
    count: u32,
}

pub struct Router {
    registry: Arc<CapabilityRegistry>,
    pool: Arc<AgentPool>,
    bus: Arc<MessageBus>,
    breakers: Arc<CircuitBreakers>,
    metrics: Arc<HaosMetrics>,
    rate_windows: DashMap<String, RateWindow>,
}

impl Router {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        pool: Arc<AgentPool>,
        bus: Arc<MessageBus>,
        breakers: Arc<CircuitBreakers>,
        metrics: Arc<HaosMetrics>,
    ) -> Self {
        Self {
            registry,
            pool,
            bus,
            breakers,
            metrics,
            rate_windows: DashMap::new(),
        }
    }

    /// Try to place a task on a worker and publish the assignment.
    pub async fn assign(&self, task: &Task) -> Result<RouteOutcome, HaosError> {
        let snapshot = self.registry.snapshot();
        let matches = snapshot.match_capabilities(&task.required_capabilities);
        if matches.is_empty() {
            return Err(HaosError::UnsatisfiableCapability(
                task.required_capabilities.clone(),
            ));
        }

        let mut blocked_by_circuit = None;
        for kind in matches {
            match self.breakers.check(&kind.kind) {
                BreakerDecision::Block => {
                    blocked_by_circuit.get_or_insert_with(|| kind.kind.clone());
                    continue;
                }
                BreakerDecision::Allow | BreakerDecision::AllowProbe => {}
            }
            if !self.within_rate_limit(kind) {
                tracing::debug!(kind = %kind.kind, "per-kind rate limit reached");
                continue;
            }

            let entry = match self.pool.acquire(kind).await {
                Ok(entry) => entry,
                Err(HaosError::NoWorkerAvailable(_)) => continue,
                Err(other) => return Err(other),
            };
            if !kind.policies.allowed_layers.contains(&entry.layer()) {
                continue;
            }
            let worker_id = entry.id();
            if !self.pool.reserve(worker_id, task.id) {
                continue;
            }

            let correlation_id = Uuid::new_v4();
            let deadline = Utc::now()
                + chrono::Duration::from_std(task.step_deadline).unwrap_or_default();
            let msg = Message::new(
                Address::Executor,
                Address::Worker(worker_id),
                task.priority,
                deadline,
                correlation_id,
                MessageBody::Assignment { task: task.clone() },
            );
            if let Err(err) = self.bus.publish(msg) {
                self.pool.finish_task(worker_id, task.id);
                tracing::warn!(
                    task_id = %task.id,
                    worker_id = %worker_id,
                    error = %err,
                    "assignment publish failed"
                );
                continue;
            }

            if let Some(ready_at) = task.ready_at {
                let waited = (Utc::now() - ready_at).num_milliseconds().max(0) as f64 / 1000.0;
                self.metrics.assign_latency.observe(waited);
            }
            tracing::info!(
                task_id = %task.id,
                worker_id = %worker_id,
                kind = %kind.kind,
                attempt = task.attempt,
                "task assigned"
            );
            return Ok(RouteOutcome::Assigned {
                worker_id,
                kind: kind.kind.clone(),
                correlation_id,
            });
        }

        Ok(RouteOutcome::NotAssignable { blocked_by_circuit })
    }

    fn within_rate_limit(&self, kind: &KindRecord) -> bool {
        let Some(limit) = kind.policies.rate_limit_per_min else {
            return true;
        };
        let minute = Utc::now().timestamp() / 60;
        let mut window = self
            .rate_windows
            .entry(kind.kind.clone())
            .or_insert(RateWindow { minute, count: 0 });
        if window.minute != minute {
            window.minute = minute;
            window.count = 0;
        }
        if window.count >= limit {
            return false;
        }
        window.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Priority, TaskState};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn task(priority: Priority, critical: bool, attempt: u32, ready_s: i64) -> Task {
        Task {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            kind: "k".to_string(),
            inputs: serde_json::json!({}),
            required_capabilities: BTreeSet::new(),
            depends_on: BTreeSet::new(),
            priority,
            attempt,
            max_attempts: 3,
            step_deadline: Duration::from_secs(60),
            state: TaskState::Ready,
            required: true,
            estimate: Default::default(),
            on_critical_path: critical,
            ready_at: Some(
                DateTime::<Utc>::from_timestamp(1_700_000_000 + ready_s, 0).unwrap(),
            ),
            started_at: None,
            last_error: None,
            output: None,
        }
    }

    #[test]
    fn priority_dominates_then_criticality_then_retry() {
        let low = EffectivePriority::of(&task(Priority::Low, true, 1, 0));
        let normal = EffectivePriority::of(&task(Priority::Normal, false, 0, 0));
        let critical_path = EffectivePriority::of(&task(Priority::Normal, true, 0, 0));
        let retried = EffectivePriority::of(&task(Priority::Normal, true, 1, 0));
        assert!(normal > low);
        assert!(critical_path > normal);
        assert!(retried > critical_path);
    }

    #[test]
    fn ties_broken_by_earliest_ready() {
        let earlier = EffectivePriority::of(&task(Priority::Normal, false, 0, 0));
        let later = EffectivePriority::of(&task(Priority::Normal, false, 0, 10));
        assert!(earlier > later);
    }
}
