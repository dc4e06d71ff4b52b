//! The orchestrator facade: registry, decomposer, pool, bus, executor and
//! supervisor wired together behind the public API.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::{AllowAll, Authorizer, Principal};
use crate::bus::{BusConfig, MessageBus};
use crate::decomposer::{Decomposer, TaskDefaults};
use crate::events::{AuditEvent, EventSink, MemoryEventSink};
use crate::executor::{CapabilityHelpPolicy, HelpPolicy, WorkflowEventStream, WorkflowExecutor};
use crate::metrics::HaosMetrics;
use crate::pool::{AgentPool, PoolConfig, RuntimeFactory};
use crate::provider::AiProvider;
use crate::quality::{QualityEngine, QualityVerdict, ReviewDecision, ReviewPolicy, ScoreReviewPolicy};
use crate::registry::CapabilityRegistry;
use crate::router::Router;
use crate::supervisor::{CircuitBreakers, Supervisor, SupervisorConfig};
use crate::types::{
    Address, Budgets, Message, MessageBody, Priority, WorkflowSnapshot, WorkerLayer,
};
use crate::{HaosConfig, HaosError};

/// Pluggable collaborators consumed by the core.
pub struct OrchestratorDeps {
    pub provider: Arc<dyn AiProvider>,
    pub factory: Arc<dyn RuntimeFactory>,
    pub authorizer: Arc<dyn Authorizer>,
    pub events: Arc<dyn EventSink>,
    pub quality: QualityEngine,
    /// Defaults to a score-threshold policy driven by
    /// `HaosConfig::review_score_threshold`.
    pub review_policy: Option<Arc<dyn ReviewPolicy>>,
    pub help_policy: Arc<dyn HelpPolicy>,
}

impl OrchestratorDeps {
    /// Defaults for everything but the provider and worker factory: permit
    /// all principals, keep audit events in memory, run the standard
    /// quality chain, review by score.
    pub fn new(provider: Arc<dyn AiProvider>, factory: Arc<dyn RuntimeFactory>) -> Self {
        Self {
            provider,
            factory,
            authorizer: Arc::new(AllowAll),
            events: Arc::new(MemoryEventSink::new()),
            quality: QualityEngine::standard(),
            review_policy: None,
            help_policy: Arc::new(CapabilityHelpPolicy),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_quality(mut self, quality: QualityEngine) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_review_policy(mut self, policy: Arc<dyn ReviewPolicy>) -> Self {
        self.review_policy = Some(policy);
        self
    }
}

/// One fully wired orchestration runtime.
pub struct Orchestrator {
    config: Arc<HaosConfig>,
    registry: Arc<CapabilityRegistry>,
    pool: Arc<AgentPool>,
    bus: Arc<MessageBus>,
    executor: WorkflowExecutor,
    decomposer: Decomposer,
    metrics: Arc<HaosMetrics>,
    events: Arc<dyn EventSink>,
    authorizer: Arc<dyn Authorizer>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(config: HaosConfig, deps: OrchestratorDeps) -> Arc<Self> {
        let config = Arc::new(config);
        let metrics = Arc::new(HaosMetrics::new());
        let bus = Arc::new(MessageBus::new(
            BusConfig {
                message_ttl: config.message_ttl,
                mailbox_capacity: config.mailbox_capacity,
                sweep_interval: config.message_ttl.min(std::time::Duration::from_secs(5)),
            },
            Arc::clone(&metrics),
        ));
        let registry = Arc::new(CapabilityRegistry::new());
        let pool = AgentPool::new(
            Arc::clone(&bus),
            Arc::clone(&deps.factory),
            PoolConfig {
                heartbeat_interval: config.heartbeat_interval,
                heartbeat_timeout: config.heartbeat_timeout,
                acquire_wait: config.acquire_wait,
                global_max_workers: config.global_max_workers,
                max_tasks_per_worker: config.max_tasks_per_worker,
            },
            Arc::clone(&metrics),
            Arc::clone(&deps.events),
        );
        let breakers = Arc::new(CircuitBreakers::new(
            config.circuit_breaker.clone(),
            Arc::clone(&metrics),
        ));
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&bus),
            Arc::clone(&breakers),
            Arc::clone(&metrics),
        ));
        let executor = WorkflowExecutor::new(
            router,
            Arc::clone(&pool),
            Arc::clone(&bus),
            Arc::new(deps.quality),
            Arc::clone(&breakers),
            Arc::clone(&registry),
            Arc::clone(&deps.events),
            Arc::clone(&metrics),
            Arc::clone(&deps.authorizer),
            Arc::clone(&deps.help_policy),
            Arc::clone(&config),
        );
        let decomposer = Decomposer::new(
            Arc::clone(&deps.provider),
            config.decomposer.clone(),
            TaskDefaults {
                step_deadline: config.step_deadline_default,
                max_attempts: config.max_attempts_default,
            },
        );
        let supervisor = Supervisor::new(
            Arc::clone(&pool),
            Arc::clone(&bus),
            executor.assignments(),
            SupervisorConfig {
                tick: config.supervisor_tick,
                heartbeat_timeout: config.heartbeat_timeout,
                cancel_grace: config.cancel_grace,
            },
            Arc::clone(&deps.events),
        );

        let review_policy = deps.review_policy.unwrap_or_else(|| {
            Arc::new(ScoreReviewPolicy {
                threshold: config.review_score_threshold,
            })
        });

        let mut background = Vec::new();
        background.push(bus.start_sweeper());
        background.push(pool.start_listener());
        background.push(executor.start_dispatcher());
        background.push(supervisor.start());
        background.push(start_lead_reviewer(
            Arc::clone(&bus),
            executor.clone(),
            review_policy,
        ));

        Arc::new(Self {
            config,
            registry,
            pool,
            bus,
            executor,
            decomposer,
            metrics,
            events: deps.events,
            authorizer: deps.authorizer,
            background: Mutex::new(background),
        })
    }

    /// Registry admin surface.
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &HaosMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &HaosConfig {
        &self.config
    }

    /// Decompose a request under a principal and start executing it.
    pub async fn submit(
        &self,
        request: &str,
        principal: Principal,
        budgets: Budgets,
    ) -> Result<Uuid, HaosError> {
        let (id, _rx) = self.submit_with_events(request, principal, budgets).await?;
        Ok(id)
    }

    /// `submit` plus an event stream attached before the first dispatch.
    pub async fn submit_with_events(
        &self,
        request: &str,
        principal: Principal,
        budgets: Budgets,
    ) -> Result<(Uuid, WorkflowEventStream), HaosError> {
        if let Err(err) = self.authorizer.authorize_submit(&principal).await {
            self.events
                .append(
                    AuditEvent::new("submit_denied").principal_name(principal.subject.clone()),
                )
                .await;
            return Err(err);
        }
        let snapshot = self.registry.snapshot();
        let workflow = self
            .decomposer
            .decompose(request, principal, budgets, &snapshot)
            .await?;
        self.pool.warm(&self.registry.list()).await;
        self.executor.submit_with_events(workflow).await
    }

    pub fn status(&self, workflow_id: Uuid) -> Result<WorkflowSnapshot, HaosError> {
        self.executor.status(workflow_id)
    }

    pub fn cancel(&self, workflow_id: Uuid, reason: impl Into<String>) -> Result<(), HaosError> {
        self.executor.cancel(workflow_id, reason)
    }

    pub fn subscribe(&self, workflow_id: Uuid) -> Result<WorkflowEventStream, HaosError> {
        self.executor.subscribe(workflow_id)
    }

    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Stop all background loops. In-flight workflows are abandoned.
    pub fn shutdown(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Lead-layer reviewer: consumes escalations, applies the review policy and
/// answers with a verdict or a split.
fn start_lead_reviewer(
    bus: Arc<MessageBus>,
    executor: WorkflowExecutor,
    policy: Arc<dyn ReviewPolicy>,
) -> JoinHandle<()> {
    let rx = bus.subscribe(Address::Layer(WorkerLayer::Lead));
    tokio::spawn(async move {
        loop {
            let msg = rx.recv().await;
            let MessageBody::Escalation { task_ref, .. } = msg.body else {
                continue;
            };
            let Some(pending) = executor.pending_review(task_ref) else {
                tracing::debug!(task_id = %task_ref, "escalation without pending review");
                continue;
            };
            let decision = policy.review(&pending.task, &pending.verdict);
            tracing::info!(
                task_id = %task_ref,
                decision = ?decision,
                "lead review decided"
            );
            let body = match decision {
                ReviewDecision::Approve => MessageBody::QualityVerdict {
                    verdict: QualityVerdict {
                        task_id: task_ref,
                        passes: true,
                        needs_review: false,
                        score: pending.verdict.score,
                        reasons: vec!["approved by lead review".to_string()],
                        rework_hint: None,
                    },
                },
                ReviewDecision::Reject { reasons } => MessageBody::QualityVerdict {
                    verdict: QualityVerdict::reject(task_ref, pending.verdict.score, reasons),
                },
                ReviewDecision::Split { capability } => MessageBody::HelpRequest {
                    task_ref,
                    capability_wanted: capability,
                    urgency: Priority::High,
                },
            };
            let out = Message::new(
                Address::Layer(WorkerLayer::Lead),
                Address::Executor,
                Priority::High,
                Utc::now() + chrono::Duration::seconds(60),
                Uuid::new_v4(),
                body,
            );
            if let Err(err) = bus.publish(out) {
                tracing::error!(task_id = %task_ref, error = %err, "review reply failed");
            }
        }
    })
}
