//! End-to-end orchestration scenarios driven through the public facade.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use haos_orchestrator::{
    Address, BackoffConfig, BreakerConfig, Budgets, DagSketch, HaosConfig, HaosError,
    KindPolicies, KindRecord, KindSpec, MemoryEventSink, Message, MessageBody, Orchestrator,
    OrchestratorDeps, Principal, Priority, ResultDisposition, RoleAuthorizer, RuntimeFactory,
    ScriptedProvider, SketchNode, Task, TaskExecution, TaskRuntime, TaskState, Workflow,
    WorkflowEvent, WorkflowEventStream, WorkflowStatus,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

type ExecFn = Arc<dyn Fn(Task) -> BoxFuture<'static, TaskExecution> + Send + Sync>;

struct FnRuntime {
    exec: ExecFn,
    responsive: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl TaskRuntime for FnRuntime {
    async fn execute(&self, task: &Task) -> TaskExecution {
        (self.exec)(task.clone()).await
    }

    fn responsive(&self) -> bool {
        self.responsive.load(Ordering::SeqCst)
    }
}

fn runtime<F>(f: F) -> Arc<dyn TaskRuntime>
where
    F: Fn(Task) -> BoxFuture<'static, TaskExecution> + Send + Sync + 'static,
{
    Arc::new(FnRuntime {
        exec: Arc::new(f),
        responsive: Arc::new(AtomicBool::new(true)),
    })
}

/// A worker whose runtime hangs and never heartbeats.
fn dead_runtime() -> Arc<dyn TaskRuntime> {
    Arc::new(FnRuntime {
        exec: Arc::new(|_task| futures::future::pending::<TaskExecution>().boxed()),
        responsive: Arc::new(AtomicBool::new(false)),
    })
}

type Builder = Box<dyn Fn() -> Arc<dyn TaskRuntime> + Send + Sync>;

/// Factory mapping registry kinds to scripted runtimes; unmapped kinds echo
/// their kind tag.
#[derive(Default)]
struct TestFactory {
    builders: Mutex<HashMap<String, Builder>>,
}

impl TestFactory {
    fn on<F>(&self, kind: &str, builder: F)
    where
        F: Fn() -> Arc<dyn TaskRuntime> + Send + Sync + 'static,
    {
        self.builders
            .lock()
            .unwrap()
            .insert(kind.to_string(), Box::new(builder));
    }
}

impl RuntimeFactory for TestFactory {
    fn build(&self, kind: &KindRecord) -> Arc<dyn TaskRuntime> {
        if let Some(builder) = self.builders.lock().unwrap().get(&kind.kind) {
            return builder();
        }
        let tag = kind.kind.clone();
        runtime(move |_task| {
            let tag = tag.clone();
            async move { TaskExecution::succeeded(json!({ "ok": tag })) }.boxed()
        })
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    provider: Arc<ScriptedProvider>,
    factory: Arc<TestFactory>,
    events: Arc<MemoryEventSink>,
}

fn harness(config: HaosConfig) -> Harness {
    let provider = Arc::new(ScriptedProvider::new());
    let factory = Arc::new(TestFactory::default());
    let events = Arc::new(MemoryEventSink::new());
    let deps = OrchestratorDeps::new(provider.clone(), factory.clone())
        .with_events(events.clone());
    let orchestrator = Orchestrator::new(config, deps);
    Harness {
        orchestrator,
        provider,
        factory,
        events,
    }
}

fn fast_config() -> HaosConfig {
    HaosConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(400),
        supervisor_tick: Duration::from_millis(50),
        cancel_grace: Duration::from_millis(300),
        acquire_wait: Duration::from_millis(500),
        assignment_backoff: BackoffConfig {
            initial: Duration::from_millis(20),
            multiplier: 2.0,
            max: Duration::from_millis(200),
        },
        ..HaosConfig::default()
    }
}

/// Sketch node whose display tag is its name, for id mapping in asserts.
fn node(name: &str, capability: &str) -> SketchNode {
    let mut n = SketchNode::new(name, capability);
    n.kind = name.to_string();
    n
}

async fn drain(stream: &mut WorkflowEventStream) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(20), stream.next())
            .await
            .expect("event stream stalled")
            .expect("stream ended without a terminal event");
        let done = matches!(event, WorkflowEvent::Finished { .. });
        events.push(event);
        if done {
            return events;
        }
    }
}

fn ids_by_tag(wf: &Workflow) -> HashMap<String, Uuid> {
    wf.tasks
        .values()
        .map(|t| (t.kind.clone(), t.id))
        .collect()
}

fn state_index(events: &[WorkflowEvent], task: Uuid, state: TaskState) -> usize {
    events
        .iter()
        .position(|e| {
            matches!(
                e,
                WorkflowEvent::TaskStateChanged { task_id, state: s, .. }
                    if *task_id == task && *s == state
            )
        })
        .unwrap_or_else(|| panic!("no {state:?} event for task {task}"))
}

fn finished_status(events: &[WorkflowEvent]) -> WorkflowStatus {
    match events.last() {
        Some(WorkflowEvent::Finished { status, .. }) => *status,
        other => panic!("expected terminal event, got {other:?}"),
    }
}

#[tokio::test]
async fn linear_workflow_runs_to_success_in_order() {
    let h = harness(fast_config());
    for k in ["k1", "k2", "k3"] {
        h.orchestrator.registry().register(KindSpec::exact(k, &[k]));
    }
    h.provider.script(
        "linear",
        DagSketch {
            nodes: vec![
                node("t1", "k1"),
                node("t2", "k2").after(&["t1"]),
                node("t3", "k3").after(&["t2"]),
            ],
        },
    );

    let (id, mut stream) = h
        .orchestrator
        .submit_with_events("linear", Principal::new("alice"), Budgets::default())
        .await
        .unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(finished_status(&events), WorkflowStatus::Succeeded);

    let wf = h.orchestrator.executor().handle(id).unwrap().workflow();
    let ids = ids_by_tag(&wf);
    let order = [
        state_index(&events, ids["t1"], TaskState::Assigned),
        state_index(&events, ids["t1"], TaskState::Succeeded),
        state_index(&events, ids["t2"], TaskState::Assigned),
        state_index(&events, ids["t2"], TaskState::Succeeded),
        state_index(&events, ids["t3"], TaskState::Assigned),
        state_index(&events, ids["t3"], TaskState::Succeeded),
    ];
    assert!(order.windows(2).all(|w| w[0] < w[1]), "events out of order: {order:?}");

    let terminal_count = events
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::Finished { .. }))
        .count();
    assert_eq!(terminal_count, 1);
    assert_eq!(
        h.orchestrator.status(id).unwrap().status,
        WorkflowStatus::Succeeded
    );
}

#[tokio::test]
async fn fan_out_runs_in_parallel_and_joins() {
    let h = harness(fast_config());
    h.orchestrator.registry().register(KindSpec::exact("fan", &["fan"]));
    h.factory.on("fan", || {
        runtime(|_task| {
            async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                TaskExecution::succeeded(json!({"ok": true}))
            }
            .boxed()
        })
    });
    h.provider.script(
        "fanout",
        DagSketch {
            nodes: vec![
                node("t0", "fan"),
                node("t1", "fan").after(&["t0"]),
                node("t2", "fan").after(&["t0"]),
                node("t3", "fan").after(&["t0"]),
                node("t4", "fan").after(&["t1", "t2", "t3"]),
            ],
        },
    );

    let (id, mut stream) = h
        .orchestrator
        .submit_with_events("fanout", Principal::new("alice"), Budgets::default())
        .await
        .unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(finished_status(&events), WorkflowStatus::Succeeded);

    let wf = h.orchestrator.executor().handle(id).unwrap().workflow();
    let ids = ids_by_tag(&wf);
    let branches = ["t1", "t2", "t3"];
    let last_assigned = branches
        .iter()
        .map(|t| state_index(&events, ids[*t], TaskState::Assigned))
        .max()
        .unwrap();
    let first_succeeded = branches
        .iter()
        .map(|t| state_index(&events, ids[*t], TaskState::Succeeded))
        .min()
        .unwrap();
    assert!(
        last_assigned < first_succeeded,
        "fan-out branches did not run concurrently"
    );
    let join_assigned = state_index(&events, ids["t4"], TaskState::Assigned);
    for t in branches {
        assert!(state_index(&events, ids[t], TaskState::Succeeded) < join_assigned);
    }
}

#[tokio::test]
async fn dead_worker_is_replaced_and_task_reassigned() {
    let h = harness(fast_config());
    h.orchestrator
        .registry()
        .register(KindSpec::exact("mortal", &["mortal"]));
    let built = Arc::new(AtomicUsize::new(0));
    {
        let built = built.clone();
        h.factory.on("mortal", move || {
            if built.fetch_add(1, Ordering::SeqCst) == 0 {
                dead_runtime()
            } else {
                runtime(|_task| {
                    async { TaskExecution::succeeded(json!({"ok": true})) }.boxed()
                })
            }
        });
    }
    h.provider.script(
        "mortal-req",
        DagSketch {
            nodes: vec![node("t1", "mortal")],
        },
    );

    let (id, mut stream) = h
        .orchestrator
        .submit_with_events("mortal-req", Principal::new("alice"), Budgets::default())
        .await
        .unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(finished_status(&events), WorkflowStatus::Succeeded);

    let snapshot = h.orchestrator.status(id).unwrap();
    assert_eq!(snapshot.tasks.len(), 1);
    assert_eq!(
        snapshot.tasks[0].attempts, 0,
        "liveness reassignment must not count as a retry"
    );
    assert_eq!(h.events.count_of("heartbeat_lost"), 1);
    assert_eq!(h.events.count_of("worker_replaced"), 1);
    assert!(built.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn quality_rework_retries_then_succeeds() {
    let h = harness(fast_config());
    h.orchestrator
        .registry()
        .register(KindSpec::exact("flaky", &["flaky"]));
    h.factory.on("flaky", || {
        runtime(|task| {
            async move {
                if task.attempt == 0 {
                    // Null payload trips the shape check and earns a rework hint.
                    TaskExecution::succeeded(serde_json::Value::Null)
                } else if task.inputs.get("rework_hint").is_some() {
                    TaskExecution::succeeded(json!({"ok": true}))
                } else {
                    TaskExecution::failed(json!({"err": "rework hint missing"}))
                }
            }
            .boxed()
        })
    });
    h.provider.script(
        "rework",
        DagSketch {
            nodes: vec![node("t1", "flaky").with_max_attempts(2)],
        },
    );

    let (id, mut stream) = h
        .orchestrator
        .submit_with_events("rework", Principal::new("alice"), Budgets::default())
        .await
        .unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(finished_status(&events), WorkflowStatus::Succeeded);

    let snapshot = h.orchestrator.status(id).unwrap();
    assert_eq!(snapshot.tasks[0].attempts, 1);

    let verdicts: Vec<bool> = events
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::QualityVerdict { passes, .. } => Some(*passes),
            _ => None,
        })
        .collect();
    assert_eq!(verdicts, vec![false, true]);
}

#[tokio::test]
async fn help_request_spawns_helper_and_resumes_requester() {
    let h = harness(fast_config());
    h.orchestrator
        .registry()
        .register(KindSpec::exact("builder", &["build"]));
    h.orchestrator
        .registry()
        .register(KindSpec::exact("research", &["research"]));
    let bus = h.orchestrator.bus().clone();
    h.factory.on("builder", move || {
        let bus = bus.clone();
        runtime(move |task| {
            let bus = bus.clone();
            async move {
                let has_helper_output = task
                    .inputs
                    .as_object()
                    .map(|m| m.keys().any(|k| k.starts_with("helper:")))
                    .unwrap_or(false);
                if has_helper_output {
                    return TaskExecution::succeeded(json!({"built": true}));
                }
                let help = Message::new(
                    Address::Worker(Uuid::nil()),
                    Address::Executor,
                    Priority::High,
                    Utc::now() + chrono::Duration::seconds(30),
                    Uuid::new_v4(),
                    MessageBody::HelpRequest {
                        task_ref: task.id,
                        capability_wanted: "research".to_string(),
                        urgency: Priority::High,
                    },
                );
                bus.publish(help).unwrap();
                // Parked until the executor cancels this attempt.
                futures::future::pending::<TaskExecution>().await
            }
            .boxed()
        })
    });
    h.provider.script(
        "needs-help",
        DagSketch {
            nodes: vec![node("t2", "build")],
        },
    );

    let (id, mut stream) = h
        .orchestrator
        .submit_with_events("needs-help", Principal::new("alice"), Budgets::default())
        .await
        .unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(finished_status(&events), WorkflowStatus::Succeeded);

    let helper_spawned = events.iter().any(|e| {
        matches!(e, WorkflowEvent::HelperSpawned { .. })
    });
    assert!(helper_spawned);

    let wf = h.orchestrator.executor().handle(id).unwrap().workflow();
    assert_eq!(wf.tasks.len(), 2, "helper task was inserted into the DAG");
    assert!(wf
        .tasks
        .values()
        .all(|t| t.state == TaskState::Succeeded));

    let requester = wf.tasks.values().find(|t| t.kind == "t2").unwrap();
    let parked = state_index(&events, requester.id, TaskState::NeedsReview);
    let resumed = state_index(&events, requester.id, TaskState::Succeeded);
    assert!(parked < resumed);
    assert!(requester
        .inputs
        .as_object()
        .unwrap()
        .keys()
        .any(|k| k.starts_with("helper:")));
}

#[tokio::test]
async fn failed_helper_resumes_requester_without_output() {
    let h = harness(fast_config());
    h.orchestrator
        .registry()
        .register(KindSpec::exact("builder", &["build"]));
    h.orchestrator
        .registry()
        .register(KindSpec::exact("research", &["research"]));
    h.factory.on("research", || {
        runtime(|_task| async { TaskExecution::failed(json!({"err": "no sources"})) }.boxed())
    });
    let asked = Arc::new(AtomicBool::new(false));
    let bus = h.orchestrator.bus().clone();
    {
        let asked = asked.clone();
        h.factory.on("builder", move || {
            let bus = bus.clone();
            let asked = asked.clone();
            runtime(move |task| {
                let bus = bus.clone();
                let asked = asked.clone();
                async move {
                    if asked.swap(true, Ordering::SeqCst) {
                        // Resumed after the helper failed: finish unaided.
                        return TaskExecution::succeeded(json!({"built": "solo"}));
                    }
                    let help = Message::new(
                        Address::Worker(Uuid::nil()),
                        Address::Executor,
                        Priority::High,
                        Utc::now() + chrono::Duration::seconds(30),
                        Uuid::new_v4(),
                        MessageBody::HelpRequest {
                            task_ref: task.id,
                            capability_wanted: "research".to_string(),
                            urgency: Priority::High,
                        },
                    );
                    bus.publish(help).unwrap();
                    futures::future::pending::<TaskExecution>().await
                }
                .boxed()
            })
        });
    }
    h.provider.script(
        "help-fails",
        DagSketch {
            nodes: vec![node("t2", "build")],
        },
    );

    let (id, mut stream) = h
        .orchestrator
        .submit_with_events("help-fails", Principal::new("alice"), Budgets::default())
        .await
        .unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(finished_status(&events), WorkflowStatus::Succeeded);

    let wf = h.orchestrator.executor().handle(id).unwrap().workflow();
    let requester = wf.tasks.values().find(|t| t.kind == "t2").unwrap();
    let helper = wf.tasks.values().find(|t| t.kind == "research").unwrap();
    assert_eq!(helper.state, TaskState::Failed);
    assert_eq!(requester.state, TaskState::Succeeded);
    assert!(
        !requester
            .inputs
            .as_object()
            .unwrap()
            .keys()
            .any(|k| k.starts_with("helper:")),
        "requester must resume without the failed helper's output"
    );

    let needs_review = h
        .orchestrator
        .metrics()
        .tasks_by_state
        .get_metric_with_label_values(&["needs_review"])
        .unwrap()
        .get();
    assert!(needs_review >= 1);
}

#[tokio::test]
async fn circuit_breaker_opens_falls_back_then_probes() {
    let mut config = fast_config();
    config.circuit_breaker = BreakerConfig {
        window: Duration::from_secs(60),
        threshold: 3,
        cooldown: Duration::from_millis(400),
    };
    let h = harness(config);
    // kx carries an extra capability so it outranks ky for {x}.
    h.orchestrator
        .registry()
        .register(KindSpec::exact("kx", &["x", "x-extra"]));
    h.orchestrator.registry().register(KindSpec::exact("ky", &["x"]));

    let kx_fail = Arc::new(AtomicBool::new(true));
    let kx_calls = Arc::new(AtomicUsize::new(0));
    {
        let fail = kx_fail.clone();
        let calls = kx_calls.clone();
        h.factory.on("kx", move || {
            let fail = fail.clone();
            let calls = calls.clone();
            runtime(move |_task| {
                let fail = fail.clone();
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if fail.load(Ordering::SeqCst) {
                        TaskExecution::failed(json!({"err": "boom"}))
                    } else {
                        TaskExecution::succeeded(json!({"ok": true}))
                    }
                }
                .boxed()
            })
        });
    }

    for i in 0..3 {
        let request = format!("cb-{i}");
        h.provider.script(
            request.as_str(),
            DagSketch {
                nodes: vec![node("t1", "x").with_max_attempts(1)],
            },
        );
        let (_, mut stream) = h
            .orchestrator
            .submit_with_events(&request, Principal::new("alice"), Budgets::default())
            .await
            .unwrap();
        let events = drain(&mut stream).await;
        assert_eq!(finished_status(&events), WorkflowStatus::Failed);
    }
    assert_eq!(h.events.count_of("circuit_opened"), 1);
    let calls_after_open = kx_calls.load(Ordering::SeqCst);
    assert_eq!(calls_after_open, 3);

    // Open circuit: the next task falls back to ky and succeeds.
    h.provider.script(
        "cb-fallback",
        DagSketch {
            nodes: vec![node("t1", "x")],
        },
    );
    let (_, mut stream) = h
        .orchestrator
        .submit_with_events("cb-fallback", Principal::new("alice"), Budgets::default())
        .await
        .unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(finished_status(&events), WorkflowStatus::Succeeded);
    assert_eq!(
        kx_calls.load(Ordering::SeqCst),
        calls_after_open,
        "open circuit must block kx assignments"
    );

    // After cooldown the circuit half-opens and a probe reaches kx again.
    kx_fail.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(600)).await;
    h.provider.script(
        "cb-probe",
        DagSketch {
            nodes: vec![node("t1", "x")],
        },
    );
    let (_, mut stream) = h
        .orchestrator
        .submit_with_events("cb-probe", Principal::new("alice"), Budgets::default())
        .await
        .unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(finished_status(&events), WorkflowStatus::Succeeded);
    assert_eq!(kx_calls.load(Ordering::SeqCst), calls_after_open + 1);
}

#[tokio::test]
async fn cancellation_terminates_with_single_terminal_event() {
    let h = harness(fast_config());
    h.orchestrator
        .registry()
        .register(KindSpec::exact("slow", &["slow"]));
    h.factory.on("slow", || {
        runtime(|_task| {
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                TaskExecution::succeeded(json!({"ok": true}))
            }
            .boxed()
        })
    });
    h.provider.script(
        "long",
        DagSketch {
            nodes: vec![node("t1", "slow"), node("t2", "slow")],
        },
    );

    let (id, mut stream) = h
        .orchestrator
        .submit_with_events("long", Principal::new("alice"), Budgets::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.orchestrator.cancel(id, "operator request").unwrap();

    let events = drain(&mut stream).await;
    assert_eq!(finished_status(&events), WorkflowStatus::Cancelled);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::Finished { .. }))
            .count(),
        1
    );
    assert_eq!(
        h.orchestrator.status(id).unwrap().status,
        WorkflowStatus::Cancelled
    );

    // Workers observed the cancel and report nothing in flight.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for info in h.orchestrator.pool().worker_infos() {
        assert!(info.in_flight.is_empty(), "worker still runs a cancelled task");
    }

    // Cancellation is idempotent.
    h.orchestrator.cancel(id, "again").unwrap();
}

#[tokio::test]
async fn duplicate_result_is_idempotent() {
    let h = harness(fast_config());
    h.orchestrator
        .registry()
        .register(KindSpec::exact("slowish", &["slowish"]));
    h.factory.on("slowish", || {
        runtime(|_task| {
            async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                TaskExecution::succeeded(json!({"real": true}))
            }
            .boxed()
        })
    });
    h.provider.script(
        "dup",
        DagSketch {
            nodes: vec![node("t1", "slowish")],
        },
    );

    let (id, mut stream) = h
        .orchestrator
        .submit_with_events("dup", Principal::new("alice"), Budgets::default())
        .await
        .unwrap();

    // Wait for the assignment to land, then forge an early result.
    let ledger = h.orchestrator.executor().assignments();
    let (task_id, record) = loop {
        if let Some(entry) = ledger.for_workflow(id).into_iter().next() {
            break entry;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    let forged = Message::new(
        Address::Worker(record.worker_id),
        Address::Executor,
        Priority::Normal,
        Utc::now() + chrono::Duration::seconds(30),
        record.correlation_id,
        MessageBody::Result {
            task_id,
            disposition: ResultDisposition::Succeeded,
            payload: json!({"forged": true}),
            wall: Duration::from_millis(1),
        },
    );
    h.orchestrator.bus().publish(forged).unwrap();

    let events = drain(&mut stream).await;
    assert_eq!(finished_status(&events), WorkflowStatus::Succeeded);

    // The real worker result replays the same correlation id and is ignored.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let snapshot = h.orchestrator.status(id).unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Succeeded);
    assert_eq!(snapshot.tasks[0].attempts, 0);
    let verdicts = events
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::QualityVerdict { .. }))
        .count();
    assert_eq!(verdicts, 1);
}

#[tokio::test]
async fn unauthorized_principal_is_rejected_before_decomposition() {
    let provider = Arc::new(ScriptedProvider::new());
    let factory = Arc::new(TestFactory::default());
    let events = Arc::new(MemoryEventSink::new());
    let deps = OrchestratorDeps::new(provider.clone(), factory)
        .with_events(events.clone())
        .with_authorizer(Arc::new(RoleAuthorizer::default()));
    let orchestrator = Orchestrator::new(fast_config(), deps);
    orchestrator.registry().register(KindSpec::exact("k", &["k"]));
    provider.script(
        "req",
        DagSketch {
            nodes: vec![node("t1", "k")],
        },
    );

    let err = orchestrator
        .submit("req", Principal::new("mallory"), Budgets::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HaosError::UnauthorizedPrincipal { .. }));
    assert!(!err.report(None, None).retriable);
    assert_eq!(events.count_of("submit_denied"), 1);

    let allowed = Principal::with_roles("alice", vec!["submitter".to_string()]);
    let id = orchestrator
        .submit("req", allowed, Budgets::default())
        .await
        .unwrap();
    assert!(orchestrator.status(id).is_ok());
}

#[tokio::test]
async fn empty_plan_is_rejected() {
    let h = harness(fast_config());
    h.provider.script("empty", DagSketch::default());
    let err = h
        .orchestrator
        .submit("empty", Principal::new("alice"), Budgets::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HaosError::InvalidDecomposition(_)));
}

#[tokio::test]
async fn step_timeout_reassigns_without_burning_attempt() {
    let mut config = fast_config();
    config.step_deadline_default = Duration::from_millis(300);
    let h = harness(config);
    h.orchestrator
        .registry()
        .register(KindSpec::exact("sluggish", &["sluggish"]));
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        h.factory.on("sluggish", move || {
            let calls = calls.clone();
            runtime(move |_task| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        // First attempt overruns its step deadline.
                        futures::future::pending::<TaskExecution>().await
                    } else {
                        TaskExecution::succeeded(json!({"ok": true}))
                    }
                }
                .boxed()
            })
        });
    }
    h.provider.script(
        "stuck-once",
        DagSketch {
            nodes: vec![node("t1", "sluggish")],
        },
    );

    let (id, mut stream) = h
        .orchestrator
        .submit_with_events("stuck-once", Principal::new("alice"), Budgets::default())
        .await
        .unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(finished_status(&events), WorkflowStatus::Succeeded);

    let snapshot = h.orchestrator.status(id).unwrap();
    assert_eq!(snapshot.tasks[0].attempts, 0);
    assert!(h.events.count_of("step_timeout") >= 1);
    assert!(h.events.count_of("task_reassigned") >= 1);
    assert_eq!(h.events.count_of("worker_replaced"), 0);
}

#[tokio::test]
async fn optional_failure_allows_partial_success() {
    let h = harness(fast_config());
    h.orchestrator.registry().register(KindSpec::exact("good", &["good"]));
    h.orchestrator.registry().register(KindSpec::exact("bad", &["bad"]));
    h.factory.on("bad", || {
        runtime(|_task| async { TaskExecution::failed(json!({"err": "nope"})) }.boxed())
    });
    h.provider.script(
        "partial",
        DagSketch {
            nodes: vec![
                node("keep", "good"),
                node("lose", "bad").optional().with_max_attempts(1),
            ],
        },
    );

    let (id, mut stream) = h
        .orchestrator
        .submit_with_events("partial", Principal::new("alice"), Budgets::default())
        .await
        .unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(finished_status(&events), WorkflowStatus::Succeeded);

    let wf = h.orchestrator.executor().handle(id).unwrap().workflow();
    assert!(!wf.failed_tasks.is_empty());
    let by_tag = ids_by_tag(&wf);
    assert_eq!(wf.tasks[&by_tag["keep"]].state, TaskState::Succeeded);
    assert_eq!(wf.tasks[&by_tag["lose"]].state, TaskState::Failed);
}

#[tokio::test]
async fn required_failure_cancels_descendants_and_fails_workflow() {
    let h = harness(fast_config());
    h.orchestrator.registry().register(KindSpec::exact("bad", &["bad"]));
    h.orchestrator.registry().register(KindSpec::exact("good", &["good"]));
    h.factory.on("bad", || {
        runtime(|_task| async { TaskExecution::failed(json!({"err": "nope"})) }.boxed())
    });
    h.provider.script(
        "doomed",
        DagSketch {
            nodes: vec![
                node("root", "bad").with_max_attempts(1),
                node("child", "good").after(&["root"]),
            ],
        },
    );

    let (id, mut stream) = h
        .orchestrator
        .submit_with_events("doomed", Principal::new("alice"), Budgets::default())
        .await
        .unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(finished_status(&events), WorkflowStatus::Failed);

    let wf = h.orchestrator.executor().handle(id).unwrap().workflow();
    let by_tag = ids_by_tag(&wf);
    assert_eq!(wf.tasks[&by_tag["root"]].state, TaskState::Failed);
    assert_eq!(wf.tasks[&by_tag["child"]].state, TaskState::Cancelled);
}

#[tokio::test]
async fn approval_required_kind_routes_through_lead() {
    let h = harness(fast_config());
    let policies = KindPolicies {
        approval_required: true,
        ..Default::default()
    };
    h.orchestrator.registry().register(
        KindSpec::exact("sensitive", &["sensitive"]).with_policies(policies),
    );
    h.provider.script(
        "gated",
        DagSketch {
            nodes: vec![node("t1", "sensitive")],
        },
    );

    let (id, mut stream) = h
        .orchestrator
        .submit_with_events("gated", Principal::new("alice"), Budgets::default())
        .await
        .unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(finished_status(&events), WorkflowStatus::Succeeded);
    assert!(events
        .iter()
        .any(|e| matches!(e, WorkflowEvent::Escalated { .. })));
    assert!(h.events.count_of("task_escalated") >= 1);
    assert_eq!(
        h.orchestrator.status(id).unwrap().tasks[0].state,
        TaskState::Succeeded
    );
}

#[tokio::test]
async fn review_escalation_is_approved_by_lead_layer() {
    let h = harness(fast_config());
    h.orchestrator
        .registry()
        .register(KindSpec::exact("writer", &["write"]));
    h.factory.on("writer", || {
        runtime(|_task| {
            async {
                // The blocked marker routes the result into review.
                TaskExecution::succeeded(json!({"text": "__policy_violation__"}))
            }
            .boxed()
        })
    });
    h.provider.script(
        "needs-review",
        DagSketch {
            nodes: vec![node("t1", "write")],
        },
    );

    let (id, mut stream) = h
        .orchestrator
        .submit_with_events("needs-review", Principal::new("alice"), Budgets::default())
        .await
        .unwrap();
    let events = drain(&mut stream).await;
    assert_eq!(finished_status(&events), WorkflowStatus::Succeeded);

    assert!(events
        .iter()
        .any(|e| matches!(e, WorkflowEvent::Escalated { .. })));
    assert!(h.events.count_of("task_escalated") >= 1);
    let snapshot = h.orchestrator.status(id).unwrap();
    assert_eq!(snapshot.tasks[0].state, TaskState::Succeeded);
}
