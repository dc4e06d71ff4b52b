//! Prometheus metrics for the orchestration core.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};

use crate::types::{TaskState, WorkerLayer, WorkerState};

/// All counters, histograms and gauges emitted by the runtime, registered
/// against a single prometheus registry.
pub struct HaosMetrics {
    pub registry: Registry,

    pub workflows_started: IntCounter,
    pub workflows_finished: IntCounter,
    pub workflows_failed: IntCounter,
    pub tasks_by_state: IntCounterVec,
    pub worker_replacements: IntCounter,
    pub circuit_breaker_opens: IntCounter,
    pub messages_dropped: IntCounterVec,

    pub task_wall: Histogram,
    pub assign_latency: Histogram,
    pub quality_check_latency: Histogram,

    pub workers_by_layer_state: IntGaugeVec,
    pub inflight_tasks: IntGauge,
}

impl HaosMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let workflows_started =
            IntCounter::new("haos_workflows_started", "Workflows submitted").unwrap();
        let workflows_finished = IntCounter::new(
            "haos_workflows_finished",
            "Workflows reaching a terminal state",
        )
        .unwrap();
        let workflows_failed =
            IntCounter::new("haos_workflows_failed", "Workflows that failed").unwrap();
        let tasks_by_state = IntCounterVec::new(
            Opts::new("haos_tasks_by_state", "Task state transitions"),
            &["state"],
        )
        .unwrap();
        let worker_replacements = IntCounter::new(
            "haos_worker_replacements",
            "Workers replaced by the supervisor",
        )
        .unwrap();
        let circuit_breaker_opens = IntCounter::new(
            "haos_circuit_breaker_opens",
            "Circuit breakers opened per kind",
        )
        .unwrap();
        let messages_dropped = IntCounterVec::new(
            Opts::new("haos_messages_dropped", "Bus messages dropped"),
            &["reason"],
        )
        .unwrap();

        let task_wall = Histogram::with_opts(HistogramOpts::new(
            "haos_task_wall_seconds",
            "Wall time of task attempts",
        ))
        .unwrap();
        let assign_latency = Histogram::with_opts(HistogramOpts::new(
            "haos_assign_latency_seconds",
            "Time from ready to assigned",
        ))
        .unwrap();
        let quality_check_latency = Histogram::with_opts(HistogramOpts::new(
            "haos_quality_check_latency_seconds",
            "Quality chain evaluation time",
        ))
        .unwrap();

        let workers_by_layer_state = IntGaugeVec::new(
            Opts::new("haos_workers_by_layer_state", "Live workers"),
            &["layer", "state"],
        )
        .unwrap();
        let inflight_tasks =
            IntGauge::new("haos_inflight_tasks", "Tasks currently assigned or running").unwrap();

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(workflows_started.clone()),
            Box::new(workflows_finished.clone()),
            Box::new(workflows_failed.clone()),
            Box::new(tasks_by_state.clone()),
            Box::new(worker_replacements.clone()),
            Box::new(circuit_breaker_opens.clone()),
            Box::new(messages_dropped.clone()),
            Box::new(task_wall.clone()),
            Box::new(assign_latency.clone()),
            Box::new(quality_check_latency.clone()),
            Box::new(workers_by_layer_state.clone()),
            Box::new(inflight_tasks.clone()),
        ];
        for collector in collectors {
            registry.register(collector).unwrap();
        }

        Self {
            registry,
            workflows_started,
            workflows_finished,
            workflows_failed,
            tasks_by_state,
            worker_replacements,
            circuit_breaker_opens,
            messages_dropped,
            task_wall,
            assign_latency,
            quality_check_latency,
            workers_by_layer_state,
            inflight_tasks,
        }
    }

    pub fn task_transition(&self, state: TaskState) {
        self.tasks_by_state.with_label_values(&[state.as_str()]).inc();
    }

    pub fn message_dropped(&self, reason: &str) {
        self.messages_dropped.with_label_values(&[reason]).inc();
    }

    pub fn worker_gauge(&self, layer: WorkerLayer, state: WorkerState, delta: i64) {
        self.workers_by_layer_state
            .with_label_values(&[layer.as_str(), state.as_str()])
            .add(delta);
    }
}

impl Default for HaosMetrics {
    fn default() -> Self {
        Self::new()
    }
}
