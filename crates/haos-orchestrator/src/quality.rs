//! Quality gate engine: an ordered, configurable chain of checks applied to
//! every task result. Checks are pure functions over `(task, result)`; the
//! chain short-circuits on the first failure.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::types::{ResultDisposition, Task};

/// A worker result as seen by the quality chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub disposition: ResultDisposition,
    pub payload: serde_json::Value,
}

/// Outcome of a single check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CheckOutcome {
    Pass {
        score: f64,
    },
    Fail {
        score: f64,
        reasons: Vec<String>,
        rework_hint: Option<String>,
    },
    Review {
        reasons: Vec<String>,
    },
}

/// One link of the quality chain.
pub trait QualityCheck: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, task: &Task, result: &TaskResult) -> CheckOutcome;
}

/// Aggregated verdict for a task result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub task_id: Uuid,
    pub passes: bool,
    pub needs_review: bool,
    /// Minimum score across evaluated checks, in `0..=1`.
    pub score: f64,
    pub reasons: Vec<String>,
    pub rework_hint: Option<String>,
}

impl QualityVerdict {
    pub fn approve(task_id: Uuid, score: f64) -> Self {
        Self {
            task_id,
            passes: true,
            needs_review: false,
            score,
            reasons: Vec::new(),
            rework_hint: None,
        }
    }

    pub fn reject(task_id: Uuid, score: f64, reasons: Vec<String>) -> Self {
        Self {
            task_id,
            passes: false,
            needs_review: false,
            score,
            reasons,
            rework_hint: None,
        }
    }
}

/// Ordered chain of checks. The engine is ignorant of result content beyond
/// what its checks inspect.
pub struct QualityEngine {
    checks: Vec<Arc<dyn QualityCheck>>,
}

impl QualityEngine {
    /// The built-in chain: correlation, payload shape, size bounds,
    /// content policy.
    pub fn standard() -> Self {
        Self {
            checks: vec![
                Arc::new(CorrelationCheck),
                Arc::new(PayloadShapeCheck),
                Arc::new(SizeBoundsCheck::default()),
                Arc::new(ContentPolicyCheck::default()),
            ],
        }
    }

    pub fn empty() -> Self {
        Self { checks: Vec::new() }
    }

    /// Append a project-registered check to the chain.
    pub fn push(mut self, check: Arc<dyn QualityCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Run the chain. Short-circuits on the first `Fail`; any `Review`
    /// outcome (without a failure before it) yields a review verdict.
    pub fn evaluate(&self, task: &Task, result: &TaskResult) -> QualityVerdict {
        let mut score: f64 = 1.0;
        let mut review_reasons: Vec<String> = Vec::new();

        if result.disposition == ResultDisposition::Failed {
            return QualityVerdict {
                task_id: task.id,
                passes: false,
                needs_review: false,
                score: 0.0,
                reasons: vec!["worker reported failure".to_string()],
                rework_hint: None,
            };
        }

        for check in &self.checks {
            match check.evaluate(task, result) {
                CheckOutcome::Pass { score: s } => score = score.min(s),
                CheckOutcome::Fail {
                    score: s,
                    reasons,
                    rework_hint,
                } => {
                    tracing::debug!(
                        task_id = %task.id,
                        check = %check.name(),
                        reasons = ?reasons,
                        "quality check failed"
                    );
                    return QualityVerdict {
                        task_id: task.id,
                        passes: false,
                        needs_review: false,
                        score: score.min(s),
                        reasons,
                        rework_hint,
                    };
                }
                CheckOutcome::Review { reasons } => review_reasons.extend(reasons),
            }
        }

        let needs_review =
            !review_reasons.is_empty() || result.disposition == ResultDisposition::NeedsReview;
        QualityVerdict {
            task_id: task.id,
            passes: !needs_review,
            needs_review,
            score,
            reasons: review_reasons,
            rework_hint: None,
        }
    }
}

/// The result must reference the task it answers.
struct CorrelationCheck;

impl QualityCheck for CorrelationCheck {
    fn name(&self) -> &str {
        "correlation"
    }

    fn evaluate(&self, task: &Task, result: &TaskResult) -> CheckOutcome {
        if result.task_id == task.id {
            CheckOutcome::Pass { score: 1.0 }
        } else {
            CheckOutcome::Fail {
                score: 0.0,
                reasons: vec![format!(
                    "result references task {} but was routed for {}",
                    result.task_id, task.id
                )],
                rework_hint: None,
            }
        }
    }
}

/// Payload must be a JSON object or string, the declared output shapes.
struct PayloadShapeCheck;

impl QualityCheck for PayloadShapeCheck {
    fn name(&self) -> &str {
        "payload_shape"
    }

    fn evaluate(&self, _task: &Task, result: &TaskResult) -> CheckOutcome {
        match &result.payload {
            serde_json::Value::Object(_) | serde_json::Value::String(_) => {
                CheckOutcome::Pass { score: 1.0 }
            }
            serde_json::Value::Null => CheckOutcome::Fail {
                score: 0.0,
                reasons: vec!["empty result payload".to_string()],
                rework_hint: Some("produce a non-empty result".to_string()),
            },
            other => CheckOutcome::Fail {
                score: 0.2,
                reasons: vec![format!("unexpected payload shape: {other}")],
                rework_hint: None,
            },
        }
    }
}

/// Serialized payload size must stay within bounds.
struct SizeBoundsCheck {
    max_bytes: usize,
}

impl Default for SizeBoundsCheck {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
        }
    }
}

impl QualityCheck for SizeBoundsCheck {
    fn name(&self) -> &str {
        "size_bounds"
    }

    fn evaluate(&self, _task: &Task, result: &TaskResult) -> CheckOutcome {
        let size = result.payload.to_string().len();
        if size <= self.max_bytes {
            CheckOutcome::Pass { score: 1.0 }
        } else {
            CheckOutcome::Fail {
                score: 0.1,
                reasons: vec![format!("payload is {size} bytes, limit {}", self.max_bytes)],
                rework_hint: Some("condense the result".to_string()),
            }
        }
    }
}

/// Flags payloads carrying markers the embedding project disallows.
struct ContentPolicyCheck {
    blocked_markers: Vec<String>,
}

impl Default for ContentPolicyCheck {
    fn default() -> Self {
        Self {
            blocked_markers: vec!["__policy_violation__".to_string()],
        }
    }
}

impl QualityCheck for ContentPolicyCheck {
    fn name(&self) -> &str {
        "content_policy"
    }

    fn evaluate(&self, _task: &Task, result: &TaskResult) -> CheckOutcome {
        let rendered = result.payload.to_string();
        for marker in &self.blocked_markers {
            if rendered.contains(marker.as_str()) {
                return CheckOutcome::Review {
                    reasons: vec![format!("payload carries blocked marker `{marker}`")],
                };
            }
        }
        CheckOutcome::Pass { score: 1.0 }
    }
}

/// What a lead reviewer decided about an escalated task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReviewDecision {
    Approve,
    Reject { reasons: Vec<String> },
    /// Insert a helper subtask with the named capability, then revisit.
    Split { capability: String },
}

/// Policy consulted by the lead layer when a task escalates.
pub trait ReviewPolicy: Send + Sync {
    fn review(&self, task: &Task, verdict: &QualityVerdict) -> ReviewDecision;
}

/// Approves when the verdict score clears a threshold, rejects otherwise.
pub struct ScoreReviewPolicy {
    pub threshold: f64,
}

impl ReviewPolicy for ScoreReviewPolicy {
    fn review(&self, _task: &Task, verdict: &QualityVerdict) -> ReviewDecision {
        if verdict.score >= self.threshold {
            ReviewDecision::Approve
        } else {
            ReviewDecision::Reject {
                reasons: vec![format!(
                    "score {:.2} below review threshold {:.2}",
                    verdict.score, self.threshold
                )],
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Priority, TaskState};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn task() -> Task {
        Task {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            kind: "analyze".to_string(),
            inputs: serde_json::json!({}),
            required_capabilities: BTreeSet::new(),
            depends_on: BTreeSet::new(),
            priority: Priority::Normal,
            attempt: 0,
            max_attempts: 3,
            step_deadline: Duration::from_secs(60),
            state: TaskState::Running,
            required: true,
            estimate: Default::default(),
            on_critical_path: false,
            ready_at: None,
            started_at: None,
            last_error: None,
            output: None,
        }
    }

    fn result_for(task: &Task, payload: serde_json::Value) -> TaskResult {
        TaskResult {
            task_id: task.id,
            disposition: ResultDisposition::Succeeded,
            payload,
        }
    }

    #[test]
    fn clean_result_passes() {
        let engine = QualityEngine::standard();
        let task = task();
        let verdict = engine.evaluate(&task, &result_for(&task, serde_json::json!({"ok": true})));
        assert!(verdict.passes);
        assert!(!verdict.needs_review);
        assert_eq!(verdict.score, 1.0);
    }

    #[test]
    fn mismatched_correlation_fails_first() {
        let engine = QualityEngine::standard();
        let task = task();
        let mut result = result_for(&task, serde_json::json!({"ok": true}));
        result.task_id = Uuid::new_v4();
        let verdict = engine.evaluate(&task, &result);
        assert!(!verdict.passes);
        assert_eq!(verdict.score, 0.0);
    }

    #[test]
    fn null_payload_fails_with_rework_hint() {
        let engine = QualityEngine::standard();
        let task = task();
        let verdict = engine.evaluate(&task, &result_for(&task, serde_json::Value::Null));
        assert!(!verdict.passes);
        assert!(verdict.rework_hint.is_some());
    }

    #[test]
    fn blocked_marker_routes_to_review() {
        let engine = QualityEngine::standard();
        let task = task();
        let verdict = engine.evaluate(
            &task,
            &result_for(&task, serde_json::json!({"text": "__policy_violation__"})),
        );
        assert!(!verdict.passes);
        assert!(verdict.needs_review);
    }

    #[test]
    fn chain_is_deterministic_on_unchanged_result() {
        let engine = QualityEngine::standard();
        let task = task();
        let result = result_for(&task, serde_json::json!({"ok": 1}));
        let first = engine.evaluate(&task, &result);
        let second = engine.evaluate(&task, &result);
        assert_eq!(first.passes, second.passes);
        assert_eq!(first.score, second.score);
        assert_eq!(first.reasons, second.reasons);
    }

    #[test]
    fn worker_reported_failure_rejects_without_checks() {
        let engine = QualityEngine::standard();
        let task = task();
        let mut result = result_for(&task, serde_json::json!({"ok": true}));
        result.disposition = ResultDisposition::Failed;
        let verdict = engine.evaluate(&task, &result);
        assert!(!verdict.passes);
        assert!(!verdict.needs_review);
    }
}
