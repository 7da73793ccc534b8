use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classification of a reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    /// A sub-task execution returned an error.
    TaskFailure,
    /// The watchdog aborted a sub-task that exceeded its time budget.
    TaskTimeout,
    /// The worker backend itself failed.
    AgentError,
    /// A sub-task was blocked forever by a failed dependency.
    DependencyFail,
    /// A required resource (e.g. an idle worker) was unavailable.
    ResourceUnavailable,
    /// A submitted plan or request failed validation.
    ValidationError,
    /// Anything that does not fit the other categories.
    Unknown,
}

impl std::fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExceptionKind::TaskFailure => "task_failure",
            ExceptionKind::TaskTimeout => "task_timeout",
            ExceptionKind::AgentError => "agent_error",
            ExceptionKind::DependencyFail => "dependency_fail",
            ExceptionKind::ResourceUnavailable => "resource_unavailable",
            ExceptionKind::ValidationError => "validation_error",
            ExceptionKind::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Severity assigned by the reporting component.
///
/// Ordered so that `Low < Medium < High < Critical`, which the handler uses
/// for threshold comparisons and for sorting pending exceptions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Recoverable without consequence.
    Low,
    /// Default severity for execution failures.
    Medium,
    /// Needs attention; escalated or handed to a human.
    High,
    /// Always requires human intervention.
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle state of an [`ExceptionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionStatus {
    /// Newly created, no decision yet.
    Pending,
    /// Seen by an operator but not yet being worked on.
    Acknowledged,
    /// A remediation strategy is being applied.
    Resolving,
    /// Remediation finished.
    Resolved,
    /// Raised beyond automatic handling.
    Escalated,
}

/// The decision a human operator can return for an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HumanDecision {
    /// Resubmit the sub-task; resets the automatic retry counter.
    Retry,
    /// Mark the sub-task failed and let siblings proceed.
    Skip,
    /// Abort the sub-task permanently.
    Abort,
    /// Resubmit on a different idle worker.
    Reassign,
}

impl std::fmt::Display for HumanDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HumanDecision::Retry => "retry",
            HumanDecision::Skip => "skip",
            HumanDecision::Abort => "abort",
            HumanDecision::Reassign => "reassign",
        };
        write!(f, "{name}")
    }
}

/// How an exception was ultimately resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    /// The strategy applied, e.g. "auto_retry" or "reassign".
    pub action: String,
    /// Who resolved it: "auto" or an operator name.
    pub resolved_by: String,
    /// Free-form notes.
    pub notes: Option<String>,
    /// When the resolution was recorded.
    pub resolved_at: DateTime<Utc>,
}

/// An open request for a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionTicket {
    /// When intervention was requested.
    pub requested_at: DateTime<Utc>,
    /// The operator decision, once provided.
    pub decision: Option<HumanDecision>,
    /// Who responded.
    pub responded_by: Option<String>,
    /// Operator notes attached to the response.
    pub notes: Option<String>,
    /// When the response arrived.
    pub responded_at: Option<DateTime<Utc>>,
}

impl InterventionTicket {
    /// Open a new ticket with no decision yet.
    pub fn open() -> Self {
        Self {
            requested_at: Utc::now(),
            decision: None,
            responded_by: None,
            notes: None,
            responded_at: None,
        }
    }
}

/// A recorded failure and its handling lifecycle.
///
/// Records are append-only: they are never deleted, so the full history
/// remains queryable as an audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Failure classification.
    pub kind: ExceptionKind,
    /// Severity assigned by the reporter.
    pub severity: Severity,
    /// The owning task.
    pub task_id: Uuid,
    /// The sub-task that failed.
    pub sub_task_id: Uuid,
    /// The worker involved, if any.
    pub worker_id: Option<Uuid>,
    /// Human-readable failure message.
    pub message: String,
    /// Lifecycle state.
    pub status: ExceptionStatus,
    /// Set when the record is resolved.
    pub resolution: Option<Resolution>,
    /// Present when human intervention was requested.
    pub intervention: Option<InterventionTicket>,
    /// When the exception occurred.
    pub created_at: DateTime<Utc>,
}

impl ExceptionRecord {
    /// Create a new pending record.
    pub fn new(
        kind: ExceptionKind,
        severity: Severity,
        task_id: Uuid,
        sub_task_id: Uuid,
        worker_id: Option<Uuid>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            task_id,
            sub_task_id,
            worker_id,
            message: message.into(),
            status: ExceptionStatus::Pending,
            resolution: None,
            intervention: None,
            created_at: Utc::now(),
        }
    }

    /// Whether this record is still waiting for a human decision.
    pub fn awaiting_human(&self) -> bool {
        self.intervention
            .as_ref()
            .is_some_and(|t| t.decision.is_none())
            && !matches!(self.status, ExceptionStatus::Resolved)
    }
}
