use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheduling priority of a sub-task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Served before medium and low priority work.
    High,
    /// The default priority.
    #[default]
    Medium,
    /// Served after high and medium priority work.
    Low,
}

impl Priority {
    /// Base score used by the scheduler. Lower scores are served first.
    pub fn base_score(self) -> i32 {
        match self {
            Priority::High => -2,
            Priority::Medium => 0,
            Priority::Low => 2,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Status of a top-level task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted but no sub-task has started yet.
    Pending,
    /// At least one sub-task has started.
    Running,
    /// Every sub-task completed.
    Completed,
    /// At least one sub-task ended in failure, or the task was cancelled.
    Failed,
}

impl TaskStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Status of a single sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    /// Waiting in the queue or blocked on dependencies.
    Pending,
    /// Currently executing on a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error, was skipped, or was cancelled.
    Failed,
}

impl SubTaskStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, SubTaskStatus::Completed | SubTaskStatus::Failed)
    }
}

/// A top-level unit of work submitted by a caller, decomposed into sub-tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: Uuid,
    /// The original high-level description.
    pub description: String,
    /// Current status.
    pub status: TaskStatus,
    /// Overall progress, 0–100, derived from completed sub-tasks.
    pub progress: u8,
    /// Ordered ids of the sub-tasks belonging to this task.
    pub sub_tasks: Vec<Uuid>,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            status: TaskStatus::Pending,
            progress: 0,
            sub_tasks: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// An atomic, independently assignable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    /// Unique identifier.
    pub id: Uuid,
    /// The owning task.
    pub task_id: Uuid,
    /// Short title.
    pub title: String,
    /// Full description handed to the worker.
    pub description: String,
    /// Scheduling priority.
    pub priority: Priority,
    /// Estimated duration in minutes, if the planner provided one.
    pub estimated_minutes: Option<u32>,
    /// Sub-tasks that must be `Completed` before this one is ready.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    /// Skill tags a worker should match.
    #[serde(default)]
    pub required_skills: Vec<String>,
    /// Current status.
    pub status: SubTaskStatus,
    /// The worker currently or last assigned.
    pub assigned_worker: Option<Uuid>,
    /// Final result text, or a human-readable error description on failure.
    pub result: Option<String>,
    /// Error message from the last failed execution.
    pub error: Option<String>,
    /// When execution first started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the sub-task reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// How many times this sub-task has been resubmitted after a failure.
    pub retry_count: u32,
}

impl SubTask {
    /// Create a new pending sub-task under the given task.
    pub fn new(task_id: Uuid, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            title: title.into(),
            description: description.into(),
            priority: Priority::Medium,
            estimated_minutes: None,
            dependencies: Vec::new(),
            required_skills: Vec::new(),
            status: SubTaskStatus::Pending,
            assigned_worker: None,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
            retry_count: 0,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the dependency set.
    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Set the required skill tags.
    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.required_skills = skills;
        self
    }

    /// Set the estimated duration in minutes.
    pub fn with_estimate(mut self, minutes: u32) -> Self {
        self.estimated_minutes = Some(minutes);
        self
    }

    /// Pre-assign a worker; the scheduler honors this when the worker is idle.
    pub fn with_worker(mut self, worker_id: Uuid) -> Self {
        self.assigned_worker = Some(worker_id);
        self
    }

    /// Whether this sub-task is ready to run: pending with every dependency
    /// in the given completed set.
    pub fn is_ready(&self, completed: &[Uuid]) -> bool {
        self.status == SubTaskStatus::Pending
            && self.dependencies.iter().all(|dep| completed.contains(dep))
    }

    /// Wall-clock duration in milliseconds, if both timestamps are set.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// A decomposed plan submitted to the orchestrator.
///
/// Produced by an external planning step; the engine treats decomposition as
/// an opaque input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    /// The original high-level task description.
    pub description: String,
    /// The decomposed sub-tasks, in plan order.
    pub sub_tasks: Vec<SubTaskSpec>,
}

/// One sub-task within a [`TaskPlan`].
///
/// Dependencies refer to sibling positions within the plan; the orchestrator
/// maps them to generated ids on submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTaskSpec {
    /// Short title.
    pub title: String,
    /// Full description handed to the worker.
    pub description: String,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// Estimated duration in minutes.
    #[serde(default)]
    pub estimated_minutes: Option<u32>,
    /// Indices of sibling sub-tasks that must complete first.
    #[serde(default)]
    pub depends_on: Vec<usize>,
    /// Skill tags a worker should match.
    #[serde(default)]
    pub required_skills: Vec<String>,
    /// Optional pre-assigned worker.
    #[serde(default)]
    pub assigned_worker: Option<Uuid>,
}

impl SubTaskSpec {
    /// Create a spec with defaults for everything but title and description.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            priority: Priority::Medium,
            estimated_minutes: None,
            depends_on: Vec::new(),
            required_skills: Vec::new(),
            assigned_worker: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the sibling indices this spec depends on.
    pub fn with_depends_on(mut self, deps: Vec<usize>) -> Self {
        self.depends_on = deps;
        self
    }

    /// Set the required skill tags.
    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.required_skills = skills;
        self
    }
}
