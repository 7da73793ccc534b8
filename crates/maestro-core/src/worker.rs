use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Real-time status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Available for assignment.
    Idle,
    /// Assigned and preparing a response.
    Thinking,
    /// Actively streaming output.
    Typing,
    /// The last execution failed.
    Error,
    /// The last execution finished successfully.
    Success,
}

/// A logical executor registered in the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Unique identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Role label, e.g. "researcher" or "frontend dev".
    pub role: String,
    /// Skill tags matched against sub-task requirements.
    #[serde(default)]
    pub skills: Vec<String>,
    /// Current status.
    pub status: WorkerStatus,
    /// The sub-task currently being executed, if any.
    pub current_sub_task: Option<Uuid>,
    /// Number of sub-tasks this worker has completed.
    pub completed_tasks: u64,
}

impl Worker {
    /// Create a new idle worker.
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            role: role.into(),
            skills: Vec::new(),
            status: WorkerStatus::Idle,
            current_sub_task: None,
            completed_tasks: 0,
        }
    }

    /// Set the skill tags.
    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.skills = skills;
        self
    }

    /// Whether this worker is available for assignment.
    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    /// Whether this worker matches any of the required skill tags.
    ///
    /// Matching is a case-insensitive substring test against each skill tag
    /// and the role label. An empty requirement list matches every worker.
    pub fn can_handle(&self, required: &[String]) -> bool {
        if required.is_empty() {
            return true;
        }
        let role = self.role.to_lowercase();
        required.iter().any(|req| {
            let req = req.to_lowercase();
            role.contains(&req)
                || self
                    .skills
                    .iter()
                    .any(|skill| skill.to_lowercase().contains(&req))
        })
    }
}
