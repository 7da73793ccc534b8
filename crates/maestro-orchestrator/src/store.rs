use maestro_core::{SubTask, SubTaskStatus, Task, TaskStatus};
use std::collections::HashMap;
use uuid::Uuid;

/// In-memory store of tasks and their sub-tasks.
///
/// Shared behind a lock by the scheduler (status/assignment writes), the
/// executor (result/timestamp writes), the exception handler (reads), and the
/// aggregator (reads). Nothing is persisted past process lifetime.
pub struct TaskStore {
    tasks: HashMap<Uuid, Task>,
    sub_tasks: HashMap<Uuid, SubTask>,
}

impl TaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            sub_tasks: HashMap::new(),
        }
    }

    /// Insert a task with its sub-tasks. The task's `sub_tasks` ordering is
    /// taken as the canonical plan order.
    pub fn insert(&mut self, mut task: Task, sub_tasks: Vec<SubTask>) {
        task.sub_tasks = sub_tasks.iter().map(|s| s.id).collect();
        for sub in sub_tasks {
            self.sub_tasks.insert(sub.id, sub);
        }
        self.tasks.insert(task.id, task);
    }

    /// Get a task.
    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Get a task mutably.
    pub fn task_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// Get a sub-task.
    pub fn sub_task(&self, id: Uuid) -> Option<&SubTask> {
        self.sub_tasks.get(&id)
    }

    /// Get a sub-task mutably.
    pub fn sub_task_mut(&mut self, id: Uuid) -> Option<&mut SubTask> {
        self.sub_tasks.get_mut(&id)
    }

    /// Sub-tasks of a task, in plan order.
    pub fn sub_tasks_of(&self, task_id: Uuid) -> Vec<&SubTask> {
        let Some(task) = self.tasks.get(&task_id) else {
            return Vec::new();
        };
        task.sub_tasks
            .iter()
            .filter_map(|id| self.sub_tasks.get(id))
            .collect()
    }

    /// Ids of a task's completed sub-tasks.
    pub fn completed_ids(&self, task_id: Uuid) -> Vec<Uuid> {
        self.sub_tasks_of(task_id)
            .into_iter()
            .filter(|s| s.status == SubTaskStatus::Completed)
            .map(|s| s.id)
            .collect()
    }

    /// Whether every sub-task of a task is in a terminal state.
    pub fn all_terminal(&self, task_id: Uuid) -> bool {
        self.sub_tasks_of(task_id)
            .iter()
            .all(|s| s.status.is_terminal())
    }

    /// Recompute and store a task's progress from its completed sub-tasks.
    /// Returns the new value.
    pub fn recompute_progress(&mut self, task_id: Uuid) -> u8 {
        let (completed, total) = {
            let subs = self.sub_tasks_of(task_id);
            let total = subs.len();
            let completed = subs
                .iter()
                .filter(|s| s.status == SubTaskStatus::Completed)
                .count();
            (completed, total)
        };
        let progress = if total == 0 {
            0
        } else {
            ((completed * 100) / total) as u8
        };
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.progress = progress;
        }
        progress
    }

    /// All task ids currently known.
    pub fn task_ids(&self) -> Vec<Uuid> {
        self.tasks.keys().copied().collect()
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}
