use chrono::{DateTime, Utc};
use maestro_core::SubTask;
use std::collections::HashMap;
use uuid::Uuid;

/// One queued sub-task awaiting dispatch. Ephemeral and scheduler-owned.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// The owning task.
    pub task_id: Uuid,
    /// The queued sub-task.
    pub sub_task_id: Uuid,
    /// Computed priority score; lower is served first.
    pub score: i32,
    /// Pre-assigned worker honored at dispatch when idle.
    pub assigned_worker: Option<Uuid>,
    /// When the entry was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Monotonic sequence used as a stable tie-break.
    pub seq: u64,
}

/// Stable priority queue of sub-tasks.
///
/// Entries are served lowest score first; ties break by enqueue sequence, so
/// equal-priority work runs in submission order.
pub struct ScheduleQueue {
    entries: Vec<QueueEntry>,
    next_seq: u64,
}

impl ScheduleQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
        }
    }

    /// Enqueue a sub-task with the given score and optional pre-assignment.
    /// Returns the entry's sequence number.
    pub fn push(
        &mut self,
        task_id: Uuid,
        sub_task_id: Uuid,
        score: i32,
        assigned_worker: Option<Uuid>,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(QueueEntry {
            task_id,
            sub_task_id,
            score,
            assigned_worker,
            enqueued_at: Utc::now(),
            seq,
        });
        seq
    }

    /// Put back an entry popped earlier, keeping its original sequence so
    /// its position relative to peers is preserved.
    pub fn restore(&mut self, entry: QueueEntry) {
        self.entries.push(entry);
    }

    /// Pop the lowest-score eligible entry, or `None` when nothing passes
    /// the eligibility test.
    pub fn pop_eligible(&mut self, eligible: impl Fn(&QueueEntry) -> bool) -> Option<QueueEntry> {
        let index = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| eligible(e))
            .min_by_key(|(_, e)| (e.score, e.seq))
            .map(|(i, _)| i)?;
        Some(self.entries.swap_remove(index))
    }

    /// Remove and return every entry belonging to a task.
    pub fn drain_task(&mut self, task_id: Uuid) -> Vec<QueueEntry> {
        let mut removed = Vec::new();
        self.entries.retain(|e| {
            if e.task_id == task_id {
                removed.push(e.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove a single sub-task's entry, if queued.
    pub fn remove(&mut self, sub_task_id: Uuid) -> Option<QueueEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.sub_task_id == sub_task_id)?;
        Some(self.entries.swap_remove(index))
    }

    /// (task, sub-task) id pairs of every queued entry, in no particular order.
    pub fn ids(&self) -> Vec<(Uuid, Uuid)> {
        self.entries
            .iter()
            .map(|e| (e.task_id, e.sub_task_id))
            .collect()
    }

    /// Whether a sub-task is currently queued.
    pub fn contains(&self, sub_task_id: Uuid) -> bool {
        self.entries.iter().any(|e| e.sub_task_id == sub_task_id)
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ScheduleQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a sub-task graph for dependency cycles.
///
/// Returns true if any cycle is found. A plan containing a cycle would stall
/// forever, so submission rejects it up front.
pub fn has_cycle(sub_tasks: &[SubTask]) -> bool {
    let by_id: HashMap<Uuid, &SubTask> = sub_tasks.iter().map(|s| (s.id, s)).collect();
    let mut visited: HashMap<Uuid, u8> = HashMap::new();
    for id in by_id.keys() {
        if dfs_cycle(*id, &by_id, &mut visited) {
            return true;
        }
    }
    false
}

fn dfs_cycle(id: Uuid, by_id: &HashMap<Uuid, &SubTask>, visited: &mut HashMap<Uuid, u8>) -> bool {
    match visited.get(&id) {
        Some(1) => return true,  // back edge = cycle
        Some(2) => return false, // already processed
        _ => {}
    }
    visited.insert(id, 1);
    if let Some(sub) = by_id.get(&id) {
        for dep in &sub.dependencies {
            if dfs_cycle(*dep, by_id, visited) {
                return true;
            }
        }
    }
    visited.insert(id, 2);
    false
}
