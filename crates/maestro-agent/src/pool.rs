use crate::backend::WorkerBackend;
use maestro_core::{Worker, WorkerStatus};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

struct Entry {
    worker: Worker,
    backend: Arc<dyn WorkerBackend>,
}

/// Registry of logical workers.
///
/// Tracks identity, skill tags, and availability. Claiming is compare-and-set
/// on the worker's status inside the write lock, so two dispatch iterations
/// can never claim the same worker.
pub struct WorkerPool {
    workers: RwLock<Vec<Entry>>,
}

impl WorkerPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(Vec::new()),
        }
    }

    /// Register a worker with its backend. Returns the worker's id.
    pub async fn register(&self, worker: Worker, backend: Arc<dyn WorkerBackend>) -> Uuid {
        let id = worker.id;
        info!(worker_id = %id, name = %worker.name, role = %worker.role, "Registering worker");
        self.workers.write().await.push(Entry { worker, backend });
        id
    }

    /// Snapshot of a single worker.
    pub async fn get(&self, id: Uuid) -> Option<Worker> {
        let workers = self.workers.read().await;
        workers
            .iter()
            .find(|e| e.worker.id == id)
            .map(|e| e.worker.clone())
    }

    /// The backend registered for a worker.
    pub async fn backend(&self, id: Uuid) -> Option<Arc<dyn WorkerBackend>> {
        let workers = self.workers.read().await;
        workers
            .iter()
            .find(|e| e.worker.id == id)
            .map(|e| Arc::clone(&e.backend))
    }

    /// Claim a specific worker for a sub-task.
    ///
    /// Succeeds only if the worker exists and is idle; flips it to
    /// [`WorkerStatus::Thinking`] atomically under the write lock.
    pub async fn claim(&self, id: Uuid, sub_task_id: Uuid) -> bool {
        let mut workers = self.workers.write().await;
        let Some(entry) = workers.iter_mut().find(|e| e.worker.id == id) else {
            return false;
        };
        if !entry.worker.is_idle() {
            return false;
        }
        entry.worker.status = WorkerStatus::Thinking;
        entry.worker.current_sub_task = Some(sub_task_id);
        debug!(worker_id = %id, sub_task_id = %sub_task_id, "Worker claimed");
        true
    }

    /// Select and claim an idle worker for a sub-task.
    ///
    /// Prefers a worker whose skill tags intersect `required` (case-insensitive
    /// substring against tags or role label). When no skills match, falls back
    /// to the idle worker with the most completed tasks, keeping idle
    /// specialists free for better matches.
    pub async fn claim_matching(
        &self,
        required: &[String],
        exclude: &[Uuid],
        sub_task_id: Uuid,
    ) -> Option<Uuid> {
        let mut workers = self.workers.write().await;

        let pick = Self::select_index(&workers, required, exclude)?;
        let entry = &mut workers[pick];
        entry.worker.status = WorkerStatus::Thinking;
        entry.worker.current_sub_task = Some(sub_task_id);
        debug!(
            worker_id = %entry.worker.id,
            sub_task_id = %sub_task_id,
            "Worker selected and claimed"
        );
        Some(entry.worker.id)
    }

    /// Pick an idle candidate without claiming it.
    ///
    /// Used for reassignment decisions where the sub-task re-enters the queue
    /// and is claimed on dispatch.
    pub async fn pick_idle(&self, required: &[String], exclude: &[Uuid]) -> Option<Uuid> {
        let workers = self.workers.read().await;
        Self::select_index(&workers, required, exclude).map(|i| workers[i].worker.id)
    }

    fn select_index(workers: &[Entry], required: &[String], exclude: &[Uuid]) -> Option<usize> {
        let available = |e: &Entry| e.worker.is_idle() && !exclude.contains(&e.worker.id);

        if !required.is_empty() {
            if let Some(i) = workers
                .iter()
                .position(|e| available(e) && e.worker.can_handle(required))
            {
                return Some(i);
            }
        }

        workers
            .iter()
            .enumerate()
            .filter(|(_, e)| available(e))
            .max_by_key(|(i, e)| (e.worker.completed_tasks, usize::MAX - i))
            .map(|(i, _)| i)
    }

    /// Update a worker's status (used by the executor during streaming).
    pub async fn set_status(&self, id: Uuid, status: WorkerStatus) {
        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.iter_mut().find(|e| e.worker.id == id) {
            entry.worker.status = status;
        }
    }

    /// Release a worker back to idle.
    ///
    /// Clears the current sub-task and, when `completed` is set, bumps the
    /// completed-task counter.
    pub async fn release(&self, id: Uuid, completed: bool) {
        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.iter_mut().find(|e| e.worker.id == id) {
            entry.worker.status = WorkerStatus::Idle;
            entry.worker.current_sub_task = None;
            if completed {
                entry.worker.completed_tasks += 1;
            }
            debug!(worker_id = %id, completed, "Worker released");
        }
    }

    /// Snapshot of every worker.
    pub async fn snapshot(&self) -> Vec<Worker> {
        let workers = self.workers.read().await;
        workers.iter().map(|e| e.worker.clone()).collect()
    }

    /// Number of registered workers.
    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Number of idle workers.
    pub async fn idle_count(&self) -> usize {
        let workers = self.workers.read().await;
        workers.iter().filter(|e| e.worker.is_idle()).count()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}
