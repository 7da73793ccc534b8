use crate::config::EngineConfig;
use crate::executor::TaskExecutor;
use crate::queue::{has_cycle, QueueEntry, ScheduleQueue};
use crate::store::TaskStore;
use chrono::{DateTime, Utc};
use maestro_agent::WorkerPool;
use maestro_core::event::now_ms;
use maestro_core::{
    EngineEvent, ExceptionKind, MaestroError, MaestroResult, SchedulerEvent, Severity, SubTask,
    SubTaskStatus, Task, TaskStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why an in-flight execution was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The whole task was cancelled by the caller.
    Cancelled,
    /// The task was paused; the sub-task re-enters the queue with its
    /// original assignment.
    Paused,
    /// An operator decided to abort this sub-task.
    Aborted,
}

/// One in-flight execution. Removed on completion, failure, or abort.
pub struct RunningEntry {
    /// The owning task.
    pub task_id: Uuid,
    /// The executing sub-task.
    pub sub_task_id: Uuid,
    /// The claimed worker.
    pub worker_id: Uuid,
    /// When execution was dispatched.
    pub started_at: DateTime<Utc>,
    cancel: oneshot::Sender<CancelReason>,
}

/// A failure handed off to the exception handler.
///
/// The scheduler never decides remediation; it only classifies and reports.
#[derive(Debug, Clone)]
pub struct FailureReport {
    /// The owning task.
    pub task_id: Uuid,
    /// The failed sub-task.
    pub sub_task_id: Uuid,
    /// The worker involved, if one was assigned.
    pub worker_id: Option<Uuid>,
    /// Failure classification.
    pub kind: ExceptionKind,
    /// Severity assigned by the reporter.
    pub severity: Severity,
    /// Human-readable failure message.
    pub message: String,
    /// How many times the sub-task has already been resubmitted.
    pub retry_count: u32,
}

/// Snapshot of queue depth and capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Entries waiting in the queue.
    pub queued: usize,
    /// Entries currently executing.
    pub running: usize,
    /// The global concurrency bound.
    pub max_concurrency: usize,
}

struct PauseState {
    reason: String,
    resumable: bool,
}

/// The priority/dependency scheduler.
///
/// Maintains the ready queue, enforces the global concurrency bound across
/// all tasks, dispatches eligible sub-tasks to the executor with a watchdog
/// timeout, and reports every failure to the exception handler through the
/// failure channel.
pub struct Scheduler {
    config: EngineConfig,
    store: Arc<RwLock<TaskStore>>,
    pool: Arc<WorkerPool>,
    executor: TaskExecutor,
    queue: Mutex<ScheduleQueue>,
    running: Mutex<HashMap<Uuid, RunningEntry>>,
    paused: Mutex<HashMap<Uuid, PauseState>>,
    dispatching: AtomicBool,
    rerun: AtomicBool,
    repoll_scheduled: AtomicBool,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    failure_tx: mpsc::UnboundedSender<FailureReport>,
    settled_tx: mpsc::UnboundedSender<Uuid>,
}

impl Scheduler {
    /// Create a scheduler sharing the given store and pool.
    ///
    /// Failures are reported on `failure_tx`; task ids are sent on
    /// `settled_tx` whenever a task reaches a terminal state.
    pub fn new(
        config: EngineConfig,
        store: Arc<RwLock<TaskStore>>,
        pool: Arc<WorkerPool>,
        event_tx: mpsc::UnboundedSender<EngineEvent>,
        failure_tx: mpsc::UnboundedSender<FailureReport>,
        settled_tx: mpsc::UnboundedSender<Uuid>,
    ) -> Arc<Self> {
        let executor = TaskExecutor::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&pool),
            event_tx.clone(),
        );
        Arc::new(Self {
            config,
            store,
            pool,
            executor,
            queue: Mutex::new(ScheduleQueue::new()),
            running: Mutex::new(HashMap::new()),
            paused: Mutex::new(HashMap::new()),
            dispatching: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            repoll_scheduled: AtomicBool::new(false),
            event_tx,
            failure_tx,
            settled_tx,
        })
    }

    /// Register a task and enqueue its sub-tasks.
    ///
    /// Each sub-task gets a computed score: the priority base, plus one when
    /// its dependencies are unmet at enqueue so it sorts after immediately
    /// runnable work. Returns after state mutation; execution proceeds on
    /// spawned tasks.
    pub async fn submit(
        self: &Arc<Self>,
        task: Task,
        sub_tasks: Vec<SubTask>,
    ) -> MaestroResult<()> {
        if sub_tasks.is_empty() {
            return Err(MaestroError::Validation("plan has no sub-tasks".into()));
        }
        if has_cycle(&sub_tasks) {
            return Err(MaestroError::Validation(
                "dependency cycle detected in sub-task graph".into(),
            ));
        }

        let task_id = task.id;
        let entries: Vec<(Uuid, i32, Option<Uuid>)> = sub_tasks
            .iter()
            .map(|sub| {
                let mut score = sub.priority.base_score();
                if !sub.dependencies.is_empty() {
                    score += 1;
                }
                (sub.id, score, sub.assigned_worker)
            })
            .collect();

        self.store.write().await.insert(task, sub_tasks);

        {
            let mut queue = self.queue.lock().await;
            for (sub_task_id, score, worker) in entries {
                queue.push(task_id, sub_task_id, score, worker);
                self.emit(SchedulerEvent::TaskQueued {
                    timestamp: now_ms(),
                    task_id,
                    sub_task_id,
                    score,
                });
            }
        }

        info!(task_id = %task_id, "Task submitted");
        self.emit_queue_updated().await;
        self.dispatch();
        Ok(())
    }

    /// Trigger a dispatch pass on a spawned task.
    ///
    /// Reentrant-safe: concurrent calls collapse into an extra pass of the
    /// already-running loop instead of double-dispatching the queue.
    pub fn dispatch(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run_dispatch().await });
    }

    async fn run_dispatch(self: Arc<Self>) {
        if self.dispatching.swap(true, Ordering::SeqCst) {
            // Another pass is active; ask it to go around once more.
            self.rerun.store(true, Ordering::SeqCst);
            return;
        }
        loop {
            self.rerun.store(false, Ordering::SeqCst);
            self.dispatch_pass().await;
            if !self.rerun.load(Ordering::SeqCst) {
                break;
            }
        }
        self.dispatching.store(false, Ordering::SeqCst);
        if self.rerun.swap(false, Ordering::SeqCst) {
            // A request arrived between the last check and the guard release.
            self.dispatch();
        }
    }

    /// One pass: start eligible entries until capacity or the queue runs dry.
    async fn dispatch_pass(self: &Arc<Self>) {
        loop {
            if self.running.lock().await.len() >= self.config.max_concurrency {
                break;
            }

            let queued_ids = self.queue.lock().await.ids();
            if queued_ids.is_empty() {
                break;
            }

            let paused: HashSet<Uuid> = self.paused.lock().await.keys().copied().collect();
            let eligible: HashSet<Uuid> = {
                let store = self.store.read().await;
                let mut completed_cache: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
                queued_ids
                    .iter()
                    .filter(|(task_id, _)| !paused.contains(task_id))
                    .filter_map(|(task_id, sub_id)| {
                        let completed = completed_cache
                            .entry(*task_id)
                            .or_insert_with(|| store.completed_ids(*task_id));
                        store
                            .sub_task(*sub_id)
                            .filter(|s| s.is_ready(completed))
                            .map(|s| s.id)
                    })
                    .collect()
            };

            let popped = self
                .queue
                .lock()
                .await
                .pop_eligible(|e| eligible.contains(&e.sub_task_id));
            let Some(entry) = popped else {
                // Blocked wait, not an error: dependencies or pauses will
                // clear, or a worker will free up. Re-poll instead of
                // busy-spinning.
                if !self.queue.lock().await.is_empty() {
                    self.schedule_repoll();
                }
                break;
            };

            let required = {
                let store = self.store.read().await;
                store
                    .sub_task(entry.sub_task_id)
                    .map(|s| s.required_skills.clone())
                    .unwrap_or_default()
            };

            let mut worker_id = None;
            if let Some(id) = entry.assigned_worker {
                if self.pool.claim(id, entry.sub_task_id).await {
                    worker_id = Some(id);
                }
            }
            if worker_id.is_none() {
                worker_id = self
                    .pool
                    .claim_matching(&required, &[], entry.sub_task_id)
                    .await;
            }
            let Some(worker_id) = worker_id else {
                debug!(
                    sub_task_id = %entry.sub_task_id,
                    "No idle worker available; sub-task stays queued"
                );
                self.queue.lock().await.restore(entry);
                self.schedule_repoll();
                break;
            };

            self.begin(entry, worker_id).await;
        }
        self.emit_queue_updated().await;
    }

    /// Mark a popped entry running and spawn its execution wrapper.
    async fn begin(self: &Arc<Self>, entry: QueueEntry, worker_id: Uuid) {
        let QueueEntry {
            task_id,
            sub_task_id,
            ..
        } = entry;

        {
            let mut store = self.store.write().await;
            if let Some(sub) = store.sub_task_mut(sub_task_id) {
                sub.status = SubTaskStatus::Running;
                sub.assigned_worker = Some(worker_id);
            }
            if let Some(task) = store.task_mut(task_id) {
                if task.status == TaskStatus::Pending {
                    task.status = TaskStatus::Running;
                }
            }
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.running.lock().await.insert(
            sub_task_id,
            RunningEntry {
                task_id,
                sub_task_id,
                worker_id,
                started_at: Utc::now(),
                cancel: cancel_tx,
            },
        );

        self.emit(SchedulerEvent::TaskStarted {
            timestamp: now_ms(),
            task_id,
            sub_task_id,
            worker_id,
        });
        info!(task_id = %task_id, sub_task_id = %sub_task_id, worker_id = %worker_id, "Sub-task started");

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler
                .run_entry(task_id, sub_task_id, worker_id, cancel_rx)
                .await;
        });
    }

    /// Execution wrapper: races the executor against the watchdog timeout and
    /// the cancellation handle. All three branches resolve through the same
    /// bookkeeping, so an aborted execution never corrupts task state.
    async fn run_entry(
        self: Arc<Self>,
        task_id: Uuid,
        sub_task_id: Uuid,
        worker_id: Uuid,
        cancel_rx: oneshot::Receiver<CancelReason>,
    ) {
        let timeout = Duration::from_millis(self.config.task_timeout_ms);
        tokio::select! {
            result = self.executor.run(task_id, sub_task_id, worker_id) => match result {
                Ok(_) => self.on_success(task_id, sub_task_id, worker_id).await,
                Err(e) => self.on_failure(task_id, sub_task_id, worker_id, e).await,
            },
            _ = tokio::time::sleep(timeout) => {
                self.on_timeout(task_id, sub_task_id, worker_id).await;
            }
            reason = cancel_rx => {
                let reason = reason.unwrap_or(CancelReason::Cancelled);
                self.on_cancelled(task_id, sub_task_id, worker_id, reason).await;
            }
        }
    }

    async fn on_success(self: &Arc<Self>, task_id: Uuid, sub_task_id: Uuid, worker_id: Uuid) {
        self.running.lock().await.remove(&sub_task_id);
        {
            let mut store = self.store.write().await;
            if let Some(sub) = store.sub_task_mut(sub_task_id) {
                sub.status = SubTaskStatus::Completed;
            }
            store.recompute_progress(task_id);
        }
        self.pool.release(worker_id, true).await;
        self.emit(SchedulerEvent::TaskCompleted {
            timestamp: now_ms(),
            task_id,
            sub_task_id,
            worker_id,
        });
        info!(task_id = %task_id, sub_task_id = %sub_task_id, "Sub-task completed");
        self.settle(task_id).await;
        // Completion may have unblocked dependents.
        self.dispatch();
    }

    async fn on_failure(
        self: &Arc<Self>,
        task_id: Uuid,
        sub_task_id: Uuid,
        worker_id: Uuid,
        err: MaestroError,
    ) {
        self.running.lock().await.remove(&sub_task_id);
        let retry_count = {
            let mut store = self.store.write().await;
            match store.sub_task_mut(sub_task_id) {
                Some(sub) => {
                    sub.status = SubTaskStatus::Failed;
                    sub.retry_count
                }
                None => 0,
            }
        };
        self.pool.release(worker_id, false).await;

        let kind = match &err {
            MaestroError::Worker(_) => ExceptionKind::AgentError,
            _ => ExceptionKind::TaskFailure,
        };
        let message = err.to_string();
        self.emit(SchedulerEvent::TaskFailed {
            timestamp: now_ms(),
            task_id,
            sub_task_id,
            worker_id: Some(worker_id),
            error: message.clone(),
        });
        warn!(task_id = %task_id, sub_task_id = %sub_task_id, error = %message, "Sub-task failed");

        // The exception handler is the single remediation authority.
        self.report(FailureReport {
            task_id,
            sub_task_id,
            worker_id: Some(worker_id),
            kind,
            severity: Severity::Medium,
            message,
            retry_count,
        });
        self.dispatch();
    }

    async fn on_timeout(self: &Arc<Self>, task_id: Uuid, sub_task_id: Uuid, worker_id: Uuid) {
        self.running.lock().await.remove(&sub_task_id);
        let message = format!("timed out after {} ms", self.config.task_timeout_ms);
        let retry_count = {
            let mut store = self.store.write().await;
            match store.sub_task_mut(sub_task_id) {
                Some(sub) => {
                    sub.status = SubTaskStatus::Failed;
                    sub.error = Some(message.clone());
                    sub.finished_at = Some(Utc::now());
                    sub.retry_count
                }
                None => 0,
            }
        };
        self.pool.release(worker_id, false).await;

        self.emit(SchedulerEvent::TaskTimeout {
            timestamp: now_ms(),
            task_id,
            sub_task_id,
            worker_id,
            timeout_ms: self.config.task_timeout_ms,
        });
        warn!(task_id = %task_id, sub_task_id = %sub_task_id, "Sub-task timed out");

        self.report(FailureReport {
            task_id,
            sub_task_id,
            worker_id: Some(worker_id),
            kind: ExceptionKind::TaskTimeout,
            severity: Severity::Medium,
            message,
            retry_count,
        });
        self.dispatch();
    }

    async fn on_cancelled(
        self: &Arc<Self>,
        task_id: Uuid,
        sub_task_id: Uuid,
        worker_id: Uuid,
        reason: CancelReason,
    ) {
        self.running.lock().await.remove(&sub_task_id);

        match reason {
            CancelReason::Paused => {
                let score = {
                    let mut store = self.store.write().await;
                    match store.sub_task_mut(sub_task_id) {
                        Some(sub) => {
                            sub.status = SubTaskStatus::Pending;
                            sub.priority.base_score()
                        }
                        None => 0,
                    }
                };
                self.pool.release(worker_id, false).await;
                // Re-enqueue with the original assignment so resume picks up
                // exactly where the pause interrupted.
                self.queue
                    .lock()
                    .await
                    .push(task_id, sub_task_id, score, Some(worker_id));
                self.emit(SchedulerEvent::TaskQueued {
                    timestamp: now_ms(),
                    task_id,
                    sub_task_id,
                    score,
                });
                debug!(sub_task_id = %sub_task_id, "Sub-task re-queued by pause");
            }
            CancelReason::Cancelled | CancelReason::Aborted => {
                let message = match reason {
                    CancelReason::Cancelled => "cancelled by user",
                    _ => "aborted by operator",
                };
                {
                    let mut store = self.store.write().await;
                    if let Some(sub) = store.sub_task_mut(sub_task_id) {
                        sub.status = SubTaskStatus::Failed;
                        sub.error = Some(message.to_string());
                        sub.result = Some(message.to_string());
                        sub.finished_at = Some(Utc::now());
                    }
                }
                self.pool.release(worker_id, false).await;
                self.emit(SchedulerEvent::TaskFailed {
                    timestamp: now_ms(),
                    task_id,
                    sub_task_id,
                    worker_id: Some(worker_id),
                    error: message.to_string(),
                });
                info!(sub_task_id = %sub_task_id, reason = message, "Sub-task aborted");
                self.settle(task_id).await;
            }
        }
        self.dispatch();
    }

    /// Abort all running and queued entries for a task.
    ///
    /// Queued and still-pending sub-tasks are failed with a human-readable
    /// message so the aggregated report stays coherent.
    pub async fn cancel(self: &Arc<Self>, task_id: Uuid) -> MaestroResult<()> {
        match self.store.read().await.task(task_id) {
            None => {
                return Err(MaestroError::Scheduler(format!("unknown task {task_id}")));
            }
            Some(task) if task.status.is_terminal() => {
                return Err(MaestroError::Scheduler(format!(
                    "task {task_id} is already in a terminal state"
                )));
            }
            Some(_) => {}
        }

        self.queue.lock().await.drain_task(task_id);
        {
            let mut store = self.store.write().await;
            let pending: Vec<Uuid> = store
                .sub_tasks_of(task_id)
                .iter()
                .filter(|s| s.status == SubTaskStatus::Pending)
                .map(|s| s.id)
                .collect();
            for id in pending {
                if let Some(sub) = store.sub_task_mut(id) {
                    sub.status = SubTaskStatus::Failed;
                    sub.error = Some("cancelled before start".to_string());
                    sub.result = Some("cancelled before start".to_string());
                    sub.finished_at = Some(Utc::now());
                }
            }
            if let Some(task) = store.task_mut(task_id) {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
            }
        }
        self.paused.lock().await.remove(&task_id);

        let entries: Vec<RunningEntry> = {
            let mut running = self.running.lock().await;
            let ids: Vec<Uuid> = running
                .values()
                .filter(|e| e.task_id == task_id)
                .map(|e| e.sub_task_id)
                .collect();
            ids.iter().filter_map(|id| running.remove(id)).collect()
        };
        let had_running = !entries.is_empty();
        for entry in entries {
            let _ = entry.cancel.send(CancelReason::Cancelled);
        }

        info!(task_id = %task_id, "Task cancelled");
        self.emit_queue_updated().await;
        if !had_running {
            let _ = self.settled_tx.send(task_id);
        }
        Ok(())
    }

    /// Stop dispatching new work for a task and abort its running entries,
    /// re-queueing them with their original assignment.
    pub async fn pause(
        &self,
        task_id: Uuid,
        reason: impl Into<String>,
        resumable: bool,
    ) -> MaestroResult<()> {
        match self.store.read().await.task(task_id) {
            None => {
                return Err(MaestroError::Scheduler(format!("unknown task {task_id}")));
            }
            Some(task) if task.status.is_terminal() => {
                return Err(MaestroError::Scheduler(format!(
                    "task {task_id} is already in a terminal state"
                )));
            }
            Some(_) => {}
        }
        let reason = reason.into();
        self.paused.lock().await.insert(
            task_id,
            PauseState {
                reason: reason.clone(),
                resumable,
            },
        );

        let entries: Vec<RunningEntry> = {
            let mut running = self.running.lock().await;
            let ids: Vec<Uuid> = running
                .values()
                .filter(|e| e.task_id == task_id)
                .map(|e| e.sub_task_id)
                .collect();
            ids.iter().filter_map(|id| running.remove(id)).collect()
        };
        for entry in entries {
            let _ = entry.cancel.send(CancelReason::Paused);
        }

        info!(task_id = %task_id, reason = %reason, "Task paused");
        Ok(())
    }

    /// Clear a pause and trigger a fresh dispatch pass.
    pub async fn resume(self: &Arc<Self>, task_id: Uuid) -> MaestroResult<()> {
        {
            let mut paused = self.paused.lock().await;
            match paused.get(&task_id) {
                None => {
                    return Err(MaestroError::Scheduler(format!(
                        "task {task_id} is not paused"
                    )))
                }
                Some(state) if !state.resumable => {
                    return Err(MaestroError::Scheduler(format!(
                        "task {task_id} cannot be resumed"
                    )))
                }
                Some(_) => {
                    paused.remove(&task_id);
                }
            }
        }
        info!(task_id = %task_id, "Task resumed");
        self.dispatch();
        Ok(())
    }

    /// Whether a task is currently paused.
    pub async fn is_paused(&self, task_id: Uuid) -> bool {
        self.paused.lock().await.contains_key(&task_id)
    }

    /// Re-enqueue a failed sub-task.
    ///
    /// Used by the exception handler for auto-retry, manual retry, and
    /// reassignment. The score is bumped by `bump` (escalating
    /// de-prioritization on repeated failure). `reset_retries` clears the
    /// resubmission counter (manual retry); otherwise it increments.
    pub async fn resubmit(
        self: &Arc<Self>,
        task_id: Uuid,
        sub_task_id: Uuid,
        assigned_worker: Option<Uuid>,
        bump: i32,
        reset_retries: bool,
    ) -> MaestroResult<()> {
        let score = {
            let mut store = self.store.write().await;
            let sub = store.sub_task_mut(sub_task_id).ok_or_else(|| {
                MaestroError::Scheduler(format!("unknown sub-task {sub_task_id}"))
            })?;
            sub.status = SubTaskStatus::Pending;
            sub.error = None;
            sub.finished_at = None;
            if reset_retries {
                sub.retry_count = 0;
            } else {
                sub.retry_count += 1;
            }
            if let Some(worker) = assigned_worker {
                sub.assigned_worker = Some(worker);
            }
            sub.priority.base_score() + bump
        };

        self.queue
            .lock()
            .await
            .push(task_id, sub_task_id, score, assigned_worker);
        self.emit(SchedulerEvent::TaskQueued {
            timestamp: now_ms(),
            task_id,
            sub_task_id,
            score,
        });
        info!(sub_task_id = %sub_task_id, score, "Sub-task resubmitted");
        self.dispatch();
        Ok(())
    }

    /// Permanently fail a sub-task, leaving the message as its result so the
    /// aggregated report stays coherent. Used for skip and abort decisions.
    pub async fn mark_failed_terminal(
        self: &Arc<Self>,
        task_id: Uuid,
        sub_task_id: Uuid,
        message: &str,
    ) -> MaestroResult<()> {
        {
            let mut store = self.store.write().await;
            let sub = store.sub_task_mut(sub_task_id).ok_or_else(|| {
                MaestroError::Scheduler(format!("unknown sub-task {sub_task_id}"))
            })?;
            sub.status = SubTaskStatus::Failed;
            sub.result = Some(message.to_string());
            if sub.error.is_none() {
                sub.error = Some(message.to_string());
            }
            if sub.finished_at.is_none() {
                sub.finished_at = Some(Utc::now());
            }
        }
        self.queue.lock().await.remove(sub_task_id);
        info!(sub_task_id = %sub_task_id, message, "Sub-task failed terminally");
        self.settle(task_id).await;
        self.dispatch();
        Ok(())
    }

    /// Abort a currently running sub-task through the normal failure path.
    pub async fn abort_running(&self, sub_task_id: Uuid) -> bool {
        let entry = self.running.lock().await.remove(&sub_task_id);
        match entry {
            Some(entry) => {
                let _ = entry.cancel.send(CancelReason::Aborted);
                true
            }
            None => false,
        }
    }

    /// Settle a task: cascade-fail permanently blocked dependents, recompute
    /// progress, and flip the task to a terminal state when every sub-task
    /// has permanently settled.
    ///
    /// A failed sub-task counts as settled only once it carries a result
    /// string; a transient failure awaiting an exception decision does not
    /// end the task.
    pub async fn settle(self: &Arc<Self>, task_id: Uuid) {
        let mut blocked: Vec<(Uuid, String)> = Vec::new();
        let mut terminal_status: Option<TaskStatus> = None;

        {
            let mut store = self.store.write().await;
            let Some(task) = store.task(task_id) else {
                return;
            };
            if task.status.is_terminal() {
                return;
            }

            // Cascade: a pending sub-task whose dependency failed permanently
            // can never become eligible (readiness requires Completed), so it
            // is failed explicitly rather than left pending forever.
            loop {
                let newly: Vec<(Uuid, String)> = store
                    .sub_tasks_of(task_id)
                    .iter()
                    .filter(|s| s.status == SubTaskStatus::Pending)
                    .filter_map(|s| {
                        s.dependencies
                            .iter()
                            .find(|dep| {
                                store.sub_task(**dep).is_some_and(|d| {
                                    d.status == SubTaskStatus::Failed && d.result.is_some()
                                })
                            })
                            .map(|dep| {
                                let dep_title = store
                                    .sub_task(*dep)
                                    .map(|d| d.title.clone())
                                    .unwrap_or_default();
                                (s.id, dep_title)
                            })
                    })
                    .collect();
                if newly.is_empty() {
                    break;
                }
                for (id, dep_title) in &newly {
                    if let Some(sub) = store.sub_task_mut(*id) {
                        let message = format!("blocked: dependency '{dep_title}' failed");
                        sub.status = SubTaskStatus::Failed;
                        sub.error = Some(message.clone());
                        sub.result = Some(message);
                        sub.finished_at = Some(Utc::now());
                    }
                }
                blocked.extend(newly);
            }

            store.recompute_progress(task_id);

            let subs = store.sub_tasks_of(task_id);
            let settled = subs.iter().all(|s| {
                s.status == SubTaskStatus::Completed
                    || (s.status == SubTaskStatus::Failed && s.result.is_some())
            });
            if settled {
                let all_completed = subs.iter().all(|s| s.status == SubTaskStatus::Completed);
                let status = if all_completed {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                if let Some(task) = store.task_mut(task_id) {
                    task.status = status;
                    task.completed_at = Some(Utc::now());
                }
                terminal_status = Some(status);
            }
        }

        // Blocked dependents get an audit record through the normal failure
        // channel and are dropped from the queue.
        if !blocked.is_empty() {
            let mut queue = self.queue.lock().await;
            for (id, _) in &blocked {
                queue.remove(*id);
            }
        }
        for (sub_task_id, dep_title) in blocked {
            self.report(FailureReport {
                task_id,
                sub_task_id,
                worker_id: None,
                kind: ExceptionKind::DependencyFail,
                severity: Severity::Low,
                message: format!("dependency '{dep_title}' failed permanently"),
                retry_count: 0,
            });
        }

        if let Some(status) = terminal_status {
            info!(task_id = %task_id, status = ?status, "Task settled");
            let _ = self.settled_tx.send(task_id);
        }
    }

    /// Queue depth, running count, and the concurrency bound.
    pub async fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            queued: self.queue.lock().await.len(),
            running: self.running.lock().await.len(),
            max_concurrency: self.config.max_concurrency,
        }
    }

    /// The stored reason for a paused task, if any.
    pub async fn pause_reason(&self, task_id: Uuid) -> Option<String> {
        self.paused
            .lock()
            .await
            .get(&task_id)
            .map(|s| s.reason.clone())
    }

    fn schedule_repoll(self: &Arc<Self>) {
        if self
            .repoll_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let scheduler = Arc::clone(self);
        let delay = Duration::from_millis(self.config.dispatch_repoll_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.repoll_scheduled.store(false, Ordering::SeqCst);
            scheduler.dispatch();
        });
    }

    fn report(&self, report: FailureReport) {
        let _ = self.failure_tx.send(report);
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.event_tx.send(EngineEvent::Scheduler(event));
    }

    async fn emit_queue_updated(&self) {
        let queued = self.queue.lock().await.len();
        let running = self.running.lock().await.len();
        self.emit(SchedulerEvent::QueueUpdated {
            timestamp: now_ms(),
            queued,
            running,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_agent::ScriptedBackend;
    use maestro_core::{Priority, Worker};

    struct Harness {
        scheduler: Arc<Scheduler>,
        store: Arc<RwLock<TaskStore>>,
        pool: Arc<WorkerPool>,
        failures: mpsc::UnboundedReceiver<FailureReport>,
        settled: mpsc::UnboundedReceiver<Uuid>,
        _events: mpsc::UnboundedReceiver<EngineEvent>,
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.retry_delay_ms = 1;
        config.stream_update_interval_ms = 0;
        config.dispatch_repoll_ms = 10;
        config
    }

    fn harness(config: EngineConfig) -> Harness {
        let store = Arc::new(RwLock::new(TaskStore::new()));
        let pool = Arc::new(WorkerPool::new());
        let (event_tx, events) = mpsc::unbounded_channel();
        let (failure_tx, failures) = mpsc::unbounded_channel();
        let (settled_tx, settled) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(
            config,
            Arc::clone(&store),
            Arc::clone(&pool),
            event_tx,
            failure_tx,
            settled_tx,
        );
        Harness {
            scheduler,
            store,
            pool,
            failures,
            settled,
            _events: events,
        }
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..500 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_submit_rejects_cycle() {
        let h = harness(fast_config());
        let task = Task::new("cyclic");
        let mut a = SubTask::new(task.id, "a", "a");
        let mut b = SubTask::new(task.id, "b", "b");
        let (a_id, b_id) = (a.id, b.id);
        a.dependencies = vec![b_id];
        b.dependencies = vec![a_id];

        let err = h.scheduler.submit(task, vec![a, b]).await.unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_plan() {
        let h = harness(fast_config());
        let err = h
            .scheduler
            .submit(Task::new("empty"), vec![])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no sub-tasks"));
    }

    #[tokio::test]
    async fn test_runs_single_sub_task_to_completion() {
        let mut h = harness(fast_config());
        h.pool
            .register(Worker::new("Ada", "dev"), Arc::new(ScriptedBackend::new("done")))
            .await;

        let task = Task::new("one step");
        let task_id = task.id;
        let sub = SubTask::new(task_id, "step", "do it");
        let sub_id = sub.id;
        h.scheduler.submit(task, vec![sub]).await.unwrap();

        let store = Arc::clone(&h.store);
        wait_until(|| {
            let store = Arc::clone(&store);
            async move {
                store
                    .read()
                    .await
                    .task(task_id)
                    .is_some_and(|t| t.status == TaskStatus::Completed)
            }
        })
        .await;

        let store = h.store.read().await;
        let sub = store.sub_task(sub_id).unwrap();
        assert_eq!(sub.status, SubTaskStatus::Completed);
        assert_eq!(sub.result.as_deref(), Some("done"));
        assert_eq!(store.task(task_id).unwrap().progress, 100);
        drop(store);

        assert_eq!(h.settled.recv().await, Some(task_id));
        // Worker released and credited.
        let workers = h.pool.snapshot().await;
        assert_eq!(workers[0].completed_tasks, 1);
        assert!(workers[0].is_idle());
    }

    #[tokio::test]
    async fn test_dependencies_run_in_order() {
        let h = harness(fast_config());
        h.pool
            .register(Worker::new("Ada", "dev"), Arc::new(ScriptedBackend::new("ok")))
            .await;

        let task = Task::new("chain");
        let task_id = task.id;
        let first = SubTask::new(task_id, "first", "one");
        let first_id = first.id;
        let second = SubTask::new(task_id, "second", "two")
            .with_priority(Priority::High)
            .with_dependencies(vec![first_id]);
        let second_id = second.id;

        // `second` has higher priority, but must not run before `first`.
        h.scheduler.submit(task, vec![first, second]).await.unwrap();

        let store = Arc::clone(&h.store);
        wait_until(|| {
            let store = Arc::clone(&store);
            async move {
                store
                    .read()
                    .await
                    .task(task_id)
                    .is_some_and(|t| t.status == TaskStatus::Completed)
            }
        })
        .await;

        let store = h.store.read().await;
        let first = store.sub_task(first_id).unwrap();
        let second = store.sub_task(second_id).unwrap();
        assert!(first.finished_at.unwrap() <= second.started_at.unwrap());
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_settled() {
        let mut h = harness(fast_config());
        h.pool
            .register(
                Worker::new("Flaky", "dev"),
                Arc::new(ScriptedBackend::new("never").failing_first(100)),
            )
            .await;

        let task = Task::new("fails");
        let task_id = task.id;
        let sub = SubTask::new(task_id, "step", "do it");
        let sub_id = sub.id;
        h.scheduler.submit(task, vec![sub]).await.unwrap();

        let report = h.failures.recv().await.unwrap();
        assert_eq!(report.task_id, task_id);
        assert_eq!(report.sub_task_id, sub_id);
        assert_eq!(report.kind, ExceptionKind::AgentError);
        assert_eq!(report.severity, Severity::Medium);

        // Without a handler decision the task is not terminal: the failed
        // sub-task carries no result yet.
        let store = h.store.read().await;
        assert_eq!(store.task(task_id).unwrap().status, TaskStatus::Running);
        assert_eq!(store.sub_task(sub_id).unwrap().status, SubTaskStatus::Failed);
        assert!(store.sub_task(sub_id).unwrap().result.is_none());
    }

    #[tokio::test]
    async fn test_mark_failed_terminal_settles_and_cascades() {
        let mut h = harness(fast_config());
        h.pool
            .register(Worker::new("Ada", "dev"), Arc::new(ScriptedBackend::new("ok")))
            .await;

        let task = Task::new("cascade");
        let task_id = task.id;
        let root = SubTask::new(task_id, "root", "r");
        let root_id = root.id;
        let dependent = SubTask::new(task_id, "dependent", "d").with_dependencies(vec![root_id]);
        let dependent_id = dependent.id;

        // Submit with no eligible path for `root`: fail it terminally by hand.
        {
            let mut store = h.store.write().await;
            store.insert(task, vec![root, dependent]);
        }
        h.scheduler
            .mark_failed_terminal(task_id, root_id, "gave up")
            .await
            .unwrap();

        let store = h.store.read().await;
        let dependent = store.sub_task(dependent_id).unwrap();
        assert_eq!(dependent.status, SubTaskStatus::Failed);
        assert!(dependent.result.as_deref().unwrap().contains("dependency"));
        assert_eq!(store.task(task_id).unwrap().status, TaskStatus::Failed);
        drop(store);

        // The cascade produced a dependency-fail report and a settlement.
        let report = h.failures.recv().await.unwrap();
        assert_eq!(report.kind, ExceptionKind::DependencyFail);
        assert_eq!(report.sub_task_id, dependent_id);
        assert_eq!(h.settled.recv().await, Some(task_id));
    }

    #[tokio::test]
    async fn test_cancel_discards_queued_work() {
        let h = harness(fast_config());
        // No workers registered: everything stays queued.
        let task = Task::new("doomed");
        let task_id = task.id;
        let sub = SubTask::new(task_id, "step", "s");
        let sub_id = sub.id;
        h.scheduler.submit(task, vec![sub]).await.unwrap();

        h.scheduler.cancel(task_id).await.unwrap();

        let store = h.store.read().await;
        assert_eq!(store.task(task_id).unwrap().status, TaskStatus::Failed);
        let sub = store.sub_task(sub_id).unwrap();
        assert_eq!(sub.status, SubTaskStatus::Failed);
        assert!(sub.result.as_deref().unwrap().contains("cancelled"));
        drop(store);

        assert_eq!(h.scheduler.queue_status().await.queued, 0);
    }

    #[tokio::test]
    async fn test_resume_rejects_unpaused_and_non_resumable() {
        let h = harness(fast_config());
        let task = Task::new("pausable");
        let task_id = task.id;
        let sub = SubTask::new(task_id, "step", "s");
        h.scheduler.submit(task, vec![sub]).await.unwrap();

        assert!(h.scheduler.resume(task_id).await.is_err());

        h.scheduler.pause(task_id, "stuck", false).await.unwrap();
        let err = h.scheduler.resume(task_id).await.unwrap_err();
        assert!(err.to_string().contains("cannot be resumed"));
    }
}
