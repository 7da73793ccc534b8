use crate::aggregator::{AggregatedResult, ReportFormat, ResultAggregator};
use crate::collaboration::{CollaborationBus, CollaborationOverview, SendRequest};
use crate::config::EngineConfig;
use crate::exceptions::{ExceptionHandler, ExceptionStats};
use crate::scheduler::{QueueStatus, Scheduler};
use crate::store::TaskStore;
use maestro_agent::{WorkerBackend, WorkerPool};
use maestro_core::{
    CollaborationMessage, EngineEvent, ExceptionRecord, HumanDecision, MaestroError,
    MaestroResult, SubTask, Task, TaskPlan, Worker,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// The orchestration engine: the single entry point external callers use to
/// submit, track, and cancel tasks.
///
/// Owns one instance of every component (pool, scheduler, exception
/// handler, collaboration bus, aggregator), so multiple independent engines
/// can coexist in one process. All observable behavior flows out through a
/// single ordered [`EngineEvent`] channel, taken once by the transport layer.
pub struct Orchestrator {
    config: EngineConfig,
    store: Arc<RwLock<TaskStore>>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
    exceptions: Arc<ExceptionHandler>,
    collaboration: Arc<CollaborationBus>,
    aggregator: Arc<ResultAggregator>,
    events: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    routers: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Construct an engine with the given configuration.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let store = Arc::new(RwLock::new(TaskStore::new()));
        let pool = Arc::new(WorkerPool::new());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
        let (settled_tx, mut settled_rx) = mpsc::unbounded_channel();

        let scheduler = Scheduler::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&pool),
            event_tx.clone(),
            failure_tx,
            settled_tx,
        );
        let collaboration = CollaborationBus::new(&config, Arc::clone(&pool), event_tx.clone());
        let exceptions = ExceptionHandler::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::clone(&scheduler),
            Arc::clone(&collaboration),
            event_tx,
        );
        let aggregator = Arc::new(ResultAggregator::new(Arc::clone(&store), Arc::clone(&pool)));

        // Route scheduler failures to the exception handler, and settled
        // tasks to the aggregator.
        let handler = Arc::clone(&exceptions);
        let failure_router = tokio::spawn(async move {
            while let Some(report) = failure_rx.recv().await {
                handler.handle_failure(report).await;
            }
        });
        let agg = Arc::clone(&aggregator);
        let settle_router = tokio::spawn(async move {
            while let Some(task_id) = settled_rx.recv().await {
                if let Err(e) = agg.aggregate(task_id).await {
                    warn!(task_id = %task_id, error = %e, "Automatic aggregation failed");
                }
            }
        });

        Arc::new(Self {
            config,
            store,
            pool,
            scheduler,
            exceptions,
            collaboration,
            aggregator,
            events: Mutex::new(Some(event_rx)),
            routers: vec![failure_router, settle_router],
        })
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a worker with its backend. Returns the worker id.
    pub async fn register_worker(
        &self,
        worker: Worker,
        backend: Arc<dyn WorkerBackend>,
    ) -> Uuid {
        self.pool.register(worker, backend).await
    }

    /// Submit a decomposed plan. Returns the new task's id.
    ///
    /// Plan dependencies are given as sibling indices and mapped to generated
    /// ids; out-of-range and self references are rejected, as are dependency
    /// cycles.
    pub async fn submit_task(&self, plan: TaskPlan) -> MaestroResult<Uuid> {
        if plan.sub_tasks.is_empty() {
            return Err(MaestroError::Validation("plan has no sub-tasks".into()));
        }

        let task = Task::new(&plan.description);
        let task_id = task.id;
        let ids: Vec<Uuid> = plan.sub_tasks.iter().map(|_| Uuid::new_v4()).collect();

        let mut sub_tasks = Vec::with_capacity(plan.sub_tasks.len());
        for (index, spec) in plan.sub_tasks.iter().enumerate() {
            let mut dependencies = Vec::with_capacity(spec.depends_on.len());
            for &dep in &spec.depends_on {
                if dep >= ids.len() {
                    return Err(MaestroError::Validation(format!(
                        "sub-task {index} depends on out-of-range index {dep}"
                    )));
                }
                if dep == index {
                    return Err(MaestroError::Validation(format!(
                        "sub-task {index} depends on itself"
                    )));
                }
                dependencies.push(ids[dep]);
            }

            let mut sub = SubTask::new(task_id, &spec.title, &spec.description)
                .with_priority(spec.priority)
                .with_dependencies(dependencies)
                .with_skills(spec.required_skills.clone());
            sub.id = ids[index];
            sub.estimated_minutes = spec.estimated_minutes;
            sub.assigned_worker = spec.assigned_worker;
            sub_tasks.push(sub);
        }

        self.scheduler.submit(task, sub_tasks).await?;
        info!(task_id = %task_id, "Plan accepted");
        Ok(task_id)
    }

    /// Register the given workers, then submit the plan.
    pub async fn submit_task_with_workers(
        &self,
        plan: TaskPlan,
        workers: Vec<(Worker, Arc<dyn WorkerBackend>)>,
    ) -> MaestroResult<Uuid> {
        for (worker, backend) in workers {
            self.register_worker(worker, backend).await;
        }
        self.submit_task(plan).await
    }

    /// Abort all running and queued work for a task.
    pub async fn cancel_task(&self, task_id: Uuid) -> MaestroResult<()> {
        self.scheduler.cancel(task_id).await
    }

    /// Stop dispatching new work for a task; running sub-tasks are aborted
    /// and re-queued with their assignment.
    pub async fn pause_task(&self, task_id: Uuid, reason: impl Into<String>) -> MaestroResult<()> {
        self.exceptions.pause_task(task_id, reason).await
    }

    /// Clear a pause and resume dispatching.
    pub async fn resume_task(&self, task_id: Uuid) -> MaestroResult<()> {
        self.exceptions.resume_task(task_id).await
    }

    /// Apply a human decision to an exception awaiting intervention.
    pub async fn respond_to_exception(
        &self,
        exception_id: Uuid,
        decision: HumanDecision,
        responded_by: &str,
        notes: Option<String>,
    ) -> MaestroResult<()> {
        self.exceptions
            .respond(exception_id, decision, responded_by, notes)
            .await
    }

    /// Send a collaboration message between two workers.
    pub async fn send_collaboration_message(
        &self,
        request: SendRequest,
    ) -> MaestroResult<CollaborationMessage> {
        self.collaboration.send(request).await
    }

    /// Build (or rebuild) the aggregated result for a terminal task.
    pub async fn aggregate(&self, task_id: Uuid) -> MaestroResult<AggregatedResult> {
        self.aggregator.aggregate(task_id).await
    }

    /// Export a report, or `None` if aggregation has not run yet.
    pub async fn export_report(&self, task_id: Uuid, format: ReportFormat) -> Option<String> {
        self.aggregator.export(task_id, format).await
    }

    /// Queue depth and capacity.
    pub async fn queue_status(&self) -> QueueStatus {
        self.scheduler.queue_status().await
    }

    /// Exception counters for observability.
    pub async fn exception_stats(&self) -> ExceptionStats {
        self.exceptions.stats().await
    }

    /// Exceptions awaiting a human decision.
    pub async fn interventions(&self) -> Vec<ExceptionRecord> {
        self.exceptions.interventions().await
    }

    /// Collaboration counters for observability.
    pub async fn collaboration_overview(&self) -> CollaborationOverview {
        self.collaboration.overview().await
    }

    /// Message history between two workers.
    pub async fn collaboration_history(&self, a: Uuid, b: Uuid) -> Vec<CollaborationMessage> {
        self.collaboration.history(a, b).await
    }

    /// Snapshot of a task.
    pub async fn task(&self, task_id: Uuid) -> Option<Task> {
        self.store.read().await.task(task_id).cloned()
    }

    /// Snapshot of a sub-task.
    pub async fn sub_task(&self, sub_task_id: Uuid) -> Option<SubTask> {
        self.store.read().await.sub_task(sub_task_id).cloned()
    }

    /// Snapshot of a task's sub-tasks, in plan order.
    pub async fn sub_tasks(&self, task_id: Uuid) -> Vec<SubTask> {
        self.store
            .read()
            .await
            .sub_tasks_of(task_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Snapshot of every registered worker.
    pub async fn workers(&self) -> Vec<Worker> {
        self.pool.snapshot().await
    }

    /// Take the engine's event stream. Yields `Some` exactly once; the
    /// transport layer owns the receiver from then on.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events.lock().await.take()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        for router in &self.routers {
            router.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_agent::ScriptedBackend;
    use maestro_core::{SubTaskSpec, TaskStatus};
    use std::time::Duration;

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.retry_delay_ms = 1;
        config.auto_retry_delay_ms = 1;
        config.dispatch_repoll_ms = 10;
        config.stream_update_interval_ms = 0;
        config
    }

    async fn wait_for_terminal(engine: &Orchestrator, task_id: Uuid) {
        for _ in 0..500 {
            if engine
                .task(task_id)
                .await
                .is_some_and(|t| t.status.is_terminal())
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never reached a terminal state");
    }

    #[tokio::test]
    async fn test_submit_validates_plan() {
        let engine = Orchestrator::new(fast_config());

        let empty = TaskPlan {
            description: "nothing".into(),
            sub_tasks: vec![],
        };
        assert!(engine.submit_task(empty).await.is_err());

        let out_of_range = TaskPlan {
            description: "bad deps".into(),
            sub_tasks: vec![SubTaskSpec::new("a", "a").with_depends_on(vec![5])],
        };
        let err = engine.submit_task(out_of_range).await.unwrap_err();
        assert!(err.to_string().contains("out-of-range"));

        let self_dep = TaskPlan {
            description: "self dep".into(),
            sub_tasks: vec![SubTaskSpec::new("a", "a").with_depends_on(vec![0])],
        };
        let err = engine.submit_task(self_dep).await.unwrap_err();
        assert!(err.to_string().contains("depends on itself"));
    }

    #[tokio::test]
    async fn test_full_pipeline_and_auto_aggregation() {
        let engine = Orchestrator::new(fast_config());
        engine
            .register_worker(
                Worker::new("Ada", "generalist"),
                Arc::new(ScriptedBackend::new("step done")),
            )
            .await;

        let plan = TaskPlan {
            description: "build the thing".into(),
            sub_tasks: vec![
                SubTaskSpec::new("design", "sketch it"),
                SubTaskSpec::new("implement", "code it").with_depends_on(vec![0]),
            ],
        };
        let task_id = engine.submit_task(plan).await.unwrap();
        wait_for_terminal(&engine, task_id).await;

        let task = engine.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);

        // The settle router aggregates automatically.
        let mut report = None;
        for _ in 0..200 {
            report = engine.export_report(task_id, ReportFormat::Markdown).await;
            if report.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let report = report.expect("report not aggregated");
        assert!(report.contains("build the thing"));
        assert!(report.contains("step done"));

        let status = engine.queue_status().await;
        assert_eq!(status.queued, 0);
        assert_eq!(status.running, 0);
    }

    #[tokio::test]
    async fn test_take_events_yields_once() {
        let engine = Orchestrator::new(fast_config());
        assert!(engine.take_events().await.is_some());
        assert!(engine.take_events().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_task_via_engine() {
        let engine = Orchestrator::new(fast_config());
        // No workers: the sub-task stays queued until cancelled.
        let plan = TaskPlan {
            description: "stalled".into(),
            sub_tasks: vec![SubTaskSpec::new("wait", "forever")],
        };
        let task_id = engine.submit_task(plan).await.unwrap();
        engine.cancel_task(task_id).await.unwrap();

        let task = engine.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(engine.cancel_task(Uuid::new_v4()).await.is_err());
    }
}
