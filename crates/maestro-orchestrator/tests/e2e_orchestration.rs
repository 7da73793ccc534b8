//! End-to-end orchestration tests.
//!
//! Drives the full engine (scheduler, executor, exception handler,
//! collaboration bus, aggregator) with scripted worker backends. Covers
//! dependency ordering, the global concurrency bound, retry/reassign/skip
//! remediation, pause/resume, timeouts, and collaboration auto-replies.

use maestro_agent::ScriptedBackend;
use maestro_core::{
    EngineEvent, ExceptionEvent, ExceptionKind, HumanDecision, MessageKind, SubTaskSpec,
    SubTaskStatus, TaskPlan, TaskStatus, Worker,
};
use maestro_orchestrator::{
    EngineConfig, Orchestrator, OverallStatus, ReportFormat, SendRequest,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry_delay_ms = 1;
    config.auto_retry_delay_ms = 1;
    config.dispatch_repoll_ms = 10;
    config.stream_update_interval_ms = 0;
    config.reply_delay_ms = 1;
    config
}

async fn wait_for_terminal(engine: &Orchestrator, task_id: Uuid) {
    for _ in 0..1000 {
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

async fn wait_for_intervention(engine: &Orchestrator) -> Uuid {
    for _ in 0..1000 {
        let interventions = engine.interventions().await;
        if let Some(record) = interventions.first() {
            return record.id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no intervention was requested");
}

// ---------------------------------------------------------------------------
// Independent sub-tasks respect the global concurrency bound
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrency_bound_and_dependency_invariant() {
    let mut config = fast_config();
    config.max_concurrency = 2;
    let engine = Orchestrator::new(config);

    for i in 0..3 {
        engine
            .register_worker(
                Worker::new(format!("worker-{i}"), "generalist"),
                Arc::new(
                    ScriptedBackend::new("slow but steady output for this step")
                        .with_chunk_size(4)
                        .with_chunk_delay_ms(10),
                ),
            )
            .await;
    }

    let plan = TaskPlan {
        description: "three independent steps".into(),
        sub_tasks: vec![
            SubTaskSpec::new("step a", "do a"),
            SubTaskSpec::new("step b", "do b"),
            SubTaskSpec::new("step c", "do c"),
        ],
    };
    let task_id = engine.submit_task(plan).await.unwrap();

    // Sample the engine continuously while the task runs: the running count
    // must never exceed the bound, and a running sub-task must never have an
    // incomplete dependency.
    let max_running = Arc::new(AtomicUsize::new(0));
    let violation = Arc::new(AtomicBool::new(false));
    let monitor = {
        let engine = Arc::clone(&engine);
        let max_running = Arc::clone(&max_running);
        let violation = Arc::clone(&violation);
        tokio::spawn(async move {
            loop {
                let status = engine.queue_status().await;
                max_running.fetch_max(status.running, Ordering::SeqCst);
                if status.running > status.max_concurrency {
                    violation.store(true, Ordering::SeqCst);
                }

                let subs = engine.sub_tasks(task_id).await;
                let completed: Vec<Uuid> = subs
                    .iter()
                    .filter(|s| s.status == SubTaskStatus::Completed)
                    .map(|s| s.id)
                    .collect();
                for sub in subs.iter().filter(|s| s.status == SubTaskStatus::Running) {
                    if !sub.dependencies.iter().all(|d| completed.contains(d)) {
                        violation.store(true, Ordering::SeqCst);
                    }
                }

                if engine
                    .task(task_id)
                    .await
                    .is_some_and(|t| t.status.is_terminal())
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    wait_for_terminal(&engine, task_id).await;
    monitor.await.unwrap();

    assert!(!violation.load(Ordering::SeqCst), "invariant violated");
    assert!(max_running.load(Ordering::SeqCst) <= 2);

    let task = engine.task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(engine
        .sub_tasks(task_id)
        .await
        .iter()
        .all(|s| s.status == SubTaskStatus::Completed));
}

// ---------------------------------------------------------------------------
// A permanently failed dependency blocks its dependent forever;
// the dependent is failed explicitly so the task still settles
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failed_dependency_blocks_dependent() {
    let engine = Orchestrator::new(fast_config());
    engine
        .register_worker(
            Worker::new("Flaky", "generalist"),
            Arc::new(ScriptedBackend::new("never delivered").failing_first(1000)),
        )
        .await;

    let plan = TaskPlan {
        description: "broken chain".into(),
        sub_tasks: vec![
            SubTaskSpec::new("s1", "always fails"),
            SubTaskSpec::new("s2", "depends on s1").with_depends_on(vec![0]),
        ],
    };
    let task_id = engine.submit_task(plan).await.unwrap();

    // Auto-retries exhaust, reassignment finds no other worker, and the
    // handler opens an intervention. The operator gives up on s1.
    let exception_id = wait_for_intervention(&engine).await;
    engine
        .respond_to_exception(exception_id, HumanDecision::Skip, "operator", None)
        .await
        .unwrap();

    wait_for_terminal(&engine, task_id).await;

    let subs = engine.sub_tasks(task_id).await;
    let s1 = &subs[0];
    let s2 = &subs[1];

    // s1 failed with the error text as its result (skip semantics).
    assert_eq!(s1.status, SubTaskStatus::Failed);
    assert!(s1.result.is_some());

    // s2 never became eligible: readiness requires a *completed* dependency.
    // It was failed explicitly instead of staying pending forever.
    assert_eq!(s2.status, SubTaskStatus::Failed);
    assert!(s2.started_at.is_none());
    assert!(s2.result.as_deref().unwrap().contains("dependency"));

    // The terminal-count invariant holds and the report is coherent.
    let result = engine.aggregate(task_id).await.unwrap();
    assert_eq!(
        result.metrics.completed_sub_tasks + result.metrics.failed_sub_tasks,
        result.metrics.total_sub_tasks
    );
    assert_eq!(result.status, OverallStatus::Failed);
    assert!(engine
        .export_report(task_id, ReportFormat::Json)
        .await
        .is_some());

    // A dependency-fail record exists for the audit trail.
    let stats = engine.exception_stats().await;
    assert!(stats.by_kind.get("dependency_fail").copied().unwrap_or(0) >= 1);
}

// ---------------------------------------------------------------------------
// Two auto-retry cycles, then reassignment to a different worker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_auto_retries_then_reassign() {
    let engine = Orchestrator::new(fast_config());
    let mut events = engine.take_events().await.unwrap();

    let broken = Worker::new("Broken", "generalist");
    let broken_id = broken.id;
    engine
        .register_worker(
            broken,
            Arc::new(ScriptedBackend::new("never").failing_first(1000)),
        )
        .await;
    let backup = Worker::new("Backup", "generalist");
    let backup_id = backup.id;
    engine
        .register_worker(backup, Arc::new(ScriptedBackend::new("rescued by backup")))
        .await;

    let mut spec = SubTaskSpec::new("fragile step", "keeps failing on the first worker");
    spec.assigned_worker = Some(broken_id);
    let plan = TaskPlan {
        description: "retry then reassign".into(),
        sub_tasks: vec![spec],
    };
    let task_id = engine.submit_task(plan).await.unwrap();
    wait_for_terminal(&engine, task_id).await;

    let subs = engine.sub_tasks(task_id).await;
    assert_eq!(subs[0].status, SubTaskStatus::Completed);
    assert_eq!(subs[0].assigned_worker, Some(backup_id));
    assert_eq!(subs[0].result.as_deref(), Some("rescued by backup"));

    // Exactly two auto-retry resolutions, then one reassign.
    let mut actions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::Exception(ExceptionEvent::ExceptionResolved { action, .. }) = event {
            actions.push(action);
        }
    }
    assert_eq!(
        actions.iter().filter(|a| a.as_str() == "auto_retry").count(),
        2
    );
    assert_eq!(actions.iter().filter(|a| a.as_str() == "reassign").count(), 1);

    // The original worker is freed back to idle with no credit.
    let workers = engine.workers().await;
    let broken = workers.iter().find(|w| w.id == broken_id).unwrap();
    assert!(broken.is_idle());
    assert_eq!(broken.completed_tasks, 0);
    let backup = workers.iter().find(|w| w.id == backup_id).unwrap();
    assert_eq!(backup.completed_tasks, 1);
}

// ---------------------------------------------------------------------------
// Pause aborts running work, re-queues it with its assignment,
// and nothing starts again until resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pause_and_resume() {
    let mut config = fast_config();
    config.max_concurrency = 1;
    let engine = Orchestrator::new(config);

    let worker = Worker::new("Steady", "generalist");
    let worker_id = worker.id;
    engine
        .register_worker(
            worker,
            Arc::new(
                ScriptedBackend::new(
                    "a long answer that takes a while to stream chunk by chunk to the engine",
                )
                .with_chunk_size(2)
                .with_chunk_delay_ms(15),
            ),
        )
        .await;

    let plan = TaskPlan {
        description: "pausable work".into(),
        sub_tasks: vec![
            SubTaskSpec::new("long step", "stream slowly"),
            SubTaskSpec::new("second step", "more work"),
        ],
    };
    let task_id = engine.submit_task(plan).await.unwrap();

    // Wait until a sub-task is actually running.
    for _ in 0..1000 {
        if engine.queue_status().await.running > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(engine.queue_status().await.running > 0);

    engine.pause_task(task_id, "operator pause").await.unwrap();

    // The running entry is aborted and re-queued with its assignment intact.
    for _ in 0..1000 {
        let status = engine.queue_status().await;
        if status.running == 0 && status.queued == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let status = engine.queue_status().await;
    assert_eq!(status.running, 0);
    assert_eq!(status.queued, 2);

    let subs = engine.sub_tasks(task_id).await;
    let interrupted = subs
        .iter()
        .find(|s| s.assigned_worker == Some(worker_id))
        .unwrap();
    assert_eq!(interrupted.status, SubTaskStatus::Pending);

    // Nothing starts while paused, even after a generous wait.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.queue_status().await.running, 0);
    assert!(engine
        .sub_tasks(task_id)
        .await
        .iter()
        .all(|s| s.status == SubTaskStatus::Pending));

    engine.resume_task(task_id).await.unwrap();
    wait_for_terminal(&engine, task_id).await;

    let task = engine.task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
}

// ---------------------------------------------------------------------------
// A question with require_response produces exactly one answer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_collaboration_auto_reply() {
    let engine = Orchestrator::new(fast_config());
    let asker = Worker::new("Asker", "frontend");
    let asker_id = asker.id;
    engine
        .register_worker(asker, Arc::new(ScriptedBackend::new("asker output")))
        .await;
    let expert = Worker::new("Expert", "backend");
    let expert_id = expert.id;
    engine
        .register_worker(expert, Arc::new(ScriptedBackend::new("use a connection pool")))
        .await;

    let task_id = Uuid::new_v4();
    let question = engine
        .send_collaboration_message(
            SendRequest::new(
                asker_id,
                expert_id,
                MessageKind::Question,
                "how should I talk to the database?",
            )
            .for_task(task_id)
            .requiring_response(),
        )
        .await
        .unwrap();

    // Exactly one answer arrives, referencing the question and task session.
    let mut overview = engine.collaboration_overview().await;
    for _ in 0..1000 {
        overview = engine.collaboration_overview().await;
        if overview.total_messages == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(overview.total_messages, 2);
    assert_eq!(overview.active_sessions, 1);
    assert_eq!(overview.pending_responses, 0);

    let history = engine.collaboration_history(asker_id, expert_id).await;
    assert_eq!(history.len(), 2);
    let answer = &history[1];
    assert_eq!(answer.kind, MessageKind::Answer);
    assert_eq!(answer.from, expert_id);
    assert_eq!(answer.to, asker_id);
    assert_eq!(answer.parent_message_id, Some(question.id));
    assert_eq!(answer.content, "use a connection pool");

    tokio::time::sleep(Duration::from_millis(20)).await;
    let final_overview = engine.collaboration_overview().await;
    assert_eq!(final_overview.total_messages, 2, "more than one auto-reply");
}

// ---------------------------------------------------------------------------
// Watchdog: a sub-task exceeding its budget is aborted and classified as a
// timeout, and remediation eventually lands with an operator
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_watchdog_timeout() {
    let mut config = fast_config();
    config.task_timeout_ms = 30;
    let engine = Orchestrator::new(config);
    engine
        .register_worker(
            Worker::new("Glacial", "generalist"),
            Arc::new(
                ScriptedBackend::new(
                    "this response streams far too slowly to ever finish in time",
                )
                .with_chunk_size(1)
                .with_chunk_delay_ms(20),
            ),
        )
        .await;

    let plan = TaskPlan {
        description: "too slow".into(),
        sub_tasks: vec![SubTaskSpec::new("slow step", "will time out")],
    };
    let task_id = engine.submit_task(plan).await.unwrap();

    let exception_id = wait_for_intervention(&engine).await;
    let record = engine
        .interventions()
        .await
        .into_iter()
        .find(|r| r.id == exception_id)
        .unwrap();
    assert_eq!(record.kind, ExceptionKind::TaskTimeout);
    assert!(record.message.contains("timed out"));

    engine
        .respond_to_exception(exception_id, HumanDecision::Abort, "operator", None)
        .await
        .unwrap();
    wait_for_terminal(&engine, task_id).await;

    let subs = engine.sub_tasks(task_id).await;
    assert_eq!(subs[0].status, SubTaskStatus::Failed);
    assert!(subs[0].result.as_deref().unwrap().contains("aborted"));
}

// ---------------------------------------------------------------------------
// Plans containing dependency cycles are rejected at submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cycle_rejected_at_submit() {
    let engine = Orchestrator::new(fast_config());
    let plan = TaskPlan {
        description: "cyclic".into(),
        sub_tasks: vec![
            SubTaskSpec::new("a", "a").with_depends_on(vec![1]),
            SubTaskSpec::new("b", "b").with_depends_on(vec![0]),
        ],
    };
    let err = engine.submit_task(plan).await.unwrap_err();
    assert!(err.to_string().contains("cycle"));
}

// ---------------------------------------------------------------------------
// Event stream: the transport layer sees the scheduler/executor lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_event_stream_lifecycle() {
    let engine = Orchestrator::new(fast_config());
    let mut events = engine.take_events().await.unwrap();

    engine
        .register_worker(
            Worker::new("Ada", "generalist"),
            Arc::new(ScriptedBackend::new("event test output")),
        )
        .await;

    let plan = TaskPlan {
        description: "eventful".into(),
        sub_tasks: vec![SubTaskSpec::new("one", "step")],
    };
    let task_id = engine.submit_task(plan).await.unwrap();
    wait_for_terminal(&engine, task_id).await;

    let mut saw_queued = false;
    let mut saw_started = false;
    let mut saw_stream = false;
    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        let json = serde_json::to_string(&event).unwrap();
        match json {
            _ if json.contains("\"type\":\"task_queued\"") => saw_queued = true,
            _ if json.contains("\"type\":\"task_started\"") => saw_started = true,
            _ if json.contains("\"type\":\"task_stream\"") => saw_stream = true,
            _ if json.contains("\"type\":\"task_completed\"") => saw_completed = true,
            _ => {}
        }
    }
    assert!(saw_queued && saw_started && saw_stream && saw_completed);
}

// ---------------------------------------------------------------------------
// Skill-based selection: specialists get matching work
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_skill_based_worker_selection() {
    let engine = Orchestrator::new(fast_config());

    let generalist = Worker::new("Gen", "generalist");
    let generalist_id = generalist.id;
    engine
        .register_worker(generalist, Arc::new(ScriptedBackend::new("generalist work")))
        .await;
    let dba = Worker::new("Dba", "database admin").with_skills(vec!["SQL".into()]);
    let dba_id = dba.id;
    engine
        .register_worker(dba, Arc::new(ScriptedBackend::new("indexed the table")))
        .await;

    let plan = TaskPlan {
        description: "tune the database".into(),
        sub_tasks: vec![
            SubTaskSpec::new("add index", "create the index").with_skills(vec!["sql".into()]),
        ],
    };
    let task_id = engine.submit_task(plan).await.unwrap();
    wait_for_terminal(&engine, task_id).await;

    let subs = engine.sub_tasks(task_id).await;
    assert_eq!(subs[0].assigned_worker, Some(dba_id));
    assert_eq!(subs[0].result.as_deref(), Some("indexed the table"));

    let workers = engine.workers().await;
    let generalist = workers.iter().find(|w| w.id == generalist_id).unwrap();
    assert_eq!(generalist.completed_tasks, 0);
}
