use crate::config::EngineConfig;
use crate::store::TaskStore;
use chrono::Utc;
use maestro_agent::{StreamEvent, WorkerPool};
use maestro_core::event::now_ms;
use maestro_core::{
    EngineEvent, ExecutorEvent, MaestroError, MaestroResult, Message, SubTask, WorkerStatus,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Characters of accumulated output that map to 100% estimated progress.
const PROGRESS_FULL_LEN: usize = 2000;

/// Runs a single sub-task against one assigned worker, streaming partial
/// output and producing a final result or error.
///
/// The executor wraps each dispatch in a bounded retry loop and is the only
/// writer of a sub-task's result, error, and timestamps. It never decides
/// remediation: terminal failures are returned to the scheduler, which hands
/// them to the exception handler.
pub struct TaskExecutor {
    config: EngineConfig,
    store: Arc<RwLock<TaskStore>>,
    pool: Arc<WorkerPool>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl TaskExecutor {
    /// Create an executor sharing the given store, pool, and event channel.
    pub fn new(
        config: EngineConfig,
        store: Arc<RwLock<TaskStore>>,
        pool: Arc<WorkerPool>,
        event_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            config,
            store,
            pool,
            event_tx,
        }
    }

    /// Execute a sub-task to completion on the given worker.
    ///
    /// Streams zero or more text deltas, emitting progress events at a
    /// bounded cadence, then resolves with the full accumulated text. A
    /// failed attempt re-enters the loop after `retry_delay * attempt`; once
    /// attempts are exhausted the last error is returned.
    pub async fn run(
        &self,
        task_id: Uuid,
        sub_task_id: Uuid,
        worker_id: Uuid,
    ) -> MaestroResult<String> {
        let messages = self.build_messages(sub_task_id, worker_id).await?;

        {
            let mut store = self.store.write().await;
            if let Some(sub) = store.sub_task_mut(sub_task_id) {
                if sub.started_at.is_none() {
                    sub.started_at = Some(Utc::now());
                }
            }
        }

        let mut last_err: Option<MaestroError> = None;

        for attempt in 1..=self.config.max_retries {
            self.emit(ExecutorEvent::TaskStart {
                timestamp: now_ms(),
                task_id,
                sub_task_id,
                worker_id,
                attempt,
            });
            self.pool.set_status(worker_id, WorkerStatus::Thinking).await;

            match self
                .attempt(task_id, sub_task_id, worker_id, &messages)
                .await
            {
                Ok(text) => {
                    self.pool.set_status(worker_id, WorkerStatus::Success).await;
                    {
                        let mut store = self.store.write().await;
                        if let Some(sub) = store.sub_task_mut(sub_task_id) {
                            sub.result = Some(text.clone());
                            sub.error = None;
                            sub.finished_at = Some(Utc::now());
                        }
                    }
                    self.emit(ExecutorEvent::TaskComplete {
                        timestamp: now_ms(),
                        task_id,
                        sub_task_id,
                        worker_id,
                        result_len: text.len(),
                    });
                    info!(sub_task_id = %sub_task_id, attempt, "Sub-task execution complete");
                    return Ok(text);
                }
                Err(e) => {
                    warn!(
                        sub_task_id = %sub_task_id,
                        attempt,
                        error = %e,
                        "Sub-task attempt failed"
                    );
                    if attempt < self.config.max_retries {
                        let delay_ms = self.config.retry_delay_ms * u64::from(attempt);
                        self.emit(ExecutorEvent::TaskRetry {
                            timestamp: now_ms(),
                            task_id,
                            sub_task_id,
                            worker_id,
                            attempt,
                            delay_ms,
                        });
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                    last_err = Some(e);
                }
            }
        }

        let err =
            last_err.unwrap_or_else(|| MaestroError::Executor("no attempts were made".into()));
        self.pool.set_status(worker_id, WorkerStatus::Error).await;
        {
            let mut store = self.store.write().await;
            if let Some(sub) = store.sub_task_mut(sub_task_id) {
                sub.error = Some(err.to_string());
                sub.finished_at = Some(Utc::now());
            }
        }
        self.emit(ExecutorEvent::TaskFailed {
            timestamp: now_ms(),
            task_id,
            sub_task_id,
            worker_id,
            error: err.to_string(),
        });
        Err(err)
    }

    /// A single streaming attempt.
    async fn attempt(
        &self,
        task_id: Uuid,
        sub_task_id: Uuid,
        worker_id: Uuid,
        messages: &[Message],
    ) -> MaestroResult<String> {
        let backend = self
            .pool
            .backend(worker_id)
            .await
            .ok_or_else(|| MaestroError::Worker("no backend registered for worker".into()))?;

        let (mut rx, handle) = backend.chat_stream(messages).await?;

        let interval = Duration::from_millis(self.config.stream_update_interval_ms);
        let mut accumulated = String::new();
        let mut pending = String::new();
        let mut last_emit: Option<Instant> = None;
        let mut streaming = false;

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::TextDelta { text } => {
                    if !streaming {
                        streaming = true;
                        self.pool.set_status(worker_id, WorkerStatus::Typing).await;
                    }
                    accumulated.push_str(&text);
                    pending.push_str(&text);

                    // Cadence bound: never emit more often than the
                    // configured interval, however chatty the backend is.
                    let due = last_emit.map_or(true, |t| t.elapsed() >= interval);
                    if due {
                        self.emit(ExecutorEvent::TaskProgress {
                            timestamp: now_ms(),
                            task_id,
                            sub_task_id,
                            worker_id,
                            progress: estimate_progress(accumulated.len()),
                        });
                        self.emit(ExecutorEvent::TaskStream {
                            timestamp: now_ms(),
                            task_id,
                            sub_task_id,
                            worker_id,
                            delta: std::mem::take(&mut pending),
                        });
                        last_emit = Some(Instant::now());
                    }
                }
                StreamEvent::Done => break,
                StreamEvent::Error { message } => {
                    handle.abort();
                    return Err(MaestroError::Worker(message));
                }
            }
        }

        if !pending.is_empty() {
            self.emit(ExecutorEvent::TaskStream {
                timestamp: now_ms(),
                task_id,
                sub_task_id,
                worker_id,
                delta: std::mem::take(&mut pending),
            });
        }

        // The join handle carries the backend's authoritative final text;
        // fall back to our own accumulation if the backend returns nothing.
        let final_text = match handle.await {
            Ok(Ok(text)) if !text.is_empty() => text,
            Ok(Ok(_)) => accumulated,
            Ok(Err(e)) => return Err(e),
            Err(e) => {
                return Err(MaestroError::Executor(format!(
                    "stream task terminated abnormally: {e}"
                )))
            }
        };

        // Snap to 100 on completion: mid-stream progress is a heuristic.
        self.emit(ExecutorEvent::TaskProgress {
            timestamp: now_ms(),
            task_id,
            sub_task_id,
            worker_id,
            progress: 100,
        });

        debug!(
            sub_task_id = %sub_task_id,
            result_len = final_text.len(),
            "Streaming attempt finished"
        );
        Ok(final_text)
    }

    /// Build the worker-facing prompt for a sub-task.
    async fn build_messages(
        &self,
        sub_task_id: Uuid,
        worker_id: Uuid,
    ) -> MaestroResult<Vec<Message>> {
        let store = self.store.read().await;
        let sub = store
            .sub_task(sub_task_id)
            .ok_or_else(|| MaestroError::Executor(format!("unknown sub-task {sub_task_id}")))?;
        let worker = self
            .pool
            .get(worker_id)
            .await
            .ok_or_else(|| MaestroError::Worker(format!("unknown worker {worker_id}")))?;

        let system = format!(
            "You are {}, working as {}. Complete the assigned sub-task and reply \
             with the final deliverable text only.",
            worker.name, worker.role
        );
        Ok(vec![
            Message::system(system),
            Message::user(build_task_prompt(sub)),
        ])
    }

    fn emit(&self, event: ExecutorEvent) {
        let _ = self.event_tx.send(EngineEvent::Executor(event));
    }
}

/// Heuristic progress estimate from accumulated output length, capped at 90
/// because true completion is unknowable mid-stream.
fn estimate_progress(len: usize) -> u8 {
    ((len * 100) / PROGRESS_FULL_LEN).min(90) as u8
}

/// Render a sub-task as a prompt: title, description, priority, and the
/// planner's duration hint when present.
fn build_task_prompt(sub: &SubTask) -> String {
    let mut prompt = format!("## {}\n\n{}\n\nPriority: {}", sub.title, sub.description, sub.priority);
    if let Some(minutes) = sub.estimated_minutes {
        prompt.push_str(&format!("\nEstimated duration: {minutes} minutes"));
    }
    prompt
}
