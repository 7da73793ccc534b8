//! Typed event families emitted by the engine.
//!
//! Every component writes to a single ordered channel of [`EngineEvent`]s.
//! Delivery is at-least-once; ordering is guaranteed only within a single
//! component's own stream, not globally across components.

use crate::exception::{ExceptionKind, HumanDecision, Severity};
use crate::MessageKind;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current time as milliseconds since the Unix epoch, the resolution carried
/// by every event.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Events emitted by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A sub-task entered the queue.
    TaskQueued {
        /// Millisecond timestamp.
        timestamp: i64,
        /// Owning task.
        task_id: Uuid,
        /// The queued sub-task.
        sub_task_id: Uuid,
        /// Computed priority score (lower is served first).
        score: i32,
    },
    /// A sub-task was dispatched to a worker.
    TaskStarted {
        /// Millisecond timestamp.
        timestamp: i64,
        /// Owning task.
        task_id: Uuid,
        /// The dispatched sub-task.
        sub_task_id: Uuid,
        /// The claimed worker.
        worker_id: Uuid,
    },
    /// A sub-task finished successfully.
    TaskCompleted {
        /// Millisecond timestamp.
        timestamp: i64,
        /// Owning task.
        task_id: Uuid,
        /// The completed sub-task.
        sub_task_id: Uuid,
        /// The worker that ran it.
        worker_id: Uuid,
    },
    /// A sub-task reached a failure the scheduler recorded.
    TaskFailed {
        /// Millisecond timestamp.
        timestamp: i64,
        /// Owning task.
        task_id: Uuid,
        /// The failed sub-task.
        sub_task_id: Uuid,
        /// The worker involved, if one was assigned.
        worker_id: Option<Uuid>,
        /// Failure message.
        error: String,
    },
    /// The watchdog aborted a sub-task that exceeded its time budget.
    TaskTimeout {
        /// Millisecond timestamp.
        timestamp: i64,
        /// Owning task.
        task_id: Uuid,
        /// The aborted sub-task.
        sub_task_id: Uuid,
        /// The worker it was running on.
        worker_id: Uuid,
        /// The budget that was exceeded, in milliseconds.
        timeout_ms: u64,
    },
    /// Queue depth or running count changed.
    QueueUpdated {
        /// Millisecond timestamp.
        timestamp: i64,
        /// Entries waiting in the queue.
        queued: usize,
        /// Entries currently executing.
        running: usize,
    },
}

/// Events emitted by the per-sub-task executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorEvent {
    /// An execution attempt began.
    TaskStart {
        /// Millisecond timestamp.
        timestamp: i64,
        /// Owning task.
        task_id: Uuid,
        /// The executing sub-task.
        sub_task_id: Uuid,
        /// The assigned worker.
        worker_id: Uuid,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Estimated progress changed.
    TaskProgress {
        /// Millisecond timestamp.
        timestamp: i64,
        /// Owning task.
        task_id: Uuid,
        /// The executing sub-task.
        sub_task_id: Uuid,
        /// The assigned worker.
        worker_id: Uuid,
        /// Heuristic progress estimate, 0–100.
        progress: u8,
    },
    /// A batch of streamed output arrived.
    TaskStream {
        /// Millisecond timestamp.
        timestamp: i64,
        /// Owning task.
        task_id: Uuid,
        /// The executing sub-task.
        sub_task_id: Uuid,
        /// The assigned worker.
        worker_id: Uuid,
        /// Accumulated text since the previous stream event.
        delta: String,
    },
    /// Execution finished successfully.
    TaskComplete {
        /// Millisecond timestamp.
        timestamp: i64,
        /// Owning task.
        task_id: Uuid,
        /// The completed sub-task.
        sub_task_id: Uuid,
        /// The worker that ran it.
        worker_id: Uuid,
        /// Length of the final result text.
        result_len: usize,
    },
    /// All attempts were exhausted.
    TaskFailed {
        /// Millisecond timestamp.
        timestamp: i64,
        /// Owning task.
        task_id: Uuid,
        /// The failed sub-task.
        sub_task_id: Uuid,
        /// The worker that ran it.
        worker_id: Uuid,
        /// The last attempt's error message.
        error: String,
    },
    /// A failed attempt will be retried after a delay.
    TaskRetry {
        /// Millisecond timestamp.
        timestamp: i64,
        /// Owning task.
        task_id: Uuid,
        /// The retrying sub-task.
        sub_task_id: Uuid,
        /// The assigned worker.
        worker_id: Uuid,
        /// The attempt that just failed (1-based).
        attempt: u32,
        /// Delay before the next attempt, in milliseconds.
        delay_ms: u64,
    },
}

/// Events emitted by the collaboration bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollaborationEvent {
    /// A message was recorded in a session.
    MessageSent {
        /// Millisecond timestamp.
        timestamp: i64,
        /// The session carrying the message.
        session_id: Uuid,
        /// The recorded message.
        message_id: Uuid,
        /// Sending worker.
        from: Uuid,
        /// Receiving worker.
        to: Uuid,
        /// Message kind.
        kind: MessageKind,
    },
    /// A message was delivered to its target worker.
    MessageReceived {
        /// Millisecond timestamp.
        timestamp: i64,
        /// The session carrying the message.
        session_id: Uuid,
        /// The delivered message.
        message_id: Uuid,
        /// Receiving worker.
        to: Uuid,
    },
    /// A new session was created.
    SessionCreated {
        /// Millisecond timestamp.
        timestamp: i64,
        /// The new session.
        session_id: Uuid,
        /// The task the session belongs to, if any.
        task_id: Option<Uuid>,
        /// Participating workers.
        participants: Vec<Uuid>,
    },
    /// A session was closed.
    SessionClosed {
        /// Millisecond timestamp.
        timestamp: i64,
        /// The closed session.
        session_id: Uuid,
        /// How many messages it carried.
        message_count: usize,
    },
}

/// Events emitted by the exception handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExceptionEvent {
    /// A failure was recorded.
    ExceptionOccurred {
        /// Millisecond timestamp.
        timestamp: i64,
        /// The new record.
        exception_id: Uuid,
        /// Failure classification.
        kind: ExceptionKind,
        /// Assigned severity.
        severity: Severity,
        /// Owning task.
        task_id: Uuid,
        /// The sub-task that failed.
        sub_task_id: Uuid,
    },
    /// An operator acknowledged a record.
    ExceptionAcknowledged {
        /// Millisecond timestamp.
        timestamp: i64,
        /// The acknowledged record.
        exception_id: Uuid,
    },
    /// A record was resolved.
    ExceptionResolved {
        /// Millisecond timestamp.
        timestamp: i64,
        /// The resolved record.
        exception_id: Uuid,
        /// The strategy applied.
        action: String,
    },
    /// A record needs a human decision.
    HumanInterventionRequired {
        /// Millisecond timestamp.
        timestamp: i64,
        /// The record awaiting a decision.
        exception_id: Uuid,
        /// Its severity.
        severity: Severity,
    },
    /// A human decision arrived.
    HumanInterventionResponded {
        /// Millisecond timestamp.
        timestamp: i64,
        /// The record that was decided.
        exception_id: Uuid,
        /// The decision.
        decision: HumanDecision,
        /// Who responded.
        responded_by: String,
    },
}

/// The single ordered event stream consumed by transport layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "component", content = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Scheduler family.
    Scheduler(SchedulerEvent),
    /// Executor family.
    Executor(ExecutorEvent),
    /// Collaboration family.
    Collaboration(CollaborationEvent),
    /// Exception family.
    Exception(ExceptionEvent),
}
