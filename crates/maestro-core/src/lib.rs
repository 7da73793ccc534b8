//! Core types and error definitions for the Maestro orchestration engine.
//!
//! This crate provides the foundational types shared across all Maestro
//! crates: error handling, the message representation exchanged with worker
//! backends, the task/worker data model, and the typed event families the
//! engine emits.
//!
//! # Main types
//!
//! - [`MaestroError`] — Unified error enum for all Maestro subsystems.
//! - [`MaestroResult`] — Convenience alias for `Result<T, MaestroError>`.
//! - [`Message`] — A single message sent to or received from a worker backend.
//! - [`Task`] / [`SubTask`] — The decomposed unit-of-work model.
//! - [`Worker`] — A logical executor registered in the pool.
//! - [`EngineEvent`] — The tagged event stream emitted by the engine.

/// Collaboration sessions, messages, and conversation records.
pub mod collab;
/// Typed event families emitted by the engine.
pub mod event;
/// Exception records, severities, and human-intervention tickets.
pub mod exception;
/// Task, sub-task, and plan types.
pub mod task;
/// Worker identity and status types.
pub mod worker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub use collab::{
    CollaborationMessage, CollaborationSession, ConversationRecord, MessageKind, SessionStatus,
};
pub use event::{
    CollaborationEvent, EngineEvent, ExceptionEvent, ExecutorEvent, SchedulerEvent,
};
pub use exception::{
    ExceptionKind, ExceptionRecord, ExceptionStatus, HumanDecision, InterventionTicket,
    Resolution, Severity,
};
pub use task::{Priority, SubTask, SubTaskSpec, SubTaskStatus, Task, TaskPlan, TaskStatus};
pub use worker::{Worker, WorkerStatus};

// --- Error types ---

/// Top-level error type for the Maestro engine.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, thiserror::Error)]
pub enum MaestroError {
    /// An error raised while scheduling or dispatching sub-tasks.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// An error raised during sub-task execution.
    #[error("Executor error: {0}")]
    Executor(String),

    /// An error surfaced by a worker backend.
    #[error("Worker error: {0}")]
    Worker(String),

    /// An error in the exception-handling workflow.
    #[error("Exception error: {0}")]
    Exception(String),

    /// An error in the inter-worker collaboration layer.
    #[error("Collaboration error: {0}")]
    Collaboration(String),

    /// An error while aggregating or exporting results.
    #[error("Aggregation error: {0}")]
    Aggregation(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A submitted plan or request failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;

// --- Message types ---

/// The role of the participant that authored a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Content originating from the engine on behalf of a user or peer.
    User,
    /// Content produced by a worker backend.
    Assistant,
    /// A system-level instruction.
    System,
}

/// A single message sent to or received from a worker backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// The role of the message author.
    pub role: Role,
    /// The textual content of the message.
    pub content: String,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
    /// Arbitrary key-value metadata attached to the message.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    /// Creates a new message with the given role and content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Creates a new message with [`Role::User`].
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates a new message with [`Role::Assistant`].
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates a new message with [`Role::System`].
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}
