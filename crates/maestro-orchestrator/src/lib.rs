//! Sub-agent orchestration engine: scheduling, execution, exception
//! handling, collaboration, and result aggregation.
//!
//! Takes an already-decomposed plan, distributes its sub-tasks across a pool
//! of logical workers under a global concurrency bound, streams execution
//! progress, routes every failure through a single remediation authority,
//! and compiles a report once the task settles.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Top-level engine owning one instance of each component.
//! - [`Scheduler`] — Priority/dependency queue with a bounded dispatch loop.
//! - [`TaskExecutor`] — Streaming per-sub-task executor with bounded retry.
//! - [`ExceptionHandler`] — Failure classification, remediation, and human
//!   intervention.
//! - [`CollaborationBus`] — Peer-to-peer and broadcast messaging between
//!   workers.
//! - [`ResultAggregator`] — Metrics and Markdown/HTML/JSON report exports.
//! - [`EngineConfig`] — Tunables, loadable from TOML.

/// Result aggregation and report exports.
pub mod aggregator;
/// Inter-worker messaging.
pub mod collaboration;
/// Engine configuration.
pub mod config;
/// The top-level engine.
pub mod engine;
/// Failure classification and remediation.
pub mod exceptions;
/// The per-sub-task streaming executor.
pub mod executor;
/// The stable priority queue and cycle detection.
pub mod queue;
/// The priority/dependency scheduler.
pub mod scheduler;
/// The in-memory task store.
pub mod store;

pub use aggregator::{
    AggregatedResult, OverallStatus, ReportFormat, ResultAggregator, SubTaskReport, TaskMetrics,
};
pub use collaboration::{CollaborationBus, CollaborationOverview, SendRequest};
pub use config::EngineConfig;
pub use engine::Orchestrator;
pub use exceptions::{ExceptionHandler, ExceptionStats};
pub use executor::TaskExecutor;
pub use queue::{QueueEntry, ScheduleQueue};
pub use scheduler::{CancelReason, FailureReport, QueueStatus, RunningEntry, Scheduler};
pub use store::TaskStore;
