//! Worker capability and pool for the Maestro orchestration engine.
//!
//! A worker is a logical executor that turns a textual task description into
//! a result, possibly incrementally. The engine only depends on the
//! [`WorkerBackend`] trait; concrete implementations (LLM providers, shell
//! runners, humans behind a chat UI) live outside the engine.
//!
//! # Main types
//!
//! - [`WorkerBackend`] — Streaming capability trait every worker implements.
//! - [`StreamEvent`] — Incremental output events from a streaming call.
//! - [`WorkerPool`] — Registry tracking identity, skills, and availability.
//! - [`ScriptedBackend`] — Deterministic backend for demos and tests.

/// The worker capability trait.
pub mod backend;
/// Worker registry with compare-and-set claiming.
pub mod pool;
/// Canned-response backend for demos and tests.
pub mod scripted;
/// Streaming output events.
pub mod stream;

pub use backend::WorkerBackend;
pub use pool::WorkerPool;
pub use scripted::ScriptedBackend;
pub use stream::StreamEvent;
