use serde::{Deserialize, Serialize};

/// Events emitted during a streaming worker response.
///
/// These let consumers (the executor, a transport layer) receive partial
/// results as they are produced, enabling real-time progress display without
/// waiting for the full result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A chunk of text output.
    TextDelta {
        /// The incremental text.
        text: String,
    },

    /// The stream has finished successfully.
    Done,

    /// An error occurred during streaming.
    Error {
        /// The error description.
        message: String,
    },
}
