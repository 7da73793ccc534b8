use crate::stream::StreamEvent;
use async_trait::async_trait;
use maestro_core::{MaestroResult, Message};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Trait for worker backends.
///
/// The engine treats this capability as opaque: it must tolerate arbitrary
/// latency, partial output, and hard failures. Implementations are free to
/// call an LLM API, shell out, or answer from a script.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Non-streaming completion. Used for collaboration message delivery and
    /// report summarization, where incremental output adds nothing.
    async fn chat(&self, messages: &[Message]) -> MaestroResult<String>;

    /// Streaming completion.
    ///
    /// Returns a receiver for stream events and a join handle that resolves
    /// to the final aggregated text. The receiver closing without a
    /// [`StreamEvent::Done`] is treated the same as `Done`; the join handle
    /// carries the authoritative result.
    async fn chat_stream(
        &self,
        messages: &[Message],
    ) -> MaestroResult<(
        mpsc::Receiver<StreamEvent>,
        JoinHandle<MaestroResult<String>>,
    )>;
}
