use crate::backend::WorkerBackend;
use crate::stream::StreamEvent;
use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult, Message};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A deterministic backend that streams a canned response in fixed-size
/// chunks, optionally failing the first N calls.
///
/// Used by the demo CLI and by tests that need a worker with predictable
/// output and failure behavior.
pub struct ScriptedBackend {
    response: String,
    chunk_size: usize,
    chunk_delay_ms: u64,
    fail_first: AtomicU32,
    calls: AtomicU32,
}

impl ScriptedBackend {
    /// Create a backend that answers every call with `response`.
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            chunk_size: 16,
            chunk_delay_ms: 0,
            fail_first: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// Stream the response in chunks of `size` characters.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Sleep between chunks to simulate a slow worker.
    pub fn with_chunk_delay_ms(mut self, delay: u64) -> Self {
        self.chunk_delay_ms = delay;
        self
    }

    /// Fail the first `n` calls with a worker error before succeeding.
    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = AtomicU32::new(n);
        self
    }

    /// Total calls received so far (streaming and non-streaming).
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> MaestroResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.fetch_sub(1, Ordering::SeqCst);
            return Err(MaestroError::Worker("scripted failure".into()));
        }
        Ok(())
    }

    fn chunks(&self) -> Vec<String> {
        self.response
            .chars()
            .collect::<Vec<_>>()
            .chunks(self.chunk_size)
            .map(|c| c.iter().collect())
            .collect()
    }
}

#[async_trait]
impl WorkerBackend for ScriptedBackend {
    async fn chat(&self, _messages: &[Message]) -> MaestroResult<String> {
        self.check_failure()?;
        Ok(self.response.clone())
    }

    async fn chat_stream(
        &self,
        _messages: &[Message],
    ) -> MaestroResult<(
        mpsc::Receiver<StreamEvent>,
        JoinHandle<MaestroResult<String>>,
    )> {
        self.check_failure()?;

        let chunks = self.chunks();
        let full = self.response.clone();
        let delay = self.chunk_delay_ms;

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(async move {
            for chunk in chunks {
                if delay > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                if tx.send(StreamEvent::TextDelta { text: chunk }).await.is_err() {
                    // Receiver dropped (cancellation); stop streaming.
                    return Ok(full);
                }
            }
            let _ = tx.send(StreamEvent::Done).await;
            Ok(full)
        });

        Ok((rx, handle))
    }
}
