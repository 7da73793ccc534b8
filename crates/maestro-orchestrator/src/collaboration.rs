use crate::config::EngineConfig;
use chrono::{DateTime, Utc};
use maestro_agent::WorkerPool;
use maestro_core::event::now_ms;
use maestro_core::{
    CollaborationEvent, CollaborationMessage, CollaborationSession, ConversationRecord,
    EngineEvent, MaestroError, MaestroResult, Message, MessageKind, SessionStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A request to send one collaboration message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    /// Sending worker.
    pub from: Uuid,
    /// Receiving worker.
    pub to: Uuid,
    /// Message kind.
    pub kind: MessageKind,
    /// Message body.
    pub content: String,
    /// The task this conversation belongs to, if any.
    #[serde(default)]
    pub task_id: Option<Uuid>,
    /// The sub-task context, if any.
    #[serde(default)]
    pub sub_task_id: Option<Uuid>,
    /// Whether the sender expects a reply.
    #[serde(default)]
    pub require_response: bool,
    /// Whether the message is urgent.
    #[serde(default)]
    pub urgent: bool,
    /// The message this one replies to, if any.
    #[serde(default)]
    pub parent_message_id: Option<Uuid>,
}

impl SendRequest {
    /// A plain message with everything else defaulted.
    pub fn new(from: Uuid, to: Uuid, kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            from,
            to,
            kind,
            content: content.into(),
            task_id: None,
            sub_task_id: None,
            require_response: false,
            urgent: false,
            parent_message_id: None,
        }
    }

    /// Scope the conversation to a task.
    pub fn for_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Flag that the sender expects a reply.
    pub fn requiring_response(mut self) -> Self {
        self.require_response = true;
        self
    }
}

/// Summary counters for the collaboration layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationOverview {
    /// Sessions currently active.
    pub active_sessions: usize,
    /// Messages across all live sessions.
    pub total_messages: usize,
    /// Messages still awaiting a reply.
    pub pending_responses: usize,
    /// Last activity per worker.
    pub last_activity: HashMap<Uuid, DateTime<Utc>>,
}

/// Peer-to-peer and broadcast messaging between workers.
///
/// Sessions are created lazily on the first message between two workers for
/// a task. Delivery invokes the target worker's backend with a constructed
/// context block; when the sender required a response and the delivery
/// produced output, that output is scheduled as an automatic reply: the
/// addressee's own processing becomes the answer.
pub struct CollaborationBus {
    pool: Arc<WorkerPool>,
    sessions: RwLock<HashMap<Uuid, CollaborationSession>>,
    by_participant: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    records: RwLock<Vec<ConversationRecord>>,
    reply_delay_ms: u64,
    purge_after_ms: u64,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl CollaborationBus {
    /// Create a bus over the given pool.
    pub fn new(
        config: &EngineConfig,
        pool: Arc<WorkerPool>,
        event_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            sessions: RwLock::new(HashMap::new()),
            by_participant: RwLock::new(HashMap::new()),
            records: RwLock::new(Vec::new()),
            reply_delay_ms: config.reply_delay_ms,
            purge_after_ms: config.session_purge_ms,
            event_tx,
        })
    }

    /// Send a message from one worker to another.
    ///
    /// Resolves or creates the active session shared by the two participants
    /// for the task, records the message, and delivers it through the
    /// target's backend. Returns the recorded message.
    pub async fn send(self: &Arc<Self>, request: SendRequest) -> MaestroResult<CollaborationMessage> {
        let sender = self
            .pool
            .get(request.from)
            .await
            .ok_or_else(|| MaestroError::Collaboration(format!("unknown sender {}", request.from)))?;
        let receiver = self
            .pool
            .get(request.to)
            .await
            .ok_or_else(|| MaestroError::Collaboration(format!("unknown receiver {}", request.to)))?;

        let session_id = self
            .resolve_session(request.from, request.to, request.task_id)
            .await;

        let message = CollaborationMessage {
            id: Uuid::new_v4(),
            kind: request.kind,
            from: request.from,
            to: request.to,
            content: request.content.clone(),
            parent_message_id: request.parent_message_id,
            urgent: request.urgent,
            requires_response: request.require_response,
            timestamp: Utc::now(),
        };
        let message_id = message.id;

        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(&session_id) {
                session.push(message.clone());
            }
        }
        self.emit(CollaborationEvent::MessageSent {
            timestamp: now_ms(),
            session_id,
            message_id,
            from: request.from,
            to: request.to,
            kind: request.kind,
        });
        debug!(
            session_id = %session_id,
            from = %sender.name,
            to = %receiver.name,
            kind = %request.kind,
            "Collaboration message recorded"
        );

        // Deliver through the target's backend with the full context block.
        let backend = self.pool.backend(request.to).await.ok_or_else(|| {
            MaestroError::Collaboration(format!("no backend for worker {}", request.to))
        })?;
        let context = build_context_block(&sender.name, &receiver.name, &request, &message);
        let output = backend.chat(&[Message::user(context)]).await?;

        self.emit(CollaborationEvent::MessageReceived {
            timestamp: now_ms(),
            session_id,
            message_id,
            to: request.to,
        });

        // The addressee's processing becomes the reply.
        if request.require_response && !output.trim().is_empty() {
            let bus = Arc::clone(self);
            let reply = SendRequest {
                from: request.to,
                to: request.from,
                kind: MessageKind::Answer,
                content: output,
                task_id: request.task_id,
                sub_task_id: request.sub_task_id,
                require_response: false,
                urgent: false,
                parent_message_id: Some(message_id),
            };
            let delay = Duration::from_millis(self.reply_delay_ms);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // The recursive call is routed through `send_boxed`, whose
                // explicit `+ Send` return type breaks the auto-trait inference
                // cycle (`send` spawns a task that calls `send`).
                if let Err(e) = send_boxed(bus, reply).await {
                    warn!(error = %e, "Automatic reply failed");
                }
            });
        }

        Ok(message)
    }

    /// Fan a message out to every recipient except the sender.
    ///
    /// Partial failures are collected and returned alongside the messages
    /// that did go through; one bad recipient never aborts the broadcast.
    pub async fn broadcast(
        self: &Arc<Self>,
        from: Uuid,
        recipients: &[Uuid],
        kind: MessageKind,
        content: &str,
        task_id: Option<Uuid>,
    ) -> (Vec<CollaborationMessage>, Vec<MaestroError>) {
        let mut sent = Vec::new();
        let mut errors = Vec::new();
        for &to in recipients {
            if to == from {
                continue;
            }
            let mut request = SendRequest::new(from, to, kind, content);
            request.task_id = task_id;
            match self.send(request).await {
                Ok(message) => sent.push(message),
                Err(e) => {
                    warn!(to = %to, error = %e, "Broadcast delivery failed");
                    errors.push(e);
                }
            }
        }
        (sent, errors)
    }

    /// Close a session.
    ///
    /// Marks it closed, optionally snapshots an immutable conversation record
    /// with a generated one-line summary, removes it from the participants'
    /// active-session indexes, and schedules the live object for purge after
    /// a bounded grace period. The archival record persists.
    pub async fn close(
        self: &Arc<Self>,
        session_id: Uuid,
        save_record: bool,
    ) -> MaestroResult<Option<ConversationRecord>> {
        let (record, message_count) = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(&session_id).ok_or_else(|| {
                MaestroError::Collaboration(format!("unknown session {session_id}"))
            })?;
            if session.status == SessionStatus::Closed {
                return Err(MaestroError::Collaboration(format!(
                    "session {session_id} already closed"
                )));
            }
            session.status = SessionStatus::Closed;
            let message_count = session.messages.len();

            let record = if save_record {
                let mut names = Vec::new();
                for participant in &session.participants {
                    if let Some(worker) = self.pool.get(*participant).await {
                        names.push(worker.name);
                    }
                }
                Some(ConversationRecord {
                    session_id,
                    task_id: session.task_id,
                    participant_names: names.clone(),
                    messages: session.messages.clone(),
                    summary: summarize_session(session, &names),
                    closed_at: Utc::now(),
                })
            } else {
                None
            };
            (record, message_count)
        };

        {
            let mut index = self.by_participant.write().await;
            for set in index.values_mut() {
                set.remove(&session_id);
            }
        }

        if let Some(ref record) = record {
            self.records.write().await.push(record.clone());
        }

        self.emit(CollaborationEvent::SessionClosed {
            timestamp: now_ms(),
            session_id,
            message_count,
        });
        info!(session_id = %session_id, message_count, "Session closed");

        // The live object lingers for a grace period, then is purged; only
        // the archival record survives.
        let bus = Arc::clone(self);
        let grace = Duration::from_millis(self.purge_after_ms);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            bus.sessions.write().await.remove(&session_id);
            debug!(session_id = %session_id, "Closed session purged");
        });

        Ok(record)
    }

    /// Messages still awaiting a reply: flagged `requires_response` with no
    /// message in the same session pointing back at them.
    pub async fn pending_responses(&self) -> Vec<CollaborationMessage> {
        let sessions = self.sessions.read().await;
        let mut pending = Vec::new();
        for session in sessions.values() {
            for message in &session.messages {
                if message.requires_response && !session.has_reply(message.id) {
                    pending.push(message.clone());
                }
            }
        }
        pending.sort_by_key(|m| m.timestamp);
        pending
    }

    /// Message history between two workers, across all live sessions.
    pub async fn history(&self, a: Uuid, b: Uuid) -> Vec<CollaborationMessage> {
        let sessions = self.sessions.read().await;
        let mut history: Vec<CollaborationMessage> = sessions
            .values()
            .filter(|s| s.participants.contains(&a) && s.participants.contains(&b))
            .flat_map(|s| s.messages.iter().cloned())
            .collect();
        history.sort_by_key(|m| m.timestamp);
        history
    }

    /// Archived conversation records.
    pub async fn archived(&self) -> Vec<ConversationRecord> {
        self.records.read().await.clone()
    }

    /// A snapshot of a live session.
    pub async fn session(&self, session_id: Uuid) -> Option<CollaborationSession> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// Active session count, message totals, pending responses, and
    /// per-worker last activity.
    pub async fn overview(&self) -> CollaborationOverview {
        let sessions = self.sessions.read().await;
        let mut total_messages = 0;
        let mut pending_responses = 0;
        let mut last_activity: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
        let mut active_sessions = 0;

        for session in sessions.values() {
            if session.status == SessionStatus::Active {
                active_sessions += 1;
            }
            total_messages += session.messages.len();
            for message in &session.messages {
                if message.requires_response && !session.has_reply(message.id) {
                    pending_responses += 1;
                }
                let entry = last_activity.entry(message.from).or_insert(message.timestamp);
                if message.timestamp > *entry {
                    *entry = message.timestamp;
                }
            }
        }

        CollaborationOverview {
            active_sessions,
            total_messages,
            pending_responses,
            last_activity,
        }
    }

    /// Find the active session shared by both participants for the task, or
    /// create one.
    async fn resolve_session(&self, a: Uuid, b: Uuid, task_id: Option<Uuid>) -> Uuid {
        // Find-or-create under the write lock, so two concurrent first
        // messages cannot race into duplicate sessions.
        let session_id = {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.values().find(|s| {
                s.status == SessionStatus::Active
                    && s.task_id == task_id
                    && s.participants.contains(&a)
                    && s.participants.contains(&b)
            }) {
                return session.id;
            }
            let session = CollaborationSession::new(task_id, vec![a, b]);
            let session_id = session.id;
            sessions.insert(session_id, session);
            session_id
        };
        {
            let mut index = self.by_participant.write().await;
            index.entry(a).or_default().insert(session_id);
            index.entry(b).or_default().insert(session_id);
        }
        self.emit(CollaborationEvent::SessionCreated {
            timestamp: now_ms(),
            session_id,
            task_id,
            participants: vec![a, b],
        });
        info!(session_id = %session_id, "Collaboration session created");
        session_id
    }

    fn emit(&self, event: CollaborationEvent) {
        let _ = self.event_tx.send(EngineEvent::Collaboration(event));
    }
}

/// Recursive-call shim for [`CollaborationBus::send`].
///
/// The explicit `+ Send` return type is taken as an assumption at the call
/// site, which breaks the auto-trait inference cycle created by `send`
/// spawning a task that calls `send` again.
fn send_boxed(
    bus: Arc<CollaborationBus>,
    request: SendRequest,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = MaestroResult<CollaborationMessage>> + Send>,
> {
    Box::pin(async move { bus.send(request).await })
}

/// Render the context block handed to the receiving worker's backend.
fn build_context_block(
    sender_name: &str,
    receiver_name: &str,
    request: &SendRequest,
    message: &CollaborationMessage,
) -> String {
    let mut block = format!(
        "[collaboration message]\nfrom: {sender_name}\nto: {receiver_name}\nkind: {}\nsent_at: {}",
        request.kind,
        message.timestamp.to_rfc3339(),
    );
    if let Some(task_id) = request.task_id {
        block.push_str(&format!("\ntask: {task_id}"));
    }
    if let Some(sub_task_id) = request.sub_task_id {
        block.push_str(&format!("\nsub_task: {sub_task_id}"));
    }
    if request.require_response {
        block.push_str("\nneeds_response: yes");
    }
    if request.urgent {
        block.push_str("\nurgent: yes");
    }
    block.push_str("\n\n");
    block.push_str(&request.content);
    block
}

/// One-line summary recorded when a session is archived.
fn summarize_session(session: &CollaborationSession, names: &[String]) -> String {
    let kinds: HashSet<String> = session
        .messages
        .iter()
        .map(|m| m.kind.to_string())
        .collect();
    let mut kinds: Vec<String> = kinds.into_iter().collect();
    kinds.sort();
    let duration_secs = (session.last_activity - session.created_at).num_seconds();
    format!(
        "{} exchanged {} messages ({}) over {}s",
        names.join(" and "),
        session.messages.len(),
        kinds.join(", "),
        duration_secs
    )
}
