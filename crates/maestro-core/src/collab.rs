use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of a collaboration message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A request for information from a peer.
    Question,
    /// A reply to a question.
    Answer,
    /// An unsolicited proposal.
    Suggestion,
    /// A one-way informational message.
    Notification,
    /// Transfer of responsibility for a piece of work.
    Handoff,
    /// A request to disambiguate earlier content.
    Clarification,
    /// A message raising a problem beyond the sender's authority.
    Escalation,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::Question => "question",
            MessageKind::Answer => "answer",
            MessageKind::Suggestion => "suggestion",
            MessageKind::Notification => "notification",
            MessageKind::Handoff => "handoff",
            MessageKind::Clarification => "clarification",
            MessageKind::Escalation => "escalation",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle state of a collaboration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepting messages.
    Active,
    /// Temporarily suspended.
    Paused,
    /// Closed; retained only until purged, with an archival record.
    Closed,
}

/// A single message between two workers. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationMessage {
    /// Unique identifier.
    pub id: Uuid,
    /// Message kind.
    pub kind: MessageKind,
    /// Sending worker.
    pub from: Uuid,
    /// Receiving worker.
    pub to: Uuid,
    /// Message body.
    pub content: String,
    /// The message this one replies to, if any.
    pub parent_message_id: Option<Uuid>,
    /// Whether the sender flagged this as urgent.
    pub urgent: bool,
    /// Whether the sender expects a reply.
    pub requires_response: bool,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
}

/// A conversation between two or more workers, scoped to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationSession {
    /// Unique identifier.
    pub id: Uuid,
    /// The task this conversation belongs to, if any.
    pub task_id: Option<Uuid>,
    /// Participating workers.
    pub participants: Vec<Uuid>,
    /// Ordered message history.
    pub messages: Vec<CollaborationMessage>,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent message.
    pub last_activity: DateTime<Utc>,
}

impl CollaborationSession {
    /// Create a new active session between the given participants.
    pub fn new(task_id: Option<Uuid>, participants: Vec<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            participants,
            messages: Vec::new(),
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
        }
    }

    /// Append a message and bump the activity timestamp.
    pub fn push(&mut self, message: CollaborationMessage) {
        self.last_activity = message.timestamp;
        self.messages.push(message);
    }

    /// Whether a reply to the given message exists in this session.
    ///
    /// A reply is any message whose `parent_message_id` points at it.
    pub fn has_reply(&self, message_id: Uuid) -> bool {
        self.messages
            .iter()
            .any(|m| m.parent_message_id == Some(message_id))
    }
}

/// Immutable archival snapshot of a closed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// The id of the session this record was taken from.
    pub session_id: Uuid,
    /// The task the conversation belonged to.
    pub task_id: Option<Uuid>,
    /// Participant display names at close time.
    pub participant_names: Vec<String>,
    /// The full message history.
    pub messages: Vec<CollaborationMessage>,
    /// Generated one-line summary.
    pub summary: String,
    /// When the record was taken.
    pub closed_at: DateTime<Utc>,
}
