use murmur_llm::{FileRef, SourceRef, TurnId};
use murmur_storage::{ConversationId, MessageId, MessageRecord, MessageRole};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

impl From<MessageRole> for Role {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::User => Self::User,
            MessageRole::Assistant => Self::Assistant,
        }
    }
}

impl From<Role> for MessageRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

/// Whether a part may still grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PartState {
    #[default]
    Streaming,
    Done,
}

/// Discriminant of [`Part`], used for contiguity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartKind {
    Text,
    Reasoning,
    File,
    SourceUrl,
    SourceDocument,
}

/// A typed, ordered fragment of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text {
        text: String,
        state: PartState,
    },
    Reasoning {
        text: String,
        state: PartState,
    },
    File {
        media_type: String,
        url: String,
        filename: Option<String>,
    },
    SourceUrl {
        source_id: String,
        url: String,
        title: Option<String>,
    },
    SourceDocument {
        source_id: String,
        media_type: String,
        title: String,
        filename: Option<String>,
    },
}

impl Part {
    pub fn text(text: impl Into<String>, state: PartState) -> Self {
        Self::Text {
            text: text.into(),
            state,
        }
    }

    pub fn reasoning(text: impl Into<String>, state: PartState) -> Self {
        Self::Reasoning {
            text: text.into(),
            state,
        }
    }

    pub fn kind(&self) -> PartKind {
        match self {
            Self::Text { .. } => PartKind::Text,
            Self::Reasoning { .. } => PartKind::Reasoning,
            Self::File { .. } => PartKind::File,
            Self::SourceUrl { .. } => PartKind::SourceUrl,
            Self::SourceDocument { .. } => PartKind::SourceDocument,
        }
    }

    /// Attachments and citations are born closed; only text-like parts stream.
    pub fn state(&self) -> PartState {
        match self {
            Self::Text { state, .. } | Self::Reasoning { state, .. } => *state,
            Self::File { .. } | Self::SourceUrl { .. } | Self::SourceDocument { .. } => {
                PartState::Done
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.state() == PartState::Done
    }

    pub(crate) fn close(&mut self) {
        if let Self::Text { state, .. } | Self::Reasoning { state, .. } = self {
            *state = PartState::Done;
        }
    }

    pub(crate) fn push_text(&mut self, delta: &str) {
        if let Self::Text { text, .. } | Self::Reasoning { text, .. } = self {
            text.push_str(delta);
        }
    }

    /// Body of a `Text` part; `None` for every other kind.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } => Some(text),
            _ => None,
        }
    }
}

impl From<FileRef> for Part {
    fn from(file: FileRef) -> Self {
        Self::File {
            media_type: file.media_type,
            url: file.url,
            filename: file.filename,
        }
    }
}

impl From<SourceRef> for Part {
    fn from(source: SourceRef) -> Self {
        match source {
            SourceRef::Url {
                source_id,
                url,
                title,
            } => Self::SourceUrl {
                source_id,
                url,
                title,
            },
            SourceRef::Document {
                source_id,
                media_type,
                title,
                filename,
            } => Self::SourceDocument {
                source_id,
                media_type,
                title,
                filename,
            },
        }
    }
}

/// Lifecycle status for one displayed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    /// User message shown before the datastore confirmed it.
    Pending,
    Streaming(TurnId),
    Done,
    Failed(String),
    Cancelled,
    /// Shown in the UI but the datastore rejected it.
    Unsaved(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Datastore id once persisted.
    pub id: Option<MessageId>,
    pub role: Role,
    pub parts: Vec<Part>,
    pub status: MessageStatus,
}

impl Message {
    pub fn user_pending(content: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::User,
            parts: vec![Part::text(content, PartState::Done)],
            status: MessageStatus::Pending,
        }
    }

    pub fn assistant_streaming(turn_id: TurnId) -> Self {
        Self {
            id: None,
            role: Role::Assistant,
            parts: Vec::new(),
            status: MessageStatus::Streaming(turn_id),
        }
    }

    pub fn from_record(record: MessageRecord) -> Self {
        Self {
            id: Some(record.id),
            role: record.role.into(),
            parts: vec![Part::text(record.content, PartState::Done)],
            status: MessageStatus::Done,
        }
    }

    /// Concatenated body of every text part.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }

    pub fn streaming_turn(&self) -> Option<TurnId> {
        match self.status {
            MessageStatus::Streaming(turn_id) => Some(turn_id),
            _ => None,
        }
    }
}

/// Request status as observed by a front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChatStatus {
    #[default]
    Idle,
    Submitted,
    Streaming,
    Ready,
    Error,
}

/// Observable chat state published by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatState {
    /// `None` until the first send creates the conversation.
    pub conversation_id: Option<ConversationId>,
    pub messages: Vec<Message>,
    pub status: ChatStatus,
    /// Turn that has been submitted but not yet settled.
    pub pending_turn: Option<TurnId>,
    pub error: Option<String>,
}

impl ChatState {
    pub fn is_settled(&self) -> bool {
        self.pending_turn.is_none()
    }

    pub(crate) fn message_for_turn_mut(&mut self, turn_id: TurnId) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .rev()
            .find(|message| message.streaming_turn() == Some(turn_id))
    }
}
