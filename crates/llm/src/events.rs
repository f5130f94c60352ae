/// Identifier for one assistant turn's generation.
///
/// Changes on every submit and regenerate so late chunks from an abandoned
/// stream can be told apart from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl TurnId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "turn-{}", self.0)
    }
}

/// File attachment emitted by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub media_type: String,
    pub url: String,
    pub filename: Option<String>,
}

/// Citation emitted by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Url {
        source_id: String,
        url: String,
        title: Option<String>,
    },
    Document {
        source_id: String,
        media_type: String,
        title: String,
        filename: Option<String>,
    },
}

/// Summary carried by the terminal `Done` event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FinishSummary {
    /// The provider's own concatenation of every text delta, when it reports one.
    pub full_text: Option<String>,
}

/// Provider-agnostic stream payload, delivered in arrival order.
///
/// A well-formed stream ends with exactly one `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    TextDelta(String),
    ReasoningDelta(String),
    File(FileRef),
    Source(SourceRef),
    Done(FinishSummary),
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error(_))
    }
}

/// One stream event tagged with the turn it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub turn_id: TurnId,
    pub event: StreamEvent,
}

impl StreamEventMapped {
    pub fn new(turn_id: TurnId, event: StreamEvent) -> Self {
        Self { turn_id, event }
    }
}
