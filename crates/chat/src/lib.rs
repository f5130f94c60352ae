#![deny(unsafe_code)]

//! Streaming chat client core.
//!
//! Provider stream events fold into a [`MessageAccumulator`]; a per-turn
//! [`TurnArbiter`] reduces every completion signal to at most one persisted
//! assistant message; [`ChatController`] is the surface a front end drives.

pub mod accumulator;
pub mod arbiter;
pub mod controller;
pub mod error;
pub mod extract;
pub mod message;
pub mod projector;
pub mod store;
pub mod title;
pub mod turn;

#[cfg(test)]
mod testing;

pub use accumulator::{AccumulatorState, ApplyOutcome, MessageAccumulator};
pub use arbiter::{
    Claim, CompletionSignal, FailureReason, PhaseRejection, PhaseTransition, TurnArbiter,
    TurnPhase,
};
pub use controller::{ChatConfig, ChatController, DEFAULT_STREAM_TIMEOUT, MAX_MESSAGE_LENGTH};
pub use error::{ChatError, ChatResult};
pub use extract::{EXTRACTION_ORDER, ExtractedContent, ExtractionRule, extract_final_content};
pub use message::{ChatState, ChatStatus, Message, MessageStatus, Part, PartKind, PartState, Role};
pub use projector::{DisplayProjector, RenderUnit, render_part};
pub use store::{ConversationStore, StorageAdapter, StoreError, StoreResult};
pub use title::{CONVERSATION_TITLE_LENGTH, generate_conversation_title};
pub use turn::{Finalization, Turn};

pub use murmur_llm::TurnId;
pub use murmur_storage::{ConversationId, ConversationRecord, MessageId, MessageRecord};
