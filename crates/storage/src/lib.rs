pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId};
pub use sqlite::SqliteStorage;
pub use types::{
    ConversationRecord, DEFAULT_CONVERSATION_TITLE, MessageRecord, MessageRole, NewConversation,
    NewMessage,
};

pub trait ConversationRepo: Send + Sync {
    fn create_conversation(&self, input: NewConversation) -> StorageResult<ConversationRecord>;
    /// Newest first by `updated_at`.
    fn list_conversations(&self) -> StorageResult<Vec<ConversationRecord>>;
    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<ConversationRecord>>;
    /// Advances `updated_at`; the stored value never moves backwards.
    fn touch_conversation(&self, conversation_id: ConversationId)
    -> StorageResult<ConversationRecord>;
    fn delete_conversation(&self, conversation_id: ConversationId) -> StorageResult<()>;
}

pub trait MessageRepo: Send + Sync {
    fn append_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord>;
    /// Oldest first by `created_at`, ties broken by insertion sequence.
    fn list_messages(&self, conversation_id: ConversationId) -> StorageResult<Vec<MessageRecord>>;
    fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> StorageResult<()>;
}

pub trait Storage: ConversationRepo + MessageRepo {}

impl<T> Storage for T where T: ConversationRepo + MessageRepo {}
