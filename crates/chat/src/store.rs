use std::sync::Arc;

use murmur_llm::BoxFuture;
use murmur_storage::{
    ConversationId, ConversationRecord, MessageId, MessageRecord, NewConversation, NewMessage,
    Storage, StorageError, StorageResult,
};
use snafu::{ResultExt, Snafu};

use crate::message::Role;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("datastore call failed on `{stage}`, {source}"))]
    Datastore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("datastore worker failed on `{stage}`, {source}"))]
    Worker {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
}

/// Async persistence seam used by the chat core.
///
/// Implementations own conversation timestamps and message ordering; deleting a
/// conversation removes its messages.
pub trait ConversationStore: Send + Sync {
    fn create_conversation(&self, title: String) -> BoxFuture<'_, StoreResult<ConversationRecord>>;

    fn append_message(
        &self,
        conversation_id: ConversationId,
        role: Role,
        content: String,
    ) -> BoxFuture<'_, StoreResult<MessageRecord>>;

    fn touch_conversation(&self, conversation_id: ConversationId) -> BoxFuture<'_, StoreResult<()>>;

    /// Most recently updated first.
    fn list_conversations(&self) -> BoxFuture<'_, StoreResult<Vec<ConversationRecord>>>;

    /// Oldest first.
    fn load_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StoreResult<Vec<MessageRecord>>>;

    fn delete_conversation(&self, conversation_id: ConversationId)
    -> BoxFuture<'_, StoreResult<()>>;

    fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StoreResult<()>>;
}

/// Runs the blocking storage repos on tokio's blocking pool.
pub struct StorageAdapter<S> {
    storage: Arc<S>,
}

impl<S> StorageAdapter<S>
where
    S: Storage + 'static,
{
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    fn call<T, F>(&self, stage: &'static str, op: F) -> BoxFuture<'static, StoreResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> StorageResult<T> + Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        Box::pin(async move {
            let result = tokio::task::spawn_blocking(move || op(&storage))
                .await
                .context(WorkerSnafu { stage })?;
            result.context(DatastoreSnafu { stage })
        })
    }
}

impl<S> ConversationStore for StorageAdapter<S>
where
    S: Storage + 'static,
{
    fn create_conversation(&self, title: String) -> BoxFuture<'_, StoreResult<ConversationRecord>> {
        self.call("create-conversation", move |storage| {
            storage.create_conversation(NewConversation { title })
        })
    }

    fn append_message(
        &self,
        conversation_id: ConversationId,
        role: Role,
        content: String,
    ) -> BoxFuture<'_, StoreResult<MessageRecord>> {
        self.call("append-message", move |storage| {
            storage.append_message(conversation_id, NewMessage::new(role.into(), content))
        })
    }

    fn touch_conversation(&self, conversation_id: ConversationId) -> BoxFuture<'_, StoreResult<()>> {
        self.call("touch-conversation", move |storage| {
            storage.touch_conversation(conversation_id).map(|_| ())
        })
    }

    fn list_conversations(&self) -> BoxFuture<'_, StoreResult<Vec<ConversationRecord>>> {
        self.call("list-conversations", |storage| storage.list_conversations())
    }

    fn load_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StoreResult<Vec<MessageRecord>>> {
        self.call("load-messages", move |storage| {
            storage.list_messages(conversation_id)
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StoreResult<()>> {
        self.call("delete-conversation", move |storage| {
            storage.delete_conversation(conversation_id)
        })
    }

    fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StoreResult<()>> {
        self.call("delete-message", move |storage| {
            storage.delete_message(conversation_id, message_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use murmur_storage::{MessageRole, SqliteStorage};

    use super::*;

    async fn open_adapter() -> (tempfile::TempDir, StorageAdapter<SqliteStorage>) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("chat.db");
        let storage = SqliteStorage::open(path.to_str().expect("utf-8 path"))
            .await
            .expect("open storage");
        (temp_dir, StorageAdapter::new(Arc::new(storage)))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn messages_round_trip_through_the_adapter() {
        let (_temp_dir, store) = open_adapter().await;
        let conversation = store
            .create_conversation("Greetings".to_string())
            .await
            .expect("create");

        store
            .append_message(conversation.id, Role::User, "hi".to_string())
            .await
            .expect("user message");
        store
            .append_message(conversation.id, Role::Assistant, "hello".to_string())
            .await
            .expect("assistant message");
        store
            .touch_conversation(conversation.id)
            .await
            .expect("touch");

        let messages = store.load_messages(conversation.id).await.expect("load");
        let roles = messages.iter().map(|message| message.role).collect::<Vec<_>>();
        assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
        assert_eq!(messages[1].content, "hello");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn storage_failures_surface_as_datastore_errors() {
        let (_temp_dir, store) = open_adapter().await;

        let error = store
            .append_message(ConversationId::new_v7(), Role::User, "orphan".to_string())
            .await
            .expect_err("missing conversation");

        assert!(matches!(
            error,
            StoreError::Datastore {
                source: StorageError::NotFound { .. },
                ..
            }
        ));
    }
}
