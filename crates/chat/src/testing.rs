//! In-memory store and scripted provider for controller and turn tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use murmur_llm::{
    BoxFuture, LlmProvider, ProviderError, ProviderResult, ProviderStreamHandle, ProviderWorker,
    StreamEvent, StreamRequest, make_event_stream,
};
use murmur_storage::{
    ConversationId, ConversationRecord, MessageId, MessageRecord, MessageRole, StorageError,
};

use crate::message::Role;
use crate::store::{ConversationStore, StoreError, StoreResult};

#[derive(Default)]
struct MemoryState {
    conversations: Vec<ConversationRecord>,
    messages: Vec<MessageRecord>,
    assistant_inserts: usize,
    touches: usize,
    fail_assistant_appends: bool,
    fail_user_appends: bool,
    clock: u64,
}

impl MemoryState {
    fn tick(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        self.clock = now.max(self.clock + 1);
        self.clock
    }
}

/// Counting in-memory [`ConversationStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_conversation(&self, title: &str) -> ConversationId {
        let mut state = self.lock();
        let now = state.tick();
        let record = ConversationRecord {
            id: ConversationId::new_v7(),
            title: title.to_string(),
            created_at_unix_millis: now,
            updated_at_unix_millis: now,
        };
        let id = record.id;
        state.conversations.push(record);
        id
    }

    pub fn assistant_inserts(&self) -> usize {
        self.lock().assistant_inserts
    }

    pub fn touches(&self) -> usize {
        self.lock().touches
    }

    pub fn messages(&self, conversation_id: ConversationId) -> Vec<MessageRecord> {
        self.lock()
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn conversation_count(&self) -> usize {
        self.lock().conversations.len()
    }

    pub fn fail_assistant_appends(&self, fail: bool) {
        self.lock().fail_assistant_appends = fail;
    }

    pub fn fail_user_appends(&self, fail: bool) {
        self.lock().fail_user_appends = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store lock")
    }
}

fn injected_failure(stage: &'static str) -> StoreError {
    StoreError::Datastore {
        stage,
        source: StorageError::InvariantViolation {
            stage,
            details: "injected failure".to_string(),
        },
    }
}

fn missing_conversation(stage: &'static str, conversation_id: ConversationId) -> StoreError {
    StoreError::Datastore {
        stage,
        source: StorageError::NotFound {
            stage,
            entity: "conversation",
            id: conversation_id.to_string(),
        },
    }
}

impl ConversationStore for MemoryStore {
    fn create_conversation(&self, title: String) -> BoxFuture<'_, StoreResult<ConversationRecord>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            let mut state = self.lock();
            let now = state.tick();
            let record = ConversationRecord {
                id: ConversationId::new_v7(),
                title,
                created_at_unix_millis: now,
                updated_at_unix_millis: now,
            };
            state.conversations.push(record.clone());
            Ok(record)
        })
    }

    fn append_message(
        &self,
        conversation_id: ConversationId,
        role: Role,
        content: String,
    ) -> BoxFuture<'_, StoreResult<MessageRecord>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            let mut state = self.lock();
            let fail = match role {
                Role::User => state.fail_user_appends,
                Role::Assistant => state.fail_assistant_appends,
            };
            if fail {
                return Err(injected_failure("memory-append"));
            }
            if !state
                .conversations
                .iter()
                .any(|conversation| conversation.id == conversation_id)
            {
                return Err(missing_conversation("memory-append", conversation_id));
            }

            let now = state.tick();
            let seq = state
                .messages
                .iter()
                .filter(|message| message.conversation_id == conversation_id)
                .count() as u64
                + 1;
            let record = MessageRecord {
                id: MessageId::new_v7(),
                conversation_id,
                seq,
                role: MessageRole::from(role),
                content,
                created_at_unix_millis: now,
            };
            if role == Role::Assistant {
                state.assistant_inserts += 1;
            }
            state.messages.push(record.clone());
            Ok(record)
        })
    }

    fn touch_conversation(&self, conversation_id: ConversationId) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            let mut state = self.lock();
            let now = state.tick();
            let Some(conversation) = state
                .conversations
                .iter_mut()
                .find(|conversation| conversation.id == conversation_id)
            else {
                return Err(missing_conversation("memory-touch", conversation_id));
            };
            conversation.updated_at_unix_millis = now;
            state.touches += 1;
            Ok(())
        })
    }

    fn list_conversations(&self) -> BoxFuture<'_, StoreResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let mut conversations = self.lock().conversations.clone();
            conversations.sort_by(|left, right| {
                right.updated_at_unix_millis.cmp(&left.updated_at_unix_millis)
            });
            Ok(conversations)
        })
    }

    fn load_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StoreResult<Vec<MessageRecord>>> {
        Box::pin(async move { Ok(self.messages(conversation_id)) })
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let mut state = self.lock();
            state
                .conversations
                .retain(|conversation| conversation.id != conversation_id);
            state
                .messages
                .retain(|message| message.conversation_id != conversation_id);
            Ok(())
        })
    }

    fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.lock().messages.retain(|message| {
                !(message.conversation_id == conversation_id && message.id == message_id)
            });
            Ok(())
        })
    }
}

/// One step of a scripted provider stream.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Emit(StreamEvent),
    /// Stop emitting and wait for cancellation.
    Hang,
}

impl ScriptStep {
    pub fn text(delta: &str) -> Self {
        Self::Emit(StreamEvent::TextDelta(delta.to_string()))
    }

    pub fn done(full_text: Option<&str>) -> Self {
        Self::Emit(StreamEvent::Done(murmur_llm::FinishSummary {
            full_text: full_text.map(str::to_owned),
        }))
    }
}

/// Provider that replays queued scripts, one per `stream_chat` call.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, steps: Vec<ScriptStep>) {
        self.scripts.lock().expect("scripts lock").push_back(steps);
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        let turn_id = request.turn_id;
        self.requests
            .lock()
            .expect("requests lock")
            .push(request);
        let Some(steps) = self.scripts.lock().expect("scripts lock").pop_front() else {
            return Err(ProviderError::UnsupportedProvider {
                stage: "scripted-stream",
                provider_id: "scripted".to_string(),
            });
        };

        let (events, stream, cancel_rx) = make_event_stream(turn_id);
        let worker: ProviderWorker = Box::pin(async move {
            for step in steps {
                match step {
                    ScriptStep::Emit(event) => {
                        if !events.send(event) {
                            return;
                        }
                        tokio::task::yield_now().await;
                    }
                    ScriptStep::Hang => {
                        let _ = cancel_rx.await;
                        return;
                    }
                }
            }
        });

        Ok(ProviderStreamHandle { stream, worker })
    }
}
