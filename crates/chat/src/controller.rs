use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use murmur_llm::{
    DEFAULT_OPENAI_MODEL, LlmProvider, ProviderEventStream, ProviderMessage, Role as ProviderRole,
    StreamRequest, TurnId,
};
use murmur_storage::{ConversationId, ConversationRecord};
use snafu::{ResultExt, ensure};
use tokio::sync::{oneshot, watch};

use crate::accumulator::ApplyOutcome;
use crate::arbiter::{CompletionSignal, FailureReason};
use crate::error::{
    BusySnafu, ChatError, ChatResult, EmptyInputSnafu, InputTooLongSnafu, NothingToRegenerateSnafu,
    StoreSnafu,
};
use crate::message::{ChatState, ChatStatus, Message, MessageStatus, Role};
use crate::store::ConversationStore;
use crate::title::generate_conversation_title;
use crate::turn::{Finalization, Turn};

/// Longest accepted user message, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 4000;
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Generation parameters applied to every turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    pub model_id: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// Wall-clock ceiling for one provider stream.
    pub stream_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_OPENAI_MODEL.to_string(),
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
        }
    }
}

struct ActiveTurn {
    turn: Arc<Turn>,
    stop_tx: Option<oneshot::Sender<()>>,
}

struct ControllerInner {
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn LlmProvider>,
    config: ChatConfig,
    state: watch::Sender<ChatState>,
    active: Mutex<Option<ActiveTurn>>,
    next_turn_id: AtomicU64,
}

/// Front-end surface for one chat session.
///
/// Owns the observable [`ChatState`], at most one in-flight assistant turn,
/// and a background watcher that turns "status ready" into a completion signal.
#[derive(Clone)]
pub struct ChatController {
    inner: Arc<ControllerInner>,
}

impl ChatController {
    /// Must be called inside a tokio runtime.
    pub fn new(
        store: Arc<dyn ConversationStore>,
        provider: Arc<dyn LlmProvider>,
        config: ChatConfig,
    ) -> Self {
        let (state, state_rx) = watch::channel(ChatState::default());
        let inner = Arc::new(ControllerInner {
            store,
            provider,
            config,
            state,
            active: Mutex::new(None),
            next_turn_id: AtomicU64::new(1),
        });
        tokio::spawn(watch_ready_status(Arc::downgrade(&inner), state_rx));
        Self { inner }
    }

    pub fn state(&self) -> ChatState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.inner.state.subscribe()
    }

    /// Resolves once no turn is pending.
    pub async fn wait_until_settled(&self) -> ChatState {
        let mut state_rx = self.inner.state.subscribe();
        match state_rx.wait_for(ChatState::is_settled).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Persists the user message and starts streaming the assistant reply.
    ///
    /// The first send on a fresh session creates the conversation, titled from `text`.
    pub async fn send(&self, text: &str) -> ChatResult<TurnId> {
        let content = text.trim();
        ensure!(!content.is_empty(), EmptyInputSnafu { stage: "send" });
        let length = content.chars().count();
        ensure!(
            length <= MAX_MESSAGE_LENGTH,
            InputTooLongSnafu {
                stage: "send",
                length,
                limit: MAX_MESSAGE_LENGTH,
            }
        );

        let turn_id = self.inner.allocate_turn_id();
        self.inner.reserve(turn_id, "send")?;

        let existing = self.inner.state.borrow().conversation_id;
        let conversation_id = match existing {
            Some(conversation_id) => conversation_id,
            None => {
                let title = generate_conversation_title(content);
                match self.inner.store.create_conversation(title).await {
                    Ok(record) => {
                        tracing::info!(
                            conversation_id = %record.id,
                            title = %record.title,
                            "conversation created"
                        );
                        self.inner
                            .state
                            .send_modify(|state| state.conversation_id = Some(record.id));
                        record.id
                    }
                    Err(source) => {
                        tracing::error!(error = %source, "failed to create conversation");
                        self.inner
                            .release(turn_id, ChatStatus::Error, Some(source.to_string()));
                        return Err(source).context(StoreSnafu {
                            stage: "send-create-conversation",
                        });
                    }
                }
            }
        };

        self.inner
            .state
            .send_modify(|state| state.messages.push(Message::user_pending(content)));

        let record = match self
            .inner
            .store
            .append_message(conversation_id, Role::User, content.to_string())
            .await
        {
            Ok(record) => record,
            Err(source) => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %source,
                    "failed to persist user message"
                );
                let detail = source.to_string();
                self.inner.state.send_modify(|state| {
                    if let Some(message) = pending_user_message(state) {
                        message.status = MessageStatus::Unsaved(detail.clone());
                    }
                });
                self.inner.release(turn_id, ChatStatus::Error, Some(detail));
                return Err(source).context(StoreSnafu {
                    stage: "send-append-user",
                });
            }
        };

        self.inner.state.send_modify(|state| {
            if let Some(message) = pending_user_message(state) {
                message.id = Some(record.id);
                message.status = MessageStatus::Done;
            }
        });

        if let Err(error) = self.inner.store.touch_conversation(conversation_id).await {
            tracing::warn!(
                conversation_id = %conversation_id,
                error = %error,
                "user message saved but conversation recency was not updated"
            );
        }

        self.inner.start_turn(turn_id, conversation_id)
    }

    /// Cancels the in-flight turn. Returns false when there is nothing to
    /// stop or its reply is already being saved.
    pub fn stop(&self) -> bool {
        let stopped = {
            let mut active = self.inner.active();
            match active.as_mut() {
                Some(active_turn) if active_turn.turn.cancel() => {
                    if let Some(stop_tx) = active_turn.stop_tx.take() {
                        let _ = stop_tx.send(());
                    }
                    Some(Arc::clone(&active_turn.turn))
                }
                _ => None,
            }
        };

        let Some(turn) = stopped else {
            return false;
        };
        tracing::info!(turn_id = %turn.id(), "assistant turn stopped");
        self.inner.settle_failure(&turn, FailureReason::Cancelled);
        true
    }

    /// Drops the trailing assistant reply and generates a new one for the last user message.
    pub async fn regenerate_last(&self) -> ChatResult<TurnId> {
        self.inner.ensure_settled("regenerate")?;

        let (conversation_id, trailing_reply) = {
            let state = self.inner.state.borrow();
            let has_user_message = state
                .messages
                .iter()
                .any(|message| message.role == Role::User);
            let trailing_reply = state
                .messages
                .last()
                .filter(|message| message.role == Role::Assistant)
                .map(|message| message.id);
            (
                state.conversation_id.filter(|_| has_user_message),
                trailing_reply,
            )
        };
        let Some(conversation_id) = conversation_id else {
            return NothingToRegenerateSnafu {
                stage: "regenerate",
            }
            .fail();
        };

        let turn_id = self.inner.allocate_turn_id();
        self.inner.reserve(turn_id, "regenerate")?;

        if let Some(Some(message_id)) = trailing_reply
            && let Err(source) = self
                .inner
                .store
                .delete_message(conversation_id, message_id)
                .await
        {
            tracing::error!(
                conversation_id = %conversation_id,
                message_id = %message_id,
                error = %source,
                "failed to delete reply before regenerating"
            );
            self.inner
                .release(turn_id, ChatStatus::Error, Some(source.to_string()));
            return Err(source).context(StoreSnafu {
                stage: "regenerate-delete-reply",
            });
        }

        if trailing_reply.is_some() {
            self.inner.state.send_modify(|state| {
                if state
                    .messages
                    .last()
                    .is_some_and(|message| message.role == Role::Assistant)
                {
                    state.messages.pop();
                }
            });
        }

        self.inner.start_turn(turn_id, conversation_id)
    }

    /// Replaces the session with a stored conversation, discarding any in-flight turn.
    pub async fn select_conversation(&self, conversation_id: ConversationId) -> ChatResult<()> {
        self.stop();
        self.inner.ensure_settled("select-conversation")?;

        let records = match self.inner.store.load_messages(conversation_id).await {
            Ok(records) => records,
            Err(source) => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %source,
                    "failed to load conversation"
                );
                let detail = source.to_string();
                self.inner.state.send_modify(|state| {
                    state.status = ChatStatus::Error;
                    state.error = Some(detail);
                });
                return Err(source).context(StoreSnafu {
                    stage: "select-conversation",
                });
            }
        };

        let messages = records.into_iter().map(Message::from_record).collect();
        self.inner.state.send_replace(ChatState {
            conversation_id: Some(conversation_id),
            messages,
            ..ChatState::default()
        });
        Ok(())
    }

    /// Starts an empty session; the conversation is created by the next send.
    pub fn new_conversation(&self) -> ChatResult<()> {
        self.stop();
        self.inner.ensure_settled("new-conversation")?;
        self.inner.state.send_replace(ChatState::default());
        Ok(())
    }

    pub async fn list_conversations(&self) -> ChatResult<Vec<ConversationRecord>> {
        self.inner
            .store
            .list_conversations()
            .await
            .context(StoreSnafu {
                stage: "list-conversations",
            })
    }

    /// Deletes a conversation with its messages, resetting the session if it was open.
    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> ChatResult<()> {
        let is_current = self.inner.state.borrow().conversation_id == Some(conversation_id);
        if is_current {
            self.stop();
            self.inner.ensure_settled("delete-conversation")?;
        }

        self.inner
            .store
            .delete_conversation(conversation_id)
            .await
            .context(StoreSnafu {
                stage: "delete-conversation",
            })?;
        tracing::info!(conversation_id = %conversation_id, "conversation deleted");

        if is_current {
            self.inner.state.send_replace(ChatState::default());
        }
        Ok(())
    }

    /// Offers the poll completion signal to a turn whose stream has finished.
    ///
    /// Returns `None` when no finished turn is waiting to be saved.
    pub async fn poll_completion(&self) -> Option<Finalization> {
        let turn_id = {
            let state = self.inner.state.borrow();
            ready_assistant_turn(&state)
        }?;
        self.inner
            .finalize_turn(turn_id, CompletionSignal::Poll)
            .await
    }
}

impl ControllerInner {
    fn allocate_turn_id(&self) -> TurnId {
        TurnId::new(self.next_turn_id.fetch_add(1, Ordering::Relaxed))
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveTurn>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn active_turn(&self, turn_id: TurnId) -> Option<Arc<Turn>> {
        self.active()
            .as_ref()
            .filter(|active| active.turn.id() == turn_id)
            .map(|active| Arc::clone(&active.turn))
    }

    fn clear_active(&self, turn_id: TurnId) {
        let mut active = self.active();
        if active
            .as_ref()
            .is_some_and(|active| active.turn.id() == turn_id)
        {
            *active = None;
        }
    }

    fn ensure_settled(&self, stage: &'static str) -> ChatResult<()> {
        match self.state.borrow().pending_turn {
            Some(turn_id) => BusySnafu { stage, turn_id }.fail(),
            None => Ok(()),
        }
    }

    /// Marks `turn_id` pending, failing if another turn already is.
    fn reserve(&self, turn_id: TurnId, stage: &'static str) -> ChatResult<()> {
        let mut busy_with = None;
        self.state.send_if_modified(|state| {
            if let Some(pending) = state.pending_turn {
                busy_with = Some(pending);
                return false;
            }
            state.pending_turn = Some(turn_id);
            state.status = ChatStatus::Submitted;
            state.error = None;
            true
        });

        match busy_with {
            Some(pending) => BusySnafu {
                stage,
                turn_id: pending,
            }
            .fail(),
            None => Ok(()),
        }
    }

    fn release(&self, turn_id: TurnId, status: ChatStatus, error: Option<String>) {
        self.state.send_if_modified(|state| {
            if state.pending_turn != Some(turn_id) {
                return false;
            }
            state.pending_turn = None;
            state.status = status;
            state.error = error;
            true
        });
    }

    fn build_request(&self, turn_id: TurnId, history: Vec<ProviderMessage>) -> StreamRequest {
        let mut request = StreamRequest::new(turn_id, self.config.model_id.clone(), history);
        if let Some(system_prompt) = &self.config.system_prompt {
            request = request.with_preamble(system_prompt.clone());
        }
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }

    fn start_turn(
        self: &Arc<Self>,
        turn_id: TurnId,
        conversation_id: ConversationId,
    ) -> ChatResult<TurnId> {
        let history = provider_history(&self.state.borrow().messages);
        let turn = Arc::new(Turn::new(turn_id, conversation_id));
        self.state
            .send_modify(|state| state.messages.push(Message::assistant_streaming(turn_id)));

        let request = self.build_request(turn_id, history);
        let handle = match self.provider.stream_chat(request) {
            Ok(handle) => handle,
            Err(source) => {
                tracing::error!(
                    turn_id = %turn_id,
                    provider_id = %self.provider.id(),
                    error = %source,
                    "failed to start provider stream"
                );
                let reason = FailureReason::Transport(source.to_string());
                turn.fail(reason.clone());
                self.settle_failure(&turn, reason);
                return Err(ChatError::Provider {
                    stage: "start-turn",
                    source,
                });
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        *self.active() = Some(ActiveTurn {
            turn: Arc::clone(&turn),
            stop_tx: Some(stop_tx),
        });

        tokio::spawn(handle.worker);
        tokio::spawn(drive_turn(Arc::clone(self), turn, handle.stream, stop_rx));
        tracing::info!(
            turn_id = %turn_id,
            conversation_id = %conversation_id,
            model_id = %self.config.model_id,
            "assistant turn started"
        );
        Ok(turn_id)
    }

    fn publish_parts(&self, turn: &Turn) {
        let parts = turn.snapshot();
        self.state.send_if_modified(|state| {
            let Some(message) = state.message_for_turn_mut(turn.id()) else {
                return false;
            };
            message.parts = parts;
            if state.status == ChatStatus::Submitted {
                state.status = ChatStatus::Streaming;
            }
            true
        });
    }

    fn mark_ready(&self, turn: &Turn) {
        self.state.send_if_modified(|state| {
            if state.pending_turn != Some(turn.id()) {
                return false;
            }
            state.status = ChatStatus::Ready;
            true
        });
    }

    async fn finalize_turn(
        &self,
        turn_id: TurnId,
        signal: CompletionSignal,
    ) -> Option<Finalization> {
        let turn = self.active_turn(turn_id)?;
        let finalization = turn.finalize(signal, self.store.as_ref()).await;
        self.apply_finalization(&turn, &finalization);
        Some(finalization)
    }

    fn apply_finalization(&self, turn: &Turn, finalization: &Finalization) {
        match finalization {
            Finalization::Persisted {
                record,
                touch_error,
            } => {
                let parts = turn.snapshot();
                let error = touch_error
                    .as_ref()
                    .map(|error| format!("conversation order was not updated: {error}"));
                self.state.send_modify(|state| {
                    if let Some(message) = state.message_for_turn_mut(turn.id()) {
                        message.id = Some(record.id);
                        message.parts = parts;
                        message.status = MessageStatus::Done;
                    }
                    if state.pending_turn == Some(turn.id()) {
                        state.pending_turn = None;
                        state.status = ChatStatus::Ready;
                        state.error = error;
                    }
                });
                self.clear_active(turn.id());
                tracing::info!(
                    turn_id = %turn.id(),
                    message_id = %record.id,
                    "assistant message persisted"
                );
            }
            Finalization::Skipped(phase) => {
                tracing::trace!(turn_id = %turn.id(), phase = ?phase, "completion signal skipped");
            }
            Finalization::Failed(reason) => self.settle_failure(turn, reason.clone()),
        }
    }

    fn settle_failure(&self, turn: &Turn, reason: FailureReason) {
        let (message_status, chat_status, error) = match &reason {
            FailureReason::Cancelled => (MessageStatus::Cancelled, ChatStatus::Ready, None),
            FailureReason::Store(detail) => (
                MessageStatus::Unsaved(detail.clone()),
                ChatStatus::Ready,
                Some(reason.to_string()),
            ),
            FailureReason::Transport(_)
            | FailureReason::EmptyContent
            | FailureReason::TimedOut
            | FailureReason::Interrupted => (
                MessageStatus::Failed(reason.to_string()),
                ChatStatus::Error,
                Some(reason.to_string()),
            ),
        };

        let parts = turn.snapshot();
        self.state.send_modify(|state| {
            if let Some(message) = state.message_for_turn_mut(turn.id()) {
                message.parts = parts;
                message.status = message_status;
            }
            if state.pending_turn == Some(turn.id()) {
                state.pending_turn = None;
                state.status = chat_status;
                state.error = error;
            }
        });
        self.clear_active(turn.id());
    }
}

/// Reads one turn's stream until it ends, is stopped, or runs out of time.
async fn drive_turn(
    inner: Arc<ControllerInner>,
    turn: Arc<Turn>,
    mut stream: ProviderEventStream,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let timeout = inner.config.stream_timeout;
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let next = tokio::select! {
            _ = &mut stop_rx => {
                stream.cancel();
                return;
            }
            next = tokio::time::timeout_at(deadline, stream.recv()) => next,
        };

        let mapped = match next {
            Ok(Some(mapped)) => mapped,
            Ok(None) => {
                let reason =
                    FailureReason::Transport("stream closed before it finished".to_string());
                if turn.fail(reason.clone()) {
                    tracing::warn!(turn_id = %turn.id(), "provider stream closed early");
                    inner.settle_failure(&turn, reason);
                }
                return;
            }
            Err(_) => {
                stream.cancel();
                if turn.fail(FailureReason::TimedOut) {
                    tracing::warn!(
                        turn_id = %turn.id(),
                        timeout_ms = timeout.as_millis() as u64,
                        "provider stream timed out"
                    );
                    inner.settle_failure(&turn, FailureReason::TimedOut);
                }
                return;
            }
        };

        if mapped.turn_id != turn.id() {
            tracing::debug!(
                turn_id = %turn.id(),
                event_turn_id = %mapped.turn_id,
                "dropping stream event from another turn"
            );
            continue;
        }

        match turn.apply(mapped.event) {
            ApplyOutcome::Appended | ApplyOutcome::Opened => inner.publish_parts(&turn),
            ApplyOutcome::Ignored => {}
            ApplyOutcome::Finished => {
                inner.publish_parts(&turn);
                inner.mark_ready(&turn);
                let finalization = turn
                    .finalize(CompletionSignal::FinishCallback, inner.store.as_ref())
                    .await;
                inner.apply_finalization(&turn, &finalization);
                return;
            }
            ApplyOutcome::Failed(message) => {
                stream.cancel();
                let reason = FailureReason::Transport(message);
                tracing::warn!(turn_id = %turn.id(), reason = %reason, "provider stream failed");
                inner.settle_failure(&turn, reason);
                return;
            }
        }
    }
}

/// Emits the status-ready completion signal whenever the chat becomes ready
/// while the newest message is an unsaved assistant reply.
async fn watch_ready_status(
    inner: Weak<ControllerInner>,
    mut state_rx: watch::Receiver<ChatState>,
) {
    while state_rx.changed().await.is_ok() {
        let ready_turn = {
            let state = state_rx.borrow_and_update();
            ready_assistant_turn(&state)
        };
        let Some(turn_id) = ready_turn else {
            continue;
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner
            .finalize_turn(turn_id, CompletionSignal::StatusReady)
            .await;
    }
}

fn ready_assistant_turn(state: &ChatState) -> Option<TurnId> {
    if state.status != ChatStatus::Ready {
        return None;
    }
    let last = state.messages.last()?;
    if last.role != Role::Assistant {
        return None;
    }
    last.streaming_turn()
}

fn pending_user_message(state: &mut ChatState) -> Option<&mut Message> {
    state
        .messages
        .iter_mut()
        .rev()
        .find(|message| message.role == Role::User && message.status == MessageStatus::Pending)
}

/// Prior turns sent as context. Failed and cancelled replies are left out.
fn provider_history(messages: &[Message]) -> Vec<ProviderMessage> {
    messages
        .iter()
        .filter(|message| {
            matches!(
                message.status,
                MessageStatus::Done | MessageStatus::Unsaved(_)
            )
        })
        .filter_map(|message| {
            let text = message.text();
            if text.trim().is_empty() {
                return None;
            }
            let role = match message.role {
                Role::User => ProviderRole::User,
                Role::Assistant => ProviderRole::Assistant,
            };
            Some(ProviderMessage::new(role, text))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use murmur_llm::StreamEvent;
    use murmur_storage::{MessageRole, SqliteStorage};

    use super::*;
    use crate::store::StorageAdapter;
    use crate::testing::{MemoryStore, ScriptStep, ScriptedProvider};

    struct Harness {
        store: Arc<MemoryStore>,
        provider: Arc<ScriptedProvider>,
        controller: ChatController,
    }

    fn harness_with(config: ChatConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new());
        let controller = ChatController::new(store.clone(), provider.clone(), config);
        Harness {
            store,
            provider,
            controller,
        }
    }

    fn harness() -> Harness {
        harness_with(ChatConfig::default())
    }

    fn reply(text: &str) -> Vec<ScriptStep> {
        vec![ScriptStep::text(text), ScriptStep::done(Some(text))]
    }

    async fn wait_for_reply_text(controller: &ChatController, expected: &str) {
        let mut state_rx = controller.subscribe();
        state_rx
            .wait_for(|state| {
                state
                    .messages
                    .last()
                    .is_some_and(|message| message.text() == expected)
            })
            .await
            .expect("controller state channel");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn send_streams_and_persists_reply_once() {
        let Harness {
            store,
            provider,
            controller,
        } = harness();
        provider.push_script(vec![
            ScriptStep::text("He"),
            ScriptStep::text("llo"),
            ScriptStep::done(Some("Hello")),
        ]);

        controller.send("  hi  ").await.expect("send");
        let state = controller.wait_until_settled().await;

        assert_eq!(state.status, ChatStatus::Ready);
        assert_eq!(state.error, None);
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].text(), "hi");
        assert_eq!(state.messages[0].status, MessageStatus::Done);
        let reply = &state.messages[1];
        assert_eq!(reply.text(), "Hello");
        assert_eq!(reply.status, MessageStatus::Done);
        assert!(reply.id.is_some());
        assert!(reply.parts.iter().all(|part| part.is_done()));

        assert!(controller.poll_completion().await.is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.assistant_inserts(), 1);
        assert_eq!(store.touches(), 2);

        let conversation_id = state.conversation_id.expect("conversation");
        let contents = store
            .messages(conversation_id)
            .into_iter()
            .map(|message| message.content)
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["hi".to_string(), "Hello".to_string()]);
    }

    #[tokio::test]
    async fn first_send_creates_titled_conversation() {
        let Harness {
            store,
            provider,
            controller,
        } = harness();
        provider.push_script(reply("ok"));
        provider.push_script(reply("ok again"));

        controller
            .send("What is the weather like\non Mars today?")
            .await
            .expect("send");
        controller.wait_until_settled().await;
        controller.send("And tomorrow?").await.expect("second send");
        controller.wait_until_settled().await;

        assert_eq!(store.conversation_count(), 1);
        let conversations = controller.list_conversations().await.expect("list");
        assert_eq!(conversations[0].title, "What is the weather like on Mars today?");
    }

    #[tokio::test]
    async fn prior_turns_are_sent_as_context() {
        let Harness {
            provider,
            controller,
            ..
        } = harness();
        provider.push_script(reply("first answer"));
        provider.push_script(reply("second answer"));

        controller.send("first question").await.expect("send");
        controller.wait_until_settled().await;
        controller.send("second question").await.expect("send");
        controller.wait_until_settled().await;

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        let roles = requests[1]
            .messages
            .iter()
            .map(|message| message.role)
            .collect::<Vec<_>>();
        assert_eq!(
            roles,
            vec![ProviderRole::User, ProviderRole::Assistant, ProviderRole::User]
        );
        assert_eq!(requests[1].messages[2].content, "second question");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_discards_the_partial_reply() {
        let Harness {
            store,
            provider,
            controller,
        } = harness();
        provider.push_script(vec![
            ScriptStep::text("He"),
            ScriptStep::text("llo"),
            ScriptStep::Hang,
        ]);

        controller.send("hi").await.expect("send");
        wait_for_reply_text(&controller, "Hello").await;

        assert!(controller.stop());
        assert!(!controller.stop());

        let state = controller.state();
        assert_eq!(state.status, ChatStatus::Ready);
        assert!(state.is_settled());
        let reply = state.messages.last().expect("reply");
        assert_eq!(reply.status, MessageStatus::Cancelled);
        assert_eq!(reply.text(), "Hello");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(controller.poll_completion().await.is_none());
        assert_eq!(store.assistant_inserts(), 0);
    }

    #[tokio::test]
    async fn stream_error_fails_the_turn() {
        let Harness {
            store,
            provider,
            controller,
        } = harness();
        provider.push_script(vec![
            ScriptStep::text("partial"),
            ScriptStep::Emit(StreamEvent::Error("upstream 500".to_string())),
        ]);

        controller.send("hi").await.expect("send");
        let state = controller.wait_until_settled().await;

        assert_eq!(state.status, ChatStatus::Error);
        assert!(state.error.as_deref().is_some_and(|error| error.contains("upstream 500")));
        assert!(matches!(
            state.messages.last().expect("reply").status,
            MessageStatus::Failed(_)
        ));
        assert_eq!(store.assistant_inserts(), 0);
    }

    #[tokio::test]
    async fn empty_reply_is_not_persisted() {
        let Harness {
            store,
            provider,
            controller,
        } = harness();
        provider.push_script(vec![ScriptStep::done(Some(""))]);

        controller.send("hi").await.expect("send");
        let state = controller.wait_until_settled().await;

        assert_eq!(state.status, ChatStatus::Error);
        assert_eq!(store.assistant_inserts(), 0);
        assert_eq!(store.touches(), 1);
    }

    #[tokio::test]
    async fn assistant_store_failure_keeps_an_unsaved_reply() {
        let Harness {
            store,
            provider,
            controller,
        } = harness();
        store.fail_assistant_appends(true);
        provider.push_script(reply("kept on screen"));

        controller.send("hi").await.expect("send");
        let state = controller.wait_until_settled().await;

        assert_eq!(state.status, ChatStatus::Ready);
        assert!(state.error.is_some());
        let reply = state.messages.last().expect("reply");
        assert_eq!(reply.text(), "kept on screen");
        assert!(matches!(reply.status, MessageStatus::Unsaved(_)));
    }

    #[tokio::test]
    async fn user_store_failure_aborts_before_streaming() {
        let Harness {
            store,
            provider,
            controller,
        } = harness();
        store.fail_user_appends(true);
        provider.push_script(reply("never"));

        let error = controller.send("hi").await.expect_err("send fails");

        assert!(matches!(error, ChatError::Store { .. }));
        assert!(provider.requests().is_empty());
        let state = controller.state();
        assert_eq!(state.status, ChatStatus::Error);
        assert!(state.is_settled());
        assert!(matches!(
            state.messages.last().expect("user message").status,
            MessageStatus::Unsaved(_)
        ));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_without_side_effects() {
        let Harness {
            store, controller, ..
        } = harness();

        assert!(matches!(
            controller.send("   ").await,
            Err(ChatError::EmptyInput { .. })
        ));
        let long_input = "a".repeat(MAX_MESSAGE_LENGTH + 1);
        assert!(matches!(
            controller.send(&long_input).await,
            Err(ChatError::InputTooLong { length, .. }) if length == MAX_MESSAGE_LENGTH + 1
        ));

        assert_eq!(store.conversation_count(), 0);
        assert_eq!(controller.state(), ChatState::default());
    }

    #[tokio::test]
    async fn second_send_while_streaming_is_busy() {
        let Harness {
            provider,
            controller,
            ..
        } = harness();
        provider.push_script(vec![ScriptStep::text("thinking"), ScriptStep::Hang]);

        let turn_id = controller.send("first").await.expect("send");
        let error = controller.send("second").await.expect_err("busy");

        assert!(matches!(error, ChatError::Busy { turn_id: busy, .. } if busy == turn_id));
        assert!(controller.stop());
    }

    #[tokio::test]
    async fn slow_stream_times_out() {
        let Harness {
            store,
            provider,
            controller,
        } = harness_with(ChatConfig {
            stream_timeout: Duration::from_millis(50),
            ..ChatConfig::default()
        });
        provider.push_script(vec![ScriptStep::text("He"), ScriptStep::Hang]);

        controller.send("hi").await.expect("send");
        let state = controller.wait_until_settled().await;

        assert_eq!(state.status, ChatStatus::Error);
        assert_eq!(
            state.messages.last().expect("reply").status,
            MessageStatus::Failed(FailureReason::TimedOut.to_string())
        );
        assert_eq!(store.assistant_inserts(), 0);
    }

    #[tokio::test]
    async fn provider_start_failure_is_reported() {
        let Harness { controller, .. } = harness();

        let error = controller.send("hi").await.expect_err("no script queued");

        assert!(matches!(error, ChatError::Provider { .. }));
        let state = controller.state();
        assert_eq!(state.status, ChatStatus::Error);
        assert!(state.is_settled());
    }

    #[tokio::test]
    async fn regenerate_replaces_the_last_reply() {
        let Harness {
            store,
            provider,
            controller,
        } = harness();
        provider.push_script(reply("first draft"));
        provider.push_script(reply("second draft"));

        controller.send("write a haiku").await.expect("send");
        let state = controller.wait_until_settled().await;
        let conversation_id = state.conversation_id.expect("conversation");

        controller.regenerate_last().await.expect("regenerate");
        let state = controller.wait_until_settled().await;

        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[1].text(), "second draft");
        let contents = store
            .messages(conversation_id)
            .into_iter()
            .map(|message| message.content)
            .collect::<Vec<_>>();
        assert_eq!(
            contents,
            vec!["write a haiku".to_string(), "second draft".to_string()]
        );

        let requests = provider.requests();
        assert_eq!(requests[1].messages.len(), 1);
        assert_eq!(requests[1].messages[0].role, ProviderRole::User);
    }

    #[tokio::test]
    async fn regenerate_needs_a_user_message() {
        let Harness { controller, .. } = harness();
        assert!(matches!(
            controller.regenerate_last().await,
            Err(ChatError::NothingToRegenerate { .. })
        ));
    }

    #[tokio::test]
    async fn switching_conversations_reloads_history() {
        let Harness {
            provider,
            controller,
            ..
        } = harness();
        provider.push_script(reply("pong"));

        controller.send("ping").await.expect("send");
        let state = controller.wait_until_settled().await;
        let conversation_id = state.conversation_id.expect("conversation");

        controller.new_conversation().expect("new conversation");
        assert_eq!(controller.state(), ChatState::default());

        controller
            .select_conversation(conversation_id)
            .await
            .expect("select");
        let state = controller.state();
        assert_eq!(state.conversation_id, Some(conversation_id));
        let texts = state.messages.iter().map(Message::text).collect::<Vec<_>>();
        assert_eq!(texts, vec!["ping".to_string(), "pong".to_string()]);
    }

    #[tokio::test]
    async fn selecting_while_streaming_discards_the_turn() {
        let Harness {
            store,
            provider,
            controller,
        } = harness();
        let other = store.seed_conversation("Other");
        provider.push_script(vec![ScriptStep::text("partial"), ScriptStep::Hang]);

        controller.send("hi").await.expect("send");
        wait_for_reply_text(&controller, "partial").await;
        controller.select_conversation(other).await.expect("select");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.assistant_inserts(), 0);
        assert_eq!(controller.state().conversation_id, Some(other));
    }

    #[tokio::test]
    async fn deleting_the_open_conversation_resets_the_session() {
        let Harness {
            store,
            provider,
            controller,
        } = harness();
        provider.push_script(reply("bye"));

        controller.send("hello").await.expect("send");
        let state = controller.wait_until_settled().await;
        let conversation_id = state.conversation_id.expect("conversation");

        controller
            .delete_conversation(conversation_id)
            .await
            .expect("delete");

        assert_eq!(controller.state(), ChatState::default());
        assert_eq!(store.conversation_count(), 0);
        assert!(store.messages(conversation_id).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sqlite_history_stays_ordered_across_turns() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("chat.db");
        let storage = SqliteStorage::open(path.to_str().expect("utf-8 path"))
            .await
            .expect("open storage");
        let store = Arc::new(StorageAdapter::new(Arc::new(storage)));
        let provider = Arc::new(ScriptedProvider::new());
        let controller = ChatController::new(store.clone(), provider.clone(), ChatConfig::default());

        let older = store
            .create_conversation("Older".to_string())
            .await
            .expect("older conversation");

        for (question, answer) in [("one", "uno"), ("two", "dos")] {
            provider.push_script(reply(answer));
            controller.send(question).await.expect("send");
            let state = controller.wait_until_settled().await;
            assert_eq!(state.status, ChatStatus::Ready);
        }

        let conversation_id = controller.state().conversation_id.expect("conversation");
        let messages = store.load_messages(conversation_id).await.expect("load");
        let transcript = messages
            .iter()
            .map(|message| (message.role, message.content.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            transcript,
            vec![
                (MessageRole::User, "one"),
                (MessageRole::Assistant, "uno"),
                (MessageRole::User, "two"),
                (MessageRole::Assistant, "dos"),
            ]
        );

        let conversations = controller.list_conversations().await.expect("list");
        assert_eq!(conversations[0].id, conversation_id);
        assert_eq!(conversations[1].id, older.id);
    }
}
