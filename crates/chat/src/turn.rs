use std::sync::{Mutex, MutexGuard};

use murmur_llm::{StreamEvent, TurnId};
use murmur_storage::{ConversationId, MessageRecord};

use crate::accumulator::{AccumulatorState, ApplyOutcome, MessageAccumulator};
use crate::arbiter::{CompletionSignal, FailureReason, TurnArbiter, TurnPhase};
use crate::extract::extract_final_content;
use crate::message::{Part, Role};
use crate::store::{ConversationStore, StoreError};

/// Result of offering one completion signal to a turn.
#[derive(Debug)]
pub enum Finalization {
    /// This signal wrote the assistant message.
    Persisted {
        record: MessageRecord,
        /// The message is saved but the conversation's recency was not advanced.
        touch_error: Option<StoreError>,
    },
    /// Another signal already claimed or settled the turn.
    Skipped(TurnPhase),
    Failed(FailureReason),
}

/// One assistant generation: its accumulated parts plus the arbiter that
/// guards persistence.
#[derive(Debug)]
pub struct Turn {
    id: TurnId,
    conversation_id: ConversationId,
    arbiter: TurnArbiter,
    accumulator: Mutex<MessageAccumulator>,
}

impl Turn {
    pub fn new(id: TurnId, conversation_id: ConversationId) -> Self {
        Self {
            id,
            conversation_id,
            arbiter: TurnArbiter::new(id),
            accumulator: Mutex::new(MessageAccumulator::new()),
        }
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn phase(&self) -> TurnPhase {
        self.arbiter.phase()
    }

    /// Folds one stream event in. An `Error` event fails the turn.
    pub fn apply(&self, event: StreamEvent) -> ApplyOutcome {
        let mut accumulator = self.accumulator();
        let outcome = accumulator.apply(event);
        if let ApplyOutcome::Failed(message) = &outcome {
            self.arbiter.abort(FailureReason::Transport(message.clone()));
        }
        outcome
    }

    pub fn snapshot(&self) -> Vec<Part> {
        self.accumulator().snapshot()
    }

    /// Stops an unclaimed turn; nothing will be persisted for it.
    pub fn cancel(&self) -> bool {
        self.fail(FailureReason::Cancelled)
    }

    /// Ends an unclaimed turn. Returns false if a finalizer already owns it.
    pub fn fail(&self, reason: FailureReason) -> bool {
        let mut accumulator = self.accumulator();
        if !self.arbiter.abort(reason) {
            return false;
        }
        accumulator.freeze();
        true
    }

    /// Offers a completion signal. At most one call per turn persists, and
    /// only once the stream has delivered `Done`.
    pub async fn finalize<S>(&self, signal: CompletionSignal, store: &S) -> Finalization
    where
        S: ConversationStore + ?Sized,
    {
        let (claim, full_text, parts) = {
            let accumulator = self.accumulator();
            if *accumulator.state() != AccumulatorState::Finished {
                tracing::debug!(
                    turn_id = %self.id,
                    signal = %signal,
                    state = ?accumulator.state(),
                    "completion signal before the stream finished, skipped"
                );
                return Finalization::Skipped(self.phase());
            }
            let Some(claim) = self.arbiter.claim(signal) else {
                return Finalization::Skipped(self.phase());
            };
            (
                claim,
                accumulator.full_text().map(str::to_owned),
                accumulator.snapshot(),
            )
        };

        let Some(extracted) = extract_final_content(full_text.as_deref(), &parts) else {
            tracing::warn!(
                turn_id = %self.id,
                conversation_id = %self.conversation_id,
                part_count = parts.len(),
                "finished turn has no text content, nothing persisted"
            );
            claim.discard(FailureReason::EmptyContent);
            return Finalization::Failed(FailureReason::EmptyContent);
        };

        tracing::debug!(
            turn_id = %self.id,
            signal = %signal,
            rule = ?extracted.rule,
            content_len = extracted.content.len(),
            "persisting assistant message"
        );

        let record = match store
            .append_message(self.conversation_id, Role::Assistant, extracted.content)
            .await
        {
            Ok(record) => record,
            Err(error) => {
                tracing::error!(
                    turn_id = %self.id,
                    conversation_id = %self.conversation_id,
                    error = %error,
                    "failed to persist assistant message"
                );
                let reason = FailureReason::Store(error.to_string());
                claim.discard(reason.clone());
                return Finalization::Failed(reason);
            }
        };

        let touch_error = match store.touch_conversation(self.conversation_id).await {
            Ok(()) => None,
            Err(error) => {
                tracing::warn!(
                    turn_id = %self.id,
                    conversation_id = %self.conversation_id,
                    error = %error,
                    "assistant message saved but conversation recency was not updated"
                );
                Some(error)
            }
        };

        claim.persisted(record.id);
        Finalization::Persisted {
            record,
            touch_error,
        }
    }

    fn accumulator(&self) -> MutexGuard<'_, MessageAccumulator> {
        // A panic mid-apply leaves parts append-only consistent, so poisoning is ignored.
        self.accumulator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
