use std::fmt;

use murmur_llm::TurnId;
use murmur_storage::MessageId;
use tokio::sync::watch;

/// Independent notifications that a turn's generation has finished.
///
/// Any subset may fire, in any order, possibly concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionSignal {
    /// The stream delivered its terminal `Done` event.
    FinishCallback,
    /// Chat status became ready while the newest message was the assistant's.
    StatusReady,
    /// Explicit polling by the front end.
    Poll,
}

impl fmt::Display for CompletionSignal {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::FinishCallback => "finish-callback",
            Self::StatusReady => "status-ready",
            Self::Poll => "poll",
        };
        formatter.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Transport(String),
    /// Every extraction rule came up empty.
    EmptyContent,
    Cancelled,
    TimedOut,
    Store(String),
    /// The finalizer was dropped before it resolved its claim.
    Interrupted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(message) => write!(formatter, "provider stream failed: {message}"),
            Self::EmptyContent => formatter.write_str("assistant returned no text"),
            Self::Cancelled => formatter.write_str("generation stopped"),
            Self::TimedOut => formatter.write_str("generation timed out"),
            Self::Store(message) => write!(formatter, "could not save reply: {message}"),
            Self::Interrupted => formatter.write_str("saving the reply was interrupted"),
        }
    }
}

/// Persistence phase of one assistant turn.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Streaming,
    /// A completion signal won the claim and is writing the message.
    Finishing(CompletionSignal),
    Persisted(MessageId),
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseTransition {
    Claim(CompletionSignal),
    /// Ends a turn that nobody has claimed yet.
    Abort(FailureReason),
    Persist(MessageId),
    /// Resolves a claim without a persisted message.
    Discard(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseRejection {
    AlreadyClaimed { by: CompletionSignal },
    AlreadySettled(TurnPhase),
    NotClaimed,
}

pub type PhaseTransitionResult = Result<TurnPhase, PhaseRejection>;

impl TurnPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Persisted(_) | Self::Failed(_))
    }

    pub fn persisted_id(&self) -> Option<MessageId> {
        match self {
            Self::Persisted(message_id) => Some(*message_id),
            _ => None,
        }
    }

    /// Applies one transition deterministically.
    ///
    /// `Streaming` accepts a claim or an abort; `Finishing` only accepts the
    /// claimer's resolution; terminal phases accept nothing.
    pub fn apply(&self, transition: PhaseTransition) -> PhaseTransitionResult {
        match (self, transition) {
            (Self::Streaming, PhaseTransition::Claim(signal)) => Ok(Self::Finishing(signal)),
            (Self::Streaming, PhaseTransition::Abort(reason)) => Ok(Self::Failed(reason)),
            (Self::Streaming, PhaseTransition::Persist(_) | PhaseTransition::Discard(_)) => {
                Err(PhaseRejection::NotClaimed)
            }
            (Self::Finishing(_), PhaseTransition::Persist(message_id)) => {
                Ok(Self::Persisted(message_id))
            }
            (Self::Finishing(_), PhaseTransition::Discard(reason)) => Ok(Self::Failed(reason)),
            (
                Self::Finishing(by),
                PhaseTransition::Claim(_) | PhaseTransition::Abort(_),
            ) => Err(PhaseRejection::AlreadyClaimed { by: *by }),
            (Self::Persisted(_) | Self::Failed(_), _) => {
                Err(PhaseRejection::AlreadySettled(self.clone()))
            }
        }
    }
}

/// Serializes completion signals for one turn so at most one persists.
///
/// The phase lives in a watch channel; every transition is a single
/// check-and-set under the channel lock.
#[derive(Debug)]
pub struct TurnArbiter {
    turn_id: TurnId,
    phase: watch::Sender<TurnPhase>,
}

impl TurnArbiter {
    pub fn new(turn_id: TurnId) -> Self {
        let (phase, _) = watch::channel(TurnPhase::Streaming);
        Self { turn_id, phase }
    }

    pub fn turn_id(&self) -> TurnId {
        self.turn_id
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TurnPhase> {
        self.phase.subscribe()
    }

    /// Wins the right to finalize, or `None` when another signal got there first.
    pub fn claim(&self, signal: CompletionSignal) -> Option<Claim<'_>> {
        match self.transition(PhaseTransition::Claim(signal)) {
            Ok(_) => Some(Claim {
                arbiter: self,
                signal,
                resolved: false,
            }),
            Err(rejection) => {
                tracing::debug!(
                    turn_id = %self.turn_id,
                    signal = %signal,
                    rejection = ?rejection,
                    "completion signal lost the claim"
                );
                None
            }
        }
    }

    /// Ends an unclaimed turn. Returns false when the turn is claimed or settled.
    pub fn abort(&self, reason: FailureReason) -> bool {
        match self.transition(PhaseTransition::Abort(reason)) {
            Ok(_) => true,
            Err(rejection) => {
                tracing::debug!(
                    turn_id = %self.turn_id,
                    rejection = ?rejection,
                    "abort ignored"
                );
                false
            }
        }
    }

    /// Resolves once the turn reaches a terminal phase.
    pub async fn settled(&self) -> TurnPhase {
        let mut phase_rx = self.phase.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        match phase_rx.wait_for(TurnPhase::is_terminal).await {
            Ok(phase) => phase.clone(),
            Err(_) => self.phase(),
        }
    }

    fn transition(&self, transition: PhaseTransition) -> PhaseTransitionResult {
        let mut result = Err(PhaseRejection::NotClaimed);
        self.phase.send_if_modified(|phase| match phase.apply(transition) {
            Ok(next) => {
                *phase = next.clone();
                result = Ok(next);
                true
            }
            Err(rejection) => {
                result = Err(rejection);
                false
            }
        });
        result
    }
}

/// Exclusive right to finalize a turn.
///
/// Dropping an unresolved claim fails the turn with [`FailureReason::Interrupted`].
#[must_use = "a claim must be resolved with `persisted` or `discard`"]
#[derive(Debug)]
pub struct Claim<'a> {
    arbiter: &'a TurnArbiter,
    signal: CompletionSignal,
    resolved: bool,
}

impl Claim<'_> {
    pub fn signal(&self) -> CompletionSignal {
        self.signal
    }

    pub fn persisted(mut self, message_id: MessageId) {
        self.resolve(PhaseTransition::Persist(message_id));
    }

    pub fn discard(mut self, reason: FailureReason) {
        self.resolve(PhaseTransition::Discard(reason));
    }

    fn resolve(&mut self, transition: PhaseTransition) {
        self.resolved = true;
        if let Err(rejection) = self.arbiter.transition(transition) {
            tracing::error!(
                turn_id = %self.arbiter.turn_id,
                rejection = ?rejection,
                "claimed turn left the finishing phase early"
            );
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.resolve(PhaseTransition::Discard(FailureReason::Interrupted));
        }
    }
}
