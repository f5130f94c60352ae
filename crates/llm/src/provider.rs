use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use crate::events::{StreamEvent, StreamEventMapped, TurnId};

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

/// Speaker role as the provider sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Prior turns, system directive and sampling parameters for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub turn_id: TurnId,
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl StreamRequest {
    pub fn new(turn_id: TurnId, model_id: impl Into<String>, messages: Vec<ProviderMessage>) -> Self {
        Self {
            turn_id,
            model_id: model_id.into(),
            messages,
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for {turn_id} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        turn_id: TurnId,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

/// Receiving half of a provider stream.
///
/// Dropping it signals cancellation to the worker.
pub struct ProviderEventStream {
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Sending half handed to a provider worker.
#[derive(Debug, Clone)]
pub struct EventSender {
    turn_id: TurnId,
    event_tx: mpsc::UnboundedSender<StreamEventMapped>,
}

impl EventSender {
    /// Returns false once the reader is gone, so workers can stop early.
    pub fn send(&self, event: StreamEvent) -> bool {
        self.event_tx
            .send(StreamEventMapped::new(self.turn_id, event))
            .is_ok()
    }
}

/// Wires a worker to its reader. Public so out-of-crate providers can reuse it.
pub fn make_event_stream(
    turn_id: TurnId,
) -> (EventSender, ProviderEventStream, oneshot::Receiver<()>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        EventSender { turn_id, event_tx },
        ProviderEventStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_tagged_with_turn_id_in_order() {
        let turn_id = TurnId::new(7);
        let (sender, mut stream, _cancel_rx) = make_event_stream(turn_id);

        assert!(sender.send(StreamEvent::TextDelta("He".to_string())));
        assert!(sender.send(StreamEvent::TextDelta("llo".to_string())));
        drop(sender);

        let first = stream.recv().await.expect("first event");
        let second = stream.recv().await.expect("second event");
        assert_eq!(first.turn_id, turn_id);
        assert_eq!(first.event, StreamEvent::TextDelta("He".to_string()));
        assert_eq!(second.event, StreamEvent::TextDelta("llo".to_string()));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancel_reaches_worker_once() {
        let (_sender, mut stream, cancel_rx) = make_event_stream(TurnId::new(1));

        assert!(stream.cancel());
        assert!(!stream.cancel());
        assert!(cancel_rx.await.is_ok());
    }

    #[tokio::test]
    async fn dropping_reader_signals_cancel_and_closes_sender() {
        let (sender, stream, cancel_rx) = make_event_stream(TurnId::new(2));
        drop(stream);

        assert!(cancel_rx.await.is_ok());
        assert!(!sender.send(StreamEvent::TextDelta("late".to_string())));
    }
}
