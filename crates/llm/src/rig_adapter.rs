use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::oneshot;

use super::events::{FinishSummary, StreamEvent};
use super::provider::{
    CompletionsFailedSnafu, DEFAULT_OPENAI_MODEL, EmptyMessageSetSnafu, EventSender,
    HttpClientSnafu, LlmProvider, MissingApiKeySnafu, ProviderConfig, ProviderError,
    ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamRequest,
    make_event_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

pub struct RigProviderAdapter {
    config: ProviderConfig,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(request: &StreamRequest) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        // Rig takes a single preamble, so system-role messages fold into it.
        for message in &request.messages {
            if matches!(message.role, Role::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                turn_id = %request.turn_id,
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                turn_id: request.turn_id,
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<StreamEvent>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) => {
                if text.text.is_empty() {
                    return None;
                }
                Some(StreamEvent::TextDelta(text.text))
            }
            StreamedAssistantContent::Reasoning(reasoning) => {
                // Rig can split one reasoning block into fragments.
                let text = reasoning.reasoning.join("");
                if text.is_empty() {
                    return None;
                }
                Some(StreamEvent::ReasoningDelta(text))
            }
            StreamedAssistantContent::ReasoningDelta { reasoning, .. } => {
                if reasoning.is_empty() {
                    return None;
                }
                Some(StreamEvent::ReasoningDelta(reasoning))
            }
            StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        events: EventSender,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let turn_id = request.turn_id;
        let mut stream = match Self::open_stream(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    turn_id = %turn_id,
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                events.send(StreamEvent::Error(error.to_string()));
                return;
            }
        };

        let mut full_text = String::new();

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(turn_id = %turn_id, "provider stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            let Some(event) = Self::map_stream_item(item) else {
                                continue;
                            };
                            if let StreamEvent::TextDelta(delta) = &event {
                                full_text.push_str(delta);
                            }
                            if !events.send(event) {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                turn_id = %turn_id,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            events.send(StreamEvent::Error(error.to_string()));
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        events.send(StreamEvent::Done(FinishSummary {
            full_text: Some(full_text),
        }));
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn default_model(&self) -> &str {
        DEFAULT_OPENAI_MODEL
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                turn_id: request.turn_id,
            }
        );

        let (events, stream, cancel_rx) = make_event_stream(request.turn_id);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            events,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TurnId;

    fn request_with(messages: Vec<ProviderMessage>) -> StreamRequest {
        StreamRequest::new(TurnId::new(1), DEFAULT_OPENAI_MODEL, messages)
    }

    #[test]
    fn blank_api_key_is_rejected() {
        let result = RigProviderAdapter::new(ProviderConfig::new("openai", "  ", ""));
        assert!(matches!(result, Err(ProviderError::MissingApiKey { .. })));
    }

    #[test]
    fn preamble_merges_directive_and_system_messages() {
        let request = request_with(vec![
            ProviderMessage::new(Role::System, "Answer briefly."),
            ProviderMessage::new(Role::User, "hi"),
        ])
        .with_preamble("You are a helpful assistant.");

        assert_eq!(
            RigProviderAdapter::merged_preamble(&request).as_deref(),
            Some("You are a helpful assistant.\n\nAnswer briefly.")
        );
    }

    #[test]
    fn preamble_is_absent_when_everything_is_blank() {
        let request = request_with(vec![ProviderMessage::new(Role::User, "hi")]).with_preamble(" ");
        assert_eq!(RigProviderAdapter::merged_preamble(&request), None);
    }

    #[test]
    fn empty_request_is_rejected_before_any_network_work() {
        let adapter = RigProviderAdapter::new(ProviderConfig::new("openai", "sk-test", ""))
            .expect("adapter with key");
        let result = adapter.stream_chat(request_with(Vec::new()));
        assert!(matches!(result, Err(ProviderError::EmptyMessageSet { .. })));
    }

    #[test]
    fn unmodelled_stream_items_emit_nothing() {
        let item = StreamedAssistantContent::<()>::Final(());
        assert_eq!(RigProviderAdapter::map_stream_item(item), None);
    }
}
