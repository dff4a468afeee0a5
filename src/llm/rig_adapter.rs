//! Bridges rig's `CompletionModel` to our `LlmProvider`.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionError, CompletionModel, Message};
use tracing::debug;

use crate::error::LlmError;

use super::provider::{ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role};

/// Wraps a rig completion model bound to one model name.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
        }
    }

    fn map_error(&self, error: CompletionError) -> LlmError {
        let reason = error.to_string();
        let lower = reason.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") {
            return LlmError::RateLimited {
                provider: self.provider.to_string(),
                retry_after: None,
            };
        }
        if lower.contains("401") || lower.contains("invalid api key") || lower.contains("unauthorized") {
            return LlmError::AuthFailed {
                provider: self.provider.to_string(),
            };
        }
        match error {
            CompletionError::ResponseError(reason) => LlmError::InvalidResponse {
                provider: self.provider.to_string(),
                reason,
            },
            _ => LlmError::RequestFailed {
                provider: self.provider.to_string(),
                reason,
            },
        }
    }
}

/// The pieces of a chat transcript in the shape rig builds requests from.
#[derive(Debug, PartialEq)]
struct SplitMessages<'a> {
    preamble: Option<String>,
    history: Vec<&'a ChatMessage>,
    prompt: &'a ChatMessage,
}

/// System messages join into the preamble; the last other message is the prompt.
fn split_messages(messages: &[ChatMessage]) -> Option<SplitMessages<'_>> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let mut turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != Role::System).collect();
    let prompt = turns.pop()?;

    Some(SplitMessages {
        preamble: (!system.is_empty()).then(|| system.join("\n\n")),
        history: turns,
        prompt,
    })
}

fn to_rig(message: &ChatMessage) -> Message {
    match message.role {
        Role::Assistant => Message::assistant(message.content.clone()),
        _ => Message::user(message.content.clone()),
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let split = split_messages(&request.messages).ok_or_else(|| LlmError::InvalidResponse {
            provider: self.provider.to_string(),
            reason: "request has no user message".to_string(),
        })?;

        if let Some(requested) = request.model.as_deref().filter(|m| *m != self.model_name) {
            debug!(requested, serving = %self.model_name, "Model override ignored by provider");
        }

        let mut builder = self
            .model
            .completion_request(to_rig(split.prompt))
            .messages(split.history.into_iter().map(to_rig).collect());
        if let Some(preamble) = split.preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let response = self
            .model
            .completion(builder.build())
            .await
            .map_err(|e| self.map_error(e))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|item| match item {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResponse {
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
            finish_reason: FinishReason::Stop,
            model: Some(self.model_name.clone()),
        })
    }
}
