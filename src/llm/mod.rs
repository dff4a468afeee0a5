//! LLM integration.
//!
//! `LlmProvider` is the completion service the decomposer and the subtask
//! runner talk to. Hosted backends go through rig-core; `RigAdapter` bridges
//! rig's `CompletionModel` to our trait. Test stubs implement the trait
//! directly.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{ConfigError, LlmError};

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    fn api_key_var(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-3-5-haiku-latest",
            Self::OpenAi => "gpt-4o-mini",
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
}

impl LlmConfig {
    /// Read `AGENT_EXEC_LLM_BACKEND` (`openai` or `anthropic`), the matching
    /// API key variable and `AGENT_EXEC_MODEL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("AGENT_EXEC_LLM_BACKEND").ok().as_deref() {
            Some("anthropic") => LlmBackend::Anthropic,
            _ => LlmBackend::OpenAi,
        };
        let key_var = backend.api_key_var();
        let api_key =
            std::env::var(key_var).map_err(|_| ConfigError::MissingEnvVar(key_var.to_string()))?;
        let model = std::env::var("AGENT_EXEC_MODEL")
            .unwrap_or_else(|_| backend.default_model().to_string());

        Ok(Self {
            backend,
            api_key: SecretString::from(api_key),
            model,
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_provider(config),
        LlmBackend::OpenAi => create_openai_provider(config),
    }
}

fn create_anthropic_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model, "anthropic")))
}

fn create_openai_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model, "openai")))
}
