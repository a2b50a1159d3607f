//! LLM gateway (C6): resolves which provider/model an agent talks to, then exposes a thin
//! chat/stream surface backed by a [`ClientWrapper`].

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::platform::client_wrapper::{ClientWrapper, Message, MessageChunkStream, Role, TokenUsage};
use crate::platform::errors::{PlatformError, PlatformErrorCode};

/// A catalog row: one (provider, model) pair along with whether it is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderModel {
    pub id: i64,
    pub provider: String,
    pub model: String,
    pub active: bool,
}

/// Read-only view over the `agent_llm_configs` and provider/model catalog tables.
#[async_trait::async_trait]
pub trait LlmCatalog: Send + Sync {
    /// The agent-specific override row, if one exists and is active.
    async fn agent_config(&self, agent_slug: &str) -> Result<Option<ProviderModel>, PlatformError>;

    /// All active (provider, model) pairs, ordered by ascending catalog id.
    async fn active_pairs(&self) -> Result<Vec<ProviderModel>, PlatformError>;
}

/// Read-only view over the secret store, used only to check presence of a usable API key.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    async fn has_key(&self, provider: &str) -> Result<bool, PlatformError>;
}

/// Builds a [`ClientWrapper`] for a resolved (provider, model) pair.
pub trait ClientFactory: Send + Sync {
    fn build(&self, provider: &str, model: &str) -> Result<Arc<dyn ClientWrapper>, PlatformError>;
}

/// Resolves, per agent slug, which provider/model to use per the three-tier fallback:
/// 1. an active agent-specific override;
/// 2. else the first active pair (ordered by id) with a present API key;
/// 3. else the first active pair regardless of key (the subsequent call surfaces an auth error).
pub async fn resolve_provider_model(
    catalog: &dyn LlmCatalog,
    secrets: &dyn SecretStore,
    agent_slug: &str,
) -> Result<ProviderModel, PlatformError> {
    if let Some(config) = catalog.agent_config(agent_slug).await? {
        if config.active {
            return Ok(config);
        }
    }

    let pairs = catalog.active_pairs().await?;
    for pair in &pairs {
        if secrets.has_key(&pair.provider).await.unwrap_or(false) {
            return Ok(pair.clone());
        }
    }

    pairs
        .into_iter()
        .next()
        .ok_or_else(|| PlatformError::new(PlatformErrorCode::ExternalApiError, "no active provider/model pairs"))
}

/// Thin gateway handed to agents through [`Context`]: a single resolved client plus the last
/// observed token usage.
///
/// [`Context`]: crate::platform::context::Context
pub struct LlmGateway {
    client: Arc<dyn ClientWrapper>,
    last_usage: Mutex<Option<TokenUsage>>,
}

impl LlmGateway {
    pub fn new(client: Arc<dyn ClientWrapper>) -> Self {
        Self {
            client,
            last_usage: Mutex::new(None),
        }
    }

    pub fn model_name(&self) -> &str {
        self.client.model_name()
    }

    /// Sends a single-turn prompt with an optional system prompt and records usage for later
    /// reading via [`LlmGateway::last_usage`].
    pub async fn chat(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, PlatformError> {
        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(Message {
                role: Role::System,
                content: Arc::from(system),
                tool_calls: vec![],
            });
        }
        messages.push(Message {
            role: Role::User,
            content: Arc::from(prompt),
            tool_calls: vec![],
        });

        let response = self
            .client
            .send_message(&messages, None)
            .await
            .map_err(|e| PlatformError::new(PlatformErrorCode::ExternalApiError, e.to_string()))?;

        if let Some(usage) = self.client.get_last_usage().await {
            *self.last_usage.lock().await = Some(usage);
        }

        Ok(response.content.to_string())
    }

    /// Streaming variant. Falls back to an empty stream if the underlying client has no native
    /// streaming support (matches [`ClientWrapper::send_message_stream`]'s default).
    pub async fn stream(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<Option<MessageChunkStream>, PlatformError> {
        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(Message {
                role: Role::System,
                content: Arc::from(system),
                tool_calls: vec![],
            });
        }
        messages.push(Message {
            role: Role::User,
            content: Arc::from(prompt),
            tool_calls: vec![],
        });

        self.client
            .send_message_stream(&messages, None)
            .await
            .map_err(|e| PlatformError::new(PlatformErrorCode::ExternalApiError, e.to_string()))
    }

    pub async fn last_usage(&self) -> Option<TokenUsage> {
        self.last_usage.lock().await.clone()
    }
}
