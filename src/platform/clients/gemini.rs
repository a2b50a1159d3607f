//! Google Gemini client wrapper exposing the [`ClientWrapper`] trait.
//!
//! The `GeminiClient` connects to Google's Generative Language (Gemini) API using the same
//! message structures and token accounting abstractions employed by the rest of the platform.
//!
//! # Selecting a model and sending a message
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use agentrun::platform::client_wrapper::{ClientWrapper, Message, Role};
//! use agentrun::platform::clients::gemini::{GeminiClient, Model};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("GEMINI_KEY")?;
//!     let client = GeminiClient::new_with_model_enum(&key, Model::Gemini20Flash);
//!     let reply = client
//!         .send_message(
//!             &[Message {
//!                 role: Role::User,
//!                 content: Arc::<str>::from("What industries benefit most from Gemini?"),
//!                 tool_calls: vec![],
//!             }],
//!             None,
//!         )
//!         .await?;
//!     println!("{}", reply.content);
//!     Ok(())
//! }
//! ```

use crate::platform::client_wrapper::{ClientWrapper, Message, Role, TokenUsage, ToolDefinition};
use crate::platform::clients::common::send_and_track;
use async_trait::async_trait;
use log::error;
use openai_rust::chat;
use openai_rust2 as openai_rust;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Client wrapper for Google Gemini (Generative Language) chat-style endpoints.
pub struct GeminiClient {
    /// Underlying OpenAI compatible client pointed at the Gemini base URL.
    client: openai_rust::Client,
    /// Model identifier used for subsequent requests.
    pub model: String,
    /// Storage for the most recent token usage report.
    token_usage: Mutex<Option<TokenUsage>>,
    /// API key, kept for native tool-calling requests.
    api_key: String,
    /// Base URL for API calls.
    base_url: String,
}

/// Gemini model identifiers returned by the public API.
///
/// Every variant maps 1:1 to the hyphenated model name that the API expects. Use
/// [`model_to_string`] when you need the string literal.
pub enum Model {
    Gemini20Flash,
    Gemini20FlashExp,
    Gemini20Flash001,
    Gemini20FlashLite001,
    Gemini20ProExp,
    Gemini15ProLatest,
    Gemini15Pro,
    Gemini15Flash,
    Gemini15Flash8b,
    Gemini25Flash,
    Gemini25Pro,
    Gemini25FlashLitePreview0617,
}

/// Convert a strongly typed [`Model`] into the string literal expected by the Gemini endpoint.
pub fn model_to_string(model: Model) -> String {
    match model {
        Model::Gemini20Flash => "gemini-2.0-flash".to_string(),
        Model::Gemini20FlashExp => "gemini-2.0-flash-exp".to_string(),
        Model::Gemini20Flash001 => "gemini-2.0-flash-001".to_string(),
        Model::Gemini20FlashLite001 => "gemini-2.0-flash-lite-001".to_string(),
        Model::Gemini20ProExp => "gemini-2.0-pro-exp".to_string(),
        Model::Gemini15ProLatest => "gemini-1.5-pro-latest".to_string(),
        Model::Gemini15Pro => "gemini-1.5-pro".to_string(),
        Model::Gemini15Flash => "gemini-1.5-flash".to_string(),
        Model::Gemini15Flash8b => "gemini-1.5-flash-8b".to_string(),
        Model::Gemini25Flash => "gemini-2.5-flash".to_string(),
        Model::Gemini25Pro => "gemini-2.5-pro".to_string(),
        Model::Gemini25FlashLitePreview0617 => "gemini-2.5-flash-lite-preview-06-17".to_string(),
    }
}

impl GeminiClient {
    /// Construct a client using the default Gemini base URL and an explicit model name.
    pub fn new_with_model_string(secret_key: &str, model_name: &str) -> Self {
        use crate::platform::clients::common::get_shared_http_client;
        let base_url = "https://generativelanguage.googleapis.com/v1beta";
        GeminiClient {
            client: openai_rust::Client::new_with_client_and_base_url(
                secret_key,
                get_shared_http_client().clone(),
                &format!("{}/", base_url),
            ),
            model: model_name.to_string(),
            token_usage: Mutex::new(None),
            api_key: secret_key.to_string(),
            base_url: base_url.to_string(),
        }
    }

    /// Construct a client from an API key and [`Model`] variant.
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_string(secret_key, &model_to_string(model))
    }

    /// Construct a client pointing at a custom Gemini-compatible base URL.
    /// Note: base_url should not have a trailing slash.
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        use crate::platform::clients::common::get_shared_http_client;
        let base_url_normalized = base_url.trim_end_matches('/');
        GeminiClient {
            client: openai_rust::Client::new_with_client_and_base_url(
                secret_key,
                get_shared_http_client().clone(),
                &format!("{}/", base_url_normalized),
            ),
            model: model_name.to_string(),
            token_usage: Mutex::new(None),
            api_key: secret_key.to_string(),
            base_url: base_url_normalized.to_string(),
        }
    }

    /// Variant of [`GeminiClient::new_with_base_url`] that accepts a strongly typed [`Model`].
    pub fn new_with_base_url_and_model_enum(
        secret_key: &str,
        model: Model,
        base_url: &str,
    ) -> Self {
        Self::new_with_base_url(secret_key, &model_to_string(model), base_url)
    }
}

#[async_trait]
impl ClientWrapper for GeminiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn send_message(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn std::error::Error>> {
        match tools {
            Some(tools) if !tools.is_empty() => {
                crate::platform::clients::common::send_with_native_tools(
                    &self.base_url,
                    &self.api_key,
                    &self.model,
                    messages,
                    &tools,
                    crate::platform::clients::common::get_shared_http_client(),
                    &self.token_usage,
                )
                .await
            }
            _ => {
                let formatted_messages = messages
                    .iter()
                    .map(|msg| chat::Message {
                        role: match msg.role {
                            Role::System => "system".to_owned(),
                            Role::User => "user".to_owned(),
                            Role::Assistant => "assistant".to_owned(),
                            Role::Tool { .. } => "tool".to_owned(),
                        },
                        content: msg.content.to_string(),
                    })
                    .collect();

                let result = send_and_track(
                    &self.client,
                    &self.model,
                    formatted_messages,
                    Some("/chat/completions".to_string()),
                    &self.token_usage,
                )
                .await;

                match result {
                    Ok(content) => Ok(Message {
                        role: Role::Assistant,
                        content: Arc::from(content.as_str()),
                        tool_calls: vec![],
                    }),
                    Err(err) => {
                        if log::log_enabled!(log::Level::Error) {
                            error!("GeminiClient::send_message error: {}", err);
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    /// Expose the storage slot used by [`ClientWrapper::get_last_usage`].
    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.token_usage)
    }
}
