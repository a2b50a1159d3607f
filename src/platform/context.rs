//! Per-turn context (C7): the sole capability surface handed to agent code.

use std::sync::Arc;

use crate::platform::connectors::ConnectorRegistry;
use crate::platform::llm::LlmGateway;
use crate::platform::sessions::SessionStore;
use crate::platform::storage::ScopedStorage;
use crate::platform::tools::ToolRegistry;

/// Publishes turn progress on the job bus; a no-op when the turn isn't running under a job.
#[async_trait::async_trait]
pub trait ProgressSink: Send + Sync {
    async fn set_progress(&self, percent: u8, message: &str);
}

/// A sink that drops every update — used for direct synchronous calls outside a job.
pub struct NoopProgressSink;

#[async_trait::async_trait]
impl ProgressSink for NoopProgressSink {
    async fn set_progress(&self, _percent: u8, _message: &str) {}
}

/// Thin view over the session store bound to one session, exposed to agents as `ctx.memory`.
pub struct SessionMemory {
    store: Arc<SessionStore>,
    session_id: uuid::Uuid,
}

impl SessionMemory {
    pub fn new(store: Arc<SessionStore>, session_id: uuid::Uuid) -> Self {
        Self { store, session_id }
    }

    pub async fn history(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<crate::platform::schemas::SessionMessage>, crate::platform::errors::PlatformError> {
        self.store.get_messages(self.session_id, limit).await
    }
}

/// Invokes another registered agent from within a turn; bound to [`crate::platform::engine::AgentEngine`]
/// by the engine when it builds a [`Context`].
#[async_trait::async_trait]
pub trait SubAgentInvoker: Send + Sync {
    async fn execute(
        &self,
        target_slug: &str,
        message: crate::platform::schemas::UserMessage,
        metadata: std::collections::HashMap<String, serde_json::Value>,
    ) -> Result<crate::platform::schemas::AgentResponse, crate::platform::errors::PlatformError>;
}

/// A plain record constructed once per turn by the engine. Agents MUST NOT retain references
/// across turns — a fresh `Context` is built for every call.
pub struct Context {
    pub session_id: uuid::Uuid,
    pub user_id: String,
    pub agent_slug: String,
    pub lang: String,
    pub llm: Arc<LlmGateway>,
    pub tools: Arc<ToolRegistry>,
    pub connectors: Arc<ConnectorRegistry>,
    pub agents: Arc<dyn SubAgentInvoker>,
    pub storage: Arc<ScopedStorage>,
    pub memory: Arc<SessionMemory>,
    progress: Arc<dyn ProgressSink>,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: uuid::Uuid,
        user_id: String,
        agent_slug: String,
        lang: String,
        llm: Arc<LlmGateway>,
        tools: Arc<ToolRegistry>,
        connectors: Arc<ConnectorRegistry>,
        agents: Arc<dyn SubAgentInvoker>,
        storage: Arc<ScopedStorage>,
        memory: Arc<SessionMemory>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            agent_slug,
            lang,
            llm,
            tools,
            connectors,
            agents,
            storage,
            memory,
            progress,
        }
    }

    /// Publishes progress on the job bus when the turn runs under a job; a no-op for direct
    /// synchronous calls (backed by [`NoopProgressSink`]).
    pub async fn set_progress(&self, percent: u8, message: &str) {
        self.progress.set_progress(percent, message).await;
    }
}
