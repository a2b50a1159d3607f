//! Execution pipeline (C9): the center of the design. Wraps every turn with ordered phases the
//! agent cannot opt out of.

use std::time::Instant;

use futures_util::StreamExt;
use log::{error, warn};

use crate::platform::context::Context;
use crate::platform::engine::Agent;
use crate::platform::errors::{PlatformError, PlatformErrorCode};
use crate::platform::schemas::{
    AgentResponse, ResponseChunk, UserMessage, MAX_USER_MESSAGE_CHARS,
};

/// Outcome of `QuotaService.check`.
pub struct QuotaDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

/// Governance collaborator for per-turn quota enforcement. A failure here is fail-open: logged,
/// turn proceeds as if allowed.
#[async_trait::async_trait]
pub trait QuotaService: Send + Sync {
    async fn check(&self, user_id: &str, agent_slug: &str) -> Result<QuotaDecision, String>;
}

/// Outcome of a moderation filter pass.
pub struct ModerationDecision {
    pub blocked: bool,
    pub replacement: Option<String>,
}

/// Pre/post content moderation collaborator. A failure here is also fail-open.
#[async_trait::async_trait]
pub trait Moderation: Send + Sync {
    async fn filter_in(&self, content: &str, agent_slug: &str) -> Result<ModerationDecision, String>;
    async fn filter_out(&self, content: &str, agent_slug: &str) -> Result<ModerationDecision, String>;
}

/// Token-consumption accounting collaborator. A failure here is fail-open: logged, never fails
/// the turn.
#[async_trait::async_trait]
pub trait ConsumptionRecorder: Send + Sync {
    async fn record(
        &self,
        user_id: &str,
        agent_slug: &str,
        provider: Option<&str>,
        model: Option<&str>,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Result<(), String>;
}

/// Always-produced result of running a turn through the pipeline.
pub struct PipelineResult {
    pub success: bool,
    pub response: Option<AgentResponse>,
    pub error_code: Option<PlatformErrorCode>,
    pub error_message: Option<String>,
    pub duration_ms: u128,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
}

impl PipelineResult {
    fn failure(code: PlatformErrorCode, message: impl Into<String>, duration_ms: u128) -> Self {
        Self {
            success: false,
            response: None,
            error_code: Some(code),
            error_message: Some(message.into()),
            duration_ms,
            tokens_in: None,
            tokens_out: None,
        }
    }
}

/// Wraps every turn with, in order: input validation, quota check, input moderation, agent
/// invocation, output moderation, consumption accounting.
pub struct ExecutionPipeline {
    quota: std::sync::Arc<dyn QuotaService>,
    moderation: std::sync::Arc<dyn Moderation>,
    consumption: std::sync::Arc<dyn ConsumptionRecorder>,
}

impl ExecutionPipeline {
    pub fn new(
        quota: std::sync::Arc<dyn QuotaService>,
        moderation: std::sync::Arc<dyn Moderation>,
        consumption: std::sync::Arc<dyn ConsumptionRecorder>,
    ) -> Self {
        Self {
            quota,
            moderation,
            consumption,
        }
    }

    /// Runs the synchronous path.
    pub async fn run(
        &self,
        agent: &dyn Agent,
        mut msg: UserMessage,
        ctx: &Context,
        resolved_provider: Option<&str>,
        resolved_model: Option<&str>,
    ) -> PipelineResult {
        let started = Instant::now();

        if let Err(code) = self.validate_input(&msg) {
            return PipelineResult::failure(code, "invalid turn input", started.elapsed().as_millis());
        }

        match self.quota.check(&ctx.user_id, &ctx.agent_slug).await {
            Ok(decision) if !decision.allowed => {
                return PipelineResult::failure(
                    PlatformErrorCode::QuotaExceeded,
                    decision.reason.unwrap_or_else(|| "quota exceeded".to_string()),
                    started.elapsed().as_millis(),
                );
            }
            Ok(_) => {}
            Err(reason) => warn!("quota check failed open for agent '{}': {reason}", ctx.agent_slug),
        }

        match self.moderation.filter_in(&msg.content, &ctx.agent_slug).await {
            Ok(decision) if decision.blocked => {
                return PipelineResult::failure(
                    PlatformErrorCode::ModerationBlockedInput,
                    "input blocked by moderation",
                    started.elapsed().as_millis(),
                );
            }
            Ok(decision) => {
                if let Some(replacement) = decision.replacement {
                    msg.content = replacement;
                }
            }
            Err(reason) => warn!("input moderation failed open for agent '{}': {reason}", ctx.agent_slug),
        }

        let response = match std::panic::AssertUnwindSafe(agent.handle_turn(msg, ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                error!("agent '{}' raised during handle_turn: {err}", ctx.agent_slug);
                return PipelineResult::failure(
                    PlatformErrorCode::ExecutionError,
                    err.to_string(),
                    started.elapsed().as_millis(),
                );
            }
            Err(_) => {
                error!("agent '{}' panicked during handle_turn", ctx.agent_slug);
                return PipelineResult::failure(
                    PlatformErrorCode::ExecutionError,
                    "agent execution failed",
                    started.elapsed().as_millis(),
                );
            }
        };

        let mut response = response;
        match self.moderation.filter_out(&response.content, &ctx.agent_slug).await {
            Ok(decision) if decision.blocked => {
                return PipelineResult::failure(
                    PlatformErrorCode::ModerationBlockedOutput,
                    "output blocked by moderation",
                    started.elapsed().as_millis(),
                );
            }
            Ok(decision) => {
                if let Some(replacement) = decision.replacement {
                    response.content = replacement;
                }
            }
            Err(reason) => warn!("output moderation failed open for agent '{}': {reason}", ctx.agent_slug),
        }

        let (tokens_in, tokens_out) = self
            .record_consumption(&response, ctx, resolved_provider, resolved_model)
            .await;

        PipelineResult {
            success: true,
            response: Some(response),
            error_code: None,
            error_message: None,
            duration_ms: started.elapsed().as_millis(),
            tokens_in,
            tokens_out,
        }
    }

    /// Runs the streaming path. Chunks are forwarded to `on_chunk` as they arrive; the
    /// accumulated full text is moderated only once the stream completes, matching the design
    /// note that the client has already seen the content by the time a block can be recorded.
    pub async fn run_stream<F>(
        &self,
        agent: &dyn Agent,
        mut msg: UserMessage,
        ctx: &Context,
        resolved_provider: Option<&str>,
        resolved_model: Option<&str>,
        mut on_chunk: F,
    ) -> PipelineResult
    where
        F: FnMut(ResponseChunk) + Send,
    {
        let started = Instant::now();

        if let Err(code) = self.validate_input(&msg) {
            return PipelineResult::failure(code, "invalid turn input", started.elapsed().as_millis());
        }

        match self.quota.check(&ctx.user_id, &ctx.agent_slug).await {
            Ok(decision) if !decision.allowed => {
                return PipelineResult::failure(
                    PlatformErrorCode::QuotaExceeded,
                    decision.reason.unwrap_or_else(|| "quota exceeded".to_string()),
                    started.elapsed().as_millis(),
                );
            }
            Ok(_) => {}
            Err(reason) => warn!("quota check failed open for agent '{}': {reason}", ctx.agent_slug),
        }

        match self.moderation.filter_in(&msg.content, &ctx.agent_slug).await {
            Ok(decision) if decision.blocked => {
                return PipelineResult::failure(
                    PlatformErrorCode::ModerationBlockedInput,
                    "input blocked by moderation",
                    started.elapsed().as_millis(),
                );
            }
            Ok(decision) => {
                if let Some(replacement) = decision.replacement {
                    msg.content = replacement;
                }
            }
            Err(reason) => warn!("input moderation failed open for agent '{}': {reason}", ctx.agent_slug),
        }

        let mut stream = agent.handle_turn_stream(msg, ctx);
        let mut accumulated = String::new();
        let mut final_metadata = None;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    error!("agent '{}' raised during handle_turn_stream: {err}", ctx.agent_slug);
                    return PipelineResult::failure(
                        PlatformErrorCode::ExecutionError,
                        err.to_string(),
                        started.elapsed().as_millis(),
                    );
                }
            };
            accumulated.push_str(&chunk.content);
            if chunk.is_final {
                final_metadata = chunk.metadata.clone();
            }
            on_chunk(chunk);
        }

        match self.moderation.filter_out(&accumulated, &ctx.agent_slug).await {
            Ok(decision) if decision.blocked => {
                // The client already received the stream; blocking only supersedes the terminal
                // record, and any persisted assistant message must be dropped by the caller.
                return PipelineResult::failure(
                    PlatformErrorCode::ModerationBlockedOutput,
                    "streamed output blocked by moderation",
                    started.elapsed().as_millis(),
                );
            }
            Ok(_) => {}
            Err(reason) => warn!("output moderation failed open for agent '{}': {reason}", ctx.agent_slug),
        }

        let response = AgentResponse {
            content: accumulated,
            attachments: vec![],
            metadata: final_metadata.unwrap_or_default(),
        };

        let (tokens_in, tokens_out) = self
            .record_consumption(&response, ctx, resolved_provider, resolved_model)
            .await;

        PipelineResult {
            success: true,
            response: Some(response),
            error_code: None,
            error_message: None,
            duration_ms: started.elapsed().as_millis(),
            tokens_in,
            tokens_out,
        }
    }

    fn validate_input(&self, msg: &UserMessage) -> Result<(), PlatformErrorCode> {
        if msg.content.is_empty() && msg.attachments.is_empty() {
            return Err(PlatformErrorCode::ValidationError);
        }
        if msg.content.chars().count() > MAX_USER_MESSAGE_CHARS {
            return Err(PlatformErrorCode::ValidationError);
        }
        Ok(())
    }

    async fn record_consumption(
        &self,
        response: &AgentResponse,
        ctx: &Context,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> (Option<u64>, Option<u64>) {
        let tokens_in = response
            .metadata
            .get("tokens_in")
            .and_then(|v| v.as_u64());
        let tokens_out = response
            .metadata
            .get("tokens_out")
            .and_then(|v| v.as_u64());

        if let (Some(tin), Some(tout)) = (tokens_in, tokens_out) {
            if let Err(reason) = self
                .consumption
                .record(&ctx.user_id, &ctx.agent_slug, provider, model, tin, tout)
                .await
            {
                warn!("consumption recording failed open for agent '{}': {reason}", ctx.agent_slug);
            }
        }

        (tokens_in, tokens_out)
    }
}

// Local shim matching tools.rs's pattern, kept minimal: catches a panicking agent without making
// every agent implementation responsible for its own unwind safety.
use futures_util::future::FutureExt;
trait CatchUnwindExt: std::future::Future + Sized {
    fn catch_unwind(self) -> futures_util::future::CatchUnwind<futures_util::future::AssertUnwindSafe<Self>>
    where
        Self: std::panic::UnwindSafe,
    {
        FutureExt::catch_unwind(self)
    }
}
impl<F: std::future::Future> CatchUnwindExt for std::panic::AssertUnwindSafe<F> where F: std::panic::UnwindSafe {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::engine::{AgentError, ResponseChunkStream};
    use std::collections::HashMap;
    use std::sync::Arc;

    struct AllowAllQuota;
    #[async_trait::async_trait]
    impl QuotaService for AllowAllQuota {
        async fn check(&self, _user_id: &str, _agent_slug: &str) -> Result<QuotaDecision, String> {
            Ok(QuotaDecision { allowed: true, reason: None })
        }
    }

    struct DenyQuota;
    #[async_trait::async_trait]
    impl QuotaService for DenyQuota {
        async fn check(&self, _user_id: &str, _agent_slug: &str) -> Result<QuotaDecision, String> {
            Ok(QuotaDecision { allowed: false, reason: Some("over limit".to_string()) })
        }
    }

    struct PassModeration;
    #[async_trait::async_trait]
    impl Moderation for PassModeration {
        async fn filter_in(&self, _content: &str, _agent_slug: &str) -> Result<ModerationDecision, String> {
            Ok(ModerationDecision { blocked: false, replacement: None })
        }
        async fn filter_out(&self, _content: &str, _agent_slug: &str) -> Result<ModerationDecision, String> {
            Ok(ModerationDecision { blocked: false, replacement: None })
        }
    }

    struct BlockOutputModeration;
    #[async_trait::async_trait]
    impl Moderation for BlockOutputModeration {
        async fn filter_in(&self, _content: &str, _agent_slug: &str) -> Result<ModerationDecision, String> {
            Ok(ModerationDecision { blocked: false, replacement: None })
        }
        async fn filter_out(&self, _content: &str, _agent_slug: &str) -> Result<ModerationDecision, String> {
            Ok(ModerationDecision { blocked: true, replacement: None })
        }
    }

    struct NoopConsumption;
    #[async_trait::async_trait]
    impl ConsumptionRecorder for NoopConsumption {
        async fn record(
            &self,
            _user_id: &str,
            _agent_slug: &str,
            _provider: Option<&str>,
            _model: Option<&str>,
            _tokens_in: u64,
            _tokens_out: u64,
        ) -> Result<(), String> {
            Ok(())
        }
    }

    struct EchoAgent;
    #[async_trait::async_trait]
    impl Agent for EchoAgent {
        fn manifest(&self) -> crate::platform::schemas::AgentManifest {
            unimplemented!("not exercised in these tests")
        }

        async fn handle_turn(&self, msg: UserMessage, _ctx: &Context) -> Result<AgentResponse, AgentError> {
            Ok(AgentResponse::new(msg.content))
        }

        fn handle_turn_stream<'a>(&'a self, msg: UserMessage, _ctx: &'a Context) -> ResponseChunkStream {
            Box::pin(futures_util::stream::iter(vec![
                Ok(ResponseChunk::delta(msg.content.clone())),
                Ok(ResponseChunk::final_chunk("", HashMap::new())),
            ]))
        }
    }

    fn test_context() -> Context {
        use crate::platform::connectors::ConnectorRegistry;
        use crate::platform::context::{NoopProgressSink, SessionMemory, SubAgentInvoker};
        use crate::platform::llm::LlmGateway;
        use crate::platform::sessions::SessionStore;
        use crate::platform::storage::{ScopedStorage, StorageScope};
        use crate::platform::tools::ToolRegistry;

        struct DummySubAgents;
        #[async_trait::async_trait]
        impl SubAgentInvoker for DummySubAgents {
            async fn execute(
                &self,
                _target_slug: &str,
                _message: UserMessage,
                _metadata: HashMap<String, serde_json::Value>,
            ) -> Result<AgentResponse, PlatformError> {
                unimplemented!("not exercised in these tests")
            }
        }

        struct DummyClient;
        #[async_trait::async_trait]
        impl crate::platform::client_wrapper::ClientWrapper for DummyClient {
            async fn send_message(
                &self,
                _messages: &[crate::platform::client_wrapper::Message],
                _tools: Option<Vec<crate::platform::client_wrapper::ToolDefinition>>,
            ) -> Result<crate::platform::client_wrapper::Message, Box<dyn std::error::Error>> {
                unimplemented!("not exercised in these tests")
            }
            fn model_name(&self) -> &str {
                "dummy"
            }
        }

        struct DummyBlobStore;
        #[async_trait::async_trait]
        impl crate::platform::storage::BlobStore for DummyBlobStore {
            async fn put(&self, _key: &str, _bytes: Vec<u8>) -> Result<(), PlatformError> {
                Ok(())
            }
            async fn get(&self, _key: &str) -> Result<Vec<u8>, PlatformError> {
                Ok(vec![])
            }
            async fn delete(&self, _key: &str) -> Result<(), PlatformError> {
                Ok(())
            }
            async fn list(&self, _prefix: &str) -> Result<Vec<String>, PlatformError> {
                Ok(vec![])
            }
            async fn exists(&self, _key: &str) -> Result<bool, PlatformError> {
                Ok(false)
            }
        }

        struct DummySessionBackend;
        #[async_trait::async_trait]
        impl crate::platform::sessions::SessionBackend for DummySessionBackend {
            async fn insert_session(&self, _session: &crate::platform::schemas::Session) -> Result<(), PlatformError> {
                Ok(())
            }
            async fn fetch_session(&self, _id: uuid::Uuid) -> Result<Option<crate::platform::schemas::Session>, PlatformError> {
                Ok(None)
            }
            async fn update_session(&self, _session: &crate::platform::schemas::Session) -> Result<(), PlatformError> {
                Ok(())
            }
            async fn list_sessions(
                &self,
                _agent_slug: &str,
                _user_id: &str,
                _limit: usize,
                _offset: usize,
            ) -> Result<Vec<crate::platform::schemas::Session>, PlatformError> {
                Ok(vec![])
            }
            async fn insert_message(&self, _message: &crate::platform::schemas::SessionMessage) -> Result<(), PlatformError> {
                Ok(())
            }
            async fn fetch_messages(
                &self,
                _session_id: uuid::Uuid,
                _limit: Option<usize>,
            ) -> Result<Vec<crate::platform::schemas::SessionMessage>, PlatformError> {
                Ok(vec![])
            }
            async fn clear_messages(&self, _session_id: uuid::Uuid) -> Result<(), PlatformError> {
                Ok(())
            }
        }

        let session_id = uuid::Uuid::new_v4();
        let session_store = Arc::new(SessionStore::new(Arc::new(DummySessionBackend)));
        Context::new(
            session_id,
            "user-1".to_string(),
            "echo-agent".to_string(),
            "en".to_string(),
            Arc::new(LlmGateway::new(Arc::new(DummyClient))),
            Arc::new(ToolRegistry::new()),
            Arc::new(ConnectorRegistry::new()),
            Arc::new(DummySubAgents),
            Arc::new(ScopedStorage::new(
                Arc::new(DummyBlobStore),
                &StorageScope::User { user_id: "user-1".to_string() },
                "echo-agent",
            )),
            Arc::new(SessionMemory::new(session_store, session_id)),
            Arc::new(NoopProgressSink),
        )
    }

    #[tokio::test]
    async fn empty_content_without_attachments_is_validation_error() {
        let pipeline = ExecutionPipeline::new(Arc::new(AllowAllQuota), Arc::new(PassModeration), Arc::new(NoopConsumption));
        let ctx = test_context();
        let result = pipeline.run(&EchoAgent, UserMessage::new(""), &ctx, None, None).await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(PlatformErrorCode::ValidationError));
    }

    #[tokio::test]
    async fn denied_quota_short_circuits_before_agent_runs() {
        let pipeline = ExecutionPipeline::new(Arc::new(DenyQuota), Arc::new(PassModeration), Arc::new(NoopConsumption));
        let ctx = test_context();
        let result = pipeline.run(&EchoAgent, UserMessage::new("hi"), &ctx, None, None).await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(PlatformErrorCode::QuotaExceeded));
    }

    #[tokio::test]
    async fn successful_turn_echoes_content() {
        let pipeline = ExecutionPipeline::new(Arc::new(AllowAllQuota), Arc::new(PassModeration), Arc::new(NoopConsumption));
        let ctx = test_context();
        let result = pipeline.run(&EchoAgent, UserMessage::new("hi"), &ctx, None, None).await;
        assert!(result.success);
        assert_eq!(result.response.unwrap().content, "hi");
    }

    #[tokio::test]
    async fn streaming_turn_blocked_on_output_drops_success() {
        let pipeline =
            ExecutionPipeline::new(Arc::new(AllowAllQuota), Arc::new(BlockOutputModeration), Arc::new(NoopConsumption));
        let ctx = test_context();
        let mut received = Vec::new();
        let result = pipeline
            .run_stream(&EchoAgent, UserMessage::new("hi"), &ctx, None, None, |chunk| {
                received.push(chunk);
            })
            .await;
        assert!(!received.is_empty(), "client already saw the stream");
        assert!(!result.success);
        assert_eq!(result.error_code, Some(PlatformErrorCode::ModerationBlockedOutput));
    }
}
