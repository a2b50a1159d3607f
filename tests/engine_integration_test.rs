//! End-to-end exercise of the engine through the public crate surface: a registered agent runs a
//! full turn through the pipeline, session history accumulates, and a second turn sees it.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use uuid::Uuid;

use agentrun::platform::client_wrapper::{ClientWrapper, Message, Role};
use agentrun::platform::connectors::ConnectorRegistry;
use agentrun::platform::engine::{Agent, AgentEngine, AgentError, AgentRegistry};
use agentrun::platform::errors::PlatformError;
use agentrun::platform::llm::{ClientFactory, LlmCatalog, ProviderModel, SecretStore};
use agentrun::platform::pipeline::{
    ConsumptionRecorder, ExecutionPipeline, Moderation, ModerationDecision, QuotaDecision, QuotaService,
};
use agentrun::platform::schemas::{
    AgentCapability, AgentManifest, AgentResponse, Session, SessionMessage, UserMessage,
};
use agentrun::platform::sessions::{SessionBackend, SessionStore};
use agentrun::platform::storage::BlobStore;
use agentrun::Context;

struct GreeterAgent;

#[async_trait]
impl Agent for GreeterAgent {
    fn manifest(&self) -> AgentManifest {
        AgentManifest {
            slug: "greeter".to_string(),
            display_name: "Greeter".to_string(),
            version: "1.0.0".to_string(),
            description: "says hello".to_string(),
            icon: None,
            category: None,
            tags: vec![],
            tool_dependencies: vec![],
            connector_dependencies: vec![],
            triggers: vec![],
            capabilities: vec![AgentCapability::Streaming],
            min_platform_version: "1.0.0".to_string(),
        }
    }

    async fn handle_turn(&self, msg: UserMessage, ctx: &Context) -> Result<AgentResponse, AgentError> {
        let history = ctx.memory.history(None).await.map_err(AgentError::from)?;
        Ok(AgentResponse {
            content: format!("hello, you've sent {} message(s) so far: {}", history.len() + 1, msg.content),
            metadata: HashMap::new(),
            attachments: vec![],
        })
    }
}

struct AllowAllQuota;
#[async_trait]
impl QuotaService for AllowAllQuota {
    async fn check(&self, _user_id: &str, _agent_slug: &str) -> Result<QuotaDecision, String> {
        Ok(QuotaDecision { allowed: true, reason: None })
    }
}

struct PassModeration;
#[async_trait]
impl Moderation for PassModeration {
    async fn filter_in(&self, _content: &str, _agent_slug: &str) -> Result<ModerationDecision, String> {
        Ok(ModerationDecision { blocked: false, replacement: None })
    }
    async fn filter_out(&self, _content: &str, _agent_slug: &str) -> Result<ModerationDecision, String> {
        Ok(ModerationDecision { blocked: false, replacement: None })
    }
}

struct NoopConsumption;
#[async_trait]
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

struct MemoryBlobStore;
#[async_trait]
impl BlobStore for MemoryBlobStore {
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

#[derive(Default)]
struct MemorySessionBackend {
    sessions: StdMutex<HashMap<Uuid, Session>>,
    messages: StdMutex<HashMap<Uuid, Vec<SessionMessage>>>,
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn insert_session(&self, session: &Session) -> Result<(), PlatformError> {
        self.sessions.lock().unwrap().insert(session.id, session.clone());
        Ok(())
    }
    async fn fetch_session(&self, id: Uuid) -> Result<Option<Session>, PlatformError> {
        Ok(self.sessions.lock().unwrap().get(&id).cloned())
    }
    async fn update_session(&self, session: &Session) -> Result<(), PlatformError> {
        self.sessions.lock().unwrap().insert(session.id, session.clone());
        Ok(())
    }
    async fn list_sessions(
        &self,
        _agent_slug: &str,
        _user_id: &str,
        _limit: usize,
        _offset: usize,
    ) -> Result<Vec<Session>, PlatformError> {
        Ok(self.sessions.lock().unwrap().values().cloned().collect())
    }
    async fn insert_message(&self, message: &SessionMessage) -> Result<(), PlatformError> {
        self.messages
            .lock()
            .unwrap()
            .entry(message.session_id)
            .or_default()
            .push(message.clone());
        Ok(())
    }
    async fn fetch_messages(
        &self,
        session_id: Uuid,
        _limit: Option<usize>,
    ) -> Result<Vec<SessionMessage>, PlatformError> {
        Ok(self.messages.lock().unwrap().get(&session_id).cloned().unwrap_or_default())
    }
    async fn clear_messages(&self, session_id: Uuid) -> Result<(), PlatformError> {
        self.messages.lock().unwrap().remove(&session_id);
        Ok(())
    }
}

struct DummyLlmCatalog;
#[async_trait]
impl LlmCatalog for DummyLlmCatalog {
    async fn agent_config(&self, _agent_slug: &str) -> Result<Option<ProviderModel>, PlatformError> {
        Ok(None)
    }
    async fn active_pairs(&self) -> Result<Vec<ProviderModel>, PlatformError> {
        Ok(vec![ProviderModel {
            id: 1,
            provider: "stub".to_string(),
            model: "stub-model".to_string(),
            active: true,
        }])
    }
}

struct DummySecretStore;
#[async_trait]
impl SecretStore for DummySecretStore {
    async fn has_key(&self, _provider: &str) -> Result<bool, PlatformError> {
        Ok(true)
    }
}

struct DummyClient;
#[async_trait]
impl ClientWrapper for DummyClient {
    async fn send_message(
        &self,
        _messages: &[Message],
        _tools: Option<Vec<agentrun::platform::client_wrapper::ToolDefinition>>,
    ) -> Result<Message, Box<dyn StdError>> {
        Ok(Message {
            role: Role::Assistant,
            content: Arc::from("stub reply"),
            tool_calls: vec![],
        })
    }
    fn model_name(&self) -> &str {
        "stub-model"
    }
}

struct DummyClientFactory;
impl ClientFactory for DummyClientFactory {
    fn build(&self, _provider: &str, _model: &str) -> Result<Arc<dyn ClientWrapper>, PlatformError> {
        Ok(Arc::new(DummyClient))
    }
}

fn build_engine() -> AgentEngine {
    let mut agents = AgentRegistry::new();
    agents.register(Arc::new(GreeterAgent));

    AgentEngine {
        agents: Arc::new(agents),
        pipeline: Arc::new(ExecutionPipeline::new(
            Arc::new(AllowAllQuota),
            Arc::new(PassModeration),
            Arc::new(NoopConsumption),
        )),
        sessions: Arc::new(SessionStore::new(Arc::new(MemorySessionBackend::default()))),
        tools: Arc::new(agentrun::platform::tools::ToolRegistry::new()),
        connectors: Arc::new(ConnectorRegistry::new()),
        blob_store: Arc::new(MemoryBlobStore),
        llm_catalog: Arc::new(DummyLlmCatalog),
        secrets: Arc::new(DummySecretStore),
        client_factory: Arc::new(DummyClientFactory),
    }
}

#[tokio::test]
async fn a_turn_runs_through_the_pipeline_and_session_history_persists() {
    let engine = build_engine();

    let result = engine
        .execute("greeter", "user-1", None, UserMessage::new("hi there"))
        .await
        .expect("turn should execute");

    assert!(result.success);
    let response = result.response.expect("successful turn has a response");
    assert!(response.content.contains("hello"));
}

#[tokio::test]
async fn unknown_agent_slug_is_reported_as_not_found() {
    let engine = build_engine();
    let err = engine
        .execute("does-not-exist", "user-1", None, UserMessage::new("hi"))
        .await
        .expect_err("unregistered slug must fail");

    assert_eq!(
        err.code,
        agentrun::platform::errors::PlatformErrorCode::AgentNotFound
    );
}
