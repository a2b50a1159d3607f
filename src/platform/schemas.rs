//! The platform's data model: the shapes that cross component boundaries.
//!
//! Everything here is plain serde-friendly data. Components own the behavior around these types
//! (registries, stores, the pipeline); this module only owns their shape.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::platform::errors::PlatformErrorCode;

/// Immutable descriptor produced by agent code and discovered at startup.
///
/// The manifest is the source of truth; the catalog table is a persisted projection of it, not
/// the other way around.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentManifest {
    /// Stable, unique, kebab-case identifier.
    pub slug: String,
    pub display_name: String,
    pub version: String,
    pub description: String,
    pub icon: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tool_dependencies: Vec<String>,
    #[serde(default)]
    pub connector_dependencies: Vec<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<AgentCapability>,
    pub min_platform_version: String,
}

/// Capabilities an agent may declare; currently only streaming is consulted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCapability {
    Streaming,
}

/// An attachment reference: logical name plus where the bytes actually live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub storage_key: String,
}

/// Turn input. Consumed once by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Maximum textual content length for a [`UserMessage`], in characters.
pub const MAX_USER_MESSAGE_CHARS: usize = 100_000;

impl UserMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            attachments: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Validates the character-count bound from the data model; does not touch moderation.
    pub fn validate(&self) -> Result<(), PlatformErrorCode> {
        if self.content.chars().count() > MAX_USER_MESSAGE_CHARS {
            return Err(PlatformErrorCode::ValidationError);
        }
        Ok(())
    }
}

/// Turn output. May be rewritten in place by post-moderation before the caller sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            attachments: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("error".to_string(), serde_json::Value::String(message.into()));
        Self {
            content: String::new(),
            attachments: Vec::new(),
            metadata,
        }
    }
}

/// One fragment of a streaming response.
///
/// `metadata` is only meaningful when `is_final` is set — intermediate chunks carry content only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseChunk {
    pub content: String,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl ResponseChunk {
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_final: false,
            metadata: None,
        }
    }

    pub fn final_chunk(
        content: impl Into<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            content: content.into(),
            is_final: true,
            metadata: Some(metadata),
        }
    }
}

/// Conversation envelope. Belongs to exactly one (user, agent) pair for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub agent_slug: String,
    pub title: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, agent_slug: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            agent_slug: agent_slug.into(),
            title: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Role of a durable [`SessionMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Durable, append-only session history record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Semantic parameter type for tool/connector input and output schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

/// One parameter in an ordered tool/connector input or output schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub description: String,
}

/// Execution mode a tool declares — whether invocation can complete inline or must be polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Synchronous,
    Asynchronous,
}

/// Self-describing tool contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub slug: String,
    pub display_name: String,
    pub description: String,
    pub version: String,
    pub category: Option<String>,
    pub execution_mode: ExecutionMode,
    pub timeout_secs: u64,
    pub input_schema: Vec<ParamSpec>,
    pub output_schema: Vec<ParamSpec>,
    #[serde(default)]
    pub examples: Vec<serde_json::Value>,
    #[serde(default)]
    pub required_connectors: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Authentication scheme a connector declares for its own configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    None,
    ApiKey,
    OAuth2,
    Basic,
    Custom,
}

/// One action a connector exposes, with its own input/output schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorAction {
    pub name: String,
    pub description: String,
    pub input_schema: Vec<ParamSpec>,
    pub output_schema: Vec<ParamSpec>,
}

/// Self-describing connector contract — same shape as [`ToolMetadata`] plus auth and actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorMetadata {
    pub slug: String,
    pub display_name: String,
    pub description: String,
    pub version: String,
    pub category: Option<String>,
    pub auth_type: AuthType,
    pub config_schema: Vec<ParamSpec>,
    pub actions: Vec<ConnectorAction>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Tagged success/failure outcome shared by tool and connector invocations.
///
/// Never has both `success = true` and `error` set — use [`ExecutionOutcome::ok`] /
/// [`ExecutionOutcome::err`] to keep that invariant rather than constructing the struct directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default)]
    pub output: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<PlatformErrorCode>,
}

impl ExecutionOutcome {
    pub fn ok(output: HashMap<String, serde_json::Value>) -> Self {
        Self {
            success: true,
            output,
            error_message: None,
            error_code: None,
        }
    }

    pub fn err(code: PlatformErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: HashMap::new(),
            error_message: Some(message.into()),
            error_code: Some(code),
        }
    }
}

/// `tool_result` and `connector_result` in the data model share this shape exactly.
pub type ToolResult = ExecutionOutcome;
/// `tool_result` and `connector_result` in the data model share this shape exactly.
pub type ConnectorResult = ExecutionOutcome;

/// Job lifecycle state. Only the terminal states are persisted durably; the rest are bus-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Streaming,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// Asynchronous invocation record (C10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub user_id: String,
    pub agent_slug: String,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AgentResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<PlatformErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(
        user_id: impl Into<String>,
        agent_slug: impl Into<String>,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Queued,
            user_id: user_id.into(),
            agent_slug: agent_slug.into(),
            session_id,
            created_at: now,
            terminal_at: None,
            result: None,
            error_code: None,
            error_message: None,
        }
    }
}
