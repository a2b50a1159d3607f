//! Stable error taxonomy shared by every component.
//!
//! Every fallible operation in the platform resolves to a [`PlatformErrorCode`] plus a
//! human-readable message rather than an opaque error chain — that stable code is what crosses
//! component boundaries (agent → pipeline → engine → caller) and what callers match on.

use std::fmt;

/// Stable, machine-readable error codes. Each surfaces at exactly one layer; see the doc comment
/// on each variant for where.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlatformErrorCode {
    /// Input shape/size invalid. Surfaces at pipeline input validation.
    ValidationError,
    /// Governance denied the turn. Surfaces at pipeline quota check.
    QuotaExceeded,
    /// Pre-filter refused content. Surfaces at pipeline input moderation.
    ModerationBlockedInput,
    /// Post-filter refused the response. Surfaces at pipeline output moderation.
    ModerationBlockedOutput,
    /// Agent code raised. Surfaces at pipeline agent invocation.
    ExecutionError,
    /// Turn exceeded its deadline. Surfaces at the worker or pipeline.
    Timeout,
    /// Cooperative cancellation observed. Surfaces at the worker or context.
    Canceled,
    /// No agent registered for the given slug. Surfaces at the engine.
    AgentNotFound,
    /// Session lookup failed. Surfaces at the session store.
    SessionNotFound,
    /// Tool/connector parameter schema mismatch. Surfaces at the tool/connector registry.
    InvalidParams,
    /// Tool/connector slug unknown. Surfaces at the tool/connector registry.
    NotFound,
    /// Connector action unknown. Surfaces at the connector registry.
    InvalidAction,
    /// Connector action attempted before `connect`. Surfaces at the connector registry/handle.
    NotConnected,
    /// Connector failed to establish its connection. Surfaces at the connector handle.
    ConnectionFailed,
    /// Connector/tool rejected credentials. Surfaces at the connector/tool handle.
    AuthFailed,
    /// Upstream rate limit hit. Surfaces at the connector/tool handle.
    RateLimited,
    /// Upstream service returned an error. Surfaces at the connector/tool handle.
    ExternalApiError,
    /// Generic runtime failure inside tool/connector execution. Surfaces at C3/C4.
    ProcessingError,
    /// Referenced file/object does not exist. Surfaces at storage or connector handles.
    FileNotFound,
    /// Sub-agent call chain cycled back to a slug already on the stack.
    CycleDetected,
}

impl PlatformErrorCode {
    /// The stable string form used on the wire and in logs, e.g. `"QUOTA_EXCEEDED"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::ModerationBlockedInput => "MODERATION_BLOCKED_INPUT",
            Self::ModerationBlockedOutput => "MODERATION_BLOCKED_OUTPUT",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Canceled => "CANCELED",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidAction => "INVALID_ACTION",
            Self::NotConnected => "NOT_CONNECTED",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::RateLimited => "RATE_LIMITED",
            Self::ExternalApiError => "EXTERNAL_API_ERROR",
            Self::ProcessingError => "PROCESSING_ERROR",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::CycleDetected => "CYCLE_DETECTED",
        }
    }
}

impl fmt::Display for PlatformErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A platform error: a stable code plus a human-readable message.
///
/// This is the only error shape that crosses component boundaries. Components never propagate
/// raw `std::error::Error` values to callers; they catch at their own boundary and convert.
#[derive(Debug, Clone)]
pub struct PlatformError {
    pub code: PlatformErrorCode,
    pub message: String,
}

impl PlatformError {
    pub fn new(code: PlatformErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(PlatformErrorCode::ValidationError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(PlatformErrorCode::NotFound, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(PlatformErrorCode::ExecutionError, message)
    }
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PlatformError {}
