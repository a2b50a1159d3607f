//! Tool registry (C3): discovers tool implementations and dispatches validated calls to them.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::FutureExt;
use log::{error, warn};

use crate::platform::client_wrapper::ToolDefinition;
use crate::platform::errors::PlatformErrorCode;
use crate::platform::schemas::{ParamType, ToolResult};

pub use crate::platform::schemas::{ExecutionOutcome, ToolMetadata};

impl ToolMetadata {
    /// Derives the provider-agnostic schema handed to the LLM gateway when native tool calling is
    /// requested for a turn. Required parameters are listed in `required`; the rest fall under
    /// `properties` with their declared type and description.
    pub fn to_tool_definition(&self) -> ToolDefinition {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for param in &self.input_schema {
            let json_type = match param.param_type {
                ParamType::String => "string",
                ParamType::Integer => "integer",
                ParamType::Number => "number",
                ParamType::Boolean => "boolean",
                ParamType::Array => "array",
                ParamType::Object => "object",
            };
            properties.insert(
                param.name.clone(),
                serde_json::json!({ "type": json_type, "description": param.description }),
            );
            if param.required {
                required.push(serde_json::Value::String(param.name.clone()));
            }
        }

        ToolDefinition {
            name: self.slug.clone(),
            description: self.description.clone(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": serde_json::Value::Object(properties),
                "required": required,
            }),
        }
    }
}

/// Health status reported by a tool or connector.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
}

impl HealthStatus {
    pub fn ok() -> Self {
        Self {
            healthy: true,
            message: String::new(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

/// A self-describing tool implementation.
#[async_trait]
pub trait ToolHandle: Send + Sync {
    fn metadata(&self) -> ToolMetadata;

    async fn execute(
        &self,
        params: &HashMap<String, serde_json::Value>,
    ) -> ToolResult;

    /// Default: checks required/non-null and declared semantic types. Tools with stricter needs
    /// may override.
    fn validate_params(&self, params: &HashMap<String, serde_json::Value>) -> Result<(), String> {
        validate_against_schema(&self.metadata().input_schema, params)
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::ok()
    }
}

/// Checks `params` against an ordered input schema: required+non-null, and type compatibility.
pub fn validate_against_schema(
    schema: &[crate::platform::schemas::ParamSpec],
    params: &HashMap<String, serde_json::Value>,
) -> Result<(), String> {
    for spec in schema {
        match params.get(&spec.name) {
            None | Some(serde_json::Value::Null) => {
                if spec.required {
                    return Err(format!("missing required parameter: {}", spec.name));
                }
            }
            Some(value) => {
                if !type_matches(spec.param_type, value) {
                    return Err(format!(
                        "parameter {} does not match declared type {:?}",
                        spec.name, spec.param_type
                    ));
                }
            }
        }
    }
    Ok(())
}

fn type_matches(declared: ParamType, value: &serde_json::Value) -> bool {
    match declared {
        ParamType::String => value.is_string(),
        ParamType::Integer => value.is_i64() || value.is_u64(),
        ParamType::Number => value.is_number(),
        ParamType::Boolean => value.is_boolean(),
        ParamType::Array => value.is_array(),
        ParamType::Object => value.is_object(),
    }
}

/// Holds `slug → ToolHandle`, discovered once at startup.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandle>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registers a tool, replacing any earlier registration under the same slug with a warning.
    pub fn register(&mut self, handle: Arc<dyn ToolHandle>) {
        let slug = handle.metadata().slug.clone();
        if self.tools.insert(slug.clone(), handle).is_some() {
            warn!("tool registry: duplicate slug '{slug}', replacing earlier registration");
        }
    }

    pub fn list(&self) -> Vec<ToolMetadata> {
        self.tools.values().map(|t| t.metadata()).collect()
    }

    pub fn list_by_category(&self, category: &str) -> Vec<ToolMetadata> {
        self.tools
            .values()
            .map(|t| t.metadata())
            .filter(|m| m.category.as_deref() == Some(category))
            .collect()
    }

    pub fn categories(&self) -> std::collections::HashSet<String> {
        self.tools
            .values()
            .filter_map(|t| t.metadata().category)
            .collect()
    }

    pub fn get(&self, slug: &str) -> Option<ToolMetadata> {
        self.tools.get(slug).map(|t| t.metadata())
    }

    pub fn slugs(&self) -> std::collections::HashSet<String> {
        self.tools.keys().cloned().collect()
    }

    pub async fn health(&self) -> HashMap<String, HealthStatus> {
        let mut out = HashMap::new();
        for (slug, handle) in &self.tools {
            out.insert(slug.clone(), handle.health().await);
        }
        out
    }

    pub async fn health_of(&self, slug: &str) -> Option<HealthStatus> {
        match self.tools.get(slug) {
            Some(handle) => Some(handle.health().await),
            None => None,
        }
    }

    /// Validates `params` against the tool's declared schema before invoking it; never calls the
    /// tool on a validation mismatch. A panic inside the tool is caught and mapped to
    /// `PROCESSING_ERROR` rather than unwinding into the caller.
    pub async fn execute(
        &self,
        slug: &str,
        params: HashMap<String, serde_json::Value>,
    ) -> ToolResult {
        let Some(handle) = self.tools.get(slug) else {
            return ExecutionOutcome::err(PlatformErrorCode::NotFound, format!("unknown tool: {slug}"));
        };

        if let Err(reason) = handle.validate_params(&params) {
            return ExecutionOutcome::err(PlatformErrorCode::InvalidParams, reason);
        }

        match AssertUnwindSafe(handle.execute(&params)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("tool '{slug}' panicked during execute");
                ExecutionOutcome::err(PlatformErrorCode::ProcessingError, "tool execution failed")
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
