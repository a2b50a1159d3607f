// src/lib.rs

//! `agentrun` is a multi-tenant agent execution platform: it hosts user-defined conversational
//! agents, routes turns through a disciplined pipeline (validation, quotas, moderation,
//! consumption accounting), and dispatches to LLM providers, tools, and connectors through a
//! per-turn capability context. See [`platform`] for the component breakdown.

pub mod platform;

// Re-exports for the common entry points so callers don't have to spell out the full module path.
pub use platform::client_wrapper::{ClientWrapper, Message, Role};
pub use platform::context::Context;
pub use platform::engine::AgentEngine;
pub use platform::errors::{PlatformError, PlatformErrorCode};
pub use platform::pipeline::{ExecutionPipeline, PipelineResult};
