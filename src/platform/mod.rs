// src/platform/mod.rs

pub mod broker;
pub mod client_wrapper;
pub mod clients;
pub mod config;
pub mod connectors;
pub mod context;
pub mod engine;
pub mod errors;
pub mod json_extract;
pub mod llm;
pub mod package_io;
pub mod pipeline;
pub mod realtime;
pub mod schemas;
pub mod sessions;
pub mod storage;
pub mod tools;

pub use errors::{PlatformError, PlatformErrorCode};
pub use schemas::{AgentManifest, AgentResponse, ResponseChunk, UserMessage};
