//! Connector registry (C4): external-system handles with explicit connect/disconnect lifecycle.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::FutureExt;
use log::{error, warn};
use tokio::sync::Mutex;

use crate::platform::errors::PlatformErrorCode;
use crate::platform::schemas::{ConnectorMetadata, ConnectorResult, ExecutionOutcome};
use crate::platform::tools::HealthStatus;

/// A self-describing connector implementation with its own connection lifecycle.
#[async_trait]
pub trait ConnectorHandle: Send + Sync {
    fn metadata(&self) -> ConnectorMetadata;

    async fn connect(&self, config: &HashMap<String, serde_json::Value>) -> Result<(), String>;

    async fn execute(
        &self,
        action: &str,
        params: &HashMap<String, serde_json::Value>,
    ) -> ConnectorResult;

    /// Best-effort teardown; MUST NOT raise/panic.
    async fn disconnect(&self);

    async fn health(&self) -> bool {
        true
    }
}

/// Holds `slug → ConnectorHandle` plus the membership set of currently-connected slugs.
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn ConnectorHandle>>,
    connected: Mutex<HashSet<String>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
            connected: Mutex::new(HashSet::new()),
        }
    }

    pub fn register(&mut self, handle: Arc<dyn ConnectorHandle>) {
        let slug = handle.metadata().slug.clone();
        if self.connectors.insert(slug.clone(), handle).is_some() {
            warn!("connector registry: duplicate slug '{slug}', replacing earlier registration");
        }
    }

    pub fn list(&self) -> Vec<ConnectorMetadata> {
        self.connectors.values().map(|c| c.metadata()).collect()
    }

    pub fn get(&self, slug: &str) -> Option<ConnectorMetadata> {
        self.connectors.get(slug).map(|c| c.metadata())
    }

    pub fn slugs(&self) -> HashSet<String> {
        self.connectors.keys().cloned().collect()
    }

    pub async fn is_connected(&self, slug: &str) -> bool {
        self.connected.lock().await.contains(slug)
    }

    pub async fn connect(
        &self,
        slug: &str,
        config: HashMap<String, serde_json::Value>,
    ) -> Result<(), PlatformErrorCode> {
        let Some(handle) = self.connectors.get(slug) else {
            return Err(PlatformErrorCode::NotFound);
        };
        match handle.connect(&config).await {
            Ok(()) => {
                self.connected.lock().await.insert(slug.to_string());
                Ok(())
            }
            Err(reason) => {
                error!("connector '{slug}' failed to connect: {reason}");
                Err(PlatformErrorCode::ConnectionFailed)
            }
        }
    }

    /// Best-effort; never raises even if the underlying handle's `disconnect` misbehaves.
    pub async fn disconnect(&self, slug: &str) {
        if let Some(handle) = self.connectors.get(slug) {
            handle.disconnect().await;
        }
        self.connected.lock().await.remove(slug);
    }

    pub async fn disconnect_all(&self) {
        let slugs: Vec<String> = self.connected.lock().await.iter().cloned().collect();
        for slug in slugs {
            self.disconnect(&slug).await;
        }
    }

    pub async fn health(&self) -> HashMap<String, HealthStatus> {
        let mut out = HashMap::new();
        for (slug, handle) in &self.connectors {
            let healthy = handle.health().await;
            out.insert(
                slug.clone(),
                HealthStatus {
                    healthy,
                    message: String::new(),
                },
            );
        }
        out
    }

    /// Rejects an unknown slug or unknown action before ever delegating to the handle. A panic
    /// inside the connector is caught and mapped to `PROCESSING_ERROR` rather than unwinding into
    /// the caller.
    pub async fn execute(
        &self,
        slug: &str,
        action: &str,
        params: HashMap<String, serde_json::Value>,
    ) -> ConnectorResult {
        let Some(handle) = self.connectors.get(slug) else {
            return ExecutionOutcome::err(PlatformErrorCode::NotFound, format!("unknown connector: {slug}"));
        };

        let metadata = handle.metadata();
        if !metadata.actions.iter().any(|a| a.name == action) {
            return ExecutionOutcome::err(
                PlatformErrorCode::InvalidAction,
                format!("connector '{slug}' has no action '{action}'"),
            );
        }

        match AssertUnwindSafe(handle.execute(action, &params)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("connector '{slug}' panicked during execute (action '{action}')");
                ExecutionOutcome::err(PlatformErrorCode::ProcessingError, "connector execution failed")
            }
        }
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
