//! Realtime fan-out (C11): job/stream pub-sub on a process-local bus backed by a shared cache,
//! plus the connection manager that routes published envelopes to the right user's clients.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::platform::schemas::JobStatus;

/// `job:{job_id}` channel envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// `stream:{job_id}` channel envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEnvelope {
    pub job_id: Uuid,
    pub content: String,
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
}

/// One published realtime event, tagged by which channel family it belongs to.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    Job(JobEnvelope),
    Stream(StreamEnvelope),
}

impl RealtimeEvent {
    fn job_id(&self) -> Uuid {
        match self {
            Self::Job(e) => e.job_id,
            Self::Stream(e) => e.job_id,
        }
    }
}

/// Backing publish/subscribe abstraction over the shared cache.
#[async_trait::async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: String);
}

/// Per-client outbound channel. A client subscribes to a user; the connection manager fans every
/// event for that user's jobs out to every open client.
pub type ClientSender = mpsc::UnboundedSender<RealtimeEvent>;

/// Maintains `user_id → set<client>` and `job_id → user_id` subscription tables and dispatches
/// published envelopes to the right clients. Subscriptions for terminal jobs are dropped
/// automatically.
pub struct ConnectionManager {
    clients: Mutex<HashMap<String, HashSet<Uuid>>>,
    senders: Mutex<HashMap<Uuid, ClientSender>>,
    job_owners: Mutex<HashMap<Uuid, String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            senders: Mutex::new(HashMap::new()),
            job_owners: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a client for `user_id`, returning its id so the caller can `unregister` later.
    pub async fn register_client(&self, user_id: &str, sender: ClientSender) -> Uuid {
        let client_id = Uuid::new_v4();
        self.clients
            .lock()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(client_id);
        self.senders.lock().await.insert(client_id, sender);
        client_id
    }

    pub async fn unregister_client(&self, user_id: &str, client_id: Uuid) {
        if let Some(set) = self.clients.lock().await.get_mut(user_id) {
            set.remove(&client_id);
        }
        self.senders.lock().await.remove(&client_id);
    }

    /// Binds a job to the user who should receive its events.
    pub async fn subscribe_job(&self, job_id: Uuid, user_id: &str) {
        self.job_owners.lock().await.insert(job_id, user_id.to_string());
    }

    async fn unsubscribe_job(&self, job_id: Uuid) {
        self.job_owners.lock().await.remove(&job_id);
    }

    /// Looks up the subscribed user for the event's job id and pushes it to every open client of
    /// that user. Drops the job's subscription once a terminal status is observed.
    pub async fn dispatch(&self, event: RealtimeEvent) {
        let job_id = event.job_id();
        let owner = self.job_owners.lock().await.get(&job_id).cloned();
        let Some(user_id) = owner else {
            return;
        };

        let client_ids: Vec<Uuid> = self
            .clients
            .lock()
            .await
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        let senders = self.senders.lock().await;
        for client_id in client_ids {
            if let Some(sender) = senders.get(&client_id) {
                if sender.send(event.clone()).is_err() {
                    warn!("dropping disconnected realtime client {client_id}");
                }
            }
        }
        drop(senders);

        if let RealtimeEvent::Job(envelope) = &event {
            if envelope.status.is_terminal() {
                self.unsubscribe_job(job_id).await;
            }
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes job/stream envelopes and drives them straight to the connection manager.
///
/// In production the publish side writes JSON envelopes onto `job:{uuid}`/`stream:{uuid}` bus
/// channels and a long-lived subscriber task (driven by [`Bus::psubscribe`] against `job:*` and
/// `stream:*`) decodes them back into [`RealtimeEvent`]s before calling [`ConnectionManager::dispatch`].
/// This type folds both halves together for in-process use; callers that need the bus hop for
/// multi-process fan-out wire their own [`Bus`] adapter at that boundary instead.
pub struct RealtimeBus {
    bus: Option<Arc<dyn Bus>>,
    manager: Arc<ConnectionManager>,
}

impl RealtimeBus {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { bus: None, manager }
    }

    pub fn with_bus(manager: Arc<ConnectionManager>, bus: Arc<dyn Bus>) -> Self {
        Self {
            bus: Some(bus),
            manager,
        }
    }

    pub async fn publish_job(&self, envelope: JobEnvelope) {
        if let Some(bus) = &self.bus {
            if let Ok(payload) = serde_json::to_string(&envelope) {
                bus.publish(&format!("job:{}", envelope.job_id), payload).await;
            }
        }
        self.manager.dispatch(RealtimeEvent::Job(envelope)).await;
    }

    pub async fn publish_stream(&self, envelope: StreamEnvelope) {
        if let Some(bus) = &self.bus {
            if let Ok(payload) = serde_json::to_string(&envelope) {
                bus.publish(&format!("stream:{}", envelope.job_id), payload).await;
            }
        }
        self.manager.dispatch(RealtimeEvent::Stream(envelope)).await;
    }
}
