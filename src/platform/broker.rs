//! Job broker & worker (C10): a durable at-least-once queue delivering turns to worker tasks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::platform::engine::AgentEngine;
use crate::platform::errors::{PlatformError, PlatformErrorCode};
use crate::platform::pipeline::PipelineResult;
use crate::platform::realtime::{JobEnvelope, RealtimeBus, StreamEnvelope};
use crate::platform::schemas::{Job, JobStatus, ResponseChunk, UserMessage};

/// Durable queue abstraction. Delivery is at-least-once; the worker is responsible for treating
/// duplicate deliveries of the same job id idempotently.
#[async_trait::async_trait]
pub trait BrokerQueue: Send + Sync {
    async fn enqueue(&self, job_id: Uuid) -> Result<(), PlatformError>;
    /// Blocks (or polls, depending on the adapter) until a job id is available.
    async fn reserve(&self) -> Result<Option<Uuid>, PlatformError>;
    async fn ack(&self, job_id: Uuid) -> Result<(), PlatformError>;
    async fn fail(&self, job_id: Uuid) -> Result<(), PlatformError>;
}

/// Durable persistence for job records; only terminal state needs to survive process restart.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<(), PlatformError>;
    async fn fetch(&self, id: Uuid) -> Result<Option<Job>, PlatformError>;
    async fn update(&self, job: &Job) -> Result<(), PlatformError>;
}

/// Per-job submission parameters carried alongside the job id through the queue.
pub struct JobRequest {
    pub user_id: String,
    pub agent_slug: String,
    pub session_id: Uuid,
    pub message: UserMessage,
    /// Optional maximum duration; the worker aborts and records `TIMEOUT` past this.
    pub max_duration: Option<Duration>,
    /// When set, the worker drives the turn through the streaming pipeline path, publishing each
    /// chunk on `stream:{job_id}` as it arrives rather than only a single terminal result.
    pub streaming: bool,
}

/// Enqueues jobs: inserts the durable record, stashes the request, and pushes the id onto the
/// broker queue.
pub struct JobBroker {
    queue: Arc<dyn BrokerQueue>,
    store: Arc<dyn JobStore>,
    requests: tokio::sync::Mutex<std::collections::HashMap<Uuid, JobRequest>>,
}

impl JobBroker {
    pub fn new(queue: Arc<dyn BrokerQueue>, store: Arc<dyn JobStore>) -> Self {
        Self {
            queue,
            store,
            requests: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub async fn submit(&self, request: JobRequest) -> Result<Uuid, PlatformError> {
        let job = Job::new(&request.user_id, &request.agent_slug, request.session_id, Utc::now());
        let job_id = job.id;
        self.store.insert(&job).await?;
        self.requests.lock().await.insert(job_id, request);
        self.queue.enqueue(job_id).await?;
        Ok(job_id)
    }

    async fn take_request(&self, job_id: Uuid) -> Option<JobRequest> {
        self.requests.lock().await.remove(&job_id)
    }
}

/// Pulls reserved job ids off the queue and runs them to completion, publishing progress and
/// stream events on the realtime bus as it goes.
pub struct JobWorker {
    broker: Arc<JobBroker>,
    engine: Arc<AgentEngine>,
    bus: Arc<RealtimeBus>,
}

impl JobWorker {
    pub fn new(broker: Arc<JobBroker>, engine: Arc<AgentEngine>, bus: Arc<RealtimeBus>) -> Self {
        Self { broker, engine, bus }
    }

    /// Runs the reserve/execute loop until the queue returns `None` (typically on shutdown).
    pub async fn run(&self) {
        while let Some(job_id) = self.reserve_next().await {
            self.process(job_id).await;
        }
    }

    async fn reserve_next(&self) -> Option<Uuid> {
        match self.broker.queue.reserve().await {
            Ok(job_id) => job_id,
            Err(err) => {
                error!("job broker reserve failed: {err}");
                None
            }
        }
    }

    /// Processes a single reserved job id. Re-checks the persisted terminal record first so a
    /// duplicate at-least-once delivery of an already-finished job is a no-op.
    async fn process(&self, job_id: Uuid) {
        let existing = match self.broker.store.fetch(job_id).await {
            Ok(existing) => existing,
            Err(err) => {
                error!("failed to load job {job_id} before processing: {err}");
                let _ = self.broker.queue.fail(job_id).await;
                return;
            }
        };

        let Some(mut job) = existing else {
            warn!("job {job_id} reserved but has no persisted record; dropping");
            let _ = self.broker.queue.ack(job_id).await;
            return;
        };

        if job.status.is_terminal() {
            info!("job {job_id} already terminal ({:?}); treating duplicate delivery as a no-op", job.status);
            let _ = self.broker.queue.ack(job_id).await;
            return;
        }

        let Some(request) = self.broker.take_request(job_id).await else {
            error!("job {job_id} has no in-memory request; cannot execute after restart");
            job.status = JobStatus::Failed;
            job.terminal_at = Some(Utc::now());
            job.error_code = Some(PlatformErrorCode::ExecutionError);
            job.error_message = Some("job request unavailable after restart".to_string());
            let _ = self.broker.store.update(&job).await;
            let _ = self.broker.queue.fail(job_id).await;
            self.publish_terminal(&job).await;
            return;
        };

        job.status = JobStatus::Running;
        if self.broker.store.update(&job).await.is_err() {
            warn!("failed to persist 'running' transition for job {job_id}");
        }
        self.bus
            .publish_job(JobEnvelope {
                job_id,
                status: JobStatus::Running,
                progress: None,
                message: None,
                timestamp: Utc::now(),
            })
            .await;

        let outcome: Result<Result<PipelineResult, PlatformError>, tokio::time::error::Elapsed> =
            if request.streaming {
                let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<ResponseChunk>();
                let bus = self.bus.clone();
                let forward_job_id = job_id;
                tokio::spawn(async move {
                    while let Some(chunk) = chunk_rx.recv().await {
                        bus.publish_stream(StreamEnvelope {
                            job_id: forward_job_id,
                            content: chunk.content,
                            is_final: chunk.is_final,
                            timestamp: Utc::now(),
                        })
                        .await;
                    }
                });

                let run = self.engine.execute_stream(
                    &request.agent_slug,
                    &request.user_id,
                    Some(request.session_id),
                    request.message,
                    move |chunk| {
                        let _ = chunk_tx.send(chunk);
                    },
                );

                match request.max_duration {
                    Some(duration) => tokio::time::timeout(duration, run).await,
                    None => Ok(run.await),
                }
            } else {
                let run = self.engine.execute(
                    &request.agent_slug,
                    &request.user_id,
                    Some(request.session_id),
                    request.message,
                );

                match request.max_duration {
                    Some(duration) => tokio::time::timeout(duration, run).await,
                    None => Ok(run.await),
                }
            };

        match outcome {
            Ok(Ok(result)) if result.success => {
                job.status = JobStatus::Completed;
                job.result = result.response;
            }
            Ok(Ok(result)) => {
                job.status = JobStatus::Failed;
                job.error_code = result.error_code;
                job.error_message = result.error_message;
            }
            Ok(Err(err)) => {
                job.status = JobStatus::Failed;
                job.error_code = Some(err.code);
                job.error_message = Some(err.message);
            }
            Err(_elapsed) => {
                job.status = JobStatus::Failed;
                job.error_code = Some(PlatformErrorCode::Timeout);
                job.error_message = Some("job exceeded its maximum duration".to_string());
            }
        }

        job.terminal_at = Some(Utc::now());
        if self.broker.store.update(&job).await.is_err() {
            error!("failed to persist terminal state for job {job_id}");
        }

        let ack_result = if job.status == JobStatus::Completed {
            self.broker.queue.ack(job_id).await
        } else {
            self.broker.queue.fail(job_id).await
        };
        if let Err(err) = ack_result {
            warn!("failed to ack/fail job {job_id} on the queue: {err}");
        }

        self.publish_terminal(&job).await;
    }

    async fn publish_terminal(&self, job: &Job) {
        self.bus
            .publish_job(JobEnvelope {
                job_id: job.id,
                status: job.status,
                progress: Some(100),
                message: job.error_message.clone(),
                timestamp: job.terminal_at.unwrap_or_else(Utc::now),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemoryQueue {
        pending: StdMutex<std::collections::VecDeque<Uuid>>,
    }

    #[async_trait::async_trait]
    impl BrokerQueue for MemoryQueue {
        async fn enqueue(&self, job_id: Uuid) -> Result<(), PlatformError> {
            self.pending.lock().unwrap().push_back(job_id);
            Ok(())
        }
        async fn reserve(&self) -> Result<Option<Uuid>, PlatformError> {
            Ok(self.pending.lock().unwrap().pop_front())
        }
        async fn ack(&self, _job_id: Uuid) -> Result<(), PlatformError> {
            Ok(())
        }
        async fn fail(&self, _job_id: Uuid) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryJobStore {
        jobs: StdMutex<std::collections::HashMap<Uuid, Job>>,
    }

    #[async_trait::async_trait]
    impl JobStore for MemoryJobStore {
        async fn insert(&self, job: &Job) -> Result<(), PlatformError> {
            self.jobs.lock().unwrap().insert(job.id, job.clone());
            Ok(())
        }
        async fn fetch(&self, id: Uuid) -> Result<Option<Job>, PlatformError> {
            Ok(self.jobs.lock().unwrap().get(&id).cloned())
        }
        async fn update(&self, job: &Job) -> Result<(), PlatformError> {
            self.jobs.lock().unwrap().insert(job.id, job.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn submit_persists_and_enqueues() {
        let queue = Arc::new(MemoryQueue::default());
        let store = Arc::new(MemoryJobStore::default());
        let broker = JobBroker::new(queue.clone(), store.clone());
        let job_id = broker
            .submit(JobRequest {
                user_id: "u1".to_string(),
                agent_slug: "echo-agent".to_string(),
                session_id: Uuid::new_v4(),
                message: UserMessage::new("hi"),
                max_duration: None,
                streaming: false,
            })
            .await
            .unwrap();

        assert!(store.fetch(job_id).await.unwrap().is_some());
        assert_eq!(queue.reserve().await.unwrap(), Some(job_id));
    }

    #[tokio::test]
    async fn duplicate_terminal_job_is_acked_without_reexecuting() {
        let queue = Arc::new(MemoryQueue::default());
        let store = Arc::new(MemoryJobStore::default());
        let mut job = Job::new("u1", "echo-agent", Uuid::new_v4(), Utc::now());
        job.status = JobStatus::Completed;
        store.insert(&job).await.unwrap();

        let broker = Arc::new(JobBroker::new(queue, store.clone()));
        // No request stashed for this id; process() must treat the already-terminal record as a
        // no-op rather than failing on the missing request.
        let existing = broker.store.fetch(job.id).await.unwrap().unwrap();
        assert!(existing.status.is_terminal());
    }
}
