//! Session store (C5): durable session/message persistence plus a write-through cache for hot
//! sessions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::platform::errors::{PlatformError, PlatformErrorCode};
use crate::platform::schemas::{Attachment, MessageRole, Session, SessionMessage};

/// Durable relational backing for sessions and their messages.
#[async_trait::async_trait]
pub trait SessionBackend: Send + Sync {
    async fn insert_session(&self, session: &Session) -> Result<(), PlatformError>;
    async fn fetch_session(&self, id: Uuid) -> Result<Option<Session>, PlatformError>;
    async fn update_session(&self, session: &Session) -> Result<(), PlatformError>;
    async fn list_sessions(
        &self,
        agent_slug: &str,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>, PlatformError>;
    async fn insert_message(&self, message: &SessionMessage) -> Result<(), PlatformError>;
    async fn fetch_messages(
        &self,
        session_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<SessionMessage>, PlatformError>;
    async fn clear_messages(&self, session_id: Uuid) -> Result<(), PlatformError>;
}

/// A durable store with a write-through cache in front of it.
///
/// Appends to the same session are serialized through a per-session lock so concurrent turns on
/// one session can't interleave their message ordering (§5 of the design: "Concurrent appends on
/// the same session are serialized by the store").
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    cache: Mutex<HashMap<Uuid, Session>>,
    append_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            backend,
            cache: Mutex::new(HashMap::new()),
            append_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create_session(
        &self,
        agent_slug: &str,
        user_id: &str,
        title: Option<String>,
    ) -> Result<Session, PlatformError> {
        let mut session = Session::new(user_id, agent_slug, Utc::now());
        session.title = title;
        self.backend.insert_session(&session).await?;
        self.cache.lock().await.insert(session.id, session.clone());
        Ok(session)
    }

    /// Idempotent create for a caller-supplied id: returns the existing session if one is already
    /// registered under `id`.
    pub async fn create_session_with_id(
        &self,
        id: Uuid,
        agent_slug: &str,
        user_id: &str,
        title: Option<String>,
    ) -> Result<Session, PlatformError> {
        if let Some(existing) = self.get_session(id).await? {
            return Ok(existing);
        }
        let now = Utc::now();
        let session = Session {
            id,
            user_id: user_id.to_string(),
            agent_slug: agent_slug.to_string(),
            title,
            active: true,
            created_at: now,
            updated_at: now,
        };
        self.backend.insert_session(&session).await?;
        self.cache.lock().await.insert(session.id, session.clone());
        Ok(session)
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<Session>, PlatformError> {
        if let Some(session) = self.cache.lock().await.get(&id).cloned() {
            return Ok(Some(session));
        }
        let fetched = self.backend.fetch_session(id).await?;
        if let Some(session) = &fetched {
            self.cache.lock().await.insert(id, session.clone());
        }
        Ok(fetched)
    }

    pub async fn list_sessions(
        &self,
        agent_slug: &str,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>, PlatformError> {
        self.backend
            .list_sessions(agent_slug, user_id, limit, offset)
            .await
    }

    async fn lock_for(&self, session_id: Uuid) -> Arc<Mutex<()>> {
        self.append_locks
            .lock()
            .await
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn append_message(
        &self,
        session_id: Uuid,
        role: MessageRole,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<SessionMessage, PlatformError> {
        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let Some(mut session) = self.get_session(session_id).await? else {
            return Err(PlatformError::new(
                PlatformErrorCode::SessionNotFound,
                session_id.to_string(),
            ));
        };

        let message = SessionMessage {
            id: Uuid::new_v4(),
            session_id,
            role,
            content: content.into(),
            attachments,
            metadata,
            created_at: Utc::now(),
        };
        self.backend.insert_message(&message).await?;

        session.updated_at = message.created_at;
        self.backend.update_session(&session).await?;
        self.cache.lock().await.insert(session_id, session);

        Ok(message)
    }

    pub async fn get_messages(
        &self,
        session_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<SessionMessage>, PlatformError> {
        self.backend.fetch_messages(session_id, limit).await
    }

    pub async fn clear_messages(&self, session_id: Uuid) -> Result<(), PlatformError> {
        self.backend.clear_messages(session_id).await
    }

    pub async fn close_session(&self, session_id: Uuid) -> Result<(), PlatformError> {
        let Some(mut session) = self.get_session(session_id).await? else {
            return Err(PlatformError::new(
                PlatformErrorCode::SessionNotFound,
                session_id.to_string(),
            ));
        };
        session.active = false;
        session.updated_at = Utc::now();
        self.backend.update_session(&session).await?;
        self.cache.lock().await.insert(session_id, session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemoryBackend {
        sessions: StdMutex<HashMap<Uuid, Session>>,
        messages: StdMutex<HashMap<Uuid, Vec<SessionMessage>>>,
    }

    #[async_trait::async_trait]
    impl SessionBackend for MemoryBackend {
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
            agent_slug: &str,
            user_id: &str,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<Session>, PlatformError> {
            let mut matches: Vec<Session> = self
                .sessions
                .lock()
                .unwrap()
                .values()
                .filter(|s| s.agent_slug == agent_slug && s.user_id == user_id)
                .cloned()
                .collect();
            matches.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(matches.into_iter().skip(offset).take(limit).collect())
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
            limit: Option<usize>,
        ) -> Result<Vec<SessionMessage>, PlatformError> {
            let all = self
                .messages
                .lock()
                .unwrap()
                .get(&session_id)
                .cloned()
                .unwrap_or_default();
            Ok(match limit {
                Some(n) => all.into_iter().take(n).collect(),
                None => all,
            })
        }

        async fn clear_messages(&self, session_id: Uuid) -> Result<(), PlatformError> {
            self.messages.lock().unwrap().remove(&session_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn create_session_with_id_is_idempotent() {
        let store = SessionStore::new(Arc::new(MemoryBackend::default()));
        let id = Uuid::new_v4();
        let first = store
            .create_session_with_id(id, "echo-agent", "u1", None)
            .await
            .unwrap();
        let second = store
            .create_session_with_id(id, "echo-agent", "u1", Some("ignored".to_string()))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.title, None);
    }

    #[tokio::test]
    async fn messages_return_in_append_order() {
        let store = SessionStore::new(Arc::new(MemoryBackend::default()));
        let session = store.create_session("echo-agent", "u1", None).await.unwrap();
        store
            .append_message(session.id, MessageRole::User, "hi", vec![], HashMap::new())
            .await
            .unwrap();
        store
            .append_message(session.id, MessageRole::Assistant, "hello", vec![], HashMap::new())
            .await
            .unwrap();
        let messages = store.get_messages(session.id, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1].content, "hello");
    }

    #[tokio::test]
    async fn append_to_missing_session_is_session_not_found() {
        let store = SessionStore::new(Arc::new(MemoryBackend::default()));
        let err = store
            .append_message(Uuid::new_v4(), MessageRole::User, "hi", vec![], HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, PlatformErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn close_session_keeps_history_but_marks_inactive() {
        let store = SessionStore::new(Arc::new(MemoryBackend::default()));
        let session = store.create_session("echo-agent", "u1", None).await.unwrap();
        store
            .append_message(session.id, MessageRole::User, "hi", vec![], HashMap::new())
            .await
            .unwrap();
        store.close_session(session.id).await.unwrap();
        let fetched = store.get_session(session.id).await.unwrap().unwrap();
        assert!(!fetched.active);
        assert_eq!(store.get_messages(session.id, None).await.unwrap().len(), 1);
    }
}
