//! Scoped storage (C2): a per-tenant view over a shared blob store.
//!
//! Every view is pinned to a prefix at construction time and every key passed through `put`,
//! `get`, `delete`, `list`, `exists` is resolved against that prefix before it ever reaches the
//! backing [`BlobStore`] — a scoped view can neither read nor write outside its own prefix,
//! regardless of what key an agent hands it.

use async_trait::async_trait;

use crate::platform::errors::{PlatformError, PlatformErrorCode};

/// Backing abstraction over a bucket-oriented blob store (S3-compatible or similar).
///
/// Keys passed here are already fully resolved (prefix + cleaned key); implementors need not
/// know about scoping.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), PlatformError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, PlatformError>;
    async fn delete(&self, key: &str) -> Result<(), PlatformError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, PlatformError>;
    async fn exists(&self, key: &str) -> Result<bool, PlatformError>;
}

/// The owning scope of a [`ScopedStorage`] view, which determines its prefix.
#[derive(Debug, Clone)]
pub enum StorageScope {
    User { user_id: String },
    Workspace { workspace_id: String },
    /// System-only view under `platform/…`; never handed to agents.
    Platform,
}

impl StorageScope {
    fn prefix(&self, agent_slug: &str) -> String {
        match self {
            Self::User { user_id } => format!("users/{user_id}/agents/{agent_slug}/"),
            Self::Workspace { workspace_id } => {
                format!("workspaces/{workspace_id}/agents/{agent_slug}/")
            }
            Self::Platform => "platform/".to_string(),
        }
    }
}

/// A storage view pinned to a single prefix, handed to agent code through [`Context`].
///
/// [`Context`]: crate::platform::context::Context
pub struct ScopedStorage {
    backend: std::sync::Arc<dyn BlobStore>,
    prefix: String,
}

impl ScopedStorage {
    /// Builds a view scoped to `scope` for the given agent slug.
    pub fn new(backend: std::sync::Arc<dyn BlobStore>, scope: &StorageScope, agent_slug: &str) -> Self {
        Self {
            backend,
            prefix: scope.prefix(agent_slug),
        }
    }

    /// Builds the platform-wide view. Never constructed on behalf of agent code.
    pub fn platform(backend: std::sync::Arc<dyn BlobStore>) -> Self {
        Self {
            backend,
            prefix: StorageScope::Platform.prefix(""),
        }
    }

    fn resolve(&self, key: &str) -> Result<String, PlatformError> {
        if key.starts_with('/') || key.split('/').any(|segment| segment == "..") {
            return Err(PlatformError::new(
                PlatformErrorCode::ValidationError,
                format!("storage key rejected: {key}"),
            ));
        }
        Ok(format!("{}{}", self.prefix, key))
    }

    pub async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), PlatformError> {
        let resolved = self.resolve(key)?;
        self.backend.put(&resolved, bytes).await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, PlatformError> {
        let resolved = self.resolve(key)?;
        self.backend.get(&resolved).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), PlatformError> {
        let resolved = self.resolve(key)?;
        self.backend.delete(&resolved).await
    }

    /// Lists keys under `sub_prefix` (relative to this view's prefix), stripped back to relative
    /// form so callers never see the internal scoping prefix.
    pub async fn list(&self, sub_prefix: &str) -> Result<Vec<String>, PlatformError> {
        let resolved = self.resolve(sub_prefix)?;
        let keys = self.backend.list(&resolved).await?;
        Ok(keys
            .into_iter()
            .map(|k| k.strip_prefix(&self.prefix).map(str::to_string).unwrap_or(k))
            .collect())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, PlatformError> {
        let resolved = self.resolve(key)?;
        self.backend.exists(&resolved).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MemoryBlobStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemoryBlobStore {
        fn new() -> std::sync::Arc<Self> {
            std::sync::Arc::new(Self {
                objects: Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl BlobStore for MemoryBlobStore {
        async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), PlatformError> {
            self.objects.lock().unwrap().insert(key.to_string(), bytes);
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, PlatformError> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| PlatformError::new(PlatformErrorCode::FileNotFound, key.to_string()))
        }

        async fn delete(&self, key: &str) -> Result<(), PlatformError> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, PlatformError> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn exists(&self, key: &str) -> Result<bool, PlatformError> {
            Ok(self.objects.lock().unwrap().contains_key(key))
        }
    }

    #[tokio::test]
    async fn put_resolves_under_user_prefix() {
        let backend = MemoryBlobStore::new();
        let scope = StorageScope::User {
            user_id: "u1".to_string(),
        };
        let view = ScopedStorage::new(backend.clone(), &scope, "echo-agent");
        view.put("notes.txt", b"hi".to_vec()).await.unwrap();
        assert!(backend
            .exists("users/u1/agents/echo-agent/notes.txt")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn rejects_parent_traversal() {
        let backend = MemoryBlobStore::new();
        let scope = StorageScope::User {
            user_id: "u1".to_string(),
        };
        let view = ScopedStorage::new(backend, &scope, "echo-agent");
        let err = view.get("../../secrets").await.unwrap_err();
        assert_eq!(err.code, PlatformErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn rejects_absolute_key() {
        let backend = MemoryBlobStore::new();
        let scope = StorageScope::Workspace {
            workspace_id: "w1".to_string(),
        };
        let view = ScopedStorage::new(backend, &scope, "echo-agent");
        let err = view.put("/etc/passwd", vec![]).await.unwrap_err();
        assert_eq!(err.code, PlatformErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn list_strips_internal_prefix() {
        let backend = MemoryBlobStore::new();
        let scope = StorageScope::User {
            user_id: "u1".to_string(),
        };
        let view = ScopedStorage::new(backend, &scope, "echo-agent");
        view.put("a.txt", vec![1]).await.unwrap();
        view.put("b.txt", vec![2]).await.unwrap();
        let mut listed = view.list("").await.unwrap();
        listed.sort();
        assert_eq!(listed, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }
}
