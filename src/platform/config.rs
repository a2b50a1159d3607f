//! Process-wide configuration for the agent execution platform.
//!
//! Values are read from the environment once at startup (see [`PlatformConfig::from_env`]); the
//! core never parses a config file itself, matching the environment-only surface described for
//! the collaborator interfaces (database URL, object-store endpoint and buckets, shared-cache
//! URL, broker URL, secret-store URL and token).

use std::env;

/// Error returned when a required environment variable is missing.
#[derive(Debug, Clone)]
pub struct MissingEnvVar(pub &'static str);

impl std::fmt::Display for MissingEnvVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "missing required environment variable: {}", self.0)
    }
}

impl std::error::Error for MissingEnvVar {}

/// Runtime configuration assembled once at process startup.
///
/// This struct is intentionally a plain data holder; callers wire the values into whichever
/// collaborator adapters they provide (database pool, object-store client, cache/bus client).
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Async database connection string.
    pub database_url: String,
    /// Object-store endpoint (S3-compatible or similar).
    pub object_store_endpoint: String,
    /// Object-store credentials access key.
    pub object_store_access_key: String,
    /// Object-store credentials secret key.
    pub object_store_secret_key: String,
    /// Bucket holding agent package exports/imports.
    pub agents_bucket: String,
    /// Bucket holding scoped per-tenant storage (C2).
    pub storage_bucket: String,
    /// Shared-cache (bus-capable) URL, e.g. Redis.
    pub cache_url: String,
    /// Broker URL; may coincide with `cache_url`.
    pub broker_url: String,
    /// Secret-store base URL.
    pub secret_store_url: String,
    /// Secret-store auth token.
    pub secret_store_token: String,
    /// Directory agents are discovered from.
    pub agents_dir: std::path::PathBuf,
    /// Directory tools are discovered from.
    pub tools_dir: std::path::PathBuf,
    /// Directory connectors are discovered from.
    pub connectors_dir: std::path::PathBuf,
}

impl PlatformConfig {
    /// Build a [`PlatformConfig`] from environment variables.
    ///
    /// Required: `DATABASE_URL`, `OBJECT_STORE_ENDPOINT`, `OBJECT_STORE_ACCESS_KEY`,
    /// `OBJECT_STORE_SECRET_KEY`, `CACHE_URL`, `SECRET_STORE_URL`, `SECRET_STORE_TOKEN`.
    /// Optional (defaulted): `AGENTS_BUCKET` (`"agents"`), `STORAGE_BUCKET` (`"storage"`),
    /// `BROKER_URL` (falls back to `CACHE_URL`), `AGENTS_DIR`/`TOOLS_DIR`/`CONNECTORS_DIR`
    /// (default to `agents`, `tools`, `connectors` under the current directory).
    ///
    /// # Example
    ///
    /// ```no_run
    /// use agentrun::platform::config::PlatformConfig;
    ///
    /// let config = PlatformConfig::from_env().expect("platform config");
    /// println!("agents bucket: {}", config.agents_bucket);
    /// ```
    pub fn from_env() -> Result<Self, MissingEnvVar> {
        fn required(key: &'static str) -> Result<String, MissingEnvVar> {
            env::var(key).map_err(|_| MissingEnvVar(key))
        }

        let cache_url = required("CACHE_URL")?;
        let broker_url = env::var("BROKER_URL").unwrap_or_else(|_| cache_url.clone());

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            object_store_endpoint: required("OBJECT_STORE_ENDPOINT")?,
            object_store_access_key: required("OBJECT_STORE_ACCESS_KEY")?,
            object_store_secret_key: required("OBJECT_STORE_SECRET_KEY")?,
            agents_bucket: env::var("AGENTS_BUCKET").unwrap_or_else(|_| "agents".to_string()),
            storage_bucket: env::var("STORAGE_BUCKET").unwrap_or_else(|_| "storage".to_string()),
            cache_url,
            broker_url,
            secret_store_url: required("SECRET_STORE_URL")?,
            secret_store_token: required("SECRET_STORE_TOKEN")?,
            agents_dir: env::var("AGENTS_DIR").unwrap_or_else(|_| "agents".to_string()).into(),
            tools_dir: env::var("TOOLS_DIR").unwrap_or_else(|_| "tools".to_string()).into(),
            connectors_dir: env::var("CONNECTORS_DIR")
                .unwrap_or_else(|_| "connectors".to_string())
                .into(),
        })
    }
}
