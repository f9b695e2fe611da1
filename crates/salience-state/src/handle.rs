//! SurrealDB connection handling
//!
//! Supports in-memory (`mem://`), embedded (`surrealkv://path`) and remote
//! (`ws://` / `wss://`) endpoints through the `any` engine.

use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

use crate::error::StateError;
use crate::migrations;
use crate::Result;

/// Connection settings for the backing SurrealDB instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Endpoint URL ("mem://", "surrealkv://.salience/db", "wss://...")
    pub endpoint: String,
    /// Namespace (default: "salience")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Optional username; when set, `password` must also be set
    pub username: Option<String>,
    pub password: Option<String>,
    /// Whether the credentials belong to a root user
    pub is_root: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "salience".to_string(),
            database: "main".to_string(),
            username: None,
            password: None,
            is_root: false,
        }
    }
}

impl StoreConfig {
    /// In-memory store (tests, dry runs)
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Override fields from environment variables
    ///
    /// Reads (all optional):
    /// - SALIENCE_DB_URL
    /// - SALIENCE_DB_NAMESPACE
    /// - SALIENCE_DB_DATABASE
    /// - SALIENCE_DB_USERNAME / SALIENCE_DB_PASSWORD
    /// - SALIENCE_DB_ROOT ("true" for root users)
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("SALIENCE_DB_URL") {
            self.endpoint = url;
        }
        if let Ok(ns) = std::env::var("SALIENCE_DB_NAMESPACE") {
            self.namespace = ns;
        }
        if let Ok(db) = std::env::var("SALIENCE_DB_DATABASE") {
            self.database = db;
        }
        if let Ok(user) = std::env::var("SALIENCE_DB_USERNAME") {
            self.username = Some(user);
        }
        if let Ok(pass) = std::env::var("SALIENCE_DB_PASSWORD") {
            self.password = Some(pass);
        }
        if let Ok(root) = std::env::var("SALIENCE_DB_ROOT") {
            self.is_root = root.eq_ignore_ascii_case("true");
        }
        self
    }
}

/// Connect, authenticate, select namespace/database and run migrations.
#[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace, database = %config.database))]
pub async fn connect(config: &StoreConfig) -> Result<Surreal<Any>> {
    if config.username.is_some() != config.password.is_some() {
        return Err(StateError::Connection(
            "username and password must be set together".to_string(),
        ));
    }

    if let Some(path) = config.endpoint.strip_prefix("surrealkv://") {
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path, e
            ))
        })?;
    }

    let db = surrealdb::engine::any::connect(config.endpoint.as_str())
        .await
        .map_err(|e| {
            StateError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
        })?;

    match (&config.username, &config.password) {
        (Some(username), Some(password)) if config.is_root => {
            db.signin(Root {
                username: username.as_str(),
                password: password.as_str(),
            })
            .await
            .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
        }
        (Some(username), Some(password)) => {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: username.as_str(),
                password: password.as_str(),
            })
            .await
            .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
        }
        _ => {}
    }

    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    migrations::init_schema(&db).await?;
    info!("SurrealDB connected and schema initialized");
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_in_memory() {
        let config = StoreConfig::default();
        assert_eq!(config.endpoint, "mem://");
        assert_eq!(config.namespace, "salience");
        assert_eq!(config, StoreConfig::in_memory());
    }

    #[tokio::test]
    async fn half_configured_credentials_are_rejected() {
        let config = StoreConfig {
            username: Some("reader".into()),
            ..StoreConfig::default()
        };
        let err = connect(&config).await.unwrap_err();
        assert!(err.to_string().contains("username and password"));
    }
}
