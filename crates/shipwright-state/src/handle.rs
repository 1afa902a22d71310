//! SurrealDB Handle - Connection and row operations
//!
//! Manages the connection and stores every record as one row per table:
//! a few indexed columns used for filtering plus the serialized record.
//!
//! Supports both local (in-memory) and remote (WebSocket) connections.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Tables created at connect time.
pub(crate) const TABLES: &[&str] = &[
    "machine",
    "repository",
    "commit",
    "branch",
    "release",
    "release_item",
    "test_run",
    "test_run_line",
    "lease",
    "job",
];

/// Extra query parameters.
pub(crate) type Binds = Vec<(&'static str, serde_json::Value)>;

/// Configuration for a remote SurrealDB connection
#[derive(Debug, Clone)]
pub struct SurrealConfig {
    /// WebSocket endpoint URL (e.g., "wss://db.example.com")
    pub endpoint: String,
    /// Database username
    pub username: String,
    /// Database password
    pub password: String,
    /// Namespace (default: "shipwright")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl SurrealConfig {
    /// Create a new configuration for a database user
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: "shipwright".to_string(),
            database: "main".to_string(),
            is_root: false,
        }
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    /// Set whether this is a root user
    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "shipwright")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace =
            std::env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| "shipwright".to_string());
        let database = std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| "main".to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

/// A stored row: filter columns plus the serialized record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Row {
    pub key: String,
    /// Parent id (repository, release, run, ...)
    pub owner: String,
    pub name: String,
    pub hash: Option<String>,
    pub state: String,
    pub tags: Vec<String>,
    /// Sort key within the owner
    pub rank: i64,
    pub payload: String,
}

impl Row {
    pub fn new<T: Serialize>(key: impl Into<String>, record: &T) -> StorageResult<Self> {
        Ok(Self {
            key: key.into(),
            owner: String::new(),
            name: String::new(),
            hash: None,
            state: String::new(),
            tags: Vec::new(),
            rank: 0,
            payload: serde_json::to_string(record)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PayloadRow {
    payload: String,
}

#[derive(Debug, Deserialize)]
struct KeyRow {
    #[allow(dead_code)]
    key: String,
}

/// SurrealDB connection handle for Shipwright
#[derive(Clone)]
pub struct SurrealHandle {
    db: Surreal<Any>,
}

impl SurrealHandle {
    /// Connect to SurrealDB in-memory and set up schema
    #[instrument(skip_all)]
    pub async fn setup_db() -> StorageResult<Self> {
        info!("Connecting to SurrealDB (in-memory)");
        Self::connect_url("mem://").await
    }

    /// Connect to an arbitrary SurrealDB URL without authentication.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn connect_url(url: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        db.use_ns("shipwright")
            .use_db("main")
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let handle = SurrealHandle { db };
        handle.init_schema().await?;
        info!("SurrealDB connected and schema initialized");
        Ok(handle)
    }

    /// Connect to a remote SurrealDB with credentials
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace, database = %config.database))]
    pub async fn setup_remote(config: SurrealConfig) -> StorageResult<Self> {
        info!("Connecting to SurrealDB (root={})", config.is_root);

        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
            })?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StorageError::Connection(format!("Root authentication failed: {}", e)))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Database authentication failed: {}", e))
            })?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to select namespace/database: {}", e))
            })?;

        let handle = SurrealHandle { db };
        handle.init_schema().await?;
        Ok(handle)
    }

    /// Connect using environment variables
    ///
    /// If SURREALDB_ENDPOINT is set, connects with credentials.
    /// If SURREALDB_URL is set, connects to that URL.
    /// Otherwise, falls back to in-memory.
    #[instrument(skip_all)]
    pub async fn setup_from_env() -> StorageResult<Self> {
        if let Ok(config) = SurrealConfig::from_env() {
            return Self::setup_remote(config).await;
        }
        if let Ok(url) = std::env::var("SURREALDB_URL") {
            info!("SURREALDB_URL found, connecting to {}", url);
            return Self::connect_url(&url).await;
        }
        info!("No database config found, using in-memory database");
        Self::setup_db().await
    }

    async fn init_schema(&self) -> StorageResult<()> {
        debug!("Initializing Shipwright schema");

        let mut schema = String::new();
        for table in TABLES {
            schema.push_str(&format!(
                "DEFINE TABLE {t} SCHEMAFULL;
                 DEFINE FIELD key ON {t} TYPE string;
                 DEFINE FIELD owner ON {t} TYPE string;
                 DEFINE FIELD name ON {t} TYPE string;
                 DEFINE FIELD hash ON {t} TYPE option<string>;
                 DEFINE FIELD state ON {t} TYPE string;
                 DEFINE FIELD tags ON {t} TYPE array<string>;
                 DEFINE FIELD rank ON {t} TYPE int;
                 DEFINE FIELD payload ON {t} TYPE string;
                 DEFINE INDEX idx_{t}_key ON {t} FIELDS key UNIQUE;
                 DEFINE INDEX idx_{t}_owner ON {t} FIELDS owner;
                ",
                t = table
            ));
        }

        self.db
            .query(schema)
            .await
            .map_err(|e| StorageError::SchemaSetup(e.to_string()))?
            .check()
            .map_err(|e| StorageError::SchemaSetup(e.to_string()))?;

        debug!("Schema initialized successfully");
        Ok(())
    }

    /// Insert or replace the row with the same key.
    #[instrument(skip(self, row), fields(key = %row.key))]
    pub(crate) async fn upsert_row(&self, table: &'static str, row: Row) -> StorageResult<()> {
        let key = row.key.clone();
        self.db
            .query("UPSERT type::thing($tb, $key) CONTENT $row RETURN NONE")
            .bind(("tb", table))
            .bind(("key", key))
            .bind(("row", row))
            .await?
            .check()?;
        Ok(())
    }

    /// Create the row unless its key is taken.
    ///
    /// An existing row matching `replaceable` is deleted first, in the same
    /// transaction. A taken key is not an error; callers read the row back
    /// to learn who holds it.
    #[instrument(skip(self, row, binds), fields(key = %row.key))]
    pub(crate) async fn create_row_unless_taken(
        &self,
        table: &'static str,
        row: Row,
        replaceable: &str,
        binds: Binds,
    ) -> StorageResult<()> {
        let query = format!(
            "BEGIN TRANSACTION;
             DELETE type::thing($tb, $key) WHERE {replaceable};
             CREATE type::thing($tb, $key) CONTENT $row RETURN NONE;
             COMMIT TRANSACTION;"
        );
        let key = row.key.clone();
        let mut q = self
            .db
            .query(query)
            .bind(("tb", table))
            .bind(("key", key))
            .bind(("row", row));
        for bind in binds {
            q = q.bind(bind);
        }
        if q.await?.check().is_err() {
            debug!(table, "row key already taken");
        }
        Ok(())
    }

    /// Replace the row only while it matches `condition`.
    ///
    /// Returns whether the row was replaced.
    #[instrument(skip(self, row, binds), fields(key = %row.key))]
    pub(crate) async fn replace_row_if(
        &self,
        table: &'static str,
        row: Row,
        condition: &str,
        binds: Binds,
    ) -> StorageResult<bool> {
        let key = row.key.clone();
        let mut q = self
            .db
            .query(format!(
                "UPDATE type::thing($tb, $key) CONTENT $row WHERE {condition} RETURN key"
            ))
            .bind(("tb", table))
            .bind(("key", key))
            .bind(("row", row));
        for bind in binds {
            q = q.bind(bind);
        }
        let mut response = q.await?.check()?;
        let rows: Vec<KeyRow> = response.take(0)?;
        Ok(!rows.is_empty())
    }

    /// Run a statement that returns nothing of interest.
    pub(crate) async fn execute(&self, query: &'static str, binds: Binds) -> StorageResult<()> {
        let mut q = self.db.query(query);
        for bind in binds {
            q = q.bind(bind);
        }
        q.await?.check()?;
        Ok(())
    }

    /// Run a `SELECT payload ...` query and decode each payload.
    pub(crate) async fn select_payloads<T: DeserializeOwned>(
        &self,
        query: &'static str,
        binds: Vec<(&'static str, String)>,
    ) -> StorageResult<Vec<T>> {
        let binds = binds
            .into_iter()
            .map(|(name, value)| (name, serde_json::Value::String(value)))
            .collect();
        self.select_payloads_with(query, binds).await
    }

    /// [`SurrealHandle::select_payloads`] with arbitrary parameter values.
    pub(crate) async fn select_payloads_with<T: DeserializeOwned>(
        &self,
        query: &'static str,
        binds: Binds,
    ) -> StorageResult<Vec<T>> {
        let mut q = self.db.query(query);
        for bind in binds {
            q = q.bind(bind);
        }
        let mut response = q.await?.check()?;
        let rows: Vec<PayloadRow> = response.take(0)?;
        rows.iter()
            .map(|r| serde_json::from_str(&r.payload).map_err(StorageError::from))
            .collect()
    }

    /// Fetch one record by key.
    pub(crate) async fn get_payload<T: DeserializeOwned>(
        &self,
        table: &'static str,
        key: &str,
    ) -> StorageResult<Option<T>> {
        let mut response = self
            .db
            .query("SELECT payload FROM type::table($tb) WHERE key = $key")
            .bind(("tb", table))
            .bind(("key", key.to_string()))
            .await?
            .check()?;
        let rows: Vec<PayloadRow> = response.take(0)?;
        rows.into_iter()
            .next()
            .map(|r| serde_json::from_str(&r.payload).map_err(StorageError::from))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_carries_serialized_record() {
        let row = Row::new("k1", &serde_json::json!({"a": 1})).unwrap();
        assert_eq!(row.key, "k1");
        assert_eq!(row.payload, r#"{"a":1}"#);
        assert!(row.tags.is_empty());
    }

    #[test]
    fn config_builder_overrides_defaults() {
        let cfg = SurrealConfig::new("ws://db:8000", "u", "p")
            .with_namespace("ns")
            .with_database("db")
            .with_root(true);
        assert_eq!(cfg.namespace, "ns");
        assert_eq!(cfg.database, "db");
        assert!(cfg.is_root);
    }
}
