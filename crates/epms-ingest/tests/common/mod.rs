//! Common test utilities for EPMS ingest integration tests
//!
//! - [`TestPostgres`]: a PostgreSQL container with the mapped tables created
//! - [`TestFolders`]: a temporary watched-folder layout
//! - [`RecordingStore`]: a [`BatchStore`] that keeps batches in memory
//! - [`GatedStore`]: a [`RecordingStore`] that holds each batch until released
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::TestPostgres;
//!
//! #[tokio::test]
//! async fn test_with_postgres() {
//!     let pg = TestPostgres::start().await.unwrap();
//!     sqlx::query("SELECT 1").execute(pg.pool()).await.unwrap();
//! }
//! ```

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use epms_ingest::config::{DatabaseConfig, FolderConfig};
use epms_ingest::db;
use epms_ingest::ingest::{BatchStore, SchemaRegistry, UpsertBatch};
use epms_ingest::{IngestError, IngestResult};
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::Notify;
use std::time::Duration;
use tempfile::TempDir;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL container with every mapped table bootstrapped
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
    config: DatabaseConfig,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .context("Failed to get container port")?;

        let config = DatabaseConfig {
            host: host.to_string(),
            port,
            name: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            max_connections: 4,
            connect_timeout_secs: 30,
            idle_timeout_secs: 30,
        };

        let pool = db::create_pool(&config)
            .await
            .context("Failed to connect to PostgreSQL")?;
        db::ensure_tables(&pool, &SchemaRegistry::standard())
            .await
            .context("Failed to create tables")?;

        Ok(Self {
            _container: container,
            pool,
            config,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub async fn count(&self, table: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

// ============================================================================
// Folder fixtures
// ============================================================================

/// Temporary root with the three folders created
pub struct TestFolders {
    _root: TempDir,
    pub layout: FolderConfig,
}

impl TestFolders {
    pub fn new() -> Result<Self> {
        let root = TempDir::new()?;
        let layout = FolderConfig::under(root.path());
        for folder in layout.all() {
            std::fs::create_dir_all(folder)?;
        }
        Ok(Self {
            _root: root,
            layout,
        })
    }

    /// Write `content` into the unprocessed folder
    pub fn drop_file(&self, name: &str, content: &str) -> Result<PathBuf> {
        let path = self.layout.unprocessed.join(name);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn processed(&self, name: &str) -> PathBuf {
        self.layout.processed.join(name)
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Keeps `(table, rows)` for every batch it accepts
#[derive(Default)]
pub struct RecordingStore {
    batches: Mutex<Vec<(String, usize)>>,
}

impl RecordingStore {
    pub fn batches(&self) -> Vec<(String, usize)> {
        self.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BatchStore for RecordingStore {
    async fn upsert(&self, batch: &UpsertBatch) -> IngestResult<u64> {
        let mut batches = self
            .batches
            .lock()
            .map_err(|_| IngestError::Config("store lock poisoned".into()))?;
        batches.push((batch.mapping.table.to_string(), batch.len()));
        Ok(batch.len() as u64)
    }
}

/// Signals when a batch arrives, then waits for [`GatedStore::release`]
/// before recording it
#[derive(Default)]
pub struct GatedStore {
    pub recorded: RecordingStore,
    entered: Notify,
    release: Notify,
}

impl GatedStore {
    /// Resolves once a batch is inside `upsert`
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the held batch through
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl BatchStore for GatedStore {
    async fn upsert(&self, batch: &UpsertBatch) -> IngestResult<u64> {
        self.entered.notify_one();
        self.release.notified().await;
        self.recorded.upsert(batch).await
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,epms_ingest=debug,sqlx=warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll until `path` exists or `timeout` passes
pub async fn wait_for(path: &Path, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    path.exists()
}
