//! EPMS Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Unattended ingestion of HR export CSVs into PostgreSQL.
//!
//! # Overview
//!
//! CSV files dropped into the `unprocessed` or `underprocessed` folders are
//! classified by name, normalized against a fixed table mapping, upserted on
//! their natural key, and moved to `processed` once the transaction commits.
//! Anything that fails stays where it was found for the next sweep.
//!
//! - **Configuration**: `DB_*`, folder and pipeline settings from the environment
//! - **Database**: pool construction, startup check and table bootstrap
//! - **Ingest**: the pipeline itself, see [`ingest`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use epms_ingest::{config::Config, db, ingest::{FileProcessor, SchemaRegistry, UpsertEngine, WatchedFolder}};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     let pool = db::create_pool(&config.database).await?;
//!     let registry = SchemaRegistry::standard();
//!     db::ensure_tables(&pool, &registry).await?;
//!
//!     let store = Arc::new(UpsertEngine::new(pool));
//!     let processor = FileProcessor::new(registry, store, &config.folders.processed);
//!     processor
//!         .sweep(&config.folders.unprocessed, WatchedFolder::Unprocessed, &CancellationToken::new())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod ingest;

pub use error::{IngestError, IngestResult};
