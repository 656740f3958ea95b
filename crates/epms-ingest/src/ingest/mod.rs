//! CSV ingestion pipeline
//!
//! # Architecture
//!
//! - **registry**: table mappings for each logical file type
//! - **classifier**: file name → logical file type
//! - **normalizer**: CSV content → [`UpsertBatch`]
//! - **upsert**: [`BatchStore`] seam and the PostgreSQL [`UpsertEngine`]
//! - **lifecycle**: per-file processing chain, move-on-success, folder sweeps
//! - **watcher**: per-folder watch contexts and their [`Supervisor`]
//! - **models**: shared pipeline types

pub mod classifier;
pub mod lifecycle;
pub mod models;
pub mod normalizer;
pub mod registry;
pub mod upsert;
pub mod watcher;

pub use classifier::FileClassifier;
pub use lifecycle::{list_csv_files, move_to_processed, prepare_folders, FileProcessor};
pub use models::{
    FieldValue, FileOutcome, IngestionFile, LogicalFileType, NormalizedRecord, SweepReport,
    UpsertBatch, WatchedFolder,
};
pub use normalizer::RecordNormalizer;
pub use registry::{ColumnSpec, SchemaRegistry, SqlType, TableMapping, STANDARD_MAPPINGS};
pub use upsert::{BatchStore, UpsertEngine};
pub use watcher::{SettleQueue, Supervisor, WatchContext, WatchHandle};
