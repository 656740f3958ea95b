//! File lifecycle
//!
//! Drives one file through classify → normalize → upsert and decides where it
//! ends up. A file is only ever moved after its batch committed; on any
//! failure it stays byte-for-byte where it was found.
//!
//! The sweep and the watchers may see the same file at once. A path is
//! claimed for the duration of its processing, and a second caller is
//! skipped instead of racing the first to the move.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::classifier::FileClassifier;
use super::models::{file_name_of, is_csv, FileOutcome, IngestionFile, SweepReport, WatchedFolder};
use super::normalizer::RecordNormalizer;
use super::registry::SchemaRegistry;
use super::upsert::BatchStore;
use crate::error::{IngestError, IngestResult};

/// Processing chain shared by the sweep and both folder watchers
pub struct FileProcessor {
    registry: SchemaRegistry,
    classifier: FileClassifier,
    store: Arc<dyn BatchStore>,
    processed_dir: PathBuf,
    in_flight: Mutex<HashSet<PathBuf>>,
}

/// A path being processed; released on drop
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<PathBuf>>,
    path: PathBuf,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        lock(self.in_flight).remove(&self.path);
    }
}

fn lock(set: &Mutex<HashSet<PathBuf>>) -> MutexGuard<'_, HashSet<PathBuf>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FileProcessor {
    pub fn new(
        registry: SchemaRegistry,
        store: Arc<dyn BatchStore>,
        processed_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            classifier: FileClassifier::new(registry),
            store,
            processed_dir: processed_dir.into(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, path: &Path) -> Option<Claim<'_>> {
        if !lock(&self.in_flight).insert(path.to_path_buf()) {
            return None;
        }
        Some(Claim {
            in_flight: &self.in_flight,
            path: path.to_path_buf(),
        })
    }

    pub fn processed_dir(&self) -> &Path {
        &self.processed_dir
    }

    /// Process one file to a terminal outcome. Never returns an error; failures
    /// are logged here and reported as [`FileOutcome::Failed`].
    #[instrument(skip(self, file), fields(file = %file.path.display(), origin = %file.origin))]
    pub async fn process(&self, mut file: IngestionFile) -> FileOutcome {
        let Some(_claim) = self.claim(&file.path) else {
            debug!("File already being processed, ignoring");
            return FileOutcome::Skipped {
                reason: "file already being processed".to_string(),
            };
        };

        if !file.path.is_file() {
            // Duplicate event for a file that was already handled
            debug!("File no longer present, ignoring");
            return FileOutcome::Skipped {
                reason: "file no longer present".to_string(),
            };
        }

        let name = file.file_name();
        let Some(file_type) = self.classifier.classify(&name) else {
            warn!(file_name = %name, "Unrecognized file type, leaving file in place");
            return FileOutcome::Skipped {
                reason: IngestError::UnknownFileType(name).to_string(),
            };
        };
        file.file_type = Some(file_type);

        match self.ingest(&file).await {
            Ok((destination, rows)) => {
                info!(
                    file_type = %file_type,
                    rows,
                    destination = %destination.display(),
                    "File ingested and moved to processed"
                );
                FileOutcome::Processed { destination, rows }
            },
            Err(e) => {
                error!(
                    file_type = %file_type,
                    error = %e,
                    retryable = e.is_retryable(),
                    "File ingestion failed, leaving file in place"
                );
                FileOutcome::Failed { error: e }
            },
        }
    }

    async fn ingest(&self, file: &IngestionFile) -> IngestResult<(PathBuf, usize)> {
        let file_type = file
            .file_type
            .ok_or_else(|| IngestError::UnknownFileType(file.file_name()))?;
        let mapping = self.registry.lookup(file_type)?;

        let normalizer = RecordNormalizer::new(mapping);
        let path = file.path.clone();
        let batch = tokio::task::spawn_blocking(move || normalizer.normalize_file(&path)).await??;

        let rows = batch.len();
        if batch.is_empty() {
            info!(table = mapping.table, "No data rows, nothing to write");
        } else {
            let written = self.store.upsert(&batch).await?;
            debug!(table = mapping.table, rows, written, "Batch committed");
        }

        let destination = move_to_processed(&file.path, &self.processed_dir).await?;
        Ok((destination, rows))
    }

    /// Process every CSV currently in `dir`, oldest first
    ///
    /// `cancel` is checked between files; once it fires the file in hand is
    /// finished and the rest are left for the next start.
    #[instrument(skip(self, dir, cancel), fields(folder = %origin, path = %dir.display()))]
    pub async fn sweep(
        &self,
        dir: &Path,
        origin: WatchedFolder,
        cancel: &CancellationToken,
    ) -> IngestResult<SweepReport> {
        let files = list_csv_files(dir).await?;
        let total = files.len();
        let mut report = SweepReport::new(origin);

        debug!(count = total, "Starting sweep");

        for (index, path) in files.into_iter().enumerate() {
            if cancel.is_cancelled() {
                report.remaining = total - index;
                info!(remaining = report.remaining, "Shutdown requested, stopping sweep");
                break;
            }
            let outcome = self.process(IngestionFile::new(path, origin)).await;
            report.record(&outcome);
        }

        info!(
            processed = report.processed,
            failed = report.failed,
            skipped = report.skipped,
            remaining = report.remaining,
            "Sweep complete"
        );

        Ok(report)
    }
}

/// CSV files directly inside `dir`, oldest modification time first
pub async fn list_csv_files(dir: &Path) -> IngestResult<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| IngestError::io(dir, e))?;

    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| IngestError::io(dir, e))?
    {
        let path = entry.path();
        if !is_csv(&path) {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Cannot stat file, skipping");
                continue;
            },
        };
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((modified, path));
    }

    files.sort();
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Move `source` into `processed_dir` under the same name, replacing any
/// file already there
///
/// Nothing is ever removed before the new copy is in place, and a
/// destination that resolves to `source` itself is refused.
pub async fn move_to_processed(source: &Path, processed_dir: &Path) -> IngestResult<PathBuf> {
    let name = file_name_of(source);
    let destination = processed_dir.join(&name);

    if same_file(source, &destination).await {
        return Err(IngestError::Config(format!(
            "processed folder {} is the folder of {}",
            processed_dir.display(),
            source.display()
        )));
    }

    // Replaces an existing destination atomically
    let Err(rename_err) = tokio::fs::rename(source, &destination).await else {
        return Ok(destination);
    };

    // Rename cannot cross filesystems. Copy next to the destination first so
    // an interrupted copy never shows up under the real name.
    debug!(error = %rename_err, "Rename failed, falling back to copy");
    let staging = processed_dir.join(format!(".{name}.part"));
    if let Err(e) = tokio::fs::copy(source, &staging).await {
        let _ = tokio::fs::remove_file(&staging).await;
        debug!(error = %e, "Copy fallback failed");
        return Err(IngestError::io(source, rename_err));
    }
    tokio::fs::rename(&staging, &destination)
        .await
        .map_err(|e| IngestError::io(&destination, e))?;
    tokio::fs::remove_file(source)
        .await
        .map_err(|e| IngestError::io(source, e))?;

    Ok(destination)
}

/// Both paths exist and resolve to the same location
async fn same_file(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Create each folder (and parents) if missing
pub fn prepare_folders<'a>(folders: impl IntoIterator<Item = &'a Path>) -> IngestResult<()> {
    for folder in folders {
        std::fs::create_dir_all(folder).map_err(|e| IngestError::io(folder, e))?;
        debug!(folder = %folder.display(), "Folder ready");
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ingest::models::UpsertBatch;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records batches instead of writing them; optionally refuses every
    /// batch, or requests shutdown while one is being written
    #[derive(Default)]
    struct RecordingStore {
        batches: Mutex<Vec<(String, usize)>>,
        fail: bool,
        cancel_on_upsert: Option<CancellationToken>,
    }

    #[async_trait]
    impl BatchStore for RecordingStore {
        async fn upsert(&self, batch: &UpsertBatch) -> IngestResult<u64> {
            if let Some(cancel) = &self.cancel_on_upsert {
                cancel.cancel();
            }
            if self.fail {
                return Err(IngestError::persistence(
                    batch.mapping.table,
                    sqlx::Error::PoolTimedOut,
                ));
            }
            self.batches
                .lock()
                .unwrap()
                .push((batch.mapping.table.to_string(), batch.len()));
            Ok(batch.len() as u64)
        }
    }

    struct Fixture {
        _root: TempDir,
        inbound: PathBuf,
        processed: PathBuf,
        store: Arc<RecordingStore>,
        processor: FileProcessor,
    }

    fn fixture(fail: bool) -> Fixture {
        fixture_with(RecordingStore {
            fail,
            ..Default::default()
        })
    }

    fn fixture_with(store: RecordingStore) -> Fixture {
        let root = TempDir::new().unwrap();
        let inbound = root.path().join("unprocessed");
        let processed = root.path().join("processed");
        prepare_folders([inbound.as_path(), processed.as_path()]).unwrap();

        let store = Arc::new(store);
        let processor = FileProcessor::new(SchemaRegistry::standard(), store.clone(), &processed);

        Fixture {
            _root: root,
            inbound,
            processed,
            store,
            processor,
        }
    }

    const TIMESHEET: &str = "Date,Employee Code,Project ID,Project Name,Hours Worked\n\
                             2025-06-01,EMP0001,PRJ001,Alpha,4.0\n\
                             2025-06-01,EMP0001,PRJ001,Alpha,6.0\n";

    #[tokio::test]
    async fn test_success_moves_file() {
        let fx = fixture(false);
        let path = fx.inbound.join("timesheet_report.csv");
        std::fs::write(&path, TIMESHEET).unwrap();

        let outcome = fx
            .processor
            .process(IngestionFile::new(&path, WatchedFolder::Unprocessed))
            .await;

        match outcome {
            FileOutcome::Processed { destination, rows } => {
                assert_eq!(destination, fx.processed.join("timesheet_report.csv"));
                assert_eq!(rows, 2);
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!path.exists());
        assert_eq!(
            std::fs::read_to_string(fx.processed.join("timesheet_report.csv")).unwrap(),
            TIMESHEET
        );
        assert_eq!(
            fx.store.batches.lock().unwrap().as_slice(),
            &[("timesheets".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn test_store_failure_leaves_file_untouched() {
        let fx = fixture(true);
        let path = fx.inbound.join("timesheet_report.csv");
        std::fs::write(&path, TIMESHEET).unwrap();

        let outcome = fx
            .processor
            .process(IngestionFile::new(&path, WatchedFolder::Unprocessed))
            .await;

        match outcome {
            FileOutcome::Failed { error } => assert!(error.is_retryable()),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), TIMESHEET);
        assert!(!fx.processed.join("timesheet_report.csv").exists());
    }

    #[tokio::test]
    async fn test_unrecognized_file_is_skipped_without_store_access() {
        let fx = fixture(false);
        let path = fx.inbound.join("payroll.csv");
        std::fs::write(&path, "a,b\n1,2\n").unwrap();

        let outcome = fx
            .processor
            .process(IngestionFile::new(&path, WatchedFolder::Unprocessed))
            .await;

        assert!(matches!(outcome, FileOutcome::Skipped { .. }));
        assert!(path.exists());
        assert!(fx.store.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_column_fails_and_stays() {
        let fx = fixture(false);
        let path = fx.inbound.join("timesheet_report.csv");
        std::fs::write(&path, "Date,Employee Code,Hours Worked\n2025-06-01,EMP0001,4\n").unwrap();

        let outcome = fx
            .processor
            .process(IngestionFile::new(&path, WatchedFolder::Underprocessed))
            .await;

        match outcome {
            FileOutcome::Failed { error } => {
                assert!(matches!(error, IngestError::MissingColumns { .. }));
                assert!(!error.is_retryable());
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(path.exists());
        assert!(fx.store.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_header_only_file_is_moved_without_write() {
        let fx = fixture(false);
        let path = fx.inbound.join("employee_master.csv");
        std::fs::write(&path, "Employee Code,Employee Name\n").unwrap();

        let outcome = fx
            .processor
            .process(IngestionFile::new(&path, WatchedFolder::Unprocessed))
            .await;

        assert!(outcome.is_processed());
        assert!(!path.exists());
        assert!(fx.store.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_file_is_skipped() {
        let fx = fixture(false);
        let outcome = fx
            .processor
            .process(IngestionFile::new(
                fx.inbound.join("timesheet_report.csv"),
                WatchedFolder::Unprocessed,
            ))
            .await;

        assert!(matches!(outcome, FileOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_move_overwrites_name_collision() {
        let fx = fixture(false);
        let source = fx.inbound.join("employee_master.csv");
        std::fs::write(&source, "new").unwrap();
        std::fs::write(fx.processed.join("employee_master.csv"), "old").unwrap();

        let destination = move_to_processed(&source, &fx.processed).await.unwrap();

        assert_eq!(std::fs::read_to_string(destination).unwrap(), "new");
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn test_sweep_counts_outcomes_and_ignores_non_csv() {
        let fx = fixture(false);
        std::fs::write(fx.inbound.join("timesheet_report.csv"), TIMESHEET).unwrap();
        std::fs::write(fx.inbound.join("payroll.csv"), "a\n1\n").unwrap();
        std::fs::write(fx.inbound.join("attendance_report_daily.CSV"), "Date\n").unwrap();
        std::fs::write(fx.inbound.join("readme.txt"), "not a csv").unwrap();

        let report = fx
            .processor
            .sweep(&fx.inbound, WatchedFolder::Unprocessed, &CancellationToken::new())
            .await
            .unwrap();

        // attendance lacks employee_code, so it fails
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.remaining, 0);
        assert!(fx.inbound.join("readme.txt").exists());
        assert!(fx.inbound.join("attendance_report_daily.CSV").exists());
    }

    #[tokio::test]
    async fn test_sweep_finishes_current_file_then_stops_on_shutdown() {
        let cancel = CancellationToken::new();
        let fx = fixture_with(RecordingStore {
            cancel_on_upsert: Some(cancel.clone()),
            ..Default::default()
        });
        std::fs::write(fx.inbound.join("timesheet_june.csv"), TIMESHEET).unwrap();
        std::fs::write(fx.inbound.join("timesheet_july.csv"), TIMESHEET).unwrap();

        let report = fx
            .processor
            .sweep(&fx.inbound, WatchedFolder::Unprocessed, &cancel)
            .await
            .unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(fx.store.batches.lock().unwrap().len(), 1);
        assert_eq!(std::fs::read_dir(&fx.processed).unwrap().count(), 1);
        assert_eq!(list_csv_files(&fx.inbound).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_processed_folder_aliasing_inbound_never_deletes_source() {
        let root = TempDir::new().unwrap();
        let inbound = root.path().join("unprocessed");
        let sibling = root.path().join("processed");
        prepare_folders([inbound.as_path(), sibling.as_path()]).unwrap();
        // Same directory, different spelling
        let aliased = sibling.join("..").join("unprocessed");

        let store = Arc::new(RecordingStore::default());
        let processor = FileProcessor::new(SchemaRegistry::standard(), store.clone(), &aliased);
        let path = inbound.join("employee_master.csv");
        std::fs::write(&path, "Employee Code\nEMP0001\n").unwrap();

        let outcome = processor
            .process(IngestionFile::new(&path, WatchedFolder::Unprocessed))
            .await;

        assert!(outcome.is_failed(), "unexpected outcome: {outcome:?}");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Employee Code\nEMP0001\n");
    }

    #[tokio::test]
    async fn test_same_file_is_processed_once_when_seen_twice() {
        let fx = fixture(false);
        let path = fx.inbound.join("timesheet_report.csv");
        std::fs::write(&path, TIMESHEET).unwrap();

        let (first, second) = tokio::join!(
            fx.processor
                .process(IngestionFile::new(&path, WatchedFolder::Unprocessed)),
            fx.processor
                .process(IngestionFile::new(&path, WatchedFolder::Unprocessed)),
        );

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|o| o.is_processed()).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, FileOutcome::Skipped { .. }))
                .count(),
            1
        );
        assert_eq!(fx.store.batches.lock().unwrap().len(), 1);
        assert!(fx.processed.join("timesheet_report.csv").exists());
    }

    #[tokio::test]
    async fn test_list_csv_files_oldest_first() {
        let dir = TempDir::new().unwrap();
        let older = dir.path().join("b_timesheet.csv");
        let newer = dir.path().join("a_timesheet.csv");
        std::fs::write(&older, "x").unwrap();
        std::fs::write(&newer, "x").unwrap();

        let past = SystemTime::now() - std::time::Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&older)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let files = list_csv_files(dir.path()).await.unwrap();
        assert_eq!(files, vec![older, newer]);
    }
}
