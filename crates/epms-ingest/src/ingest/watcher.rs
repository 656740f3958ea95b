//! Folder watching
//!
//! Each inbound folder gets its own [`WatchContext`]: a `notify` watcher whose
//! callback feeds a tokio channel, and a task that waits for arrivals to
//! settle before handing them to the shared [`FileProcessor`]. A
//! [`Supervisor`] owns the handles and stops them all on shutdown.
//!
//! Files in a context are processed one at a time. Cancellation is only
//! observed between files, so a file that has started is always finished.

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lifecycle::FileProcessor;
use super::models::{is_csv, IngestionFile, WatchedFolder};
use crate::error::{IngestError, IngestResult};

/// Default wait after the last event for a file before it is read
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(2_000);

// ============================================================================
// Settle queue
// ============================================================================

/// Files waiting for their settle delay to elapse
///
/// Every further event for a pending file pushes its deadline back, so a
/// file still being written is not picked up half-way.
#[derive(Debug)]
pub struct SettleQueue {
    delay: Duration,
    deadlines: HashMap<PathBuf, Instant>,
}

impl SettleQueue {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadlines: HashMap::new(),
        }
    }

    /// A file appeared; (re)start its delay
    pub fn arrive(&mut self, path: PathBuf, now: Instant) {
        self.deadlines.insert(path, now + self.delay);
    }

    /// A pending file was written to; restart its delay
    pub fn touch(&mut self, path: &Path, now: Instant) {
        if let Some(deadline) = self.deadlines.get_mut(path) {
            *deadline = now + self.delay;
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return files whose delay has elapsed, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut due: Vec<(Instant, PathBuf)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, deadline)| (*deadline, path.clone()))
            .collect();
        due.sort();

        for (_, path) in &due {
            self.deadlines.remove(path);
        }
        due.into_iter().map(|(_, path)| path).collect()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Feed one filesystem event into the queue
    pub fn observe(&mut self, event: &Event, now: Instant) {
        match event.kind {
            EventKind::Create(_) => {
                for path in event.paths.iter().filter(|p| is_csv(p)) {
                    self.arrive(path.clone(), now);
                }
            },
            // Moved in: `Both` carries [from, to], the others only the new name
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let Some(path) = event.paths.last().filter(|p| is_csv(p)) {
                    self.arrive(path.clone(), now);
                }
            },
            EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any)) => {
                for path in event.paths.iter().filter(|p| is_csv(p)) {
                    self.arrive(path.clone(), now);
                }
            },
            EventKind::Modify(_) => {
                for path in &event.paths {
                    self.touch(path, now);
                }
            },
            _ => {},
        }
    }
}

// ============================================================================
// Watch context
// ============================================================================

/// Event-reaction loop for one inbound folder
pub struct WatchContext {
    folder: WatchedFolder,
    path: PathBuf,
    processor: Arc<FileProcessor>,
    settle_delay: Duration,
}

impl WatchContext {
    pub fn new(
        folder: WatchedFolder,
        path: impl Into<PathBuf>,
        processor: Arc<FileProcessor>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            folder,
            path: path.into(),
            processor,
            settle_delay,
        }
    }

    /// Register the OS watch and start the loop
    ///
    /// Registration happens before this returns, so files created after a
    /// successful call are guaranteed to be seen.
    pub fn spawn(self, cancel: CancellationToken) -> IngestResult<WatchHandle> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| {
                // Receiver is gone only after the loop has exited
                let _ = tx.send(res);
            })?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        info!(folder = %self.folder, path = %self.path.display(), "Watching folder");

        let folder = self.folder;
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { self.run(watcher, rx, task_cancel).await });

        Ok(WatchHandle {
            folder,
            cancel,
            task,
        })
    }

    async fn run(
        self,
        watcher: RecommendedWatcher,
        mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
        cancel: CancellationToken,
    ) -> IngestResult<()> {
        let mut queue = SettleQueue::new(self.settle_delay);

        loop {
            let next_deadline = queue.next_deadline();
            let settled = async move {
                match next_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                event = events.recv() => match event {
                    Some(Ok(event)) => queue.observe(&event, Instant::now()),
                    Some(Err(e)) => warn!(folder = %self.folder, error = %e, "Watch error"),
                    None => {
                        error!(folder = %self.folder, "Watch channel closed unexpectedly");
                        break;
                    },
                },

                _ = settled => {
                    for path in queue.take_due(Instant::now()) {
                        self.processor
                            .process(IngestionFile::new(path, self.folder))
                            .await;
                        if cancel.is_cancelled() {
                            break;
                        }
                    }
                },
            }
        }

        // Dropping the watcher unregisters the OS watch
        drop(watcher);

        if !queue.is_empty() {
            info!(
                folder = %self.folder,
                pending = queue.len(),
                "Stopped with unsettled files; they will be picked up by the next sweep"
            );
        }
        info!(folder = %self.folder, "Folder watcher stopped");

        Ok(())
    }
}

/// Handle to a running [`WatchContext`]
pub struct WatchHandle {
    folder: WatchedFolder,
    cancel: CancellationToken,
    task: JoinHandle<IngestResult<()>>,
}

impl WatchHandle {
    pub fn folder(&self) -> WatchedFolder {
        self.folder
    }

    /// Ask the loop to stop after its current file
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the loop to exit
    pub async fn join(self) -> IngestResult<()> {
        self.task.await?
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Owns every watch context of the process
pub struct Supervisor {
    shutdown: CancellationToken,
    handles: Vec<WatchHandle>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Start watching `path`; the context stops when the supervisor shuts down
    pub fn watch(
        &mut self,
        folder: WatchedFolder,
        path: impl Into<PathBuf>,
        processor: Arc<FileProcessor>,
        settle_delay: Duration,
    ) -> IngestResult<()> {
        let context = WatchContext::new(folder, path, processor, settle_delay);
        let handle = context.spawn(self.shutdown.child_token())?;
        self.handles.push(handle);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn folders(&self) -> Vec<WatchedFolder> {
        self.handles.iter().map(WatchHandle::folder).collect()
    }

    /// Stop intake on every context and wait for in-flight files to finish
    pub async fn shutdown(self) -> IngestResult<()> {
        info!(contexts = self.handles.len(), "Stopping folder watchers");
        self.shutdown.cancel();

        let mut first_error: Option<IngestError> = None;
        for handle in self.handles {
            let folder = handle.folder();
            if let Err(e) = handle.join().await {
                error!(folder = %folder, error = %e, "Folder watcher ended with error");
                first_error.get_or_insert(e);
            } else {
                debug!(folder = %folder, "Folder watcher joined");
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
