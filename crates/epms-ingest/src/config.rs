//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::ingest::models::WatchedFolder;

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database host.
pub const DEFAULT_DB_HOST: &str = "localhost";

/// Default database port.
pub const DEFAULT_DB_PORT: u16 = 5432;

/// Default database name.
pub const DEFAULT_DB_NAME: &str = "epms_db";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 4;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default idle timeout in seconds. Short, so idle periods hold no connection.
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Folder Configuration Constants
// ============================================================================

/// Default root under which the three folders live.
pub const DEFAULT_WATCHED_FOLDER_PATH: &str = "./watched_folder";

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default settle delay in milliseconds.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 2_000;

/// Default rows per upsert statement.
pub const DEFAULT_UPSERT_CHUNK_SIZE: usize = 1_000;

/// Watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub folders: FolderConfig,
    pub pipeline: PipelineConfig,
}

/// Database configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"***")
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .finish()
    }
}

/// Folder layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderConfig {
    pub root: PathBuf,
    pub unprocessed: PathBuf,
    pub underprocessed: PathBuf,
    pub processed: PathBuf,
}

impl FolderConfig {
    /// Conventional layout under `root`
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            unprocessed: root.join(WatchedFolder::Unprocessed.as_str()),
            underprocessed: root.join(WatchedFolder::Underprocessed.as_str()),
            processed: root.join(WatchedFolder::Processed.as_str()),
            root,
        }
    }

    pub fn path(&self, folder: WatchedFolder) -> &Path {
        match folder {
            WatchedFolder::Unprocessed => &self.unprocessed,
            WatchedFolder::Underprocessed => &self.underprocessed,
            WatchedFolder::Processed => &self.processed,
        }
    }

    /// Folders that are swept and watched
    pub fn inbound(&self) -> [(WatchedFolder, &Path); 2] {
        WatchedFolder::inbound().map(|folder| (folder, self.path(folder)))
    }

    pub fn all(&self) -> [&Path; 3] {
        [&self.unprocessed, &self.underprocessed, &self.processed]
    }

    /// The same layout with every folder resolved to its canonical path
    ///
    /// The folders must exist. Distinctness is checked again on the resolved
    /// paths, so `..`, `.` and symlink spellings of one folder are caught.
    pub fn resolve(&self) -> anyhow::Result<Self> {
        let canonical = |path: &Path| {
            std::fs::canonicalize(path)
                .map_err(|e| anyhow::anyhow!("Failed to resolve folder {}: {}", path.display(), e))
        };

        let resolved = Self {
            root: std::fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone()),
            unprocessed: canonical(&self.unprocessed)?,
            underprocessed: canonical(&self.underprocessed)?,
            processed: canonical(&self.processed)?,
        };
        resolved.check_distinct()?;

        Ok(resolved)
    }

    /// The three folders must be three different directories
    pub fn check_distinct(&self) -> anyhow::Result<()> {
        let processed = &self.processed;
        if processed == &self.unprocessed || processed == &self.underprocessed {
            anyhow::bail!(
                "Processed folder ({}) must differ from the watched folders",
                processed.display()
            );
        }

        if self.unprocessed == self.underprocessed {
            anyhow::bail!(
                "Unprocessed and underprocessed folders must differ (both are {})",
                self.unprocessed.display()
            );
        }

        Ok(())
    }
}

/// Pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub settle_delay_ms: u64,
    pub upsert_chunk_size: usize,
}

impl PipelineConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Config {
    /// Load configuration from environment and defaults, reading `env_file`
    /// (or `.env` when `None`) first
    pub fn load(env_file: Option<&Path>) -> anyhow::Result<Self> {
        match env_file {
            Some(path) => {
                dotenvy::from_path(path).map_err(|e| {
                    anyhow::anyhow!("Failed to read env file {}: {}", path.display(), e)
                })?;
            },
            None => {
                dotenvy::dotenv().ok();
            },
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; used by `load` and by tests
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let root: PathBuf = lookup("WATCHED_FOLDER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WATCHED_FOLDER_PATH));
        let defaults = FolderConfig::under(&root);

        let config = Config {
            database: DatabaseConfig {
                host: lookup("DB_HOST").unwrap_or_else(|| DEFAULT_DB_HOST.to_string()),
                port: parsed(&lookup, "DB_PORT")?.unwrap_or(DEFAULT_DB_PORT),
                name: lookup("DB_NAME").unwrap_or_else(|| DEFAULT_DB_NAME.to_string()),
                user: lookup("DB_USER").unwrap_or_default(),
                password: lookup("DB_PASSWORD").unwrap_or_default(),
                max_connections: parsed(&lookup, "DATABASE_MAX_CONNECTIONS")?
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
                connect_timeout_secs: parsed(&lookup, "DATABASE_CONNECT_TIMEOUT")?
                    .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
                idle_timeout_secs: parsed(&lookup, "DATABASE_IDLE_TIMEOUT")?
                    .unwrap_or(DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            folders: FolderConfig {
                unprocessed: lookup("UNPROCESSED_FOLDER")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.unprocessed),
                underprocessed: lookup("UNDERPROCESSED_FOLDER")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.underprocessed),
                processed: lookup("PROCESSED_FOLDER")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.processed),
                root,
            },
            pipeline: PipelineConfig {
                settle_delay_ms: parsed(&lookup, "SETTLE_DELAY_MS")?
                    .unwrap_or(DEFAULT_SETTLE_DELAY_MS),
                upsert_chunk_size: parsed(&lookup, "UPSERT_CHUNK_SIZE")?
                    .unwrap_or(DEFAULT_UPSERT_CHUNK_SIZE),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        // Credentials have no defaults
        if self.database.user.is_empty() {
            anyhow::bail!("DB_USER must be set");
        }

        if self.database.password.is_empty() {
            anyhow::bail!("DB_PASSWORD must be set");
        }

        if self.database.port == 0 {
            anyhow::bail!("Database port must be greater than 0");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        self.folders.check_distinct()?;

        if self.pipeline.upsert_chunk_size == 0 {
            anyhow::bail!("UPSERT_CHUNK_SIZE must be greater than 0");
        }

        Ok(())
    }
}

/// Parse a variable, `None` when unset; a malformed value is an error
fn parsed<T, F>(lookup: &F, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid value {:?} for {}: {}", raw, key, e))
        })
        .transpose()
}
