//! Database setup
//!
//! Pool construction, the startup reachability check, and creation of the
//! mapped tables. Any error here is a startup failure.

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;

use crate::config::DatabaseConfig;
use crate::ingest::registry::SchemaRegistry;

/// Database setup errors with contextual information
#[derive(Error, Debug)]
pub enum DbError {
    /// SQL query or connection error
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Database could not be reached at startup
    #[error("Database unreachable at {host}:{port}/{name}: {source}. Check DB_HOST, DB_PORT and credentials.")]
    Unreachable {
        host: String,
        port: u16,
        name: String,
        #[source]
        source: sqlx::Error,
    },

    /// A mapped table could not be created
    #[error("Failed to create table {table}: {source}")]
    Bootstrap {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

pub type DbResult<T> = Result<T, DbError>;

/// Connection options for the configured server
pub fn connect_options(config: &DatabaseConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .database(&config.name)
        .username(&config.user)
        .password(&config.password)
}

/// No connections are kept warm: each file checks one out for its
/// transaction, and idle ones are closed after `idle_timeout_secs`.
fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
}

/// Build the pool and verify the server answers
pub async fn create_pool(config: &DatabaseConfig) -> DbResult<PgPool> {
    let pool = pool_options(config)
        .connect_with(connect_options(config))
        .await
        .map_err(|source| DbError::Unreachable {
            host: config.host.clone(),
            port: config.port,
            name: config.name.clone(),
            source,
        })?;

    health_check(&pool).await?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        database = %config.name,
        max_connections = config.max_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> DbResult<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(DbError::from)
}

/// Create every mapped table that does not exist yet
pub async fn ensure_tables(pool: &PgPool, registry: &SchemaRegistry) -> DbResult<()> {
    for mapping in registry.mappings() {
        let ddl = mapping.create_table_sql();
        sqlx::query(&ddl)
            .execute(pool)
            .await
            .map_err(|source| DbError::Bootstrap {
                table: mapping.table,
                source,
            })?;

        tracing::debug!(table = mapping.table, "Table ready");
    }

    tracing::info!(tables = registry.mappings().len(), "Table bootstrap complete");

    Ok(())
}
