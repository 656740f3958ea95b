//! Upsert engine
//!
//! Writes an [`UpsertBatch`] as multi-row `INSERT ... ON CONFLICT DO UPDATE`
//! statements inside a single transaction. Rows are matched on the mapping's
//! natural key and every non-key column present in the batch is overwritten
//! with the incoming value (last write wins). Either the whole batch commits
//! or nothing from it is visible.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::{debug, info};

use super::models::{NormalizedRecord, UpsertBatch};
use super::registry::{ColumnSpec, SqlType, TableMapping};
use crate::error::{IngestError, IngestResult};

/// PostgreSQL limit on bind parameters per statement
const MAX_BIND_PARAMS: usize = 65_535;

/// Default rows per INSERT statement
pub const DEFAULT_CHUNK_SIZE: usize = 1_000;

/// Destination for normalized batches
///
/// Implementations must be all-or-nothing per batch: on `Err` no row of the
/// batch may remain visible.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Persist the batch, returning the number of rows written
    async fn upsert(&self, batch: &UpsertBatch) -> IngestResult<u64>;
}

/// PostgreSQL-backed [`BatchStore`]
///
/// A connection is taken from the pool for the duration of one batch and
/// returned when the transaction ends, whether it committed or not.
#[derive(Debug, Clone)]
pub struct UpsertEngine {
    pool: PgPool,
    chunk_size: usize,
}

impl UpsertEngine {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Rows per statement for a given column count
    pub fn rows_per_statement(&self, column_count: usize) -> usize {
        let by_params = MAX_BIND_PARAMS / column_count.max(1);
        self.chunk_size.min(by_params).max(1)
    }
}

#[async_trait]
impl BatchStore for UpsertEngine {
    async fn upsert(&self, batch: &UpsertBatch) -> IngestResult<u64> {
        let table = batch.mapping.table;

        if batch.is_empty() {
            debug!(table, file = %batch.source.display(), "Empty batch, nothing to write");
            return Ok(0);
        }

        let rows = collapse_by_key(&batch.records, batch.mapping.natural_key);
        if rows.len() < batch.len() {
            debug!(
                table,
                incoming = batch.len(),
                distinct = rows.len(),
                "Collapsed repeated natural keys, last row wins"
            );
        }

        let per_statement = self.rows_per_statement(batch.columns.len());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IngestError::persistence(table, e))?;

        let mut written = 0u64;
        for chunk in rows.chunks(per_statement) {
            let mut query_builder = build_upsert(batch.mapping, &batch.columns, chunk);

            // On error `tx` is dropped here, which rolls the transaction back
            let result = query_builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| IngestError::persistence(table, e))?;

            written += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| IngestError::persistence(table, e))?;

        info!(
            table,
            file = %batch.source.display(),
            rows = written,
            "Upserted batch"
        );

        Ok(written)
    }
}

/// Keep one record per natural key: the last one seen, at the position of the first
pub fn collapse_by_key<'a>(
    records: &'a [NormalizedRecord],
    natural_key: &[&str],
) -> Vec<&'a NormalizedRecord> {
    let mut positions: HashMap<Vec<Option<String>>, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<&NormalizedRecord> = Vec::with_capacity(records.len());

    for record in records {
        let key = record.key(natural_key);
        match positions.get(&key) {
            Some(&pos) => out[pos] = record,
            None => {
                positions.insert(key, out.len());
                out.push(record);
            },
        }
    }

    out
}

/// Build one multi-row upsert statement for `rows`
pub fn build_upsert<'a>(
    mapping: &TableMapping,
    columns: &[&'static ColumnSpec],
    rows: &[&'a NormalizedRecord],
) -> QueryBuilder<'a, Postgres> {
    let column_list = columns.iter().map(|c| c.name).collect::<Vec<_>>().join(", ");

    let mut query_builder: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("INSERT INTO {} ({}) ", mapping.table, column_list));

    query_builder.push_values(rows.iter(), |mut b, record| {
        for column in columns {
            let value = record.get(column.name);
            match column.sql_type {
                SqlType::Date => {
                    b.push_bind(value.as_date());
                },
                SqlType::Text => {
                    b.push_bind(value.to_text());
                },
                SqlType::Time | SqlType::Decimal => {
                    b.push_bind(value.to_text());
                    if let Some(cast) = column.sql_type.cast() {
                        b.push_unseparated(cast);
                    }
                },
            }
        }
    });

    let mut assignments: Vec<String> = columns
        .iter()
        .filter(|c| !mapping.is_key_column(c.name))
        .map(|c| format!("{0} = EXCLUDED.{0}", c.name))
        .collect();
    assignments.push("updated_at = NOW()".to_string());

    query_builder.push(format!(
        " ON CONFLICT ({}) DO UPDATE SET {}",
        mapping.natural_key.join(", "),
        assignments.join(", ")
    ));

    query_builder
}
