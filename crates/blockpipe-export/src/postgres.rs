//! PostgreSQL record store.
//!
//! Each record kind maps to a table through a [`TableSpec`]: the primary-key
//! parts map positionally onto `key_columns`, payload fields map onto
//! `columns` by name (fields without a column are ignored by Postgres).
//!
//! A partition is written inside one transaction as one or more statements
//! of the form:
//!
//! ```sql
//! INSERT INTO "blocks" ("number", "hash", "timestamp")
//! SELECT "number", "hash", "timestamp"
//! FROM jsonb_populate_recordset(NULL::"blocks", $1)
//! ON CONFLICT ("number") DO UPDATE SET "hash" = EXCLUDED."hash", "timestamp" = EXCLUDED."timestamp"
//! ```
//!
//! Rows travel as a single JSONB parameter, so statement size is bounded by
//! `rows_per_statement` rather than the bind-parameter limit. A table with
//! no non-key columns uses `ON CONFLICT DO NOTHING`.
//!
//! SQL generation and error classification are always compiled; the store
//! itself needs the `postgres` feature.

use blockpipe_core::ErrorKind;
use blockpipe_core::{ExportRecord, PrimaryKey, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_rows_per_statement() -> usize {
    5_000
}

/// Mapping from one record kind to a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    pub table: String,
    pub key_columns: Vec<String>,
    /// Non-key columns overwritten on conflict.
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default = "default_rows_per_statement")]
    pub rows_per_statement: usize,
}

impl TableSpec {
    pub fn new(table: impl Into<String>, key_columns: &[&str], columns: &[&str]) -> Self {
        Self {
            table: table.into(),
            key_columns: key_columns.iter().map(|c| c.to_string()).collect(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows_per_statement: default_rows_per_statement(),
        }
    }

    pub fn upsert_sql(&self) -> String {
        build_upsert_sql(&self.table, &self.key_columns, &self.columns)
    }

    pub fn fetch_sql(&self) -> String {
        build_fetch_sql(&self.table, &self.key_columns)
    }

    /// JSON object for one row: key parts under their key columns, then the
    /// payload fields.
    pub fn row_json(&self, record: &ExportRecord) -> Result<Value, StoreError> {
        let mut row = record.payload().clone();
        self.insert_key(&mut row, record.key())?;
        Ok(Value::Object(row))
    }

    fn insert_key(&self, row: &mut Map<String, Value>, key: &PrimaryKey) -> Result<(), StoreError> {
        if key.len() != self.key_columns.len() {
            return Err(StoreError::conflict(format!(
                "key {} has {} parts, table {} has {} key columns",
                key,
                key.len(),
                self.table,
                self.key_columns.len()
            )));
        }
        for (column, part) in self.key_columns.iter().zip(key.parts()) {
            row.insert(column.clone(), part.to_json());
        }
        Ok(())
    }

    /// JSON object holding only the key columns, as bound by the fetch query.
    pub fn key_json(&self, key: &PrimaryKey) -> Result<Value, StoreError> {
        let mut row = Map::new();
        self.insert_key(&mut row, key)?;
        Ok(Value::Object(row))
    }
}

/// Double-quote an identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn column_list(columns: &[&String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build the set-based upsert statement for one table.
pub fn build_upsert_sql(table: &str, key_columns: &[String], columns: &[String]) -> String {
    let value_columns: Vec<&String> = columns.iter().filter(|c| !key_columns.contains(c)).collect();
    let all: Vec<&String> = key_columns.iter().chain(value_columns.iter().copied()).collect();
    let table = quote_ident(table);
    let cols = column_list(&all);

    let mut sql = format!(
        "INSERT INTO {table} ({cols}) SELECT {cols} FROM jsonb_populate_recordset(NULL::{table}, $1) ON CONFLICT ({keys})",
        table = table,
        cols = cols,
        keys = column_list(&key_columns.iter().collect::<Vec<_>>()),
    );

    if value_columns.is_empty() {
        sql.push_str(" DO NOTHING");
    } else {
        let updates = value_columns
            .iter()
            .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(" DO UPDATE SET ");
        sql.push_str(&updates);
    }
    sql
}

/// Build the single-row lookup used to read a record back by key.
pub fn build_fetch_sql(table: &str, key_columns: &[String]) -> String {
    let table = quote_ident(table);
    let keys = column_list(&key_columns.iter().collect::<Vec<_>>());
    let qualified = key_columns
        .iter()
        .map(|c| format!("t.{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT to_jsonb(t) AS row FROM {table} AS t WHERE ({qualified}) = (SELECT {keys} FROM jsonb_populate_record(NULL::{table}, $1))",
        table = table,
        qualified = qualified,
        keys = keys,
    )
}

/// Classify a Postgres SQLSTATE code.
///
/// Serialization failures and deadlocks (class 40), connection exceptions
/// (08), insufficient resources (53) and admin shutdown (57P01) are
/// transient; everything else is a non-retryable conflict.
pub fn classify_sqlstate(code: &str) -> ErrorKind {
    if code.starts_with("40") || code.starts_with("08") || code.starts_with("53") || code == "57P01" {
        ErrorKind::StorageTransient
    } else {
        ErrorKind::StorageConflictUnresolvable
    }
}

#[cfg(feature = "postgres")]
pub use store::PostgresStore;

#[cfg(feature = "postgres")]
mod store {
    use super::{classify_sqlstate, TableSpec};
    use crate::store::RecordStore;
    use async_trait::async_trait;
    use blockpipe_core::{ExportRecord, PrimaryKey, RecordKind, StoreError};
    use serde_json::{Map, Value};
    use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
    use sqlx::types::Json;
    use sqlx::Row;
    use std::collections::HashMap;
    use std::str::FromStr;
    use tracing::debug;

    fn classify(err: sqlx::Error) -> StoreError {
        let kind = match &err {
            sqlx::Error::Database(db) => db
                .code()
                .map(|code| classify_sqlstate(&code))
                .unwrap_or(blockpipe_core::ErrorKind::StorageConflictUnresolvable),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => blockpipe_core::ErrorKind::StorageTransient,
            _ => blockpipe_core::ErrorKind::StorageConflictUnresolvable,
        };
        StoreError {
            kind,
            message: err.to_string(),
        }
    }

    /// [`RecordStore`] over a `sqlx` Postgres pool.
    pub struct PostgresStore {
        pool: PgPool,
        tables: HashMap<RecordKind, TableSpec>,
    }

    impl PostgresStore {
        pub async fn connect(
            url: &str,
            max_connections: u32,
            tables: HashMap<RecordKind, TableSpec>,
        ) -> Result<Self, StoreError> {
            let options = PgConnectOptions::from_str(url).map_err(classify)?;
            let pool = PgPoolOptions::new()
                .max_connections(max_connections)
                .connect_with(options)
                .await
                .map_err(classify)?;
            Ok(Self::with_pool(pool, tables))
        }

        pub fn with_pool(pool: PgPool, tables: HashMap<RecordKind, TableSpec>) -> Self {
            Self { pool, tables }
        }

        pub fn pool(&self) -> &PgPool {
            &self.pool
        }

        fn spec(&self, kind: &RecordKind) -> Result<&TableSpec, StoreError> {
            self.tables
                .get(kind)
                .ok_or_else(|| StoreError::conflict(format!("no table mapping for record kind {}", kind)))
        }
    }

    #[async_trait]
    impl RecordStore for PostgresStore {
        async fn upsert(&self, kind: &RecordKind, records: &[ExportRecord]) -> Result<u64, StoreError> {
            let spec = self.spec(kind)?;
            let rows = records
                .iter()
                .map(|r| spec.row_json(r))
                .collect::<Result<Vec<_>, _>>()?;
            let sql = spec.upsert_sql();

            let mut tx = self.pool.begin().await.map_err(classify)?;
            let mut written = 0u64;
            for chunk in rows.chunks(spec.rows_per_statement.max(1)) {
                let result = sqlx::query(&sql)
                    .bind(Json(chunk))
                    .execute(&mut *tx)
                    .await
                    .map_err(classify)?;
                written += result.rows_affected();
            }
            tx.commit().await.map_err(classify)?;

            debug!(kind = %kind, table = %spec.table, rows = records.len(), written, "Upserted partition");
            Ok(records.len() as u64)
        }

        async fn fetch(
            &self,
            kind: &RecordKind,
            key: &PrimaryKey,
        ) -> Result<Option<Map<String, Value>>, StoreError> {
            let spec = self.spec(kind)?;
            let row = sqlx::query(&spec.fetch_sql())
                .bind(Json(spec.key_json(key)?))
                .fetch_optional(&self.pool)
                .await
                .map_err(classify)?;

            let Some(row) = row else {
                return Ok(None);
            };
            let Json(value): Json<Value> = row.try_get("row").map_err(classify)?;
            match value {
                Value::Object(mut map) => {
                    for column in &spec.key_columns {
                        map.remove(column);
                    }
                    Ok(Some(map))
                }
                other => Err(StoreError::conflict(format!(
                    "unexpected row shape from {}: {}",
                    spec.table, other
                ))),
            }
        }

        fn name(&self) -> &str {
            "postgres"
        }
    }
}
