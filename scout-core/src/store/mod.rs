//! Durable, SQL-queryable storage for fetched tables.
//!
//! Every table lives in one SQLite file, addressed by a
//! `(dataset, source, partition)` key. A catalog table records the key,
//! the polars schema and the row count of each stored table, so loads can
//! rebuild logical types that SQLite itself does not know about.
//!
//! Physical tables are named `t__{dataset}__{source}__{partition}` and their
//! columns are positional (`c0`, `c1`, ..). Column names live only in the
//! catalog, so names SQLite would treat as equal (`"G"` and `"g"`) can be
//! stored side by side. Reads alias every column back to its real name.
//!
//! A single writer is assumed. The connection sits behind a mutex so the
//! store can be shared between threads, but concurrent `save` calls for the
//! same key are last-writer-wins.

pub mod export;
pub mod schema;

pub use export::Compression;

use chrono::{DateTime, Utc};
use polars::prelude::*;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use self::schema::{ColumnBuffer, ColumnSpec};

const CATALOG: &str = "_scout_catalog";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no stored table for {0}")]
    TableNotFound(TableKey),

    #[error("table name '{table}' for {key} is already used by {existing}")]
    NameCollision {
        table: String,
        key: TableKey,
        existing: TableKey,
    },

    #[error("column '{column}' has unsupported type {dtype}")]
    UnsupportedType { column: String, dtype: String },

    #[error("catalog entry for '{table}' is invalid: {reason}")]
    Catalog { table: String, reason: String },
}

/// Identity of one stored table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TableKey {
    pub dataset: String,
    pub source: String,
    pub partition: String,
}

impl TableKey {
    pub fn new(
        dataset: impl Into<String>,
        source: impl Into<String>,
        partition: impl Into<String>,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            source: source.into(),
            partition: partition.into(),
        }
    }

    /// Each component sanitized, joined with `__`. Used for export file names.
    ///
    /// `("Match Stats", "FBref", "2023-2024")` → `match_stats__fbref__2023_2024`
    pub fn stem(&self) -> String {
        format!(
            "{}__{}__{}",
            sanitize(&self.dataset),
            sanitize(&self.source),
            sanitize(&self.partition)
        )
    }

    /// Physical table name, [`TableKey::stem`] behind a fixed `t__` prefix
    /// so no key can land in SQLite's reserved `sqlite_` namespace.
    pub fn table_name(&self) -> String {
        format!("t__{}", self.stem())
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.dataset, self.source, self.partition)
    }
}

/// Lowercase, with every run of non-alphanumerics collapsed to one `_`.
fn sanitize(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    let mut in_gap = false;
    for c in component.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            in_gap = false;
        } else if !in_gap {
            out.push('_');
            in_gap = true;
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Physical name of the column at `idx`.
fn physical_column(idx: usize) -> String {
    format!("c{idx}")
}

/// Row selection pushed down to SQLite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// SQL boolean expression over the table's columns, e.g. `"goals > 2"`.
    /// Trusted input: it is spliced into the query as-is.
    pub filter: Option<String>,
    pub limit: Option<usize>,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, expr: impl Into<String>) -> Self {
        self.filter = Some(expr.into());
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

/// Catalog row as shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableInfo {
    pub key: TableKey,
    pub table_name: String,
    pub row_count: u64,
    pub saved_at: DateTime<Utc>,
}

/// Schema of one stored table, read from the catalog.
struct StoredTable {
    table_name: String,
    columns: Vec<ColumnSpec>,
}

pub struct PartitionedStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl fmt::Debug for PartitionedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl PartitionedStore {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        let store = Self::init(conn, Some(path.to_path_buf()))?;
        debug!(path = %path.display(), "opened partitioned store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::open(&config.path)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {CATALOG} (
                table_name  TEXT PRIMARY KEY,
                dataset     TEXT NOT NULL,
                source      TEXT NOT NULL,
                \"partition\" TEXT NOT NULL,
                row_count   INTEGER NOT NULL,
                schema_json TEXT NOT NULL,
                saved_at    TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {CATALOG}_key
                ON {CATALOG} (dataset, source, \"partition\");"
        ))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Database file, `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace the table for `key`.
    ///
    /// An empty frame is skipped and reported as `Ok(false)`: an empty
    /// fetch result should not look like data that exists with zero rows.
    pub fn save(&self, frame: &DataFrame, key: &TableKey) -> Result<bool, StoreError> {
        if frame.height() == 0 {
            info!(table = %key, "skipping save of empty table");
            return Ok(false);
        }

        match self.write_table(frame, key) {
            Ok(()) => {
                info!(table = %key, rows = frame.height(), "saved table");
                Ok(true)
            }
            Err(e) => {
                error!(table = %key, error = %e, "failed to save table");
                Err(e)
            }
        }
    }

    fn write_table(&self, frame: &DataFrame, key: &TableKey) -> Result<(), StoreError> {
        let table = key.table_name();
        let encoded = schema::encode_columns(frame)?;
        let specs: Vec<ColumnSpec> = encoded.iter().map(|c| c.spec.clone()).collect();
        let schema_json = serde_json::to_string(&specs).map_err(|e| StoreError::Catalog {
            table: table.clone(),
            reason: e.to_string(),
        })?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT dataset, source, \"partition\" FROM {CATALOG} WHERE table_name = ?1"
                ),
                params![table],
                catalog_key,
            )
            .optional()?;
        if let Some(existing) = existing.filter(|k| k != key) {
            return Err(StoreError::NameCollision {
                table,
                key: key.clone(),
                existing,
            });
        }

        let quoted = quote_ident(&table);
        let column_defs = specs
            .iter()
            .enumerate()
            .map(|(idx, s)| format!("{} {}", physical_column(idx), s.ty.storage().sql_type()))
            .collect::<Vec<_>>()
            .join(", ");
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {quoted}; CREATE TABLE {quoted} ({column_defs});"
        ))?;

        {
            let placeholders = vec!["?"; encoded.len()].join(", ");
            let mut insert =
                tx.prepare(&format!("INSERT INTO {quoted} VALUES ({placeholders})"))?;
            for row in 0..frame.height() {
                insert.execute(params_from_iter(encoded.iter().map(|c| &c.values[row])))?;
            }
        }

        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO {CATALOG}
                    (table_name, dataset, source, \"partition\", row_count, schema_json, saved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                table,
                key.dataset,
                key.source,
                key.partition,
                frame.height() as i64,
                schema_json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Load one partition. A key that was never saved yields an empty frame.
    pub fn load(&self, key: &TableKey, options: &LoadOptions) -> Result<DataFrame, StoreError> {
        let conn = self.lock();
        let Some(stored) = lookup(&conn, key)? else {
            debug!(table = %key, "load of absent table");
            return Ok(DataFrame::empty());
        };
        let sql = select_sql(&stored.columns, std::slice::from_ref(&stored), options);
        query_frame(&conn, &sql, &stored.columns)
    }

    /// Row-wise union of the requested partitions that exist, as one query.
    ///
    /// Absent partitions are skipped. Columns missing from some partitions
    /// come back as nulls for those rows; a column stored with different
    /// types in two partitions is a [`StoreError::Catalog`] error.
    pub fn load_multi_partition<S: AsRef<str>>(
        &self,
        dataset: &str,
        source: &str,
        partitions: &[S],
        options: &LoadOptions,
    ) -> Result<DataFrame, StoreError> {
        let conn = self.lock();
        let mut seen = HashSet::new();
        let mut tables = Vec::new();
        for partition in partitions {
            let partition = partition.as_ref();
            if !seen.insert(partition) {
                continue;
            }
            let key = TableKey::new(dataset, source, partition);
            match lookup(&conn, &key)? {
                Some(stored) => tables.push(stored),
                None => debug!(table = %key, "partition absent, skipping"),
            }
        }

        if tables.is_empty() {
            return Ok(DataFrame::empty());
        }

        let columns = union_columns(&tables)?;
        let sql = select_sql(&columns, &tables, options);
        debug!(
            dataset,
            source,
            requested = partitions.len(),
            found = tables.len(),
            "multi-partition load"
        );
        query_frame(&conn, &sql, &columns)
    }

    /// Whether a non-empty table is stored under `key`. Never fails.
    pub fn has_data(&self, key: &TableKey) -> bool {
        let conn = self.lock();
        let found = conn
            .query_row(
                &format!(
                    "SELECT row_count FROM {CATALOG}
                     WHERE dataset = ?1 AND source = ?2 AND \"partition\" = ?3"
                ),
                params![key.dataset, key.source, key.partition],
                |row| row.get::<_, i64>(0),
            )
            .optional();
        match found {
            Ok(rows) => rows.is_some_and(|n| n > 0),
            Err(e) => {
                warn!(table = %key, error = %e, "catalog lookup failed");
                false
            }
        }
    }

    /// Write the table for `key` to `dir/{stem}.{compression}.parquet`.
    pub fn export_columnar(
        &self,
        key: &TableKey,
        dir: impl AsRef<Path>,
        compression: Compression,
    ) -> Result<PathBuf, StoreError> {
        let frame = {
            let conn = self.lock();
            let stored =
                lookup(&conn, key)?.ok_or_else(|| StoreError::TableNotFound(key.clone()))?;
            let sql = select_sql(
                &stored.columns,
                std::slice::from_ref(&stored),
                &LoadOptions::default(),
            );
            query_frame(&conn, &sql, &stored.columns)?
        };

        let path = export::export_path(dir.as_ref(), &key.stem(), compression);
        export::write_parquet(&frame, &path, compression)?;
        info!(table = %key, path = %path.display(), %compression, "exported table");
        Ok(path)
    }

    /// Every stored table, ordered by key.
    pub fn list_tables(&self) -> Result<Vec<TableInfo>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT dataset, source, \"partition\", table_name, row_count, saved_at
             FROM {CATALOG} ORDER BY dataset, source, \"partition\""
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    catalog_key(row)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(key, table_name, row_count, saved_at)| {
                let saved_at = DateTime::parse_from_rfc3339(&saved_at)
                    .map_err(|e| StoreError::Catalog {
                        table: table_name.clone(),
                        reason: format!("bad saved_at '{saved_at}': {e}"),
                    })?
                    .with_timezone(&Utc);
                Ok(TableInfo {
                    key,
                    table_name,
                    row_count: row_count.max(0) as u64,
                    saved_at,
                })
            })
            .collect()
    }

    /// Partitions saved for one dataset and source, sorted.
    pub fn partitions(&self, dataset: &str, source: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT \"partition\" FROM {CATALOG}
             WHERE dataset = ?1 AND source = ?2 ORDER BY \"partition\""
        ))?;
        let partitions = stmt
            .query_map(params![dataset, source], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(partitions)
    }

    /// Drop the table for `key`. Returns whether anything was removed.
    pub fn delete(&self, key: &TableKey) -> Result<bool, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let Some(stored) = lookup(&tx, key)? else {
            return Ok(false);
        };
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {};",
            quote_ident(&stored.table_name)
        ))?;
        tx.execute(
            &format!("DELETE FROM {CATALOG} WHERE table_name = ?1"),
            params![stored.table_name],
        )?;
        tx.commit()?;
        info!(table = %key, "deleted table");
        Ok(true)
    }
}

fn catalog_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<TableKey> {
    Ok(TableKey::new(
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, String>(2)?,
    ))
}

fn lookup(conn: &Connection, key: &TableKey) -> Result<Option<StoredTable>, StoreError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT table_name, schema_json FROM {CATALOG}
                 WHERE dataset = ?1 AND source = ?2 AND \"partition\" = ?3"
            ),
            params![key.dataset, key.source, key.partition],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    let Some((table_name, schema_json)) = row else {
        return Ok(None);
    };
    let columns = serde_json::from_str(&schema_json).map_err(|e| StoreError::Catalog {
        table: table_name.clone(),
        reason: e.to_string(),
    })?;
    Ok(Some(StoredTable {
        table_name,
        columns,
    }))
}

fn union_columns(tables: &[StoredTable]) -> Result<Vec<ColumnSpec>, StoreError> {
    let mut columns: Vec<ColumnSpec> = Vec::new();
    for table in tables {
        for spec in &table.columns {
            match columns.iter().find(|c| c.name == spec.name) {
                Some(first) if first.ty != spec.ty => {
                    return Err(StoreError::Catalog {
                        table: table.table_name.clone(),
                        reason: format!(
                            "column '{}' is {:?} here but {:?} in an earlier partition",
                            spec.name, spec.ty, first.ty
                        ),
                    });
                }
                Some(_) => {}
                None => columns.push(spec.clone()),
            }
        }
    }
    Ok(columns)
}

/// `SELECT * FROM (SELECT c0 AS "a", .. UNION ALL SELECT ..) WHERE (filter) LIMIT n`
///
/// Every branch yields `columns` in order, aliased to their real names, so
/// the filter is written against real names. Where two names differ only in
/// case the filter resolves to the first of them.
fn select_sql(columns: &[ColumnSpec], tables: &[StoredTable], options: &LoadOptions) -> String {
    let branches = tables
        .iter()
        .map(|table| {
            let cols = columns
                .iter()
                .map(|c| {
                    let alias = quote_ident(&c.name);
                    match table.columns.iter().position(|tc| tc.name == c.name) {
                        Some(idx) => format!("{} AS {alias}", physical_column(idx)),
                        None => format!("NULL AS {alias}"),
                    }
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("SELECT {cols} FROM {}", quote_ident(&table.table_name))
        })
        .collect::<Vec<_>>()
        .join(" UNION ALL ");

    let mut sql = format!("SELECT * FROM ({branches})");
    if let Some(filter) = options.filter.as_deref().filter(|f| !f.trim().is_empty()) {
        sql.push_str(&format!(" WHERE ({filter})"));
    }
    if let Some(limit) = options.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    sql
}

fn query_frame(
    conn: &Connection,
    sql: &str,
    columns: &[ColumnSpec],
) -> Result<DataFrame, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut buffers: Vec<ColumnBuffer> = columns
        .iter()
        .map(|c| ColumnBuffer::for_type(&c.ty))
        .collect();

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        for (idx, buffer) in buffers.iter_mut().enumerate() {
            buffer.push(row, idx)?;
        }
    }

    let columns = buffers
        .into_iter()
        .zip(columns)
        .map(|(buffer, spec)| buffer.finish(spec))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DataFrame::new(columns)?)
}
