//! SQLite-backed document store.
//!
//! One JSON document per row: `(id TEXT PRIMARY KEY, body TEXT)`. The pending
//! predicate, exclusions and limit all run in SQL; excluded ids live in a temp
//! table that is topped up with only the ids added since the previous query.
//! Updates replace each field, merging in Rust inside one transaction per
//! bulk call. Every statement runs on the blocking pool.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value;

use super::{BulkWriteReport, DocumentStore, UpdateOp, WorkQuery, WriteError};
use crate::domain::WorkItem;
use crate::error::{BatchforgeError, Result};

const EXCLUDED: &str = "temp.batchforge_excluded";

/// Document store over a single SQLite table.
///
/// `rusqlite::Connection` is not `Sync`, so it lives behind a mutex that is
/// only taken on the blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
    /// Ids currently in the exclusion table; `None` when unknown
    excluded: Mutex<Option<BTreeSet<String>>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("table", &self.table).finish()
    }
}

/// What a pending-documents statement returns
enum Selection {
    Rows { limit: Option<usize> },
    Count,
}

/// Exclusion table changes needed before a query
struct ExclusionDelta {
    reset: bool,
    added: Vec<String>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path, table: &str) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?, table)
    }

    pub fn in_memory(table: &str) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, table)
    }

    fn init(conn: Connection, table: &str) -> Result<Self> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(BatchforgeError::Config(format!("invalid table name: {:?}", table)));
        }

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL
            );
            CREATE TEMP TABLE IF NOT EXISTS batchforge_excluded (id TEXT PRIMARY KEY);"
        ))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_string(),
            excluded: Mutex::new(Some(BTreeSet::new())),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        lock(&self.conn)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut lock(&conn)))
            .await
            .map_err(|e| BatchforgeError::Storage(format!("sqlite task failed: {}", e)))?
    }

    /// Insert or replace a document.
    pub fn insert(&self, id: &str, doc: &Value) -> Result<()> {
        let body = serde_json::to_string(doc)?;
        self.conn().execute(
            &format!("INSERT OR REPLACE INTO {} (id, body) VALUES (?1, ?2)", self.table),
            params![id, body],
        )?;
        Ok(())
    }

    /// Fetch a document by id.
    pub fn get(&self, id: &str) -> Result<Option<Value>> {
        let body = self
            .conn()
            .query_row(&format!("SELECT body FROM {} WHERE id = ?1", self.table), [id], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    /// Work out which ids to add to the exclusion table, assuming the
    /// caller applies the delta.
    fn exclusion_delta(&self, wanted: &BTreeSet<String>) -> ExclusionDelta {
        let mut excluded = self.excluded.lock().unwrap_or_else(|p| p.into_inner());
        let (reset, loaded) = match excluded.take() {
            Some(loaded) if loaded.is_subset(wanted) => (false, loaded),
            _ => (true, BTreeSet::new()),
        };
        let added: Vec<String> = wanted.difference(&loaded).cloned().collect();
        let mut loaded = loaded;
        loaded.extend(added.iter().cloned());
        *excluded = Some(loaded);
        ExclusionDelta { reset, added }
    }

    fn forget_exclusions(&self) {
        *self.excluded.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Run a pending-documents statement with the exclusion table synced.
    async fn query_pending<T, F>(
        &self,
        query: &WorkQuery,
        selection: Selection,
        read: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Statement<'_>, Vec<SqlValue>) -> Result<T> + Send + 'static,
    {
        let (predicate, mut args) = pending_predicate(query);
        let sql = match selection {
            Selection::Count => format!("SELECT COUNT(*) FROM {} WHERE {}", self.table, predicate),
            Selection::Rows { limit } => {
                let mut sql = format!("SELECT id, body FROM {} WHERE {} ORDER BY id", self.table, predicate);
                if let Some(limit) = limit {
                    args.push(SqlValue::Integer(limit as i64));
                    sql.push_str(&format!(" LIMIT ?{}", args.len()));
                }
                sql
            }
        };

        let delta = self.exclusion_delta(&query.exclude_ids);
        let result = self
            .blocking(move |conn| {
                let tx = conn.transaction()?;
                if delta.reset {
                    tx.execute(&format!("DELETE FROM {}", EXCLUDED), [])?;
                }
                {
                    let mut insert = tx.prepare(&format!("INSERT OR IGNORE INTO {} (id) VALUES (?1)", EXCLUDED))?;
                    for id in &delta.added {
                        insert.execute([id])?;
                    }
                }
                let out = {
                    let mut stmt = tx.prepare(&sql)?;
                    read(&mut stmt, args)?
                };
                tx.commit()?;
                Ok(out)
            })
            .await;

        if result.is_err() {
            self.forget_exclusions();
        }
        result
    }

    /// Set every field of `op` on its document. Returns (matched, modified).
    fn apply(conn: &Connection, table: &str, op: &UpdateOp) -> Result<(u64, u64)> {
        let body: Option<String> = conn
            .query_row(&format!("SELECT body FROM {} WHERE id = ?1", table), [&op.id], |row| row.get(0))
            .optional()?;
        let Some(body) = body else {
            return Ok((0, 0));
        };

        let mut doc: Value = serde_json::from_str(&body)?;
        let Value::Object(fields) = &mut doc else {
            return Err(BatchforgeError::Storage(format!("document {} is not an object", op.id)));
        };

        let mut changed = false;
        for (key, value) in &op.set {
            if fields.get(key) != Some(value) {
                fields.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        if !changed {
            return Ok((1, 0));
        }

        conn.execute(
            &format!("UPDATE {} SET body = ?1 WHERE id = ?2", table),
            params![serde_json::to_string(&doc)?, op.id],
        )?;
        Ok((1, 1))
    }
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|p| p.into_inner())
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', ""))
}

/// SQL for "the value at path parameter `?n` is empty": absent, null, blank
/// text, `[]` or `{}`.
fn empty_at(n: usize) -> String {
    format!(
        "(json_type(body, ?{n}) IS NULL OR json_type(body, ?{n}) = 'null' \
         OR (json_type(body, ?{n}) = 'text' AND trim(json_extract(body, ?{n}), ' ' || char(9, 10, 11, 12, 13)) = '') \
         OR (json_type(body, ?{n}) = 'array' AND json_array_length(body, ?{n}) = 0) \
         OR (json_type(body, ?{n}) = 'object' AND json_extract(body, ?{n}) = '{{}}'))"
    )
}

/// WHERE clause and its parameters for [`WorkQuery`]'s pending rule.
fn pending_predicate(query: &WorkQuery) -> (String, Vec<SqlValue>) {
    let mut args = Vec::new();
    let mut clauses = vec!["json_valid(body)".to_string()];

    for field in &query.required_fields {
        args.push(SqlValue::Text(json_path(field)));
        clauses.push(format!("NOT {}", empty_at(args.len())));
    }

    if !query.target_fields.is_empty() {
        let mut any_empty = Vec::new();
        for field in &query.target_fields {
            args.push(SqlValue::Text(json_path(field)));
            any_empty.push(empty_at(args.len()));
        }
        clauses.push(format!("({})", any_empty.join(" OR ")));
    }

    if !query.exclude_ids.is_empty() {
        clauses.push(format!("id NOT IN (SELECT id FROM {})", EXCLUDED));
    }

    (clauses.join(" AND "), args)
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn find_pending(&self, query: &WorkQuery) -> Result<Vec<WorkItem>> {
        let rows: Vec<(String, String)> = self
            .query_pending(query, Selection::Rows { limit: query.limit }, |stmt, args| {
                let rows = stmt.query_map(params_from_iter(args), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for (id, body) in rows {
            match serde_json::from_str(&body) {
                Ok(doc) => items.push(WorkItem::new(id, doc)),
                Err(e) => log::warn!("Skipping document {} with unparseable body: {}", id, e),
            }
        }
        Ok(items)
    }

    async fn count_pending(&self, query: &WorkQuery) -> Result<u64> {
        self.query_pending(query, Selection::Count, |stmt, args| {
            let n: i64 = stmt.query_row(params_from_iter(args), |row| row.get(0))?;
            Ok(n as u64)
        })
        .await
    }

    async fn bulk_update(&self, ops: &[UpdateOp]) -> Result<BulkWriteReport> {
        let ops = ops.to_vec();
        let table = self.table.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let mut report = BulkWriteReport::default();

            for op in &ops {
                match Self::apply(&tx, &table, op) {
                    Ok((matched, modified)) => {
                        report.matched += matched;
                        report.modified += modified;
                    }
                    Err(e) => report.errors.push(WriteError {
                        id: op.id.clone(),
                        message: e.to_string(),
                    }),
                }
            }

            tx.commit()?;
            Ok(report)
        })
        .await
    }

    async fn update_one(&self, op: &UpdateOp) -> Result<u64> {
        let op = op.clone();
        let table = self.table.clone();
        self.blocking(move |conn| Self::apply(conn, &table, &op).map(|(matched, _)| matched))
            .await
    }
}
