//! Storage layer: the backlog the engine reads from and writes results to.
//!
//! The engine only depends on [`DocumentStore`]: find documents that have
//! their source fields but lack their target fields, and apply an unordered
//! batch of per-document updates. [`BatchWriter`] sits in front of it and
//! degrades from one bulk call to chunks to single writes.

mod memory;
mod sqlite;
mod writer;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::domain::{ItemResult, WorkItem};
use crate::error::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use writer::{BatchWriter, FlushReport};

/// Selection predicate for pending work.
///
/// A document is pending when every required field is present and non-empty
/// and at least one target field is absent or empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkQuery {
    pub required_fields: Vec<String>,
    pub target_fields: Vec<String>,
    pub exclude_ids: BTreeSet<String>,
    pub limit: Option<usize>,
}

impl WorkQuery {
    pub fn new(required_fields: Vec<String>, target_fields: Vec<String>) -> Self {
        Self {
            required_fields,
            target_fields,
            exclude_ids: BTreeSet::new(),
            limit: None,
        }
    }

    pub fn excluding(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.exclude_ids.extend(ids);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether the document `doc` with id `id` is pending under this query.
    pub fn matches(&self, id: &str, doc: &Value) -> bool {
        if self.exclude_ids.contains(id) {
            return false;
        }
        let required_ok = self.required_fields.iter().all(|f| !is_empty(doc.get(f)));
        let target_missing =
            self.target_fields.is_empty() || self.target_fields.iter().any(|f| is_empty(doc.get(f)));
        required_ok && target_missing
    }
}

/// Absent, `null`, `""`, `[]` and `{}` all count as empty.
pub fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

/// Set `set` on the document with id `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOp {
    pub id: String,
    pub set: Map<String, Value>,
}

impl From<&ItemResult> for UpdateOp {
    fn from(result: &ItemResult) -> Self {
        Self {
            id: result.work_item_id.clone(),
            set: result.update_fields.clone(),
        }
    }
}

/// One item that failed inside an otherwise successful bulk call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteError {
    pub id: String,
    pub message: String,
}

/// What a bulk call reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteReport {
    /// Documents the filter found
    pub matched: u64,
    /// Documents actually changed
    pub modified: u64,
    pub errors: Vec<WriteError>,
}

/// Backing document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Pending documents in a stable order, honouring `query.limit`.
    async fn find_pending(&self, query: &WorkQuery) -> Result<Vec<WorkItem>>;

    /// Number of pending documents, ignoring `query.limit`.
    async fn count_pending(&self, query: &WorkQuery) -> Result<u64>;

    /// Apply every op independently. `Err` means the call itself failed;
    /// per-item failures are reported in [`BulkWriteReport::errors`].
    async fn bulk_update(&self, ops: &[UpdateOp]) -> Result<BulkWriteReport>;

    /// Apply one op, returning the number of documents matched.
    async fn update_one(&self, op: &UpdateOp) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query() -> WorkQuery {
        WorkQuery::new(vec!["title".into()], vec!["summary".into(), "tags".into()])
    }

    #[test]
    fn test_matches_requires_source_fields() {
        assert!(query().matches("a", &json!({"title": "Dune"})));
        assert!(!query().matches("a", &json!({"title": ""})));
        assert!(!query().matches("a", &json!({"author": "Herbert"})));
    }

    #[test]
    fn test_matches_any_target_missing() {
        assert!(query().matches("a", &json!({"title": "Dune", "summary": "s"})));
        assert!(query().matches("a", &json!({"title": "Dune", "summary": "s", "tags": []})));
        assert!(!query().matches("a", &json!({"title": "Dune", "summary": "s", "tags": ["x"]})));
    }

    #[test]
    fn test_matches_honours_exclusions() {
        let q = query().excluding(vec!["a".to_string()]);
        assert!(!q.matches("a", &json!({"title": "Dune"})));
        assert!(q.matches("b", &json!({"title": "Dune"})));
    }

    #[test]
    fn test_is_empty() {
        assert!(is_empty(None));
        assert!(is_empty(Some(&json!(null))));
        assert!(is_empty(Some(&json!("  "))));
        assert!(is_empty(Some(&json!({}))));
        assert!(!is_empty(Some(&json!(0))));
        assert!(!is_empty(Some(&json!(false))));
    }

    #[test]
    fn test_update_op_from_result() {
        let result = ItemResult::new("a", Map::new()).with_field("summary", "s");
        let op = UpdateOp::from(&result);
        assert_eq!(op.id, "a");
        assert_eq!(op.set.get("summary"), Some(&json!("s")));
    }
}
