//! In-memory document store with failure injection.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use super::{BulkWriteReport, DocumentStore, UpdateOp, WorkQuery, WriteError};
use crate::domain::WorkItem;
use crate::error::{BatchforgeError, Result};

#[derive(Debug, Default)]
struct Faults {
    bulk_always: bool,
    bulk_above: Option<usize>,
    failing_ids: HashSet<String>,
    find_failures: u32,
}

/// Documents ordered by id. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<String, Value>>,
    faults: Mutex<Faults>,
    bulk_calls: AtomicU64,
    single_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(docs: impl IntoIterator<Item = (String, Value)>) -> Self {
        let store = Self::new();
        store.docs.lock().unwrap_or_else(|p| p.into_inner()).extend(docs);
        store
    }

    pub fn insert(&self, id: impl Into<String>, doc: Value) {
        self.docs.lock().unwrap_or_else(|p| p.into_inner()).insert(id.into(), doc);
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.docs.lock().unwrap_or_else(|p| p.into_inner()).get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Every bulk call fails outright.
    pub fn fail_bulk_always(&self) {
        self.faults().bulk_always = true;
    }

    /// Bulk calls with more than `size` ops fail outright.
    pub fn fail_bulk_above(&self, size: usize) {
        self.faults().bulk_above = Some(size);
    }

    /// Writes touching `id` fail, in bulk (as an item error) and singly.
    pub fn fail_writes_for(&self, id: impl Into<String>) {
        self.faults().failing_ids.insert(id.into());
    }

    /// The next `times` selection queries fail.
    pub fn fail_next_finds(&self, times: u32) {
        self.faults().find_failures = times;
    }

    pub fn bulk_calls(&self) -> u64 {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn single_calls(&self) -> u64 {
        self.single_calls.load(Ordering::SeqCst)
    }

    fn apply(docs: &mut BTreeMap<String, Value>, op: &UpdateOp) -> (u64, u64) {
        let Some(Value::Object(doc)) = docs.get_mut(&op.id) else {
            return (0, 0);
        };
        let mut changed = false;
        for (key, value) in &op.set {
            if doc.get(key) != Some(value) {
                doc.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        (1, u64::from(changed))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_pending(&self, query: &WorkQuery) -> Result<Vec<WorkItem>> {
        {
            let mut faults = self.faults();
            if faults.find_failures > 0 {
                faults.find_failures -= 1;
                return Err(BatchforgeError::Storage("simulated selection failure".to_string()));
            }
        }

        let docs = self.docs.lock().unwrap_or_else(|p| p.into_inner());
        let pending = docs
            .iter()
            .filter(|(id, doc)| query.matches(id, doc))
            .map(|(id, doc)| WorkItem::new(id.clone(), doc.clone()));

        Ok(match query.limit {
            Some(limit) => pending.take(limit).collect(),
            None => pending.collect(),
        })
    }

    async fn count_pending(&self, query: &WorkQuery) -> Result<u64> {
        let docs = self.docs.lock().unwrap_or_else(|p| p.into_inner());
        Ok(docs.iter().filter(|(id, doc)| query.matches(id, doc)).count() as u64)
    }

    async fn bulk_update(&self, ops: &[UpdateOp]) -> Result<BulkWriteReport> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let failing = {
            let faults = self.faults();
            if faults.bulk_always || faults.bulk_above.is_some_and(|max| ops.len() > max) {
                return Err(BatchforgeError::Storage(format!(
                    "simulated bulk failure ({} ops)",
                    ops.len()
                )));
            }
            faults.failing_ids.clone()
        };

        let mut docs = self.docs.lock().unwrap_or_else(|p| p.into_inner());
        let mut report = BulkWriteReport::default();
        for op in ops {
            if failing.contains(&op.id) {
                report.errors.push(WriteError {
                    id: op.id.clone(),
                    message: "simulated write failure".to_string(),
                });
                continue;
            }
            let (matched, modified) = Self::apply(&mut docs, op);
            report.matched += matched;
            report.modified += modified;
        }
        Ok(report)
    }

    async fn update_one(&self, op: &UpdateOp) -> Result<u64> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        if self.faults().failing_ids.contains(&op.id) {
            return Err(BatchforgeError::Storage(format!("simulated write failure for {}", op.id)));
        }
        let mut docs = self.docs.lock().unwrap_or_else(|p| p.into_inner());
        Ok(Self::apply(&mut docs, op).0)
    }
}
