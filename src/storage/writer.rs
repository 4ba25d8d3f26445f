//! Buffered result writer with a degrading fallback chain.

use std::sync::Arc;

use super::{DocumentStore, UpdateOp};
use crate::domain::ItemResult;

/// Outcome of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub attempted: usize,
    pub persisted: usize,
    /// Ids whose write errored in every strategy tried
    pub failed_ids: Vec<String>,
}

impl FlushReport {
    fn merge(&mut self, other: FlushReport) {
        self.attempted += other.attempted;
        self.persisted += other.persisted;
        self.failed_ids.extend(other.failed_ids);
    }
}

/// Accumulates results and writes them in bulk.
///
/// The buffer is owned by whoever owns the writer; workers hand results to
/// the orchestrator, which pushes them here. Writes never return an error:
/// a bulk call that fails is retried in chunks, a chunk that fails is
/// retried one item at a time, and whatever still fails is reported.
pub struct BatchWriter<S: DocumentStore> {
    store: Arc<S>,
    buffer: Vec<ItemResult>,
    flush_threshold: usize,
    chunk_size: usize,
}

impl<S: DocumentStore> BatchWriter<S> {
    pub fn new(store: Arc<S>, flush_threshold: usize, chunk_size: usize) -> Self {
        Self {
            store,
            buffer: Vec::new(),
            flush_threshold: flush_threshold.max(1),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Buffer a result. Returns true once the flush threshold is reached.
    pub fn push(&mut self, result: ItemResult) -> bool {
        self.buffer.push(result);
        self.buffer.len() >= self.flush_threshold
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Write everything buffered so far.
    pub async fn flush(&mut self) -> FlushReport {
        if self.buffer.is_empty() {
            return FlushReport::default();
        }
        let batch = std::mem::take(&mut self.buffer);
        self.write(&batch).await
    }

    /// Write `results`, degrading through the fallback chain as needed.
    pub async fn write(&self, results: &[ItemResult]) -> FlushReport {
        if results.is_empty() {
            return FlushReport::default();
        }
        let ops: Vec<UpdateOp> = results.iter().map(UpdateOp::from).collect();

        match self.store.bulk_update(&ops).await {
            Ok(report) => {
                let failed_ids: Vec<String> = report.errors.iter().map(|e| e.id.clone()).collect();
                for err in &report.errors {
                    log::warn!("Write failed for {}: {}", err.id, err.message);
                }
                log_unmatched(ops.len(), report.matched, failed_ids.len());
                log::debug!("Bulk write: {} ops, {} matched, {} modified", ops.len(), report.matched, report.modified);
                FlushReport {
                    attempted: ops.len(),
                    persisted: report.matched as usize,
                    failed_ids,
                }
            }
            Err(e) => {
                log::warn!(
                    "Bulk write of {} results failed, retrying in chunks of {}: {}",
                    ops.len(),
                    self.chunk_size,
                    e
                );
                self.write_chunked(&ops).await
            }
        }
    }

    async fn write_chunked(&self, ops: &[UpdateOp]) -> FlushReport {
        let mut total = FlushReport::default();

        for chunk in ops.chunks(self.chunk_size) {
            let report = match self.store.bulk_update(chunk).await {
                Ok(report) => {
                    for err in &report.errors {
                        log::warn!("Write failed for {}: {}", err.id, err.message);
                    }
                    FlushReport {
                        attempted: chunk.len(),
                        persisted: report.matched as usize,
                        failed_ids: report.errors.into_iter().map(|e| e.id).collect(),
                    }
                }
                Err(e) => {
                    log::warn!("Chunk of {} failed, writing items one at a time: {}", chunk.len(), e);
                    self.write_each(chunk).await
                }
            };
            total.merge(report);
        }

        if total.persisted == 0 {
            log::error!("No results persisted out of {}", ops.len());
        }
        total
    }

    async fn write_each(&self, ops: &[UpdateOp]) -> FlushReport {
        let mut report = FlushReport {
            attempted: ops.len(),
            ..Default::default()
        };

        for op in ops {
            match self.store.update_one(op).await {
                Ok(matched) => report.persisted += matched as usize,
                Err(e) => {
                    log::warn!("Write failed for {}: {}", op.id, e);
                    report.failed_ids.push(op.id.clone());
                }
            }
        }
        report
    }
}

fn log_unmatched(ops: usize, matched: u64, errors: usize) {
    let unmatched = ops.saturating_sub(matched as usize + errors);
    if unmatched > 0 {
        log::warn!("{} results matched no document", unmatched);
    }
}
