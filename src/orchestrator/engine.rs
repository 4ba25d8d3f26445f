//! The driving loop.
//!
//! Each cycle selects a slice of pending work, spawns one task per item,
//! waits for the whole slice, then writes what is due. Items run through
//! `RetryingClient -> ResponseValidator`; the outcome comes back to this task,
//! which alone touches the `BatchWriter` buffer.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::EngineConfig;
use super::state::EnginePhase;
use crate::checkpoint::CheckpointStore;
use crate::domain::{Collaborator, FailureReason, ItemOutcome, ValidationError, WorkItem};
use crate::error::{BatchforgeError, Result};
use crate::llm::ApiClient;
use crate::metrics::{Metrics, RunSummary};
use crate::resilience::{CircuitBreaker, RateLimiter, RetryingClient};
use crate::shutdown::ShutdownController;
use crate::storage::{BatchWriter, DocumentStore, WorkQuery};

/// Attempts at a selection query before the run is abandoned
const SELECT_ATTEMPTS: u32 = 3;

type SliceTasks = JoinSet<(String, ItemOutcome)>;

/// Batch-processing engine for one content type.
pub struct Orchestrator<S, C, H>
where
    S: DocumentStore + 'static,
    C: ApiClient + 'static,
    H: Collaborator + 'static,
{
    config: EngineConfig,
    store: Arc<S>,
    client: Arc<RetryingClient<C>>,
    collaborator: Arc<H>,
    checkpoint: Arc<CheckpointStore>,
    shutdown: ShutdownController,
    query: WorkQuery,
    metrics: Arc<Metrics>,
    phase: EnginePhase,
}

impl<S, C, H> Orchestrator<S, C, H>
where
    S: DocumentStore + 'static,
    C: ApiClient + 'static,
    H: Collaborator + 'static,
{
    /// Build an engine; the rate limiter, circuit breaker and retry policy
    /// come from `config`.
    pub fn new(
        config: EngineConfig,
        store: Arc<S>,
        api: Arc<C>,
        collaborator: Arc<H>,
        checkpoint: Arc<CheckpointStore>,
        shutdown: ShutdownController,
        query: WorkQuery,
    ) -> Result<Self> {
        config.validate().map_err(BatchforgeError::Config)?;

        let limiter = Arc::new(RateLimiter::new(config.rate_limit_config()));
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker_config()));
        let client = Arc::new(RetryingClient::new(api, limiter, breaker, config.retry_policy()));

        Ok(Self {
            config,
            store,
            client,
            collaborator,
            checkpoint,
            shutdown,
            query,
            metrics: Arc::new(Metrics::new()),
            phase: EnginePhase::Selecting,
        })
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    pub fn client(&self) -> &RetryingClient<C> {
        &self.client
    }

    fn enter(&mut self, next: EnginePhase) {
        if self.phase == next {
            return;
        }
        if !self.phase.can_transition_to(next) {
            log::warn!("Unexpected phase transition {} -> {}", self.phase, next);
        }
        log::debug!("Engine phase {} -> {}", self.phase, next);
        self.phase = next;
    }

    /// Process the backlog until it is empty, `max_items` is reached or
    /// shutdown is requested.
    ///
    /// Returns `Err` only when the store cannot be queried; buffered results
    /// and the checkpoint are still written first.
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.metrics = Arc::new(Metrics::new());
        self.phase = EnginePhase::Selecting;

        let mut writer = BatchWriter::new(
            Arc::clone(&self.store),
            self.config.flush_threshold,
            self.config.write_chunk_size,
        );
        // Grows by each slice so nothing is selected twice in one run
        let mut selection = self.base_query();
        let mut background: Vec<JoinHandle<()>> = Vec::new();
        let mut fatal: Option<BatchforgeError> = None;

        match self.store.count_pending(&selection).await {
            Ok(n) => {
                let expected = self.config.max_items.map_or(n, |max| n.min(max));
                self.metrics.set_expected(expected);
                log::info!("Starting run: {} pending items", expected);
            }
            Err(e) => {
                log::error!("Cannot query the store: {}", e);
                fatal = Some(e);
            }
        }

        while fatal.is_none() && !self.shutdown.is_triggered() {
            self.enter(EnginePhase::Selecting);
            let limit = match self.remaining_quota() {
                Some(0) => {
                    log::info!("Reached max_items, stopping");
                    break;
                }
                Some(n) => n.min(self.config.batch_size),
                None => self.config.batch_size,
            };

            selection.limit = Some(limit);
            let slice = match self.select(&selection).await {
                Ok(slice) => slice,
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            };
            if slice.is_empty() {
                log::info!("No more pending work");
                break;
            }
            selection.exclude_ids.extend(slice.iter().map(|item| item.id.clone()));
            self.metrics.add_selected(slice.len() as u64);

            self.enter(EnginePhase::Dispatching);
            log::debug!("Dispatching {} items", slice.len());
            let (tasks, pending) = self.dispatch(slice);

            self.enter(EnginePhase::Collecting);
            let checkpoint_due = self.collect(tasks, pending, &mut writer).await;

            self.enter(EnginePhase::Flushing);
            if checkpoint_due || writer.pending() >= self.config.flush_threshold {
                self.flush_writer(&mut writer).await;
            }
            if checkpoint_due {
                background.retain(|handle| !handle.is_finished());
                background.push(self.checkpoint.persist_in_background());
            }
            log::info!("{}", self.metrics.progress_line());

            let delay = self.config.batch_delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.triggered() => {}
                }
            }
        }

        self.enter(EnginePhase::Draining);
        self.flush_writer(&mut writer).await;
        for handle in background {
            if let Err(e) = handle.await {
                log::warn!("Checkpoint writer task failed: {}", e);
            }
        }
        let checkpoint_flushed = match self.checkpoint.persist().await {
            Ok(()) => true,
            Err(e) => {
                log::error!("Final checkpoint write failed, completed work may be reprocessed: {}", e);
                false
            }
        };
        self.enter(EnginePhase::Stopped);

        let summary = RunSummary::from_snapshot(
            &self.metrics.snapshot(),
            self.client.throttle_events(),
            self.shutdown.is_triggered(),
            checkpoint_flushed,
        );
        log::info!("Run finished: {}", summary);

        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn base_query(&self) -> WorkQuery {
        self.query.clone().excluding(self.checkpoint.processed_ids())
    }

    fn remaining_quota(&self) -> Option<usize> {
        self.config.max_items.map(|max| {
            let selected = self.metrics.snapshot().selected;
            max.saturating_sub(selected) as usize
        })
    }

    /// Next slice of pending items. `query` excludes everything processed
    /// before the run and everything attempted in it.
    async fn select(&self, query: &WorkQuery) -> Result<Vec<WorkItem>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.find_pending(query).await {
                Ok(items) => {
                    return Ok(items
                        .into_iter()
                        .filter(|item| !query.exclude_ids.contains(&item.id) && !self.checkpoint.is_processed(&item.id))
                        .collect());
                }
                Err(e) if attempt < SELECT_ATTEMPTS && !self.shutdown.is_triggered() => {
                    let delay = self.config.retry_base_delay() * attempt;
                    log::warn!("Selection failed (attempt {}), retrying in {:?}: {}", attempt, delay, e);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.triggered() => return Ok(Vec::new()),
                    }
                }
                Err(e) => {
                    log::error!("Selection failed after {} attempts: {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }

    fn dispatch(&self, slice: Vec<WorkItem>) -> (SliceTasks, HashSet<String>) {
        let mut tasks = JoinSet::new();
        let mut pending = HashSet::with_capacity(slice.len());

        for item in slice {
            pending.insert(item.id.clone());
            let client = Arc::clone(&self.client);
            let collaborator = Arc::clone(&self.collaborator);
            let cancel = self.shutdown.token().clone();
            let validation_retries = self.config.validation_retries;

            tasks.spawn(async move {
                let id = item.id.clone();
                let outcome = AssertUnwindSafe(process_item(client, collaborator, item, cancel, validation_retries))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| ItemOutcome::Failed(FailureReason::Panicked(panic_message(&*panic))));
                (id, outcome)
            });
        }

        (tasks, pending)
    }

    /// Wait for the slice. Returns true if a checkpoint write came due.
    ///
    /// After shutdown, in-flight items get the grace period and are then
    /// aborted; aborted items stay unmarked.
    async fn collect(&self, mut tasks: SliceTasks, mut pending: HashSet<String>, writer: &mut BatchWriter<S>) -> bool {
        let grace = self.config.shutdown_grace();
        let mut deadline: Option<Instant> = None;
        let mut checkpoint_due = false;

        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        log::warn!("Shutdown grace expired, abandoning {} in-flight items", tasks.len());
                        tasks.abort_all();
                        while let Some(joined) = tasks.join_next().await {
                            if let Ok((id, outcome)) = joined {
                                pending.remove(&id);
                                checkpoint_due |= self.record_outcome(&id, outcome, writer);
                            }
                        }
                        break;
                    }
                },
                None => tokio::select! {
                    next = tasks.join_next() => next,
                    _ = self.shutdown.triggered() => {
                        log::info!("Shutdown requested, waiting up to {:?} for {} in-flight items", grace, tasks.len());
                        deadline = Some(Instant::now() + grace);
                        continue;
                    }
                },
            };

            match next {
                None => break,
                Some(Ok((id, outcome))) => {
                    pending.remove(&id);
                    checkpoint_due |= self.record_outcome(&id, outcome, writer);
                }
                Some(Err(e)) => log::error!("Item task ended abnormally: {}", e),
            }
        }

        if !pending.is_empty() {
            log::warn!("{} items left unfinished; they will be selected again next run", pending.len());
            self.metrics.record_cancelled(pending.len() as u64);
        }
        checkpoint_due
    }

    fn record_outcome(&self, id: &str, outcome: ItemOutcome, writer: &mut BatchWriter<S>) -> bool {
        match outcome {
            ItemOutcome::Succeeded(result) => {
                self.metrics.record_success();
                writer.push(result);
                self.checkpoint.mark_processed(id, true)
            }
            ItemOutcome::Failed(reason) => {
                log::warn!("Item {} failed: {}", id, reason);
                self.metrics.record_failure();
                self.checkpoint.mark_processed(id, false)
            }
            ItemOutcome::Cancelled => {
                log::debug!("Item {} cancelled before completion", id);
                self.metrics.record_cancelled(1);
                false
            }
        }
    }

    async fn flush_writer(&self, writer: &mut BatchWriter<S>) {
        let report = writer.flush().await;
        if report.attempted == 0 {
            return;
        }

        self.metrics.record_persisted(report.persisted as u64);
        if !report.failed_ids.is_empty() {
            for id in &report.failed_ids {
                self.checkpoint.record_persist_failure(id);
            }
            self.metrics.record_persist_failures(report.failed_ids.len() as u64);
            log::error!(
                "{} of {} results could not be written and will be retried next run",
                report.failed_ids.len(),
                report.attempted
            );
        }
    }
}

/// Run one item to a terminal outcome (or `Cancelled`).
async fn process_item<C, H>(
    client: Arc<RetryingClient<C>>,
    collaborator: Arc<H>,
    item: WorkItem,
    cancel: CancellationToken,
    validation_retries: u32,
) -> ItemOutcome
where
    C: ApiClient,
    H: Collaborator,
{
    let mut validation_failures = 0;

    loop {
        let payload = match collaborator.build_request(&item) {
            Ok(payload) => payload,
            Err(e) => return ItemOutcome::Failed(e.into()),
        };

        let reply = match client.send(&payload, &cancel).await {
            Ok(reply) => reply,
            Err(e) => return e.into(),
        };

        match collaborator.validate(&reply, &item) {
            Ok(result) if result.work_item_id != item.id => {
                return ItemOutcome::Failed(
                    ValidationError::ForeignResult {
                        expected: item.id.clone(),
                        actual: result.work_item_id,
                    }
                    .into(),
                );
            }
            Ok(result) => return ItemOutcome::Succeeded(result),
            Err(e) if validation_failures < validation_retries && !cancel.is_cancelled() => {
                validation_failures += 1;
                log::warn!(
                    "Validation failed for {} ({}), retrying ({}/{})",
                    item.id,
                    e,
                    validation_failures,
                    validation_retries
                );
            }
            Err(e) => {
                log::debug!("Validation failed for {}: {}", item.id, e);
                return ItemOutcome::Failed(e.into());
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
