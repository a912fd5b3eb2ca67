//! Pipeline orchestration
//!
//! # Architecture
//! - **Orchestrator**: owns the broker; polls, routes batches to partition
//!   workers, folds their reports into commit cursors, and commits
//! - **Worker**: one task per partition; decodes, classifies and applies
//!   batches in offset order
//! - **CommitCursor**: per-partition record of resolved and committed offsets
//!
//! Offsets are committed only after every earlier message of the partition
//! is applied, dead-lettered or skipped. A partition whose retries run out is
//! halted and paused; other partitions keep flowing.

mod cursor;
mod worker;

pub use cursor::CommitCursor;

use resilience::RetryConfig;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::metrics::PipelineMetrics;
use crate::services::broker::Broker;
use crate::services::cdc::{PartitionId, RawMessage, TableResolver};
use crate::services::dead_letter::DeadLetterSink;
use crate::services::sink::{SinkApplier, SinkStore};
use worker::{PartitionWorker, WorkerReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Polling,
    Decoding,
    Classifying,
    Applying,
    Committing,
    Draining,
    Stopped,
}

/// Shared handle that publishes state transitions
#[derive(Clone)]
pub(crate) struct StateTracker(Arc<watch::Sender<PipelineState>>);

impl StateTracker {
    fn new() -> (Self, watch::Receiver<PipelineState>) {
        let (tx, rx) = watch::channel(PipelineState::Polling);
        (Self(Arc::new(tx)), rx)
    }

    fn set(&self, next: PipelineState) {
        self.0.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = ?*current, to = ?next, "Pipeline state transition");
            *current = next;
            true
        });
    }

    /// Like `set`, but never leaves Draining or Stopped
    pub(crate) fn set_phase(&self, next: PipelineState) {
        self.0.send_if_modified(|current| {
            if matches!(*current, PipelineState::Draining | PipelineState::Stopped)
                || *current == next
            {
                return false;
            }
            debug!(from = ?*current, to = ?next, "Pipeline state transition");
            *current = next;
            true
        });
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub topics: Vec<String>,
    pub poll_timeout: Duration,
    pub poll_max_messages: usize,
    /// Concurrent sink writes across all partitions
    pub max_in_flight: usize,
    /// Batches buffered per partition worker before the partition is paused
    pub worker_queue_depth: usize,
    /// Deadline for a single sink write
    pub write_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            topics: vec!["dbserver1.public.customers".to_string()],
            poll_timeout: Duration::from_millis(100),
            poll_max_messages: 500,
            max_in_flight: 10,
            worker_queue_depth: 4,
            write_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaltedPartition {
    /// Offset of the message that could not be resolved
    pub offset: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub received: u64,
    pub applied: u64,
    pub skipped: u64,
    pub dead_lettered: u64,
    pub retries: u64,
}

/// Result of a pipeline run
#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    /// Last offset acknowledged to the broker per partition
    pub committed: BTreeMap<PartitionId, i64>,
    pub halted: BTreeMap<PartitionId, HaltedPartition>,
    pub stats: PipelineStats,
}

impl PipelineSummary {
    pub fn is_clean(&self) -> bool {
        self.halted.is_empty()
    }
}

struct PartitionHandle {
    sender: mpsc::Sender<Vec<RawMessage>>,
    task: JoinHandle<()>,
    /// Batches waiting for room in the worker queue
    backlog: VecDeque<Vec<RawMessage>>,
    paused: bool,
}

pub struct Orchestrator {
    broker: Box<dyn Broker>,
    applier: SinkApplier,
    dead_letter: Arc<dyn DeadLetterSink>,
    resolver: Arc<TableResolver>,
    config: PipelineConfig,
    metrics: PipelineMetrics,
    apply_permits: Arc<Semaphore>,
    state: StateTracker,
    state_rx: watch::Receiver<PipelineState>,
    partitions: HashMap<PartitionId, PartitionHandle>,
    cursors: BTreeMap<PartitionId, CommitCursor>,
    halted: BTreeMap<PartitionId, HaltedPartition>,
    reports_tx: Option<mpsc::UnboundedSender<WorkerReport>>,
    reports_rx: mpsc::UnboundedReceiver<WorkerReport>,
}

impl Orchestrator {
    pub fn new(
        broker: Box<dyn Broker>,
        store: Arc<dyn SinkStore>,
        dead_letter: Arc<dyn DeadLetterSink>,
        resolver: Arc<TableResolver>,
        config: PipelineConfig,
    ) -> Self {
        let (state, state_rx) = StateTracker::new();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        Self {
            broker,
            applier: SinkApplier::new(store, config.write_timeout),
            dead_letter,
            resolver,
            apply_permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            config,
            metrics: PipelineMetrics::new(),
            state,
            state_rx,
            partitions: HashMap::new(),
            cursors: BTreeMap::new(),
            halted: BTreeMap::new(),
            reports_tx: Some(reports_tx),
            reports_rx,
        }
    }

    /// Watch the pipeline state; stays valid after `run` consumes the orchestrator
    ///
    /// The state is a coarse, pipeline-wide phase. The poll loop and every
    /// partition worker publish into the same channel, so with several
    /// partitions it shows whichever phase was entered last, not the phase of
    /// one consumption cycle. Draining and Stopped are final.
    pub fn state(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Consume until `shutdown` turns true, then drain and stop
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PipelineSummary, AppError> {
        self.broker.subscribe(&self.config.topics).await?;
        info!(topics = ?self.config.topics, "CDC pipeline started");

        let mut poll_failures = 0u32;

        while !*shutdown.borrow() {
            self.state.set(PipelineState::Polling);

            match self
                .broker
                .poll(self.config.poll_timeout, self.config.poll_max_messages)
                .await
            {
                Ok(messages) => {
                    poll_failures = 0;
                    self.dispatch(messages);
                }
                Err(e) => {
                    poll_failures += 1;
                    self.metrics.poll_errors_total.inc();
                    let delay = self.config.retry.backoff_for(poll_failures);
                    warn!(
                        error = %e,
                        consecutive_failures = poll_failures,
                        delay_ms = delay.as_millis() as u64,
                        "Broker poll failed, backing off"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        Ok(()) = shutdown.changed() => {}
                    }
                }
            }

            self.collect_reports().await;
            self.flush_backlogs().await;
            self.commit_pending().await;
        }

        self.drain().await;
        Ok(self.summary())
    }

    /// Queue polled messages per partition, preserving arrival order
    fn dispatch(&mut self, messages: Vec<RawMessage>) {
        if messages.is_empty() {
            return;
        }
        self.metrics.messages_received_total.inc_by(messages.len() as u64);

        let mut batches: BTreeMap<PartitionId, Vec<RawMessage>> = BTreeMap::new();
        for message in messages {
            batches.entry(message.partition_id()).or_default().push(message);
        }

        for (partition, batch) in batches {
            if self.halted.contains_key(&partition) {
                debug!(%partition, count = batch.len(), "Dropping messages for halted partition");
                continue;
            }

            if !self.partitions.contains_key(&partition) {
                let Some(handle) = self.spawn_worker(&partition) else {
                    continue;
                };
                self.partitions.insert(partition.clone(), handle);
            }

            if let Some(handle) = self.partitions.get_mut(&partition) {
                handle.backlog.push_back(batch);
            }
        }
    }

    fn spawn_worker(&self, partition: &PartitionId) -> Option<PartitionHandle> {
        let reports = self.reports_tx.clone()?;
        let (sender, receiver) = mpsc::channel(self.config.worker_queue_depth.max(1));

        let worker = PartitionWorker {
            partition: partition.clone(),
            applier: self.applier.clone(),
            dead_letter: Arc::clone(&self.dead_letter),
            resolver: Arc::clone(&self.resolver),
            retry: self.config.retry.clone(),
            apply_permits: Arc::clone(&self.apply_permits),
            metrics: self.metrics.clone(),
            state: self.state.clone(),
            reports,
        };

        info!(%partition, "Starting partition worker");

        Some(PartitionHandle {
            sender,
            task: tokio::spawn(worker.run(receiver)),
            backlog: VecDeque::new(),
            paused: false,
        })
    }

    /// Hand backlogged batches to workers; pause partitions whose queue is full
    async fn flush_backlogs(&mut self) {
        for (partition, handle) in self.partitions.iter_mut() {
            if self.halted.contains_key(partition) {
                handle.backlog.clear();
                continue;
            }

            while let Some(batch) = handle.backlog.pop_front() {
                match handle.sender.try_send(batch) {
                    Ok(()) => {}
                    Err(TrySendError::Full(batch)) => {
                        handle.backlog.push_front(batch);
                        break;
                    }
                    Err(TrySendError::Closed(_)) => {
                        handle.backlog.clear();
                        break;
                    }
                }
            }

            let backed_up = !handle.backlog.is_empty();
            if backed_up != handle.paused {
                let result = if backed_up {
                    self.broker.pause(partition).await
                } else {
                    self.broker.resume(partition).await
                };

                match result {
                    Ok(()) => handle.paused = backed_up,
                    Err(e) => warn!(%partition, error = %e, "Failed to change partition flow"),
                }
            }
        }
    }

    /// Fold worker reports into cursors, and notice workers that died silently
    async fn collect_reports(&mut self) {
        let finished: Vec<PartitionId> = self
            .partitions
            .iter()
            .filter(|(_, handle)| handle.task.is_finished())
            .map(|(partition, _)| partition.clone())
            .collect();

        while let Ok(report) = self.reports_rx.try_recv() {
            self.handle_report(report).await;
        }

        for partition in finished {
            if !self.halted.contains_key(&partition) {
                self.halt(
                    partition.clone(),
                    self.next_offset(&partition),
                    "partition worker exited unexpectedly".to_string(),
                )
                .await;
            }
        }
    }

    async fn handle_report(&mut self, report: WorkerReport) {
        match report {
            WorkerReport::Progress { partition, offset } => {
                self.cursors.entry(partition).or_default().advance(offset);
            }
            WorkerReport::Halted {
                partition,
                offset,
                reason,
            } => self.halt(partition, offset, reason).await,
        }
    }

    /// First offset not yet resolved, as far as the orchestrator knows
    fn next_offset(&self, partition: &PartitionId) -> i64 {
        self.cursors
            .get(partition)
            .and_then(CommitCursor::resolved)
            .map_or(0, |offset| offset + 1)
    }

    async fn halt(&mut self, partition: PartitionId, offset: i64, reason: String) {
        if self.halted.contains_key(&partition) {
            return;
        }

        error!(
            %partition,
            offset,
            reason = %reason,
            "Halting partition; offsets from here on stay uncommitted"
        );

        if let Some(handle) = self.partitions.get_mut(&partition) {
            handle.backlog.clear();
            if !handle.paused {
                match self.broker.pause(&partition).await {
                    Ok(()) => handle.paused = true,
                    Err(e) => warn!(%partition, error = %e, "Failed to pause halted partition"),
                }
            }
        }

        self.metrics.partitions_halted.inc();
        self.halted.insert(partition, HaltedPartition { offset, reason });
    }

    async fn commit_pending(&mut self) {
        let pending: BTreeMap<PartitionId, i64> = self
            .cursors
            .iter()
            .filter_map(|(partition, cursor)| cursor.pending().map(|o| (partition.clone(), o)))
            .collect();

        if pending.is_empty() {
            return;
        }

        self.state.set(PipelineState::Committing);

        match self.broker.commit(&pending).await {
            Ok(()) => {
                for (partition, offset) in &pending {
                    if let Some(cursor) = self.cursors.get_mut(partition) {
                        cursor.mark_committed(*offset);
                    }
                }
                self.metrics.commits_total.inc();
                debug!(partitions = pending.len(), "Offsets committed");
            }
            Err(e) => {
                self.metrics.commit_errors_total.inc();
                warn!(error = %e, "Offset commit failed, will retry next cycle");
            }
        }
    }

    /// Let workers finish what they hold, commit, and release resources
    async fn drain(&mut self) {
        self.state.set(PipelineState::Draining);
        info!(partitions = self.partitions.len(), "Draining CDC pipeline");

        for (partition, handle) in self.partitions.iter_mut() {
            if self.halted.contains_key(partition) {
                continue;
            }
            while let Some(batch) = handle.backlog.pop_front() {
                if handle.sender.send(batch).await.is_err() {
                    break;
                }
            }
        }

        self.reports_tx = None;
        let partitions = std::mem::take(&mut self.partitions);
        let mut crashed = Vec::new();

        for (partition, handle) in partitions {
            drop(handle.sender);
            if let Err(e) = handle.task.await {
                error!(%partition, error = %e, "Partition worker failed");
                crashed.push((partition, e.to_string()));
            }
        }

        while let Some(report) = self.reports_rx.recv().await {
            self.handle_report(report).await;
        }

        for (partition, reason) in crashed {
            let offset = self.next_offset(&partition);
            self.halt(partition, offset, format!("partition worker failed: {}", reason))
                .await;
        }

        self.state.set(PipelineState::Committing);
        self.commit_pending().await;

        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Failed to close broker");
        }
        if let Err(e) = self.dead_letter.flush().await {
            warn!(error = %e, "Failed to flush dead-letter output");
        }
        self.applier.store().close().await;

        self.state.set(PipelineState::Stopped);
        info!(halted = self.halted.len(), "CDC pipeline stopped");
    }

    fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            committed: self
                .cursors
                .iter()
                .filter_map(|(partition, cursor)| {
                    cursor.committed().map(|offset| (partition.clone(), offset))
                })
                .collect(),
            halted: self.halted.clone(),
            stats: PipelineStats {
                received: self.metrics.messages_received_total.get(),
                applied: self.metrics.mutations_applied_total.get(),
                skipped: self.metrics.messages_skipped_total.get(),
                dead_lettered: self.metrics.messages_dead_lettered_total.get(),
                retries: self.metrics.apply_retries_total.get(),
            },
        }
    }
}
