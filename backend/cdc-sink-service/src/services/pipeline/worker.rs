//! Per-partition batch processing
//!
//! A worker owns one partition. Batches arrive in offset order; within a
//! batch, mutations touching the same row form a lane that applies strictly
//! in arrival order, while distinct lanes run concurrently under the shared
//! apply permits.

use futures::future::join_all;
use resilience::{with_retry, with_transient_retry, RetryConfig, RetryError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, warn};

use super::{PipelineState, StateTracker};
use crate::error::{ApplyError, RecordError};
use crate::metrics::PipelineMetrics;
use crate::services::cdc::{classify, decode, Mutation, PartitionId, RawMessage, TableResolver};
use crate::services::dead_letter::{DeadLetterRecord, DeadLetterSink};
use crate::services::sink::SinkApplier;

/// Worker to orchestrator notifications
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WorkerReport {
    /// Every message up to and including `offset` has a final outcome
    Progress { partition: PartitionId, offset: i64 },
    /// The message at `offset` could not be resolved; the worker has stopped
    Halted {
        partition: PartitionId,
        offset: i64,
        reason: String,
    },
}

/// What a message needs after decoding and classification
enum Step {
    Skip,
    Apply(Mutation),
    DeadLetter(RecordError),
}

/// Outcome of one lane: indexes resolved in order, then the first failure
struct LaneOutcome {
    resolved: Vec<usize>,
    failure: Option<(usize, String)>,
}

pub(crate) struct PartitionWorker {
    pub(crate) partition: PartitionId,
    pub(crate) applier: SinkApplier,
    pub(crate) dead_letter: Arc<dyn DeadLetterSink>,
    pub(crate) resolver: Arc<TableResolver>,
    pub(crate) retry: RetryConfig,
    pub(crate) apply_permits: Arc<Semaphore>,
    pub(crate) metrics: PipelineMetrics,
    pub(crate) state: StateTracker,
    pub(crate) reports: mpsc::UnboundedSender<WorkerReport>,
}

impl PartitionWorker {
    pub(crate) async fn run(self, mut batches: mpsc::Receiver<Vec<RawMessage>>) {
        while let Some(batch) = batches.recv().await {
            if !self.process_batch(batch).await {
                return;
            }
        }

        debug!(partition = %self.partition, "Partition worker finished");
    }

    /// Returns false once the partition has halted
    async fn process_batch(&self, messages: Vec<RawMessage>) -> bool {
        if messages.is_empty() {
            return true;
        }

        let steps = self.prepare(&messages);
        let lanes = lanes(&steps);

        self.state.set_phase(PipelineState::Applying);

        let mut resolved: Vec<bool> = steps.iter().map(|s| matches!(s, Step::Skip)).collect();
        let mut failures = HashMap::new();

        let outcomes = join_all(
            lanes
                .iter()
                .map(|lane| self.run_lane(lane, &messages, &steps)),
        )
        .await;

        for outcome in outcomes {
            for idx in outcome.resolved {
                resolved[idx] = true;
            }
            if let Some((idx, reason)) = outcome.failure {
                failures.insert(idx, reason);
            }
        }

        let first_unresolved = resolved.iter().position(|done| !done);
        let prefix_end = first_unresolved.unwrap_or(messages.len());

        if prefix_end > 0 {
            self.report(WorkerReport::Progress {
                partition: self.partition.clone(),
                offset: messages[prefix_end - 1].offset,
            });
        }

        let Some(idx) = first_unresolved else {
            return true;
        };

        let offset = messages[idx].offset;
        let reason = failures
            .remove(&idx)
            .unwrap_or_else(|| "message left unresolved".to_string());

        error!(
            partition = %self.partition,
            offset,
            reason = %reason,
            "Partition halted"
        );

        self.report(WorkerReport::Halted {
            partition: self.partition.clone(),
            offset,
            reason,
        });
        false
    }

    /// Decode then classify every message of the batch
    fn prepare(&self, messages: &[RawMessage]) -> Vec<Step> {
        self.state.set_phase(PipelineState::Decoding);

        let decoded: Vec<_> = messages.iter().map(decode).collect();

        self.state.set_phase(PipelineState::Classifying);

        messages
            .iter()
            .zip(decoded)
            .map(|(message, decoded)| match decoded {
                Ok(None) => {
                    debug!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        "Skipping tombstone"
                    );
                    self.metrics.messages_skipped_total.inc();
                    Step::Skip
                }
                Err(e) => Step::DeadLetter(e.into()),
                Ok(Some(event)) => {
                    let target = self.resolver.resolve(&message.topic);
                    match classify(&event, &target) {
                        Ok(Some(mutation)) => Step::Apply(mutation),
                        Ok(None) => {
                            debug!(
                                topic = %message.topic,
                                offset = message.offset,
                                operation = ?event.operation,
                                "No mutation for event, skipping"
                            );
                            self.metrics.messages_skipped_total.inc();
                            Step::Skip
                        }
                        Err(e) => Step::DeadLetter(e.into()),
                    }
                }
            })
            .collect()
    }

    async fn run_lane(&self, lane: &[usize], messages: &[RawMessage], steps: &[Step]) -> LaneOutcome {
        let mut outcome = LaneOutcome {
            resolved: Vec::with_capacity(lane.len()),
            failure: None,
        };

        for &idx in lane {
            let message = &messages[idx];
            let result = match &steps[idx] {
                Step::Skip => Ok(()),
                Step::Apply(mutation) => match self.apply_with_retry(mutation).await {
                    Ok(()) => Ok(()),
                    Err(RetryError::Permanent(e)) => {
                        self.send_to_dead_letter(message, &RecordError::Apply(e)).await
                    }
                    Err(RetryError::Exhausted { attempts, last }) => Err(format!(
                        "apply to '{}' failed after {} attempts: {}",
                        mutation.table, attempts, last
                    )),
                },
                Step::DeadLetter(error) => self.send_to_dead_letter(message, error).await,
            };

            match result {
                Ok(()) => outcome.resolved.push(idx),
                Err(reason) => {
                    outcome.failure = Some((idx, reason));
                    break;
                }
            }
        }

        outcome
    }

    async fn apply_with_retry(&self, mutation: &Mutation) -> Result<(), RetryError<ApplyError>> {
        with_transient_retry(&self.retry, ApplyError::is_transient, |attempt| {
            if attempt > 1 {
                self.metrics.apply_retries_total.inc();
            }
            async move {
                let _permit = self
                    .apply_permits
                    .acquire()
                    .await
                    .map_err(|_| ApplyError::Transient("apply permits closed".to_string()))?;
                self.applier.apply(mutation).await
            }
        })
        .await?;

        self.metrics.mutations_applied_total.inc();
        Ok(())
    }

    async fn send_to_dead_letter(
        &self,
        message: &RawMessage,
        error: &RecordError,
    ) -> Result<(), String> {
        let record = DeadLetterRecord::new(message, error);

        warn!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            error_kind = error.kind(),
            error = %error,
            "Routing message to dead letter"
        );

        with_retry(&self.retry, || self.dead_letter.record(&record))
            .await
            .map_err(|e| format!("dead-letter write failed: {}", e))?;

        self.metrics.messages_dead_lettered_total.inc();
        Ok(())
    }

    fn report(&self, report: WorkerReport) {
        if self.reports.send(report).is_err() {
            warn!(partition = %self.partition, "Orchestrator gone, dropping report");
        }
    }
}

/// Group step indexes into lanes.
///
/// Mutations of the same (table, key) share a lane in arrival order; every
/// dead-letter step gets a lane of its own; skips need no lane.
fn lanes(steps: &[Step]) -> Vec<Vec<usize>> {
    let mut lanes: Vec<Vec<usize>> = Vec::new();
    let mut by_key: HashMap<(String, String), usize> = HashMap::new();

    for (idx, step) in steps.iter().enumerate() {
        match step {
            Step::Skip => {}
            Step::DeadLetter(_) => lanes.push(vec![idx]),
            Step::Apply(mutation) => {
                let key = (mutation.table.clone(), mutation.key_fingerprint());
                match by_key.get(&key) {
                    Some(&lane) => lanes[lane].push(idx),
                    None => {
                        by_key.insert(key, lanes.len());
                        lanes.push(vec![idx]);
                    }
                }
            }
        }
    }

    lanes
}
