//! Durable notification queue with a fixed worker pool
//!
//! Jobs are persisted through a [`JobStore`] before they are dispatched, so
//! anything not yet terminal when the process stops is picked up again by
//! [`NotificationQueue::recover`].
//!
//! Rate-limited deliveries wait exactly the hinted time and are counted
//! separately from generic failures, which back off exponentially up to the
//! job's attempt budget. Exhausting either budget fails the job.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certissue_core::TargetId;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::delivery::{DeliveryChannel, DeliveryOutcome};
use crate::retry::RetryPolicy;
use crate::store::{BatchId, JobId, JobOutcome, JobStore, NotificationJob, Payload, StoreResult};

/// Worker pool tuning
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Jobs processed at once
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            retry: RetryPolicy::default(),
        }
    }
}

/// Final tally of a bulk send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub batch: BatchId,
    pub total: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Called once when every job of a batch is terminal
#[async_trait]
pub trait BatchCompletion: Send + Sync {
    async fn batch_completed(&self, report: BatchReport);
}

struct BatchTracker {
    id: BatchId,
    total: usize,
    remaining: AtomicUsize,
    delivered: AtomicUsize,
    failed: AtomicUsize,
    completion: Arc<dyn BatchCompletion>,
}

impl BatchTracker {
    /// Count one terminal job; returns the report for the last one only
    fn record(&self, outcome: JobOutcome) -> Option<BatchReport> {
        match outcome {
            JobOutcome::Delivered => self.delivered.fetch_add(1, Ordering::SeqCst),
            JobOutcome::Failed => self.failed.fetch_add(1, Ordering::SeqCst),
        };
        if self.remaining.fetch_sub(1, Ordering::SeqCst) != 1 {
            return None;
        }
        Some(BatchReport {
            batch: self.id,
            total: self.total,
            delivered: self.delivered.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        })
    }
}

struct Shared {
    sender: mpsc::UnboundedSender<NotificationJob>,
    channel: Arc<dyn DeliveryChannel>,
    store: Arc<dyn JobStore>,
    retry: RetryPolicy,
    batches: std::sync::Mutex<HashMap<BatchId, Arc<BatchTracker>>>,
    /// Jobs dispatched and not yet terminal
    outstanding: AtomicUsize,
    idle: Notify,
}

impl Shared {
    fn dispatch(&self, job: NotificationJob) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let id = job.id;
        if self.sender.send(job).is_err() {
            // Still persisted; the next start recovers it
            tracing::error!(job_id = %id, "Notification workers are gone, job left pending");
            self.settle();
        }
    }

    fn settle(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn process(&self, mut job: NotificationJob) {
        let outcome = self.channel.deliver(job.target, &job.payload).await;

        match outcome {
            DeliveryOutcome::Success => {
                tracing::info!(job_id = %job.id, target_id = %job.target, "Notification delivered");
                self.finish(&job, JobOutcome::Delivered);
            }
            DeliveryOutcome::PermanentRejection(reason) => {
                tracing::warn!(
                    job_id = %job.id,
                    target_id = %job.target,
                    reason = %reason,
                    "Notification rejected permanently"
                );
                self.finish(&job, JobOutcome::Failed);
            }
            DeliveryOutcome::RateLimited(wait) => {
                job.rate_limited_count += 1;
                if job.rate_limited_count > self.retry.max_rate_limit_waits {
                    tracing::error!(
                        job_id = %job.id,
                        target_id = %job.target,
                        "Notification still rate limited, giving up"
                    );
                    self.finish(&job, JobOutcome::Failed);
                    return;
                }
                tracing::warn!(
                    job_id = %job.id,
                    target_id = %job.target,
                    wait_ms = wait.as_millis() as u64,
                    "Notification rate limited"
                );
                self.retry_later(job, wait);
            }
            DeliveryOutcome::TransientError(reason) => {
                job.attempt_count += 1;
                if job.attempt_count >= job.max_attempts {
                    tracing::error!(
                        job_id = %job.id,
                        target_id = %job.target,
                        attempts = job.attempt_count,
                        reason = %reason,
                        "Notification failed after retries"
                    );
                    self.finish(&job, JobOutcome::Failed);
                    return;
                }
                tracing::warn!(
                    job_id = %job.id,
                    target_id = %job.target,
                    attempt = job.attempt_count,
                    max_attempts = job.max_attempts,
                    reason = %reason,
                    "Notification attempt failed"
                );
                let wait = self.retry.backoff(job.attempt_count);
                self.retry_later(job, wait);
            }
        }
    }

    /// Re-queue after `wait` without holding a worker
    fn retry_later(&self, job: NotificationJob, wait: Duration) {
        if let Err(e) = self.store.record_attempt(&job) {
            tracing::error!(job_id = %job.id, error = %e, "Failed to persist attempt count");
        }
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if sender.send(job).is_err() {
                tracing::warn!("Queue closed before retry");
            }
        });
    }

    fn finish(&self, job: &NotificationJob, outcome: JobOutcome) {
        if let Err(e) = self.store.finish_job(job.id, outcome) {
            tracing::error!(job_id = %job.id, error = %e, "Failed to persist job outcome");
        }
        if let Some(batch) = job.batch {
            self.batch_progress(batch, outcome);
        }
        self.settle();
    }

    fn batch_progress(&self, batch: BatchId, outcome: JobOutcome) {
        let tracker = self.batches.lock().unwrap().get(&batch).cloned();
        let Some(tracker) = tracker else {
            // Batches started before a restart are not tracked
            tracing::debug!(batch_id = %batch, "Job finished for untracked batch");
            return;
        };

        if let Some(report) = tracker.record(outcome) {
            self.batches.lock().unwrap().remove(&batch);
            fire_completion(tracker.completion.clone(), report);
        }
    }
}

fn fire_completion(completion: Arc<dyn BatchCompletion>, report: BatchReport) {
    tracing::info!(
        batch_id = %report.batch,
        total = report.total,
        delivered = report.delivered,
        failed = report.failed,
        "Bulk send complete"
    );
    tokio::spawn(async move {
        completion.batch_completed(report).await;
    });
}

async fn run_worker(
    worker: usize,
    shared: Arc<Shared>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<NotificationJob>>>,
) {
    tracing::debug!(worker, "Notification worker started");
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else { break };
        shared.process(job).await;
    }
    tracing::debug!(worker, "Notification worker stopped");
}

/// Handles to the running workers
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Stop all workers; unfinished jobs stay pending in the store
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// Producer side of the queue
#[derive(Clone)]
pub struct NotificationQueue {
    shared: Arc<Shared>,
}

impl NotificationQueue {
    /// Spawn the worker pool
    pub fn start(
        channel: Arc<dyn DeliveryChannel>,
        store: Arc<dyn JobStore>,
        settings: QueueSettings,
    ) -> (Self, WorkerPool) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            sender,
            channel,
            store,
            retry: settings.retry,
            batches: std::sync::Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let receiver = Arc::new(Mutex::new(receiver));
        let handles = (0..settings.concurrency.max(1))
            .map(|worker| tokio::spawn(run_worker(worker, shared.clone(), receiver.clone())))
            .collect();

        (Self { shared }, WorkerPool { handles })
    }

    /// Queue one message
    pub fn enqueue(&self, target: TargetId, payload: Payload) -> StoreResult<JobId> {
        let job = NotificationJob::new(target, payload, self.shared.retry.max_attempts);
        self.shared.store.insert_job(&job)?;
        let id = job.id;
        self.shared.dispatch(job);
        Ok(id)
    }

    /// Queue the same payload for many targets
    ///
    /// `completion` runs exactly once after the last job is terminal, or
    /// right away if there are no targets. Duplicate targets are sent once.
    pub fn start_bulk_send(
        &self,
        targets: Vec<TargetId>,
        payload: Payload,
        completion: Arc<dyn BatchCompletion>,
    ) -> BatchId {
        let mut seen = HashSet::new();
        let targets: Vec<TargetId> = targets.into_iter().filter(|t| seen.insert(*t)).collect();
        let batch = BatchId::new();

        tracing::info!(batch_id = %batch, targets = targets.len(), "Bulk send started");

        if targets.is_empty() {
            fire_completion(
                completion,
                BatchReport {
                    batch,
                    total: 0,
                    delivered: 0,
                    failed: 0,
                },
            );
            return batch;
        }

        // Registered before any job can finish
        let tracker = Arc::new(BatchTracker {
            id: batch,
            total: targets.len(),
            remaining: AtomicUsize::new(targets.len()),
            delivered: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            completion,
        });
        self.shared.batches.lock().unwrap().insert(batch, tracker);

        for target in targets {
            let job = NotificationJob::new(target, payload.clone(), self.shared.retry.max_attempts)
                .in_batch(batch);
            if let Err(e) = self.shared.store.insert_job(&job) {
                tracing::error!(
                    batch_id = %batch,
                    target_id = %target,
                    error = %e,
                    "Failed to persist bulk job"
                );
                self.shared.batch_progress(batch, JobOutcome::Failed);
                continue;
            }
            self.shared.dispatch(job);
        }

        batch
    }

    /// Re-dispatch every job the store still holds as pending
    pub fn recover(&self) -> StoreResult<usize> {
        let pending = self.shared.store.pending_jobs()?;
        let count = pending.len();
        for job in pending {
            self.shared.dispatch(job);
        }
        if count > 0 {
            tracing::info!(jobs = count, "Recovered pending notifications");
        }
        Ok(count)
    }

    /// Jobs dispatched and not yet terminal
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until every dispatched job is terminal
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}
