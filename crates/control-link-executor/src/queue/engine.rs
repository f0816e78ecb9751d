//! Named queues processed in the background.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};

use control_link_core::{EventStore, LocalEvent, MessageSink, SharedClock};
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    BatchOptions, BatchResult, Queue, QueueCommand, QueueCompleted, QueueReport, QueueStatus,
    StepSpec, StepStatus, execute_step, run_batch,
};
use crate::registry::OperationRegistry;

/// Finished queues are kept this long before the sweep removes them.
pub const FINISHED_QUEUE_RETENTION: Duration = Duration::from_secs(30 * 60);

/// Queue error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Queue not found: {0}")]
    NotFound(String),
    #[error("Queue {0} has already finished")]
    AlreadyFinished(String),
}

/// Options for a named queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Pause between consecutive steps.
    pub delay: Duration,
    /// Per-step timeout.
    pub timeout: Duration,
    pub stop_on_error: bool,
}

/// How the processing loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Exhausted,
    Halted,
    Cancelled,
}

struct QueueEntry {
    record: Mutex<Queue>,
    cancel: CancellationToken,
}

impl QueueEntry {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Queue engine.
///
/// Owns the table of named queues. Status queries and cancellation touch only
/// the queue record and never wait on an in-flight step.
pub struct QueueEngine {
    registry: Arc<OperationRegistry>,
    sink: Arc<dyn MessageSink>,
    clock: SharedClock,
    events: Option<Arc<EventStore>>,
    default_timeout: Duration,
    retention: Duration,
    queues: RwLock<HashMap<String, Arc<QueueEntry>>>,
}

impl QueueEngine {
    #[must_use]
    pub fn new(
        registry: Arc<OperationRegistry>,
        sink: Arc<dyn MessageSink>,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            sink,
            clock,
            events: None,
            default_timeout: Duration::from_secs(30),
            retention: FINISHED_QUEUE_RETENTION,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Publish queue completions to an event store.
    #[must_use]
    pub fn with_events(mut self, events: Arc<EventStore>) -> Self {
        self.events = Some(events);
        self
    }

    /// Step timeout used when a request does not name one.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// How long finished queues are kept.
    #[must_use]
    pub const fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run a one-shot batch.
    pub async fn run_batch(&self, steps: Vec<StepSpec>, options: BatchOptions) -> BatchResult {
        run_batch(&self.registry, &self.clock, steps, options).await
    }

    /// Create a named queue and start processing it in the background.
    ///
    /// Returns immediately with the initial snapshot.
    pub fn create_queue(
        self: &Arc<Self>,
        steps: Vec<StepSpec>,
        options: QueueOptions,
    ) -> QueueReport {
        let now = self.clock.now_millis();
        let queue = Queue {
            id: format!("queue_{}", Uuid::new_v4().simple()),
            status: QueueStatus::Running,
            commands: steps
                .into_iter()
                .enumerate()
                .map(|(index, spec)| QueueCommand::pending(index, spec))
                .collect(),
            current_index: 0,
            cancelled: false,
            delay_ms: millis(options.delay),
            timeout_ms: millis(options.timeout),
            stop_on_error: options.stop_on_error,
            start_time: now,
            end_time: None,
        };
        let report = QueueReport {
            summary: queue.summary(now),
            queue: queue.clone(),
        };

        let entry = Arc::new(QueueEntry {
            record: Mutex::new(queue),
            cancel: CancellationToken::new(),
        });
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(report.queue.id.clone(), Arc::clone(&entry));

        tracing::info!(queue_id = %report.queue.id, total = report.summary.total, "Queue created");
        tokio::spawn(Arc::clone(self).process(entry, options));
        report
    }

    async fn process(self: Arc<Self>, entry: Arc<QueueEntry>, options: QueueOptions) {
        let total = entry.lock().commands.len();
        let mut ending = Ending::Exhausted;

        for index in 0..total {
            if entry.cancel.is_cancelled() {
                ending = Ending::Cancelled;
                break;
            }
            if index > 0 && !options.delay.is_zero() {
                tokio::select! {
                    () = entry.cancel.cancelled() => {
                        ending = Ending::Cancelled;
                        break;
                    }
                    () = time::sleep(options.delay) => {}
                }
            }

            let step = {
                let mut queue = entry.lock();
                queue.current_index = index;
                queue.commands.get_mut(index).map(|command| {
                    command.start(self.clock.now_millis());
                    (command.command_type.clone(), command.params.clone())
                })
            };
            let Some((command_type, params)) = step else {
                break;
            };

            let outcome =
                execute_step(&self.registry, &command_type, params, options.timeout).await;
            let failed = outcome.is_err();
            {
                let mut queue = entry.lock();
                if let Some(command) = queue.commands.get_mut(index) {
                    command.settle(outcome, self.clock.now_millis());
                }
            }

            if failed && options.stop_on_error {
                tracing::debug!(index, "Queue halted on error");
                ending = Ending::Halted;
                break;
            }
        }

        self.finish(&entry, ending);
    }

    /// Settle the queue. Only a cancellation the loop actually observed makes
    /// the queue `cancelled`; a request arriving during the last step does not.
    fn finish(&self, entry: &QueueEntry, ending: Ending) {
        let now = self.clock.now_millis();
        let (queue_id, status, summary) = {
            let mut queue = entry.lock();
            let remainder = match ending {
                Ending::Halted => StepStatus::Skipped,
                Ending::Cancelled | Ending::Exhausted => StepStatus::Cancelled,
            };
            for command in &mut queue.commands {
                if command.status == StepStatus::Pending {
                    command.status = remainder;
                }
            }
            queue.status = match ending {
                Ending::Cancelled => QueueStatus::Cancelled,
                Ending::Halted | Ending::Exhausted => QueueStatus::Completed,
            };
            queue.end_time = Some(now);
            (queue.id.clone(), queue.status, queue.summary(now))
        };

        tracing::info!(
            %queue_id,
            ?status,
            completed = summary.completed,
            failed = summary.failed,
            "Queue finished"
        );

        let event = QueueCompleted {
            queue_id: queue_id.clone(),
            status,
            summary: summary.clone(),
            timestamp: now,
        };
        match serde_json::to_value(&event) {
            Ok(message) => {
                if let Err(e) = self.sink.send(&message) {
                    tracing::warn!(%queue_id, error = %e, "Queue completion not delivered");
                }
            }
            Err(e) => tracing::error!("Failed to serialize queue completion: {e}"),
        }

        if let Some(events) = &self.events {
            events.push(LocalEvent::QueueFinished {
                queue_id,
                status: status_name(status).to_string(),
                summary: serde_json::to_value(&summary).unwrap_or_default(),
            });
        }
    }

    fn entry(&self, queue_id: &str) -> Result<Arc<QueueEntry>, QueueError> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(queue_id.to_string()))
    }

    fn report(&self, entry: &QueueEntry) -> QueueReport {
        let queue = entry.lock().clone();
        QueueReport {
            summary: queue.summary(self.clock.now_millis()),
            queue,
        }
    }

    /// Current snapshot of a queue.
    ///
    /// # Errors
    /// Returns error if the queue does not exist.
    pub fn get_status(&self, queue_id: &str) -> Result<QueueReport, QueueError> {
        let entry = self.entry(queue_id)?;
        Ok(self.report(&entry))
    }

    /// Request cancellation.
    ///
    /// An in-flight step finishes (or times out) first; every step still
    /// pending afterwards is marked cancelled.
    ///
    /// # Errors
    /// Returns error if the queue does not exist or has already finished.
    pub fn cancel(&self, queue_id: &str) -> Result<QueueReport, QueueError> {
        let entry = self.entry(queue_id)?;
        {
            let mut queue = entry.lock();
            if queue.status != QueueStatus::Running {
                return Err(QueueError::AlreadyFinished(queue_id.to_string()));
            }
            queue.cancelled = true;
        }
        entry.cancel.cancel();
        tracing::info!(%queue_id, "Queue cancellation requested");
        Ok(self.report(&entry))
    }

    /// Snapshots of all live queues, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<QueueReport> {
        let entries: Vec<Arc<QueueEntry>> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut reports: Vec<QueueReport> = entries.iter().map(|e| self.report(e)).collect();
        reports.sort_by(|a, b| {
            a.queue
                .start_time
                .cmp(&b.queue.start_time)
                .then_with(|| a.queue.id.cmp(&b.queue.id))
        });
        reports
    }

    /// Remove queues that finished longer ago than the retention period.
    pub fn sweep(&self) -> usize {
        let retention = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_millis().saturating_sub(retention);
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let before = queues.len();
        queues.retain(|_, entry| entry.lock().end_time.is_none_or(|end| end >= cutoff));
        let removed = before - queues.len();
        if removed > 0 {
            tracing::debug!(removed, "Swept finished queues");
        }
        removed
    }
}

const fn status_name(status: QueueStatus) -> &'static str {
    match status {
        QueueStatus::Running => "running",
        QueueStatus::Completed => "completed",
        QueueStatus::Cancelled => "cancelled",
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
