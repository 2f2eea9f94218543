//! The dispatch pass: the only component that sends mail or advances a
//! message past `Queued`.
//!
//! A run is a single bounded pass, not a daemon. It takes the dispatch
//! lock, requeues stale `sending` entries left by a crashed run, selects
//! due items in schedule order, and attempts each one under a transport
//! timeout. Failures are classified retryable or permanent; permanent
//! failures move to history and fire a best-effort alert. One item's
//! failure never aborts the rest of the pass.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::backoff_secs;
use crate::config::{DispatchConfig, RetryConfig};
use crate::lock::{DispatchLock, LockError};
use crate::message::{HistoryRecord, QueuedMessage, Status};
use crate::notify::{FailureAlert, Notifier};
use crate::resolver::RecipientResolver;
use crate::store::{sort_by_schedule, HistoryStore, QueueStore, StoreError};
use crate::transport::{MailTransport, OutboundMessage, TransportError};

// ── Errors and outcomes ─────────────────────────────────────────

/// A dispatch run failed outright (as opposed to individual items
/// failing, which the run absorbs and reports).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The queue or history store is unusable.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The lock file could not be created or read.
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// How a dispatch run ended.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Another run holds the lock; nothing was touched. A clean no-op.
    LockBusy {
        /// The holder's process id.
        pid: u32,
        /// When the holder acquired the lock.
        acquired_at: DateTime<Utc>,
    },
    /// The pass ran to completion.
    Completed(DispatchReport),
}

/// Counters for one completed dispatch pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    /// Due items attempted this pass.
    pub attempted: usize,
    /// Items delivered to the transport.
    pub sent: usize,
    /// Items scheduled for retry after a retryable failure.
    pub retried: usize,
    /// Items that failed permanently and moved to history.
    pub failed: usize,
    /// Stale `sending` items reclaimed from a crashed run.
    pub requeued_stale: usize,
    /// Items skipped because the store itself errored mid-item.
    pub store_errors: usize,
}

/// What a pass would do, without doing it.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchPlan {
    /// Due items that would be attempted, in schedule order, batch-capped.
    pub due: Vec<QueuedMessage>,
    /// Stale `sending` items that would be requeued first.
    pub stale: Vec<Uuid>,
}

// ── Dispatcher ──────────────────────────────────────────────────

/// Runs dispatch passes over a queue with pluggable collaborators.
pub struct Dispatcher<R, T, N> {
    queue: QueueStore,
    history: HistoryStore,
    lock_path: std::path::PathBuf,
    retry: RetryConfig,
    dispatch: DispatchConfig,
    resolver: R,
    transport: T,
    notifier: N,
}

impl<R, T, N> Dispatcher<R, T, N>
where
    R: RecipientResolver,
    T: MailTransport,
    N: Notifier,
{
    /// Assemble a dispatcher over the given stores and collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: QueueStore,
        history: HistoryStore,
        lock_path: impl Into<std::path::PathBuf>,
        retry: RetryConfig,
        dispatch: DispatchConfig,
        resolver: R,
        transport: T,
        notifier: N,
    ) -> Self {
        Self {
            queue,
            history,
            lock_path: lock_path.into(),
            retry,
            dispatch,
            resolver,
            transport,
            notifier,
        }
    }

    /// Run one dispatch pass.
    ///
    /// `now` anchors every scheduling decision and recorded timestamp in
    /// the pass, so a run is deterministic given the queue state.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] only when the stores or the lock file
    /// are unusable; a busy lock and per-item failures are reported in
    /// the [`DispatchOutcome`], not as errors.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<DispatchOutcome, DispatchError> {
        let lock = match DispatchLock::acquire(&self.lock_path, self.stale_window(), now) {
            Ok(lock) => lock,
            Err(LockError::Busy { pid, acquired_at }) => {
                info!(pid, %acquired_at, "dispatch lock busy, skipping run");
                return Ok(DispatchOutcome::LockBusy { pid, acquired_at });
            }
            Err(e) => return Err(e.into()),
        };

        let mut report = DispatchReport::default();
        self.requeue_stale(now, &mut report).await?;

        let due = self.select_due(now)?;
        report.attempted = due.len();
        debug!(due = due.len(), "selected due items");

        for item in due {
            if let Err(e) = self.attempt(item, now, &mut report).await {
                // Item-level store failure: skip it and keep going.
                report.store_errors = report.store_errors.saturating_add(1);
                error!(error = %e, "store error while dispatching item, skipping");
            }
        }

        lock.release();
        info!(
            attempted = report.attempted,
            sent = report.sent,
            retried = report.retried,
            failed = report.failed,
            requeued_stale = report.requeued_stale,
            "dispatch pass complete"
        );
        Ok(DispatchOutcome::Completed(report))
    }

    /// Compute what a pass would do right now, without mutating anything
    /// or taking the lock.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] if the queue cannot be read.
    pub fn plan(&self, now: DateTime<Utc>) -> Result<DispatchPlan, DispatchError> {
        let items = self.queue.load()?;
        let stale = items
            .iter()
            .filter(|m| self.is_stale_sending(m, now))
            .map(|m| m.id)
            .collect();
        let mut due: Vec<QueuedMessage> =
            items.into_iter().filter(|m| is_due(m, now)).collect();
        sort_by_schedule(&mut due);
        due.truncate(self.dispatch.batch_size);
        Ok(DispatchPlan { due, stale })
    }

    // ── Pass phases ─────────────────────────────────────────────

    /// Reclaim `sending` items whose run evidently died mid-send.
    ///
    /// The attempt is charged (the send may or may not have gone out, and
    /// at-least-once delivery tolerates the duplicate) and the item is
    /// either scheduled for retry or escalated if attempts are exhausted.
    /// Reclaimed items are not re-attempted in the same pass.
    async fn requeue_stale(
        &self,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
    ) -> Result<(), DispatchError> {
        let items = self.queue.load()?;
        for mut item in items {
            if !self.is_stale_sending(&item, now) {
                continue;
            }
            warn!(id = %item.id, since = ?item.sending_since, "requeueing stale sending item");
            item.attempts = item.attempts.saturating_add(1);
            item.sending_since = None;
            item.last_error = Some("dispatch run interrupted mid-send".to_owned());
            if item.attempts >= item.max_attempts {
                self.escalate(&item, now).await?;
                report.failed = report.failed.saturating_add(1);
            } else {
                item.status = Status::FailedRetryable;
                item.next_attempt_at = Some(self.retry_at(item.attempts, now));
                self.queue.replace(&item)?;
            }
            report.requeued_stale = report.requeued_stale.saturating_add(1);
        }
        Ok(())
    }

    /// Select due items in schedule order, capped at the batch size.
    fn select_due(&self, now: DateTime<Utc>) -> Result<Vec<QueuedMessage>, DispatchError> {
        let mut due: Vec<QueuedMessage> = self
            .queue
            .load()?
            .into_iter()
            .filter(|m| is_due(m, now))
            .collect();
        sort_by_schedule(&mut due);
        due.truncate(self.dispatch.batch_size);
        Ok(due)
    }

    /// Attempt one item: mark sending, resolve, send, classify.
    async fn attempt(
        &self,
        mut item: QueuedMessage,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
    ) -> Result<(), DispatchError> {
        item.status = Status::Sending;
        item.sending_since = Some(now);
        self.queue.replace(&item)?;

        let result = self.resolve_and_send(&item).await;
        item.attempts = item.attempts.saturating_add(1);
        item.sending_since = None;

        match result {
            Ok(message_id) => {
                info!(id = %item.id, %message_id, attempts = item.attempts, "message sent");
                let record = HistoryRecord::terminal(&item, Status::Sent, None, now);
                self.queue.move_to_history(&self.history, &record)?;
                report.sent = report.sent.saturating_add(1);
            }
            Err(e) if e.retryable && item.attempts < item.max_attempts => {
                let next = self.retry_at(item.attempts, now);
                warn!(
                    id = %item.id,
                    attempts = item.attempts,
                    next_attempt_at = %next,
                    error = %e,
                    "send failed, scheduling retry"
                );
                item.status = Status::FailedRetryable;
                item.next_attempt_at = Some(next);
                item.last_error = Some(e.message);
                self.queue.replace(&item)?;
                report.retried = report.retried.saturating_add(1);
            }
            Err(e) => {
                error!(
                    id = %item.id,
                    attempts = item.attempts,
                    retryable = e.retryable,
                    error = %e,
                    "send failed permanently"
                );
                item.last_error = Some(e.message);
                self.escalate(&item, now).await?;
                report.failed = report.failed.saturating_add(1);
            }
        }
        Ok(())
    }

    /// Resolve recipients and push the message through the transport
    /// under the configured timeout.
    async fn resolve_and_send(
        &self,
        item: &QueuedMessage,
    ) -> Result<crate::transport::MessageId, TransportError> {
        // Group expansion happens here, not at add time, so membership
        // edits between queueing and sending take effect. An unresolvable
        // group counts as a permanent failure of the attempt.
        let to = self
            .resolver
            .resolve(&item.payload.to)
            .map_err(|e| TransportError::permanent(e.to_string()))?;
        let cc = self
            .resolver
            .resolve(&item.payload.cc)
            .map_err(|e| TransportError::permanent(e.to_string()))?;
        let bcc = self
            .resolver
            .resolve(&item.payload.bcc)
            .map_err(|e| TransportError::permanent(e.to_string()))?;

        let outbound = OutboundMessage {
            sender: item.payload.sender.clone(),
            to,
            cc,
            bcc,
            subject: item.payload.subject.clone(),
            body_text: item.payload.body_text.clone(),
            body_html: item.payload.body_html.clone(),
            in_reply_to: item.payload.in_reply_to.clone(),
            references: item.payload.references.clone(),
        };

        let timeout = std::time::Duration::from_secs(self.dispatch.send_timeout_secs);
        match tokio::time::timeout(timeout, self.transport.send(&outbound)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::retryable(format!(
                "transport timed out after {}s",
                self.dispatch.send_timeout_secs
            ))),
        }
    }

    /// Move a spent item to history as `failed_permanent` and alert.
    async fn escalate(
        &self,
        item: &QueuedMessage,
        now: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let error = item
            .last_error
            .clone()
            .unwrap_or_else(|| "unknown error".to_owned());
        let record =
            HistoryRecord::terminal(item, Status::FailedPermanent, Some(error.clone()), now);
        self.queue.move_to_history(&self.history, &record)?;

        let alert = FailureAlert {
            id: item.id,
            subject: item.payload.subject.clone(),
            recipients: item.payload.recipient_summary(),
            attempts: item.attempts,
            error,
            failed_at: now,
        };
        // Best effort; the notifier logs its own failures.
        self.notifier.notify_failure(&alert).await;
        Ok(())
    }

    // ── Small helpers ───────────────────────────────────────────

    fn stale_window(&self) -> Duration {
        Duration::seconds(to_i64(self.dispatch.stale_sending_secs))
    }

    fn is_stale_sending(&self, item: &QueuedMessage, now: DateTime<Utc>) -> bool {
        item.status == Status::Sending
            && match item.sending_since {
                Some(since) => now.signed_duration_since(since) >= self.stale_window(),
                // Legacy record without a timestamp: assume stale.
                None => true,
            }
    }

    fn retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = backoff_secs(
            attempts,
            self.retry.base_backoff_secs,
            self.retry.max_backoff_secs,
        );
        now.checked_add_signed(Duration::seconds(to_i64(secs)))
            .unwrap_or(now)
    }
}

/// Whether an item should be attempted at `now`.
fn is_due(item: &QueuedMessage, now: DateTime<Utc>) -> bool {
    match item.status {
        Status::Queued => item.send_at <= now,
        Status::FailedRetryable => item.next_attempt_at.is_none_or(|t| t <= now),
        _ => false,
    }
}

fn to_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}
