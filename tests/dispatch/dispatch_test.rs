//! End-to-end dispatch pass coverage with scripted collaborators.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use outbox::config::{DispatchConfig, RetryConfig};
use outbox::dispatch::{DispatchOutcome, DispatchReport, Dispatcher};
use outbox::lock::DispatchLock;
use outbox::message::{MessagePayload, QueuedMessage, RecipientSpec, Status};
use outbox::notify::{FailureAlert, Notifier};
use outbox::resolver::GroupBook;
use outbox::store::{HistoryStore, QueueStore};
use outbox::transport::{MailTransport, MessageId, OutboundMessage, TransportError};

// ── Scripted collaborators ──────────────────────────────────────

/// One scripted transport response, consumed in order.
enum Scripted {
    Deliver(String),
    Retryable(String),
    Permanent(String),
    Hang,
}

struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
}

impl ScriptedTransport {
    fn new(steps: Vec<Scripted>) -> (Self, Arc<Mutex<Vec<OutboundMessage>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                script: Mutex::new(steps.into()),
                sent: Arc::clone(&sent),
            },
            sent,
        )
    }

    fn delivering() -> (Self, Arc<Mutex<Vec<OutboundMessage>>>) {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl MailTransport for ScriptedTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<MessageId, TransportError> {
        let step = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Scripted::Deliver("msg-ok".to_owned()));
        match step {
            Scripted::Hang => {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Err(TransportError::retryable("hang ended unexpectedly"))
            }
            Scripted::Deliver(id) => {
                self.sent
                    .lock()
                    .expect("sent lock")
                    .push(message.clone());
                Ok(MessageId(id))
            }
            Scripted::Retryable(msg) => Err(TransportError::retryable(msg)),
            Scripted::Permanent(msg) => Err(TransportError::permanent(msg)),
        }
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    alerts: Arc<Mutex<Vec<FailureAlert>>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_failure(&self, alert: &FailureAlert) {
        self.alerts.lock().expect("alerts lock").push(alert.clone());
    }
}

// ── Harness ─────────────────────────────────────────────────────

fn stores(dir: &TempDir) -> (QueueStore, HistoryStore) {
    (
        QueueStore::new(dir.path().join("queue.jsonl")),
        HistoryStore::new(dir.path().join("history.jsonl")),
    )
}

fn group_book() -> GroupBook {
    let mut groups = BTreeMap::new();
    groups.insert(
        "team".to_owned(),
        vec!["alice@example.com".to_owned(), "bob@example.com".to_owned()],
    );
    GroupBook::new(groups)
}

fn dispatcher(
    dir: &TempDir,
    dispatch_config: DispatchConfig,
    transport: ScriptedTransport,
    notifier: RecordingNotifier,
) -> Dispatcher<GroupBook, ScriptedTransport, RecordingNotifier> {
    let (queue, history) = stores(dir);
    Dispatcher::new(
        queue,
        history,
        dir.path().join("dispatch.lock"),
        RetryConfig::default(),
        dispatch_config,
        group_book(),
        transport,
        notifier,
    )
}

fn payload(to: RecipientSpec) -> MessagePayload {
    MessagePayload {
        to: vec![to],
        subject: "subject".to_owned(),
        body_text: Some("body".to_owned()),
        ..MessagePayload::default()
    }
}

fn due_message(send_at: DateTime<Utc>, max_attempts: u32) -> QueuedMessage {
    let to = RecipientSpec::Address("ops@example.com".to_owned());
    QueuedMessage::new(payload(to), send_at, max_attempts, send_at).expect("valid message")
}

async fn run(
    dispatcher: &Dispatcher<GroupBook, ScriptedTransport, RecordingNotifier>,
    now: DateTime<Utc>,
) -> DispatchReport {
    match dispatcher.run(now).await.expect("dispatch run") {
        DispatchOutcome::Completed(report) => report,
        DispatchOutcome::LockBusy { .. } => panic!("lock should be free"),
    }
}

// ── Happy path ──────────────────────────────────────────────────

#[tokio::test]
async fn due_message_is_sent_and_archived() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, history) = stores(&dir);
    let now = Utc::now();
    let id = queue
        .add(due_message(now - Duration::minutes(5), 5))
        .expect("add");

    let (transport, sent) = ScriptedTransport::delivering();
    let d = dispatcher(&dir, DispatchConfig::default(), transport, RecordingNotifier::default());
    let report = run(&d, now).await;

    assert_eq!(report.attempted, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(sent.lock().expect("sent").len(), 1);

    assert!(queue.load().expect("load").is_empty(), "queue must drain");
    let records = history.list(10).expect("history");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].status, Status::Sent);
    assert_eq!(records[0].attempts, 1);
    assert!(records[0].error.is_none());
}

#[tokio::test]
async fn groups_expand_at_dispatch_time() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, _history) = stores(&dir);
    let now = Utc::now();
    let to = RecipientSpec::Group("team".to_owned());
    let msg =
        QueuedMessage::new(payload(to), now - Duration::minutes(1), 5, now).expect("valid");
    queue.add(msg).expect("add");

    let (transport, sent) = ScriptedTransport::delivering();
    let d = dispatcher(&dir, DispatchConfig::default(), transport, RecordingNotifier::default());
    run(&d, now).await;

    let sent = sent.lock().expect("sent");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["alice@example.com", "bob@example.com"]);
}

#[tokio::test]
async fn future_message_is_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, history) = stores(&dir);
    let now = Utc::now();
    queue
        .add(due_message(now + Duration::hours(2), 5))
        .expect("add");

    let (transport, sent) = ScriptedTransport::delivering();
    let d = dispatcher(&dir, DispatchConfig::default(), transport, RecordingNotifier::default());
    let report = run(&d, now).await;

    assert_eq!(report.attempted, 0);
    assert!(sent.lock().expect("sent").is_empty());
    let items = queue.load().expect("load");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, Status::Queued);
    assert_eq!(items[0].attempts, 0);
    assert!(history.list(10).expect("history").is_empty());
}

#[tokio::test]
async fn second_pass_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, history) = stores(&dir);
    let now = Utc::now();
    queue
        .add(due_message(now - Duration::minutes(1), 5))
        .expect("add");

    let (transport, _sent) = ScriptedTransport::delivering();
    let d = dispatcher(&dir, DispatchConfig::default(), transport, RecordingNotifier::default());
    run(&d, now).await;
    let second = run(&d, now + Duration::minutes(1)).await;

    assert_eq!(second.attempted, 0);
    assert_eq!(history.list(10).expect("history").len(), 1);
}

#[tokio::test]
async fn batch_size_caps_a_pass() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, _history) = stores(&dir);
    let now = Utc::now();
    queue
        .add(due_message(now - Duration::minutes(2), 5))
        .expect("add first");
    queue
        .add(due_message(now - Duration::minutes(1), 5))
        .expect("add second");

    let config = DispatchConfig {
        batch_size: 1,
        ..DispatchConfig::default()
    };
    let (transport, sent) = ScriptedTransport::delivering();
    let d = dispatcher(&dir, config, transport, RecordingNotifier::default());
    let report = run(&d, now).await;

    assert_eq!(report.attempted, 1);
    assert_eq!(sent.lock().expect("sent").len(), 1);
    // The earlier-scheduled item goes first; the other waits.
    let remaining = queue.load().expect("load");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].status, Status::Queued);
}

// ── Retry and escalation ────────────────────────────────────────

#[tokio::test]
async fn retryable_failure_schedules_backoff() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, history) = stores(&dir);
    let now = Utc::now();
    let id = queue
        .add(due_message(now - Duration::minutes(1), 5))
        .expect("add");

    let (transport, _sent) =
        ScriptedTransport::new(vec![Scripted::Retryable("smtp 451 try later".to_owned())]);
    let d = dispatcher(&dir, DispatchConfig::default(), transport, RecordingNotifier::default());
    let report = run(&d, now).await;

    assert_eq!(report.retried, 1);
    let item = queue.get(id).expect("still queued");
    assert_eq!(item.status, Status::FailedRetryable);
    assert_eq!(item.attempts, 1);
    assert_eq!(item.last_error.as_deref(), Some("smtp 451 try later"));

    // First retry delay is base plus up to 50% jitter.
    let next = item.next_attempt_at.expect("next attempt scheduled");
    assert!(next >= now + Duration::seconds(60));
    assert!(next <= now + Duration::seconds(90));
    assert!(history.list(10).expect("history").is_empty());
}

#[tokio::test]
async fn retried_message_succeeds_on_later_pass() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, history) = stores(&dir);
    let now = Utc::now();
    queue
        .add(due_message(now - Duration::minutes(1), 5))
        .expect("add");

    let (transport, _sent) = ScriptedTransport::new(vec![
        Scripted::Retryable("transient".to_owned()),
        Scripted::Deliver("msg-second".to_owned()),
    ]);
    let d = dispatcher(&dir, DispatchConfig::default(), transport, RecordingNotifier::default());
    run(&d, now).await;
    let later = now + Duration::hours(2);
    let report = run(&d, later).await;

    assert_eq!(report.sent, 1);
    assert!(queue.load().expect("load").is_empty());
    let records = history.list(10).expect("history");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, Status::Sent);
    assert_eq!(records[0].attempts, 2);
}

#[tokio::test]
async fn three_retries_then_success_follows_doubling_schedule() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, history) = stores(&dir);
    let now = Utc::now();
    let id = queue
        .add(due_message(now - Duration::minutes(1), 5))
        .expect("add");

    let (transport, sent) = ScriptedTransport::new(vec![
        Scripted::Retryable("451 greylisted".to_owned()),
        Scripted::Retryable("451 greylisted".to_owned()),
        Scripted::Retryable("451 greylisted".to_owned()),
        Scripted::Deliver("msg-fourth".to_owned()),
    ]);
    let notifier = RecordingNotifier::default();
    let d = dispatcher(&dir, DispatchConfig::default(), transport, notifier.clone());

    // Each failed pass doubles the base delay, plus up to 50% jitter.
    let mut pass_at = now;
    for (attempt, window_secs) in [(1, 60..=90), (2, 120..=180), (3, 240..=360)] {
        let report = run(&d, pass_at).await;
        assert_eq!(report.retried, 1, "attempt {attempt} must be retried");

        let item = queue.get(id).expect("still queued");
        assert_eq!(item.status, Status::FailedRetryable);
        assert_eq!(item.attempts, attempt);
        let next = item.next_attempt_at.expect("next attempt scheduled");
        let gap = (next - pass_at).num_seconds();
        assert!(
            window_secs.contains(&gap),
            "attempt {attempt} gap {gap}s outside {window_secs:?}"
        );
        pass_at = next;
    }

    let report = run(&d, pass_at).await;
    assert_eq!(report.sent, 1);
    assert_eq!(sent.lock().expect("sent").len(), 1);
    assert!(queue.load().expect("load").is_empty());

    let records = history.list(10).expect("history");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].status, Status::Sent);
    assert_eq!(records[0].attempts, 4);
    assert!(records[0].error.is_none());
    assert!(notifier.alerts.lock().expect("alerts").is_empty());
}

#[tokio::test]
async fn permanent_failure_archives_and_alerts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, history) = stores(&dir);
    let now = Utc::now();
    let id = queue
        .add(due_message(now - Duration::minutes(1), 5))
        .expect("add");

    let (transport, _sent) =
        ScriptedTransport::new(vec![Scripted::Permanent("550 no such user".to_owned())]);
    let notifier = RecordingNotifier::default();
    let d = dispatcher(&dir, DispatchConfig::default(), transport, notifier.clone());
    let report = run(&d, now).await;

    assert_eq!(report.failed, 1);
    assert!(queue.load().expect("load").is_empty());
    let records = history.list(10).expect("history");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, Status::FailedPermanent);
    assert_eq!(records[0].attempts, 1);
    assert_eq!(records[0].error.as_deref(), Some("550 no such user"));

    let alerts = notifier.alerts.lock().expect("alerts");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].id, id);
    assert_eq!(alerts[0].error, "550 no such user");
}

#[tokio::test]
async fn exhausted_attempts_escalate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, history) = stores(&dir);
    let now = Utc::now();
    queue
        .add(due_message(now - Duration::minutes(1), 2))
        .expect("add");

    let (transport, _sent) = ScriptedTransport::new(vec![
        Scripted::Retryable("transient one".to_owned()),
        Scripted::Retryable("transient two".to_owned()),
    ]);
    let notifier = RecordingNotifier::default();
    let d = dispatcher(&dir, DispatchConfig::default(), transport, notifier.clone());
    run(&d, now).await;
    let report = run(&d, now + Duration::hours(2)).await;

    assert_eq!(report.failed, 1);
    let records = history.list(10).expect("history");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, Status::FailedPermanent);
    assert_eq!(records[0].attempts, 2);
    assert_eq!(records[0].error.as_deref(), Some("transient two"));
    assert_eq!(notifier.alerts.lock().expect("alerts").len(), 1);
}

#[tokio::test]
async fn unknown_group_fails_permanently_on_first_attempt() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, history) = stores(&dir);
    let now = Utc::now();
    let to = RecipientSpec::Group("nobody".to_owned());
    let msg =
        QueuedMessage::new(payload(to), now - Duration::minutes(1), 5, now).expect("valid");
    let id = queue.add(msg).expect("add");

    let (transport, sent) = ScriptedTransport::delivering();
    let notifier = RecordingNotifier::default();
    let d = dispatcher(&dir, DispatchConfig::default(), transport, notifier.clone());
    let report = run(&d, now).await;

    assert_eq!(report.failed, 1);
    assert!(sent.lock().expect("sent").is_empty());
    assert!(queue.load().expect("load").is_empty());

    let records = history.list(10).expect("history");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].status, Status::FailedPermanent);
    assert_eq!(records[0].attempts, 1);
    assert!(records[0]
        .error
        .as_deref()
        .expect("error recorded")
        .contains("unknown recipient group"));
    assert_eq!(notifier.alerts.lock().expect("alerts").len(), 1);
}

#[tokio::test]
async fn transport_timeout_is_retryable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, _history) = stores(&dir);
    let now = Utc::now();
    let id = queue
        .add(due_message(now - Duration::minutes(1), 5))
        .expect("add");

    let config = DispatchConfig {
        send_timeout_secs: 0,
        ..DispatchConfig::default()
    };
    let (transport, _sent) = ScriptedTransport::new(vec![Scripted::Hang]);
    let d = dispatcher(&dir, config, transport, RecordingNotifier::default());
    let report = run(&d, now).await;

    assert_eq!(report.retried, 1);
    let item = queue.get(id).expect("still queued");
    assert_eq!(item.status, Status::FailedRetryable);
    assert!(item.last_error.expect("error").contains("timed out"));
}

// ── Locking and planning ────────────────────────────────────────

#[tokio::test]
async fn busy_lock_is_a_clean_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, _history) = stores(&dir);
    let now = Utc::now();
    queue
        .add(due_message(now - Duration::minutes(1), 5))
        .expect("add");

    let held = DispatchLock::acquire(
        dir.path().join("dispatch.lock"),
        Duration::minutes(15),
        now,
    )
    .expect("acquire");

    let (transport, sent) = ScriptedTransport::delivering();
    let d = dispatcher(&dir, DispatchConfig::default(), transport, RecordingNotifier::default());
    let outcome = d.run(now).await.expect("run");

    assert!(matches!(outcome, DispatchOutcome::LockBusy { .. }));
    assert!(sent.lock().expect("sent").is_empty());
    let items = queue.load().expect("load");
    assert_eq!(items[0].status, Status::Queued, "queue must be untouched");
    held.release();
}

#[tokio::test]
async fn plan_lists_due_items_without_sending() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, _history) = stores(&dir);
    let now = Utc::now();
    let due_id = queue
        .add(due_message(now - Duration::minutes(1), 5))
        .expect("add due");
    queue
        .add(due_message(now + Duration::hours(1), 5))
        .expect("add future");

    let (transport, sent) = ScriptedTransport::delivering();
    let d = dispatcher(&dir, DispatchConfig::default(), transport, RecordingNotifier::default());
    let plan = d.plan(now).expect("plan");

    assert_eq!(plan.due.len(), 1);
    assert_eq!(plan.due[0].id, due_id);
    assert!(plan.stale.is_empty());
    assert!(sent.lock().expect("sent").is_empty());
    assert_eq!(queue.load().expect("load").len(), 2, "plan must not mutate");
}
