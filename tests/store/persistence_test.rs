//! Durability across process boundaries, simulated by reopening the
//! stores on the same files.

use chrono::{Duration, Utc};
use tempfile::TempDir;

use outbox::message::{
    HistoryRecord, MessagePayload, QueuedMessage, RecipientSpec, Status, UpdateRequest,
};
use outbox::store::{HistoryStore, QueueStore, StoreError};

fn message(subject: &str) -> QueuedMessage {
    let now = Utc::now();
    let payload = MessagePayload {
        to: vec![RecipientSpec::Address("ops@example.com".to_owned())],
        subject: subject.to_owned(),
        body_text: Some("body".to_owned()),
        ..MessagePayload::default()
    };
    QueuedMessage::new(payload, now + Duration::hours(1), 5, now).expect("valid")
}

#[test]
fn queue_survives_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("queue.jsonl");

    let id = QueueStore::new(&path)
        .add(message("persisted"))
        .expect("add");

    // A fresh store instance sees the same state.
    let reopened = QueueStore::new(&path);
    let item = reopened.get(id).expect("get after reopen");
    assert_eq!(item.payload.subject, "persisted");
    assert_eq!(item.status, Status::Queued);
}

#[test]
fn updates_are_visible_across_instances() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("queue.jsonl");

    let id = QueueStore::new(&path).add(message("original")).expect("add");
    QueueStore::new(&path)
        .update(
            id,
            &UpdateRequest {
                subject: Some("edited".to_owned()),
                ..UpdateRequest::default()
            },
        )
        .expect("update");

    let item = QueueStore::new(&path).get(id).expect("get");
    assert_eq!(item.payload.subject, "edited");
}

#[test]
fn history_accumulates_across_instances() {
    let dir = TempDir::new().expect("tempdir");
    let queue_path = dir.path().join("queue.jsonl");
    let history_path = dir.path().join("history.jsonl");
    let now = Utc::now();

    for subject in ["first", "second"] {
        let queue = QueueStore::new(&queue_path);
        let history = HistoryStore::new(&history_path);
        let id = queue.add(message(subject)).expect("add");
        queue.cancel(&history, id, now).expect("cancel");
    }

    let records = HistoryStore::new(&history_path).list(10).expect("list");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].payload.subject, "first");
    assert_eq!(records[1].payload.subject, "second");
    assert!(records.iter().all(|r| r.status == Status::Cancelled));
}

#[test]
fn cancelled_id_stays_gone_after_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let queue_path = dir.path().join("queue.jsonl");
    let history_path = dir.path().join("history.jsonl");

    let queue = QueueStore::new(&queue_path);
    let history = HistoryStore::new(&history_path);
    let id = queue.add(message("doomed")).expect("add");
    queue.cancel(&history, id, Utc::now()).expect("cancel");

    let reopened = QueueStore::new(&queue_path);
    assert!(matches!(reopened.get(id), Err(StoreError::NotFound(_))));
    // Cancelling again conflicts by absence, not by corruption.
    assert!(matches!(
        reopened.cancel(&HistoryStore::new(&history_path), id, Utc::now()),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn terminal_record_is_immutable_history_not_queue() {
    let dir = TempDir::new().expect("tempdir");
    let queue_path = dir.path().join("queue.jsonl");
    let history_path = dir.path().join("history.jsonl");

    let queue = QueueStore::new(&queue_path);
    let history = HistoryStore::new(&history_path);
    let msg = message("archived");
    let id = queue.add(msg.clone()).expect("add");

    let record = HistoryRecord::terminal(&msg, Status::Sent, None, Utc::now());
    queue.move_to_history(&history, &record).expect("move");

    assert!(queue.load().expect("load").is_empty());
    let before = std::fs::read(&history_path).expect("read");

    // Queue operations on other items leave history bytes untouched.
    queue.add(message("unrelated")).expect("add unrelated");
    let after = std::fs::read(&history_path).expect("read");
    assert_eq!(before, after);
    assert!(matches!(queue.get(id), Err(StoreError::NotFound(_))));
}
