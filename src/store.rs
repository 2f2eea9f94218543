//! Durable queue and history stores.
//!
//! The queue file holds one JSON record per line for every non-terminal
//! message. Every mutating operation loads the full set, applies the
//! change in memory, and commits by writing a temporary file and renaming
//! it over the original, so a reader never observes a half-written file
//! and a crash mid-write leaves the previous consistent state intact.
//!
//! The history file is append-only: one JSON line per terminal record,
//! never rewritten. Moving a message to history appends the record first
//! and rewrites the queue second — a crash between the two can duplicate
//! a history line but can never lose the message.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::message::{
    HistoryRecord, QueuedMessage, Status, UpdateRequest, ValidationError,
};

// ── Errors ──────────────────────────────────────────────────────

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No queued message with the given id.
    #[error("message not found: {0}")]
    NotFound(Uuid),
    /// The message is no longer mutable — a dispatch run (or cancel) got
    /// there first.
    #[error("message {id} is no longer mutable (status: {status})")]
    Conflict {
        /// The contested message id.
        id: Uuid,
        /// Its status at the moment of the re-check.
        status: Status,
    },
    /// The mutated payload failed validation; nothing was persisted.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Filesystem failure reading or writing a store file.
    #[error("store io error at {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },
    /// A record could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ── QueueStore ──────────────────────────────────────────────────

/// Durable storage of pending (non-terminal) send requests.
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    /// Create a store backed by the given queue file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The queue file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every record in the queue file.
    ///
    /// A missing file is an empty queue. Malformed lines are skipped with
    /// a warning rather than aborting the load; an unreadable file aborts
    /// with the state on disk untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file exists but cannot be read.
    pub fn load(&self) -> Result<Vec<QueuedMessage>, StoreError> {
        read_jsonl(&self.path)
    }

    /// Persist a new message and return its id.
    ///
    /// The caller validates before constructing the message; the store
    /// only persists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] or [`StoreError::Serialization`] on
    /// commit failure.
    pub fn add(&self, message: QueuedMessage) -> Result<Uuid, StoreError> {
        let id = message.id;
        let mut items = self.load()?;
        items.push(message);
        self.commit(&items)?;
        Ok(id)
    }

    /// Fetch a single message by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such message is queued.
    pub fn get(&self, id: Uuid) -> Result<QueuedMessage, StoreError> {
        self.load()?
            .into_iter()
            .find(|m| m.id == id)
            .ok_or(StoreError::NotFound(id))
    }

    /// List messages, optionally filtered by status, ordered by `send_at`
    /// ascending with ties broken by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the queue file cannot be read.
    pub fn list(&self, status: Option<Status>) -> Result<Vec<QueuedMessage>, StoreError> {
        let mut items = self.load()?;
        if let Some(wanted) = status {
            items.retain(|m| m.status == wanted);
        }
        sort_by_schedule(&mut items);
        Ok(items)
    }

    /// Apply a partial mutation to a still-`Queued` message.
    ///
    /// Re-reads the current record immediately before applying, so an
    /// operator update racing a dispatch run resolves without blocking:
    /// whoever moved the message out of `Queued` first wins and the
    /// loser gets [`StoreError::Conflict`] with the record untouched.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the id is unknown,
    /// [`StoreError::Conflict`] if the message is no longer `Queued`,
    /// [`StoreError::Validation`] if the mutated payload is invalid.
    pub fn update(
        &self,
        id: Uuid,
        request: &UpdateRequest,
    ) -> Result<QueuedMessage, StoreError> {
        let mut items = self.load()?;
        let slot = items
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StoreError::NotFound(id))?;
        if slot.status != Status::Queued {
            return Err(StoreError::Conflict {
                id,
                status: slot.status,
            });
        }
        let updated = request.apply(slot)?;
        *slot = updated.clone();
        self.commit(&items)?;
        Ok(updated)
    }

    /// Replace a message in place, keyed by id. Dispatcher-internal: runs
    /// under the dispatch lock and does not enforce the `Queued`-only
    /// rule.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the id is unknown.
    pub fn replace(&self, message: &QueuedMessage) -> Result<(), StoreError> {
        let mut items = self.load()?;
        let slot = items
            .iter_mut()
            .find(|m| m.id == message.id)
            .ok_or(StoreError::NotFound(message.id))?;
        *slot = message.clone();
        self.commit(&items)
    }

    /// Move a message to history as a single logical operation: append
    /// the terminal record, then rewrite the queue without the message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the id is not queued, or an
    /// I/O error from either file.
    pub fn move_to_history(
        &self,
        history: &HistoryStore,
        record: &HistoryRecord,
    ) -> Result<(), StoreError> {
        let mut items = self.load()?;
        if !items.iter().any(|m| m.id == record.id) {
            return Err(StoreError::NotFound(record.id));
        }
        // History first: a crash here duplicates, never loses.
        history.append(record)?;
        items.retain(|m| m.id != record.id);
        self.commit(&items)
    }

    /// Cancel a still-`Queued` message, moving it to history.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the id is unknown,
    /// [`StoreError::Conflict`] if the message already left `Queued`.
    pub fn cancel(
        &self,
        history: &HistoryStore,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<HistoryRecord, StoreError> {
        // Status check and removal share one load, so a concurrent
        // dispatcher cannot flip the item to `Sending` in between.
        let mut items = self.load()?;
        let message = items
            .iter()
            .find(|m| m.id == id)
            .ok_or(StoreError::NotFound(id))?;
        if message.status != Status::Queued {
            return Err(StoreError::Conflict {
                id,
                status: message.status,
            });
        }
        let record = HistoryRecord::terminal(message, Status::Cancelled, None, now);
        // History first: a crash here duplicates, never loses.
        history.append(&record)?;
        items.retain(|m| m.id != id);
        self.commit(&items)?;
        Ok(record)
    }

    /// Rewrite the queue file atomically: write `<file>.tmp`, then rename
    /// over the original.
    fn commit(&self, items: &[QueuedMessage]) -> Result<(), StoreError> {
        ensure_parent(&self.path)?;
        let tmp_path = self.path.with_extension("jsonl.tmp");
        let mut buf = String::new();
        for item in items {
            buf.push_str(&serde_json::to_string(item)?);
            buf.push('\n');
        }
        std::fs::write(&tmp_path, buf).map_err(|e| StoreError::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::io(&self.path, e))
    }
}

// ── HistoryStore ────────────────────────────────────────────────

/// Append-only log of terminal (sent/failed/cancelled) requests.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    /// Create a store backed by the given history file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The history file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one terminal record as a JSON line.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] or [`StoreError::Serialization`] on
    /// failure; the file is never rewritten.
    pub fn append(&self, record: &HistoryRecord) -> Result<(), StoreError> {
        ensure_parent(&self.path)?;
        let line = serde_json::to_string(record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        writeln!(file, "{line}").map_err(|e| StoreError::io(&self.path, e))?;
        file.flush().map_err(|e| StoreError::io(&self.path, e))
    }

    /// Load the most recent `limit` records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file exists but cannot be read.
    pub fn list(&self, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let records: Vec<HistoryRecord> = read_jsonl(&self.path)?;
        let start = records.len().saturating_sub(limit);
        Ok(records.get(start..).unwrap_or_default().to_vec())
    }
}

// ── Helpers ─────────────────────────────────────────────────────

/// Order by `send_at` ascending, ties broken by id.
pub fn sort_by_schedule(items: &mut [QueuedMessage]) {
    items.sort_by(|a, b| a.send_at.cmp(&b.send_at).then_with(|| a.id.cmp(&b.id)));
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
    }
    Ok(())
}

fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let mut out = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => out.push(record),
            Err(e) => {
                // Skip the bad line; losing one record beats refusing to
                // load the rest of the queue.
                warn!(
                    path = %path.display(),
                    line = idx.saturating_add(1),
                    error = %e,
                    "skipping malformed store record"
                );
            }
        }
    }
    Ok(out)
}
