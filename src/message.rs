//! Queue data model and add-time validation.
//!
//! A [`QueuedMessage`] lives in the queue store while non-terminal and is
//! snapshotted into an immutable [`HistoryRecord`] the moment it reaches a
//! terminal status. Validation happens before anything is persisted — an
//! invalid payload is rejected outright, never queued.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Grace window for `send_at` values slightly in the past.
///
/// Mirrors operator reality: a cron-edited timestamp that is a few seconds
/// stale should still be accepted and dispatched on the next run.
const SEND_AT_GRACE_SECS: i64 = 30;

// ── Errors ──────────────────────────────────────────────────────

/// Rejected at add/update time; never persisted.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// No direct address or group reference was supplied.
    #[error("at least one recipient (address or group) is required")]
    NoRecipients,
    /// Neither a text nor an HTML body was supplied.
    #[error("a text and/or html body is required")]
    NoBody,
    /// A direct address does not look like an email address.
    #[error("invalid recipient address: {0}")]
    InvalidAddress(String),
    /// A group reference is empty.
    #[error("group reference must not be empty")]
    EmptyGroup,
    /// The scheduled send time is in the past.
    #[error("send_at is in the past; use a future time")]
    SendAtInPast,
    /// `max_attempts` must allow at least one attempt.
    #[error("max_attempts must be at least 1")]
    ZeroMaxAttempts,
}

// ── Status ──────────────────────────────────────────────────────

/// Lifecycle status of a queued message.
///
/// Transitions are monotonic: `Queued → Sending → Sent`,
/// `Sending → FailedRetryable → Sending → …`, `Queued → Cancelled`.
/// Nothing ever re-enters `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for its scheduled send time.
    Queued,
    /// A dispatch run is mid-send. Stuck entries are reclaimed after the
    /// staleness threshold.
    Sending,
    /// Delivered to the transport (terminal).
    Sent,
    /// A retryable failure occurred; waiting for `next_attempt_at`.
    FailedRetryable,
    /// Exhausted attempts or hit a permanent error (terminal).
    FailedPermanent,
    /// Cancelled by the operator while still queued (terminal).
    Cancelled,
}

impl Status {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Sent | Status::FailedPermanent | Status::Cancelled
        )
    }

    /// Stable string form, matching the on-disk serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Sending => "sending",
            Status::Sent => "sent",
            Status::FailedRetryable => "failed_retryable",
            Status::FailedPermanent => "failed_permanent",
            Status::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Status::Queued),
            "sending" => Ok(Status::Sending),
            "sent" => Ok(Status::Sent),
            "failed_retryable" => Ok(Status::FailedRetryable),
            "failed_permanent" => Ok(Status::FailedPermanent),
            "cancelled" => Ok(Status::Cancelled),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

// ── Recipients ──────────────────────────────────────────────────

/// A recipient as given by the operator: either a direct address or a
/// named group to be expanded at dispatch time.
///
/// Both forms are preserved verbatim in the payload for audit; expansion
/// happens when the dispatcher runs, so group edits between add and send
/// are honored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientSpec {
    /// A concrete email address.
    Address(String),
    /// A named group reference resolved by the recipient resolver.
    Group(String),
}

impl std::fmt::Display for RecipientSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecipientSpec::Address(a) => f.write_str(a),
            RecipientSpec::Group(g) => write!(f, "group:{g}"),
        }
    }
}

// ── Payload ─────────────────────────────────────────────────────

/// The message content and addressing, fixed at add time (mutable only
/// while the item is still `Queued`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Sender identity; the transport's default identity when `None`.
    #[serde(default)]
    pub sender: Option<String>,
    /// Primary recipients.
    #[serde(default)]
    pub to: Vec<RecipientSpec>,
    /// Carbon-copy recipients.
    #[serde(default)]
    pub cc: Vec<RecipientSpec>,
    /// Blind-carbon-copy recipients.
    #[serde(default)]
    pub bcc: Vec<RecipientSpec>,
    /// Subject line (may be empty).
    #[serde(default)]
    pub subject: String,
    /// Plain-text body.
    #[serde(default)]
    pub body_text: Option<String>,
    /// HTML body.
    #[serde(default)]
    pub body_html: Option<String>,
    /// Message-ID this send replies to, if threading.
    #[serde(default)]
    pub in_reply_to: Option<String>,
    /// Prior Message-IDs in the thread.
    #[serde(default)]
    pub references: Vec<String>,
}

impl MessagePayload {
    /// Validate the payload for queueing.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if there are no recipients, no body,
    /// a malformed direct address, or an empty group reference.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty() {
            return Err(ValidationError::NoRecipients);
        }
        if self.body_text.is_none() && self.body_html.is_none() {
            return Err(ValidationError::NoBody);
        }
        for spec in self.all_recipients() {
            match spec {
                RecipientSpec::Address(addr) => {
                    // Cheap shape check only; real address validation is the
                    // transport's problem.
                    if !addr.contains('@') || addr.trim() != addr || addr.is_empty() {
                        return Err(ValidationError::InvalidAddress(addr.clone()));
                    }
                }
                RecipientSpec::Group(name) => {
                    if name.trim().is_empty() {
                        return Err(ValidationError::EmptyGroup);
                    }
                }
            }
        }
        Ok(())
    }

    /// Iterate over every recipient spec across to/cc/bcc.
    pub fn all_recipients(&self) -> impl Iterator<Item = &RecipientSpec> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    /// Short human summary of the addressing, for alerts and logs.
    ///
    /// Addresses are listed as-is; groups appear as `group:<name>`.
    pub fn recipient_summary(&self) -> String {
        let parts: Vec<String> = self.all_recipients().map(ToString::to_string).collect();
        parts.join(", ")
    }
}

// ── QueuedMessage ───────────────────────────────────────────────

/// A pending send request, owned by the queue store while non-terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Opaque unique identifier, assigned at creation.
    pub id: Uuid,
    /// When the request was queued.
    pub created_at: DateTime<Utc>,
    /// Scheduled send time; mutable only while `Queued`.
    pub send_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: Status,
    /// Completed delivery attempts.
    pub attempts: u32,
    /// Attempt ceiling, fixed at creation; always ≥ 1.
    pub max_attempts: u32,
    /// Earliest time for the next retry; meaningful only in
    /// `FailedRetryable`.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the current `Sending` attempt began; drives staleness
    /// recovery after a crash mid-send.
    #[serde(default)]
    pub sending_since: Option<DateTime<Utc>>,
    /// Most recent dispatch error, set by the dispatcher only.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Message content and addressing.
    pub payload: MessagePayload,
}

impl QueuedMessage {
    /// Build a new queued message with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the payload is invalid, `send_at`
    /// is more than the grace window in the past, or `max_attempts` is 0.
    pub fn new(
        payload: MessagePayload,
        send_at: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        payload.validate()?;
        if max_attempts == 0 {
            return Err(ValidationError::ZeroMaxAttempts);
        }
        if send_at < now.checked_sub_signed(Duration::seconds(SEND_AT_GRACE_SECS)).unwrap_or(now) {
            return Err(ValidationError::SendAtInPast);
        }
        Ok(Self {
            id: Uuid::new_v4(),
            created_at: now,
            send_at,
            status: Status::Queued,
            attempts: 0,
            max_attempts,
            next_attempt_at: None,
            sending_since: None,
            last_error: None,
            payload,
        })
    }
}

// ── UpdateRequest ───────────────────────────────────────────────

/// Partial mutation of a still-`Queued` message.
///
/// `None` fields are left untouched. The store re-checks the status
/// immediately before applying, so a racing dispatch run wins cleanly.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    /// Reschedule the send.
    pub send_at: Option<DateTime<Utc>>,
    /// Replace the sender identity.
    pub sender: Option<String>,
    /// Replace the primary recipients.
    pub to: Option<Vec<RecipientSpec>>,
    /// Replace the cc recipients.
    pub cc: Option<Vec<RecipientSpec>>,
    /// Replace the bcc recipients.
    pub bcc: Option<Vec<RecipientSpec>>,
    /// Replace the subject.
    pub subject: Option<String>,
    /// Replace the text body.
    pub body_text: Option<String>,
    /// Replace the HTML body.
    pub body_html: Option<String>,
}

impl UpdateRequest {
    /// Whether the request mutates anything at all.
    pub fn is_empty(&self) -> bool {
        self.send_at.is_none()
            && self.sender.is_none()
            && self.to.is_none()
            && self.cc.is_none()
            && self.bcc.is_none()
            && self.subject.is_none()
            && self.body_text.is_none()
            && self.body_html.is_none()
    }

    /// Apply the mutation to a message and re-validate the result.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the mutated payload would be
    /// invalid; the message is left unchanged in that case.
    pub fn apply(&self, message: &QueuedMessage) -> Result<QueuedMessage, ValidationError> {
        let mut updated = message.clone();
        if let Some(send_at) = self.send_at {
            updated.send_at = send_at;
        }
        if let Some(ref sender) = self.sender {
            updated.payload.sender = Some(sender.clone());
        }
        if let Some(ref to) = self.to {
            updated.payload.to = to.clone();
        }
        if let Some(ref cc) = self.cc {
            updated.payload.cc = cc.clone();
        }
        if let Some(ref bcc) = self.bcc {
            updated.payload.bcc = bcc.clone();
        }
        if let Some(ref subject) = self.subject {
            updated.payload.subject = subject.clone();
        }
        if let Some(ref body_text) = self.body_text {
            updated.payload.body_text = Some(body_text.clone());
        }
        if let Some(ref body_html) = self.body_html {
            updated.payload.body_html = Some(body_html.clone());
        }
        updated.payload.validate()?;
        Ok(updated)
    }
}

// ── HistoryRecord ───────────────────────────────────────────────

/// Immutable snapshot of a message at the moment it reached a terminal
/// status. Appended to the history store once; never mutated or removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// The message id (unique across queue and history).
    pub id: Uuid,
    /// The terminal status: `sent`, `failed_permanent`, or `cancelled`.
    pub status: Status,
    /// Delivery attempts made in total.
    pub attempts: u32,
    /// When the request was originally queued.
    pub created_at: DateTime<Utc>,
    /// The scheduled send time at the moment of termination.
    pub send_at: DateTime<Utc>,
    /// When the terminal status was reached.
    pub completed_at: DateTime<Utc>,
    /// Final error, if the message failed.
    #[serde(default)]
    pub error: Option<String>,
    /// The full payload, preserved for audit.
    pub payload: MessagePayload,
}

impl HistoryRecord {
    /// Snapshot a message into a terminal record.
    pub fn terminal(
        message: &QueuedMessage,
        status: Status,
        error: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: message.id,
            status,
            attempts: message.attempts,
            created_at: message.created_at,
            send_at: message.send_at,
            completed_at,
            error,
            payload: message.payload.clone(),
        }
    }
}
