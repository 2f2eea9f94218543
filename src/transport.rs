//! Mail transport boundary.
//!
//! The queue never speaks SMTP itself. Each send spawns a configured
//! sendmail-style command, feeds it the resolved message as JSON on
//! stdin, and reads the transport message id from stdout. Exit code 75
//! (`EX_TEMPFAIL`) marks a retryable failure; any other non-zero exit is
//! permanent.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::TransportConfig;

/// Sysexits code a transport command uses to signal "try again later".
pub const EXIT_TEMPFAIL: i32 = 75;

/// Identifier assigned by the transport for a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fully resolved message handed to the transport.
///
/// All group references are already expanded; the transport sees only
/// concrete addresses.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    /// Sender address; the command's default identity when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Resolved `To:` addresses.
    pub to: Vec<String>,
    /// Resolved `Cc:` addresses.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    /// Resolved `Bcc:` addresses.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_text: Option<String>,
    /// HTML body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    /// `In-Reply-To` header value for threading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    /// `References` header values for threading.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

/// A failed send attempt, classified for the retry policy.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TransportError {
    /// Human-readable failure description, recorded on the queue item.
    pub message: String,
    /// Whether the failure is worth retrying with backoff.
    pub retryable: bool,
}

impl TransportError {
    /// A failure worth retrying with backoff.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that retries cannot fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Delivers a single resolved message.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Attempt delivery once. Never retries internally.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] classified as retryable or permanent.
    async fn send(&self, message: &OutboundMessage) -> Result<MessageId, TransportError>;
}

/// Transport that pipes the message to a configured command.
#[derive(Debug, Clone)]
pub struct CommandTransport {
    config: TransportConfig,
}

impl CommandTransport {
    /// Build a transport from the `[transport]` config section.
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailTransport for CommandTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<MessageId, TransportError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| TransportError::permanent(format!("failed to encode message: {e}")))?;

        let mut child = tokio::process::Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                TransportError::permanent(format!(
                    "failed to spawn transport command {}: {e}",
                    self.config.command
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| TransportError::retryable(format!("transport stdin write: {e}")))?;
            // Drop closes the pipe so the command sees EOF.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TransportError::retryable(format!("transport wait: {e}")))?;

        if output.status.success() {
            let id = String::from_utf8_lossy(&output.stdout).trim().to_owned();
            tracing::debug!(message_id = %id, "transport accepted message");
            return Ok(MessageId(id));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.trim();
        match output.status.code() {
            Some(EXIT_TEMPFAIL) => Err(TransportError::retryable(format!(
                "transport tempfail (exit {EXIT_TEMPFAIL}): {detail}"
            ))),
            Some(code) => Err(TransportError::permanent(format!(
                "transport failed (exit {code}): {detail}"
            ))),
            None => Err(TransportError::retryable(format!(
                "transport killed by signal: {detail}"
            ))),
        }
    }
}
