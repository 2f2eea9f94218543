//! Outbox CLI entry point.
//!
//! One-shot subcommands over the durable send queue: `add`, `list`,
//! `update`, `cancel`, `history`, and `dispatch`. Designed to be driven
//! by an operator or a cron entry; `dispatch` is the only subcommand
//! that sends mail.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use outbox::config::{outbox_paths, OutboxConfig};
use outbox::dispatch::{DispatchOutcome, Dispatcher};
use outbox::message::{MessagePayload, QueuedMessage, RecipientSpec, Status, UpdateRequest};
use outbox::notify::{Notifier, NullNotifier, WebhookNotifier};
use outbox::resolver::GroupBook;
use outbox::store::{HistoryStore, QueueStore, StoreError};
use outbox::transport::CommandTransport;

/// Exit code for rejected input (validation).
const EXIT_VALIDATION: u8 = 2;
/// Exit code for an unknown message id.
const EXIT_NOT_FOUND: u8 = 3;
/// Exit code for a message that is no longer mutable.
const EXIT_CONFLICT: u8 = 4;
/// Exit code for a dispatch run skipped because the lock is held.
const EXIT_LOCK_BUSY: u8 = 5;

/// Outbox — durable scheduled-send queue for email.
#[derive(Parser)]
#[command(name = "outbox", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Operate on the send queue.
    Queue {
        /// Queue operation to execute.
        #[command(subcommand)]
        command: QueueCommand,
    },
}

/// Operations on the send queue.
#[derive(Subcommand)]
enum QueueCommand {
    /// Queue a message for later sending.
    Add {
        /// Primary recipient: an address or `group:<name>`. Repeatable.
        #[arg(long)]
        to: Vec<String>,
        /// Carbon-copy recipient. Repeatable.
        #[arg(long)]
        cc: Vec<String>,
        /// Blind-carbon-copy recipient. Repeatable.
        #[arg(long)]
        bcc: Vec<String>,
        /// Sender address; the transport default when omitted.
        #[arg(long)]
        from: Option<String>,
        /// Subject line.
        #[arg(long, default_value = "")]
        subject: String,
        /// Plain-text body.
        #[arg(long)]
        body: Option<String>,
        /// HTML body.
        #[arg(long)]
        body_html: Option<String>,
        /// Message-ID this send replies to.
        #[arg(long)]
        in_reply_to: Option<String>,
        /// Prior Message-ID in the thread. Repeatable.
        #[arg(long)]
        references: Vec<String>,
        /// When to send (RFC 3339, e.g. `2026-09-01T09:00:00Z`). Now if omitted.
        #[arg(long)]
        send_at: Option<String>,
        /// Override the configured attempt ceiling.
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Validate and print the would-be item without queueing it.
        #[arg(long)]
        dry_run: bool,
    },
    /// List pending (non-terminal) messages in schedule order.
    List {
        /// Only show messages with this status.
        #[arg(long)]
        status: Option<String>,
    },
    /// Modify a still-queued message.
    Update {
        /// The message id.
        id: Uuid,
        /// Reschedule the send (RFC 3339).
        #[arg(long)]
        send_at: Option<String>,
        /// Replace the sender.
        #[arg(long)]
        from: Option<String>,
        /// Replace the primary recipients. Repeatable.
        #[arg(long)]
        to: Vec<String>,
        /// Replace the cc recipients. Repeatable.
        #[arg(long)]
        cc: Vec<String>,
        /// Replace the bcc recipients. Repeatable.
        #[arg(long)]
        bcc: Vec<String>,
        /// Replace the subject.
        #[arg(long)]
        subject: Option<String>,
        /// Replace the plain-text body.
        #[arg(long)]
        body: Option<String>,
        /// Replace the HTML body.
        #[arg(long)]
        body_html: Option<String>,
    },
    /// Cancel a still-queued message.
    Cancel {
        /// The message id.
        id: Uuid,
    },
    /// Show terminal (sent, failed, cancelled) records.
    History {
        /// Most recent records to show.
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Run one dispatch pass: send everything that is due.
    Dispatch {
        /// Cap the number of items handled this pass.
        #[arg(long)]
        max: Option<usize>,
        /// Show what the pass would do without sending anything.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let Command::Queue { command } = cli.command;

    match command {
        QueueCommand::Add {
            to,
            cc,
            bcc,
            from,
            subject,
            body,
            body_html,
            in_reply_to,
            references,
            send_at,
            max_attempts,
            dry_run,
        } => {
            outbox::logging::init_cli();
            handle_add(AddArgs {
                to,
                cc,
                bcc,
                from,
                subject,
                body,
                body_html,
                in_reply_to,
                references,
                send_at,
                max_attempts,
                dry_run,
            })
        }
        QueueCommand::List { status } => {
            outbox::logging::init_cli();
            handle_list(status)
        }
        QueueCommand::Update {
            id,
            send_at,
            from,
            to,
            cc,
            bcc,
            subject,
            body,
            body_html,
        } => {
            outbox::logging::init_cli();
            handle_update(UpdateArgs {
                id,
                send_at,
                from,
                to,
                cc,
                bcc,
                subject,
                body,
                body_html,
            })
        }
        QueueCommand::Cancel { id } => {
            outbox::logging::init_cli();
            handle_cancel(id)
        }
        QueueCommand::History { limit } => {
            outbox::logging::init_cli();
            handle_history(limit)
        }
        QueueCommand::Dispatch { max, dry_run } => handle_dispatch(max, dry_run).await,
    }
}

// ── add ─────────────────────────────────────────────────────────

struct AddArgs {
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    from: Option<String>,
    subject: String,
    body: Option<String>,
    body_html: Option<String>,
    in_reply_to: Option<String>,
    references: Vec<String>,
    send_at: Option<String>,
    max_attempts: Option<u32>,
    dry_run: bool,
}

fn handle_add(args: AddArgs) -> ExitCode {
    let (config, queue, _history) = match open_stores() {
        Ok(parts) => parts,
        Err(e) => return fail("startup", &e.to_string(), ExitCode::FAILURE),
    };

    let now = Utc::now();
    let send_at = match args.send_at.as_deref().map(parse_timestamp).transpose() {
        Ok(parsed) => parsed.unwrap_or(now),
        Err(e) => return fail("validation", &e, ExitCode::from(EXIT_VALIDATION)),
    };

    let payload = MessagePayload {
        sender: args.from,
        to: args.to.iter().map(|s| parse_recipient(s)).collect(),
        cc: args.cc.iter().map(|s| parse_recipient(s)).collect(),
        bcc: args.bcc.iter().map(|s| parse_recipient(s)).collect(),
        subject: args.subject,
        body_text: args.body,
        body_html: args.body_html,
        in_reply_to: args.in_reply_to,
        references: args.references,
    };

    let max_attempts = args.max_attempts.unwrap_or(config.retry.max_attempts);
    let message = match QueuedMessage::new(payload, send_at, max_attempts, now) {
        Ok(message) => message,
        Err(e) => return fail("validation", &e.to_string(), ExitCode::from(EXIT_VALIDATION)),
    };

    if args.dry_run {
        return print_json(&message);
    }

    match queue.add(message.clone()) {
        Ok(id) => {
            info!(%id, send_at = %message.send_at, "message queued");
            print_json(&message)
        }
        Err(e) => store_failure(&e),
    }
}

// ── list / history ──────────────────────────────────────────────

fn handle_list(status: Option<String>) -> ExitCode {
    let (_config, queue, _history) = match open_stores() {
        Ok(parts) => parts,
        Err(e) => return fail("startup", &e.to_string(), ExitCode::FAILURE),
    };

    let filter: Option<Status> = match status.as_deref().map(str::parse).transpose() {
        Ok(filter) => filter,
        Err(e) => return fail("validation", &e, ExitCode::from(EXIT_VALIDATION)),
    };

    match queue.list(filter) {
        Ok(items) => print_json(&items),
        Err(e) => store_failure(&e),
    }
}

fn handle_history(limit: usize) -> ExitCode {
    let (_config, _queue, history) = match open_stores() {
        Ok(parts) => parts,
        Err(e) => return fail("startup", &e.to_string(), ExitCode::FAILURE),
    };

    match history.list(limit) {
        Ok(records) => print_json(&records),
        Err(e) => store_failure(&e),
    }
}

// ── update / cancel ─────────────────────────────────────────────

struct UpdateArgs {
    id: Uuid,
    send_at: Option<String>,
    from: Option<String>,
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    subject: Option<String>,
    body: Option<String>,
    body_html: Option<String>,
}

fn handle_update(args: UpdateArgs) -> ExitCode {
    let (_config, queue, _history) = match open_stores() {
        Ok(parts) => parts,
        Err(e) => return fail("startup", &e.to_string(), ExitCode::FAILURE),
    };

    let send_at = match args.send_at.as_deref().map(parse_timestamp).transpose() {
        Ok(parsed) => parsed,
        Err(e) => return fail("validation", &e, ExitCode::from(EXIT_VALIDATION)),
    };

    let request = UpdateRequest {
        send_at,
        sender: args.from,
        to: non_empty(args.to),
        cc: non_empty(args.cc),
        bcc: non_empty(args.bcc),
        subject: args.subject,
        body_text: args.body,
        body_html: args.body_html,
    };

    if request.is_empty() {
        return fail(
            "validation",
            "nothing to update; pass at least one field",
            ExitCode::from(EXIT_VALIDATION),
        );
    }

    match queue.update(args.id, &request) {
        Ok(updated) => {
            info!(id = %args.id, "message updated");
            print_json(&updated)
        }
        Err(e) => store_failure(&e),
    }
}

fn handle_cancel(id: Uuid) -> ExitCode {
    let (_config, queue, history) = match open_stores() {
        Ok(parts) => parts,
        Err(e) => return fail("startup", &e.to_string(), ExitCode::FAILURE),
    };

    match queue.cancel(&history, id, Utc::now()) {
        Ok(record) => {
            info!(%id, "message cancelled");
            print_json(&record)
        }
        Err(e) => store_failure(&e),
    }
}

// ── dispatch ────────────────────────────────────────────────────

async fn handle_dispatch(max: Option<usize>, dry_run: bool) -> ExitCode {
    let (mut config, queue, history) = match open_stores() {
        Ok(parts) => parts,
        Err(e) => return fail("startup", &e.to_string(), ExitCode::FAILURE),
    };
    let paths = match outbox_paths() {
        Ok(paths) => paths,
        Err(e) => return fail("startup", &e.to_string(), ExitCode::FAILURE),
    };
    if let Some(max) = max {
        config.dispatch.batch_size = max;
    }

    // Dry runs read only, no file logging needed.
    let _logging_guard = if dry_run {
        outbox::logging::init_cli();
        None
    } else {
        match outbox::logging::init_dispatch(&paths.logs_dir) {
            Ok(guard) => Some(guard),
            Err(e) => return fail("startup", &e.to_string(), ExitCode::FAILURE),
        }
    };

    let notifier: Box<dyn Notifier> = match config.notify.webhook_url.clone() {
        Some(url) => Box::new(WebhookNotifier::new(url)),
        None => Box::new(NullNotifier),
    };

    let dispatcher = Dispatcher::new(
        queue,
        history,
        paths.lock_file,
        config.retry.clone(),
        config.dispatch.clone(),
        GroupBook::new(config.groups.clone()),
        CommandTransport::new(config.transport.clone()),
        notifier,
    );

    let now = Utc::now();
    if dry_run {
        return match dispatcher.plan(now) {
            Ok(plan) => print_json(&plan),
            Err(e) => fail("dispatch", &e.to_string(), ExitCode::FAILURE),
        };
    }

    match dispatcher.run(now).await {
        Ok(DispatchOutcome::Completed(report)) => print_json(&report),
        Ok(DispatchOutcome::LockBusy { pid, acquired_at }) => fail(
            "lock_busy",
            &format!("dispatch lock held by pid {pid} since {acquired_at}"),
            ExitCode::from(EXIT_LOCK_BUSY),
        ),
        Err(e) => fail("dispatch", &e.to_string(), ExitCode::FAILURE),
    }
}

// ── Helpers ─────────────────────────────────────────────────────

fn open_stores() -> anyhow::Result<(OutboxConfig, QueueStore, HistoryStore)> {
    let config = OutboxConfig::load()?;
    let paths = outbox_paths()?;
    Ok((
        config,
        QueueStore::new(paths.queue_file),
        HistoryStore::new(paths.history_file),
    ))
}

/// Parse an operator recipient argument: `group:<name>` or an address.
fn parse_recipient(s: &str) -> RecipientSpec {
    match s.strip_prefix("group:") {
        Some(name) => RecipientSpec::Group(name.to_owned()),
        None => RecipientSpec::Address(s.to_owned()),
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp {s:?} (want RFC 3339): {e}"))
}

fn non_empty(v: Vec<String>) -> Option<Vec<RecipientSpec>> {
    if v.is_empty() {
        None
    } else {
        Some(v.iter().map(|s| parse_recipient(s)).collect())
    }
}

/// Print a success result as pretty JSON on stdout.
fn print_json<T: serde::Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => fail("serialization", &e.to_string(), ExitCode::FAILURE),
    }
}

/// Print a single-line JSON error on stderr and return the exit code.
fn fail(kind: &str, message: &str, code: ExitCode) -> ExitCode {
    let error = serde_json::json!({ "error": message, "kind": kind });
    eprintln!("{error}");
    code
}

fn store_failure(e: &StoreError) -> ExitCode {
    match e {
        StoreError::NotFound(_) => fail("not_found", &e.to_string(), ExitCode::from(EXIT_NOT_FOUND)),
        StoreError::Conflict { .. } => {
            fail("conflict", &e.to_string(), ExitCode::from(EXIT_CONFLICT))
        }
        StoreError::Validation(_) => {
            fail("validation", &e.to_string(), ExitCode::from(EXIT_VALIDATION))
        }
        StoreError::Io { .. } | StoreError::Serialization(_) => {
            fail("io", &e.to_string(), ExitCode::FAILURE)
        }
    }
}
