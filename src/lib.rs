//! Outbox — a durable scheduled-send queue for email.
//!
//! Single Rust binary. Queue a message now, have it sent later; survive
//! crashes, retry transient failures with backoff, and escalate the rest
//! to an operator instead of dropping them silently.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod backoff;
pub mod lock;
pub mod message;
pub mod store;

pub mod dispatch;
pub mod notify;
pub mod resolver;
pub mod transport;
