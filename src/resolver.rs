//! Recipient resolution: expanding group references into addresses.
//!
//! Payloads may name recipients either directly or as `group:<name>`
//! references. Groups are expanded at dispatch time, so membership edits
//! between enqueue and send take effect without touching queued items.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::message::RecipientSpec;

/// Errors raised while resolving recipient specs.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// A `group:` reference names a group that is not configured.
    #[error("unknown recipient group: {0}")]
    UnknownGroup(String),

    /// A configured group expanded to zero addresses.
    #[error("recipient group is empty: {0}")]
    EmptyGroup(String),
}

/// Maps recipient specs to concrete addresses.
pub trait RecipientResolver {
    /// Expand a list of specs into addresses, preserving order and
    /// dropping case-insensitive duplicates (first occurrence wins).
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError`] if a group is unknown or empty.
    fn resolve(&self, specs: &[RecipientSpec]) -> Result<Vec<String>, ResolutionError>;
}

/// Resolver backed by the `[groups]` table of the config file.
#[derive(Debug, Clone, Default)]
pub struct GroupBook {
    groups: BTreeMap<String, Vec<String>>,
}

impl GroupBook {
    /// Build a group book from configured name-to-addresses entries.
    pub fn new(groups: BTreeMap<String, Vec<String>>) -> Self {
        Self { groups }
    }
}

impl RecipientResolver for GroupBook {
    fn resolve(&self, specs: &[RecipientSpec]) -> Result<Vec<String>, ResolutionError> {
        let mut out = Vec::new();
        let mut seen = Vec::new();
        let push = |addr: &str, out: &mut Vec<String>, seen: &mut Vec<String>| {
            let lowered = addr.to_lowercase();
            if !seen.contains(&lowered) {
                seen.push(lowered);
                out.push(addr.to_owned());
            }
        };

        for spec in specs {
            match spec {
                RecipientSpec::Address(addr) => push(addr, &mut out, &mut seen),
                RecipientSpec::Group(name) => {
                    let members = self
                        .groups
                        .get(name)
                        .ok_or_else(|| ResolutionError::UnknownGroup(name.clone()))?;
                    if members.is_empty() {
                        return Err(ResolutionError::EmptyGroup(name.clone()));
                    }
                    for addr in members {
                        push(addr, &mut out, &mut seen);
                    }
                }
            }
        }
        Ok(out)
    }
}
