//! Claims on a batch.
//!
//! A [`Claim`] is a plain snapshot of one batch, held by the worker that won
//! its lock. It is consumed by [`Repository::complete`] or
//! [`Repository::release`]; the only trace it leaves in the store is the
//! lock key.
//!
//! [`Repository::complete`]: crate::Repository::complete
//! [`Repository::release`]: crate::Repository::release

use std::collections::HashMap;

use bytes::Bytes;

/// Store keys backing one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchKeys {
    /// List of payloads.
    pub entries: String,
    /// Overwrite flag; presence is the signal.
    pub overwrite: String,
    /// Claim lock; presence means claimed.
    pub lock: String,
    /// Metadata hash.
    pub data: String,
}

impl BatchKeys {
    /// Keys for `key` under `prefix`.
    #[must_use]
    pub fn new(prefix: &str, key: &str) -> Self {
        let entries = format!("{prefix}{key}");
        Self {
            overwrite: format!("{entries}:overwrite"),
            lock: format!("{entries}:lock"),
            data: format!("{entries}:data"),
            entries,
        }
    }

    /// Every key, for a full delete.
    #[must_use]
    pub fn all(&self) -> Vec<String> {
        vec![
            self.entries.clone(),
            self.overwrite.clone(),
            self.data.clone(),
            self.lock.clone(),
        ]
    }
}

/// Exclusive, single-use right to deliver a snapshot of a batch.
#[derive(Debug)]
#[must_use = "a claim holds the batch lock until it is completed or released"]
pub struct Claim {
    pub(crate) key: String,
    pub(crate) keys: BatchKeys,
    pub(crate) token: String,
    pub(crate) count: usize,
    pub(crate) entries: Vec<Bytes>,
    pub(crate) metadata: HashMap<String, String>,
    pub(crate) overwritten: bool,
}

impl Claim {
    /// Batch key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of entries in the snapshot; only these are trimmed on completion.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Snapshotted payloads, in push order.
    #[must_use]
    pub fn entries(&self) -> &[Bytes] {
        &self.entries
    }

    /// Snapshotted metadata.
    #[must_use]
    pub const fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Whether the overwrite flag was set when the claim was taken.
    #[must_use]
    pub const fn is_overwritten(&self) -> bool {
        self.overwritten
    }

    /// Fencing token written to the lock key.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the snapshot holds nothing to deliver.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Result of a claim attempt.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The lock was taken; the batch is ours to resolve.
    Claimed(Claim),
    /// Another worker holds the lock.
    AlreadyClaimed,
    /// The batch is not scheduled, or not due yet.
    NotReady,
}

/// Result of completing a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The batch was removed entirely.
    Drained,
    /// Entries arrived during delivery and stay scheduled.
    Partial {
        /// Entries left behind.
        remaining: usize,
    },
}
