//! # Work Source
//!
//! The durable store the reprocessing loop claims work from. Claim exclusivity is
//! the store's job: `claim_batch` selects and marks items in one atomic step so a
//! concurrent claimer (another task, another process) cannot select them again
//! until the claim lease expires or is released.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants;

/// Opaque identifier of one unit of deferred work
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(String);

impl WorkItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WorkItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for WorkItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<uuid::Uuid> for WorkItemId {
    fn from(id: uuid::Uuid) -> Self {
        Self(id.to_string())
    }
}

/// The store could not serve a claim
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("work source unavailable: {0}")]
    Unavailable(String),

    #[error("claim query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable store of claimable work items
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Atomically select up to `max_count` claimable items and mark them claimed.
    ///
    /// An empty vector means nothing is claimable; it must leave the store unchanged.
    async fn claim_batch(&self, max_count: usize) -> Result<Vec<WorkItemId>, ClaimError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "work_source"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Processed,
}

#[derive(Debug, Clone)]
struct Entry {
    id: WorkItemId,
    last_touched: DateTime<Utc>,
    claimed_until: Option<DateTime<Utc>>,
    state: EntryState,
}

impl Entry {
    fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == EntryState::Pending && self.claimed_until.map_or(true, |until| until <= now)
    }
}

/// Lease-based in-process work source.
///
/// Items are claimed oldest-touched first. A claim refreshes the item's touch
/// time and hides it for the lease window. Items stay claimable until the
/// processor marks them processed.
#[derive(Debug)]
pub struct InMemoryWorkSource {
    entries: Mutex<Vec<Entry>>,
    lease: chrono::Duration,
    available: AtomicBool,
    claim_calls: AtomicUsize,
}

impl Default for InMemoryWorkSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkSource {
    pub fn new() -> Self {
        Self::with_lease(Duration::from_secs(constants::work_source::LEASE_SECONDS))
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            lease: chrono::Duration::from_std(lease)
                .unwrap_or_else(|_| chrono::Duration::days(365 * 100)),
            available: AtomicBool::new(true),
            claim_calls: AtomicUsize::new(0),
        }
    }

    /// Source pre-filled with `ids`, the first one being the oldest
    pub fn with_items<I, T>(ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<WorkItemId>,
    {
        let source = Self::new();
        source.extend(ids);
        source
    }

    pub fn push(&self, id: impl Into<WorkItemId>) {
        self.extend(std::iter::once(id));
    }

    pub fn extend<I, T>(&self, ids: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<WorkItemId>,
    {
        let mut entries = self.entries.lock();
        let base = Utc::now();
        for (offset, id) in ids.into_iter().enumerate() {
            entries.push(Entry {
                id: id.into(),
                // Keep insertion order as age order for items added together
                last_touched: base - chrono::Duration::milliseconds(1_000_000 - offset as i64),
                claimed_until: None,
                state: EntryState::Pending,
            });
        }
    }

    /// Record the terminal state of an item. Returns whether the item existed.
    pub fn mark_processed(&self, id: &WorkItemId) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|entry| &entry.id == id) {
            Some(entry) => {
                entry.state = EntryState::Processed;
                entry.claimed_until = None;
                true
            }
            None => false,
        }
    }

    /// Clear the claim on one item so it can be selected again
    pub fn release(&self, id: &WorkItemId) -> bool {
        let mut entries = self.entries.lock();
        match entries
            .iter_mut()
            .find(|entry| &entry.id == id && entry.state == EntryState::Pending)
        {
            Some(entry) => {
                entry.claimed_until = None;
                true
            }
            None => false,
        }
    }

    /// Let every outstanding claim lapse, as if all leases had expired
    pub fn expire_claims(&self) {
        for entry in self.entries.lock().iter_mut() {
            entry.claimed_until = None;
        }
    }

    /// Simulate an outage: claims fail with [`ClaimError::Unavailable`]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Items not yet marked processed, claimed or not
    pub fn pending_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.state == EntryState::Pending)
            .count()
    }

    /// Items currently hidden by a valid claim
    pub fn claimed_count(&self) -> usize {
        let now = Utc::now();
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.state == EntryState::Pending && !entry.is_claimable(now))
            .count()
    }

    pub fn processed_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.state == EntryState::Processed)
            .count()
    }

    /// Number of `claim_batch` invocations so far
    pub fn claim_calls(&self) -> usize {
        self.claim_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkSource for InMemoryWorkSource {
    async fn claim_batch(&self, max_count: usize) -> Result<Vec<WorkItemId>, ClaimError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(ClaimError::Unavailable(
                "in-memory work source marked unavailable".to_string(),
            ));
        }

        let now = Utc::now();
        let mut entries = self.entries.lock();

        let mut candidates: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_claimable(now))
            .map(|(index, _)| index)
            .collect();
        candidates.sort_by_key(|&index| entries[index].last_touched);
        candidates.truncate(max_count);

        let claimed: Vec<WorkItemId> = candidates
            .into_iter()
            .map(|index| {
                let entry = &mut entries[index];
                entry.last_touched = now;
                entry.claimed_until = Some(now + self.lease);
                entry.id.clone()
            })
            .collect();

        debug!(
            requested = max_count,
            claimed = claimed.len(),
            "In-memory work source claim"
        );
        Ok(claimed)
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}
