//! Embedding store: the roster of enrolled identities.
//!
//! The roster is an immutable value. Refreshes build a complete new roster
//! and swap the shared pointer, so a reader holds either the old or the new
//! roster for as long as it keeps its snapshot.

use crate::types::Embedding;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Roster as delivered by the backend: identity-id -> raw embedding.
pub type RawRoster = HashMap<String, Vec<f32>>;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("roster fetch failed: {0}")]
    Fetch(String),
}

/// Anything that can deliver the raw roster for a room.
pub trait RosterSource {
    fn fetch_roster(
        &self,
        room_filter: Option<&str>,
    ) -> impl Future<Output = Result<RawRoster, RosterError>> + Send;
}

/// Immutable identity -> normalized embedding mapping, ordered by identity-id.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: BTreeMap<String, Embedding>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a roster from backend data.
    ///
    /// Every vector is normalized on the way in. Entries that cannot be
    /// normalized, or whose length differs from `dim`, are dropped and
    /// counted in the returned skip count.
    pub fn from_raw(raw: RawRoster, dim: Option<usize>) -> (Self, usize) {
        let mut entries = BTreeMap::new();
        let mut skipped = 0usize;

        for (identity, values) in raw {
            let normalized = match dim {
                Some(d) => Embedding::normalized_with_dim(values, d),
                None => Embedding::normalized(values),
            };
            match normalized {
                Ok(embedding) => {
                    entries.insert(identity, embedding);
                }
                Err(err) => {
                    tracing::warn!(identity = %identity, error = %err, "skipping roster entry");
                    skipped += 1;
                }
            }
        }

        (Self { entries }, skipped)
    }

    pub fn insert(&mut self, identity: impl Into<String>, embedding: Embedding) {
        self.entries.insert(identity.into(), embedding);
    }

    pub fn get(&self, identity: &str) -> Option<&Embedding> {
        self.entries.get(identity)
    }

    /// Entries in ascending identity-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Embedding)> {
        self.entries.iter().map(|(id, e)| (id.as_str(), e))
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared holder of the current roster snapshot.
///
/// Readers take an `Arc` clone under a read lock held for a pointer copy;
/// writers only ever replace the whole roster.
#[derive(Debug)]
pub struct RosterStore {
    current: RwLock<Arc<Roster>>,
    dim: Option<usize>,
    refreshed_at_ms: AtomicI64,
    refresh_count: AtomicU64,
}

impl RosterStore {
    /// Empty store. `dim` pins the expected embedding dimension.
    pub fn new(dim: Option<usize>) -> Self {
        Self {
            current: RwLock::new(Arc::new(Roster::new())),
            dim,
            refreshed_at_ms: AtomicI64::new(0),
            refresh_count: AtomicU64::new(0),
        }
    }

    /// The roster in effect right now.
    pub fn snapshot(&self) -> Arc<Roster> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Swap in a complete new roster.
    pub fn replace(&self, roster: Roster, now_ms: i64) -> Arc<Roster> {
        let roster = Arc::new(roster);
        match self.current.write() {
            Ok(mut guard) => *guard = Arc::clone(&roster),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&roster),
        }
        self.refreshed_at_ms.store(now_ms, Ordering::Release);
        self.refresh_count.fetch_add(1, Ordering::AcqRel);
        roster
    }

    /// Fetch from `source` and replace the roster on success.
    ///
    /// On failure the previous roster stays in effect.
    pub async fn refresh<S: RosterSource>(
        &self,
        source: &S,
        room_filter: Option<&str>,
        now_ms: i64,
    ) -> Result<Arc<Roster>, RosterError> {
        let room_filter = room_filter.filter(|r| !r.is_empty());

        let raw = match source.fetch_roster(room_filter).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    room = room_filter.unwrap_or("*"),
                    kept = self.snapshot().len(),
                    "roster refresh failed; keeping previous roster"
                );
                return Err(err);
            }
        };

        let received = raw.len();
        let (roster, skipped) = Roster::from_raw(raw, self.dim);
        let roster = self.replace(roster, now_ms);

        tracing::info!(
            room = room_filter.unwrap_or("*"),
            received,
            skipped,
            identities = roster.len(),
            "roster refreshed"
        );

        Ok(roster)
    }

    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    /// Epoch millis of the last successful refresh (0 if never).
    pub fn refreshed_at_ms(&self) -> i64 {
        self.refreshed_at_ms.load(Ordering::Acquire)
    }

    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::Acquire)
    }
}
