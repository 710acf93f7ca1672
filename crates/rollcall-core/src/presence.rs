//! Presence tracking: one state machine per identity.
//!
//! An identity is either absent (no record) or present (one
//! [`PresenceRecord`]). Qualifying matches open or refresh a record; the
//! periodic sweep closes records whose last sighting is older than the
//! timeout. Every transition that the backend must hear about is pushed,
//! in order, onto an outbound [`PresenceEvent`] channel.

use crate::types::MatchResult;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Gap without a sighting after which a presence is closed.
pub const DEFAULT_PRESENCE_TIMEOUT_MS: i64 = 10_000;

/// Identifies one presence session of one identity.
///
/// `generation` is unique per opened record, so backend answers for a
/// closed session never attach to a later session of the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionKey {
    pub identity: String,
    pub generation: u64,
}

/// Backend view of a presence record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "session_id", rename_all = "snake_case")]
pub enum SyncState {
    /// Check-in emitted, no answer yet.
    Pending,
    /// Check-in accepted; heartbeats may flow.
    Synced(String),
    /// Check-in gave up; re-sent on the next heartbeat tick.
    Failed,
    /// Backend refused the check-in outright. Stays present locally and
    /// is never re-sent.
    Rejected,
}

impl SyncState {
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncState::Synced(_))
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            SyncState::Synced(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceRecord {
    pub key: SessionKey,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub last_confidence: f32,
    pub sync: SyncState,
}

impl PresenceRecord {
    pub fn identity(&self) -> &str {
        &self.key.identity
    }

    pub fn session_id(&self) -> Option<&str> {
        self.sync.session_id()
    }

    pub fn is_synced(&self) -> bool {
        self.sync.is_synced()
    }

    fn is_expired(&self, now_ms: i64, timeout_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_seen_ms) >= timeout_ms
    }
}

/// Transition requests for the backend sync adapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PresenceEvent {
    CheckIn {
        key: SessionKey,
        timestamp_ms: i64,
        confidence: f32,
    },
    Heartbeat {
        key: SessionKey,
        session_id: String,
        timestamp_ms: i64,
        confidence: f32,
    },
    CheckOut {
        key: SessionKey,
        /// Known session, if the check-in answer had arrived by then.
        session_id: Option<String>,
        timestamp_ms: i64,
    },
}

impl PresenceEvent {
    pub fn key(&self) -> &SessionKey {
        match self {
            PresenceEvent::CheckIn { key, .. }
            | PresenceEvent::Heartbeat { key, .. }
            | PresenceEvent::CheckOut { key, .. } => key,
        }
    }
}

/// Result of feeding one qualifying match into the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Absent -> Present: a new session was opened and a check-in emitted.
    Opened(SessionKey),
    /// Present -> Present: last-seen and confidence updated.
    Refreshed(SessionKey),
}

/// Concurrent per-identity presence state machine.
///
/// Shared between the frame loop (matches) and the presence task (sweeps,
/// heartbeats, backend outcomes). Each identity's record is mutated under
/// its map shard lock, and the matching event is sent while that lock is
/// held, so the channel order always follows the state order.
pub struct PresenceTracker {
    records: DashMap<String, PresenceRecord>,
    timeout_ms: i64,
    next_generation: AtomicU64,
    events: mpsc::UnboundedSender<PresenceEvent>,
}

impl PresenceTracker {
    pub fn new(timeout_ms: i64, events: mpsc::UnboundedSender<PresenceEvent>) -> Self {
        Self {
            records: DashMap::new(),
            timeout_ms,
            next_generation: AtomicU64::new(1),
            events,
        }
    }

    pub fn timeout_ms(&self) -> i64 {
        self.timeout_ms
    }

    /// Feed a qualifying match observed at `now_ms`.
    pub fn observe(&self, matched: &MatchResult, now_ms: i64) -> Transition {
        match self.records.entry(matched.identity.clone()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.last_seen_ms = record.last_seen_ms.max(now_ms);
                record.last_confidence = matched.score;
                tracing::trace!(identity = %matched.identity, score = matched.score, "presence refreshed");
                Transition::Refreshed(record.key.clone())
            }
            Entry::Vacant(vacant) => {
                let key = SessionKey {
                    identity: matched.identity.clone(),
                    generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                };
                vacant.insert(PresenceRecord {
                    key: key.clone(),
                    first_seen_ms: now_ms,
                    last_seen_ms: now_ms,
                    last_confidence: matched.score,
                    sync: SyncState::Pending,
                });
                tracing::info!(
                    identity = %key.identity,
                    generation = key.generation,
                    score = matched.score,
                    "presence opened"
                );
                self.emit(PresenceEvent::CheckIn {
                    key: key.clone(),
                    timestamp_ms: now_ms,
                    confidence: matched.score,
                });
                Transition::Opened(key)
            }
        }
    }

    /// Close every record not seen for at least the timeout.
    ///
    /// All records are judged against the same `now_ms`. Returns the
    /// identities that went absent.
    pub fn sweep(&self, now_ms: i64) -> Vec<String> {
        let mut expired = Vec::new();

        self.records.retain(|identity, record| {
            if !record.is_expired(now_ms, self.timeout_ms) {
                return true;
            }
            tracing::info!(
                identity = %identity,
                generation = record.key.generation,
                gap_ms = now_ms - record.last_seen_ms,
                synced = record.is_synced(),
                "presence expired"
            );
            self.emit(PresenceEvent::CheckOut {
                key: record.key.clone(),
                session_id: record.session_id().map(str::to_string),
                timestamp_ms: now_ms,
            });
            expired.push(identity.clone());
            false
        });

        expired.sort();
        expired
    }

    /// Emit heartbeats for synced records; re-send check-ins that failed.
    ///
    /// Pending and rejected records are skipped. Returns the number of
    /// events emitted.
    pub fn heartbeat(&self, now_ms: i64) -> usize {
        let mut emitted = 0usize;

        for mut entry in self.records.iter_mut() {
            let record = entry.value_mut();
            match &record.sync {
                SyncState::Synced(session_id) => {
                    self.emit(PresenceEvent::Heartbeat {
                        key: record.key.clone(),
                        session_id: session_id.clone(),
                        timestamp_ms: now_ms,
                        confidence: record.last_confidence,
                    });
                    emitted += 1;
                }
                SyncState::Failed => {
                    tracing::info!(identity = %record.key.identity, "re-sending failed check-in");
                    record.sync = SyncState::Pending;
                    self.emit(PresenceEvent::CheckIn {
                        key: record.key.clone(),
                        timestamp_ms: record.first_seen_ms,
                        confidence: record.last_confidence,
                    });
                    emitted += 1;
                }
                SyncState::Pending | SyncState::Rejected => {}
            }
        }

        emitted
    }

    /// Attach the backend session id to the current record for `key`.
    ///
    /// Returns false if that session is no longer current.
    pub fn confirm_session(&self, key: &SessionKey, session_id: String) -> bool {
        match self.records.get_mut(&key.identity) {
            Some(mut record) if record.key == *key => {
                tracing::debug!(identity = %key.identity, session_id = %session_id, "session confirmed");
                record.sync = SyncState::Synced(session_id);
                true
            }
            _ => false,
        }
    }

    /// Mark the check-in for `key` as given up; it is re-sent later.
    pub fn mark_check_in_failed(&self, key: &SessionKey) -> bool {
        self.settle_unsynced(key, SyncState::Failed)
    }

    /// Mark the check-in for `key` as refused for good.
    pub fn mark_check_in_rejected(&self, key: &SessionKey) -> bool {
        self.settle_unsynced(key, SyncState::Rejected)
    }

    fn settle_unsynced(&self, key: &SessionKey, state: SyncState) -> bool {
        match self.records.get_mut(&key.identity) {
            Some(mut record) if record.key == *key && !record.is_synced() => {
                record.sync = state;
                true
            }
            _ => false,
        }
    }

    /// Check out every present identity. Used on shutdown.
    pub fn close_all(&self, now_ms: i64) -> usize {
        let mut closed = 0usize;
        self.records.retain(|identity, record| {
            tracing::info!(identity = %identity, "presence closed on shutdown");
            self.emit(PresenceEvent::CheckOut {
                key: record.key.clone(),
                session_id: record.session_id().map(str::to_string),
                timestamp_ms: now_ms,
            });
            closed += 1;
            false
        });
        closed
    }

    /// Copy of all present records, ordered by identity.
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> =
            self.records.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by(|a, b| a.key.identity.cmp(&b.key.identity));
        records
    }

    pub fn get(&self, identity: &str) -> Option<PresenceRecord> {
        self.records.get(identity).map(|r| r.value().clone())
    }

    pub fn is_present(&self, identity: &str) -> bool {
        self.records.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn emit(&self, event: PresenceEvent) {
        if self.events.send(event).is_err() {
            tracing::warn!("presence event dropped: sync worker is gone");
        }
    }
}
