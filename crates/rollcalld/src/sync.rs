//! Backend sync worker.
//!
//! Consumes presence events in emission order and turns them into backend
//! calls, off the frame loop. Check-ins and checkouts are retried with
//! exponential backoff on transient failures; heartbeats get one attempt,
//! and a queued heartbeat is dropped once a newer one for the same session
//! is queued behind it. Check-in outcomes flow back to the
//! presence task as [`SyncReport`]s.

use crate::backend::{
    AttendanceBackend, BackendError, CheckInRequest, CheckOutRequest, HeartbeatRequest,
};
use rand::Rng;
use rollcall_core::{PresenceEvent, SessionKey};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Backoff schedule for backend calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add 0-50% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: MAX_RETRY_DELAY,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let exponential = base.saturating_mul(2u64.saturating_pow(retry));
        let delay = exponential.min(self.max_delay.as_millis() as u64);

        if self.jitter && delay > 0 {
            let jitter = rand::thread_rng().gen_range(0..=delay / 2);
            Duration::from_millis(delay + jitter)
        } else {
            Duration::from_millis(delay)
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    call: &'static str,
    mut op: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt - 1);
                tracing::debug!(
                    call,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient backend failure; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Check-in outcomes applied back onto the presence tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncReport {
    SessionOpened { key: SessionKey, session_id: String },
    /// `retryable` is false when the backend refused the check-in itself.
    CheckInFailed { key: SessionKey, retryable: bool },
}

/// Events taken off the channel but not yet sent.
///
/// Holds at most one heartbeat per session, so an unreachable backend
/// costs one queued heartbeat per present identity rather than one per
/// tick.
#[derive(Debug, Default)]
struct Backlog {
    queue: VecDeque<PresenceEvent>,
    superseded: usize,
}

impl Backlog {
    fn push(&mut self, event: PresenceEvent) {
        if let PresenceEvent::Heartbeat { key, .. } = &event {
            let before = self.queue.len();
            self.queue.retain(
                |queued| !matches!(queued, PresenceEvent::Heartbeat { key: k, .. } if k == key),
            );
            self.superseded += before - self.queue.len();
        }
        self.queue.push_back(event);
    }

    fn pop(&mut self) -> Option<PresenceEvent> {
        self.queue.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

pub struct SyncWorker<B> {
    backend: B,
    room_id: Option<String>,
    retry: RetryPolicy,
    sessions: HashMap<SessionKey, String>,
    reports: mpsc::UnboundedSender<SyncReport>,
}

impl<B: AttendanceBackend> SyncWorker<B> {
    pub fn new(
        backend: B,
        room_id: Option<String>,
        retry: RetryPolicy,
        reports: mpsc::UnboundedSender<SyncReport>,
    ) -> Self {
        Self {
            backend,
            room_id,
            retry,
            sessions: HashMap::new(),
            reports,
        }
    }

    /// Process events until the channel closes or `drain` fires.
    ///
    /// After `drain` fires no new events are accepted, but everything
    /// already queued is still delivered before returning. Everything
    /// waiting on the channel is pulled into the backlog before each call,
    /// so stale heartbeats are dropped instead of sent.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PresenceEvent>,
        mut drain: oneshot::Receiver<()>,
    ) {
        tracing::info!("sync worker started");
        let mut backlog = Backlog::default();
        let mut draining = false;
        let mut drained = 0usize;

        loop {
            if backlog.is_empty() {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => backlog.push(event),
                        None => break,
                    },
                    _ = &mut drain, if !draining => {
                        events.close();
                        draining = true;
                        continue;
                    }
                }
            }
            while let Ok(event) = events.try_recv() {
                backlog.push(event);
            }
            if let Some(event) = backlog.pop() {
                tracing::trace!(backlog = backlog.len(), "sending presence event");
                self.handle(event).await;
                if draining {
                    drained += 1;
                }
            }
        }

        if draining {
            tracing::info!(drained, "sync queue drained");
        }
        tracing::info!(
            open_sessions = self.sessions.len(),
            superseded_heartbeats = backlog.superseded,
            "sync worker exiting"
        );
    }

    async fn handle(&mut self, event: PresenceEvent) {
        match event {
            PresenceEvent::CheckIn {
                key,
                timestamp_ms,
                confidence,
            } => self.check_in(key, timestamp_ms, confidence).await,
            PresenceEvent::Heartbeat {
                key,
                session_id,
                timestamp_ms,
                confidence,
            } => {
                let req = HeartbeatRequest {
                    session_id,
                    timestamp: timestamp_ms,
                    confidence_score: confidence,
                };
                // One attempt: the next tick is the retry.
                if let Err(err) = self.backend.heartbeat(&req).await {
                    tracing::warn!(identity = %key.identity, error = %err, "heartbeat failed");
                }
            }
            PresenceEvent::CheckOut {
                key,
                session_id,
                timestamp_ms,
            } => {
                let known = self.sessions.remove(&key);
                let Some(session_id) = session_id.or(known) else {
                    tracing::warn!(
                        identity = %key.identity,
                        generation = key.generation,
                        "no backend session for checkout; skipping"
                    );
                    return;
                };
                let req = CheckOutRequest {
                    session_id,
                    timestamp: timestamp_ms,
                };
                match with_retry(&self.retry, "checkout", || self.backend.check_out(&req)).await {
                    Ok(()) => tracing::info!(
                        identity = %key.identity,
                        session_id = %req.session_id,
                        "checkout accepted"
                    ),
                    Err(err) => tracing::warn!(
                        identity = %key.identity,
                        session_id = %req.session_id,
                        error = %err,
                        "checkout failed"
                    ),
                }
            }
        }
    }

    async fn check_in(&mut self, key: SessionKey, timestamp_ms: i64, confidence: f32) {
        let req = CheckInRequest {
            student_id: key.identity.clone(),
            room_id: self.room_id.clone(),
            timestamp: timestamp_ms,
            confidence_score: confidence,
        };

        let report = match with_retry(&self.retry, "checkin", || self.backend.check_in(&req)).await
        {
            Ok(session_id) => {
                tracing::info!(
                    identity = %key.identity,
                    session_id = %session_id,
                    score = confidence,
                    "check-in accepted"
                );
                self.sessions.insert(key.clone(), session_id.clone());
                SyncReport::SessionOpened { key, session_id }
            }
            Err(err) => {
                let retryable = err.is_transient();
                tracing::warn!(identity = %key.identity, retryable, error = %err, "check-in failed");
                SyncReport::CheckInFailed { key, retryable }
            }
        };

        if self.reports.send(report).is_err() {
            tracing::debug!("presence task gone; sync report dropped");
        }
    }
}
