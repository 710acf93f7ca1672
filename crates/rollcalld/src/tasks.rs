//! Periodic daemon tasks: roster refresh and presence upkeep.

use crate::sync::SyncReport;
use rollcall_core::{PresenceTracker, RosterSource, RosterStore};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::MissedTickBehavior;

/// Epoch milliseconds that advance with the monotonic clock.
///
/// Anchored to wall time on first call. Presence gaps are differences of
/// these values, so a wall-clock step never expires or freezes a record.
pub fn now_ms() -> i64 {
    static ANCHOR: OnceLock<(Instant, i64)> = OnceLock::new();
    let (start, epoch_ms) =
        ANCHOR.get_or_init(|| (Instant::now(), chrono::Utc::now().timestamp_millis()));
    epoch_ms.saturating_add(i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX))
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Refresh the roster every `period`, and whenever `trigger` is notified.
///
/// The first refresh is the caller's job; this loop starts one period in.
pub async fn roster_refresh_loop<S: RosterSource>(
    store: Arc<RosterStore>,
    source: S,
    room_filter: Option<String>,
    period: Duration,
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = ticker(period);
    tick.tick().await;

    loop {
        let reason = tokio::select! {
            _ = tick.tick() => "scheduled",
            _ = trigger.notified() => "requested",
            _ = shutdown.changed() => break,
        };
        tracing::debug!(reason, "refreshing roster");
        // Failures keep the previous roster and are logged by the store.
        let _ = store.refresh(&source, room_filter.as_deref(), now_ms()).await;
    }

    tracing::info!("roster refresh task stopped");
}

/// Apply one check-in outcome to the tracker.
pub fn apply_report(tracker: &PresenceTracker, report: SyncReport) {
    match report {
        SyncReport::SessionOpened { key, session_id } => {
            if !tracker.confirm_session(&key, session_id) {
                tracing::debug!(
                    identity = %key.identity,
                    generation = key.generation,
                    "session answer for a closed presence; ignored"
                );
            }
        }
        SyncReport::CheckInFailed {
            key,
            retryable: true,
        } => {
            if tracker.mark_check_in_failed(&key) {
                tracing::info!(identity = %key.identity, "check-in will be re-sent on next heartbeat");
            }
        }
        SyncReport::CheckInFailed {
            key,
            retryable: false,
        } => {
            if tracker.mark_check_in_rejected(&key) {
                tracing::warn!(identity = %key.identity, "check-in rejected by backend; not re-sending");
            }
        }
    }
}

/// Sweep expired presences, emit heartbeats, and fold sync outcomes back
/// into the tracker.
pub async fn presence_loop(
    tracker: Arc<PresenceTracker>,
    sweep_every: Duration,
    heartbeat_every: Duration,
    mut reports: mpsc::UnboundedReceiver<SyncReport>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sweep = ticker(sweep_every);
    let mut heartbeat = ticker(heartbeat_every);
    heartbeat.tick().await;
    let mut reports_open = true;

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                let expired = tracker.sweep(now_ms());
                if !expired.is_empty() {
                    tracing::debug!(count = expired.len(), "presences expired");
                }
            }
            _ = heartbeat.tick() => {
                let emitted = tracker.heartbeat(now_ms());
                tracing::trace!(emitted, "heartbeat tick");
            }
            report = reports.recv(), if reports_open => match report {
                Some(report) => apply_report(&tracker, report),
                None => reports_open = false,
            },
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!(present = tracker.len(), "presence task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{MatchResult, PresenceEvent, RawRoster, RosterError, SyncState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn matched(identity: &str) -> MatchResult {
        MatchResult {
            identity: identity.into(),
            score: 0.8,
        }
    }

    #[test]
    fn test_apply_report_confirms_current_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = PresenceTracker::new(10_000, tx);
        tracker.observe(&matched("s1"), 0);
        let Ok(PresenceEvent::CheckIn { key, .. }) = rx.try_recv() else {
            panic!("expected check-in");
        };

        apply_report(
            &tracker,
            SyncReport::SessionOpened {
                key: key.clone(),
                session_id: "sess-1".into(),
            },
        );
        assert_eq!(
            tracker.get("s1").unwrap().sync,
            SyncState::Synced("sess-1".into())
        );
    }

    #[test]
    fn test_apply_report_ignores_stale_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = PresenceTracker::new(10_000, tx);
        tracker.observe(&matched("s1"), 0);
        let Ok(PresenceEvent::CheckIn { key: old, .. }) = rx.try_recv() else {
            panic!("expected check-in");
        };
        tracker.sweep(10_000);
        tracker.observe(&matched("s1"), 12_000);

        apply_report(
            &tracker,
            SyncReport::SessionOpened {
                key: old.clone(),
                session_id: "sess-old".into(),
            },
        );
        apply_report(
            &tracker,
            SyncReport::CheckInFailed {
                key: old,
                retryable: false,
            },
        );
        assert_eq!(tracker.get("s1").unwrap().sync, SyncState::Pending);
    }

    #[test]
    fn test_transient_check_in_failure_is_resent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = PresenceTracker::new(10_000, tx);
        tracker.observe(&matched("s1"), 0);
        let Ok(PresenceEvent::CheckIn { key, .. }) = rx.try_recv() else {
            panic!("expected check-in");
        };

        apply_report(
            &tracker,
            SyncReport::CheckInFailed {
                key,
                retryable: true,
            },
        );
        assert_eq!(tracker.heartbeat(5_000), 1);
        assert!(matches!(rx.try_recv(), Ok(PresenceEvent::CheckIn { .. })));
    }

    #[test]
    fn test_rejected_check_in_is_sent_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = PresenceTracker::new(10_000, tx);
        tracker.observe(&matched("s1"), 0);
        let Ok(PresenceEvent::CheckIn { key, .. }) = rx.try_recv() else {
            panic!("expected check-in");
        };

        apply_report(
            &tracker,
            SyncReport::CheckInFailed {
                key,
                retryable: false,
            },
        );
        let mut check_ins = 1;
        for tick in 1..=12 {
            tracker.observe(&matched("s1"), tick * 5_000);
            tracker.heartbeat(tick * 5_000);
            while let Ok(event) = rx.try_recv() {
                if matches!(event, PresenceEvent::CheckIn { .. }) {
                    check_ins += 1;
                }
            }
        }
        assert_eq!(check_ins, 1);
        assert!(tracker.is_present("s1"));
        assert_eq!(tracker.get("s1").unwrap().sync, SyncState::Rejected);
    }

    #[test]
    fn test_now_ms_is_monotonic_and_near_wall_clock() {
        let first = now_ms();
        let wall = chrono::Utc::now().timestamp_millis();
        assert!((wall - first).abs() < 60_000);

        let mut last = first;
        for _ in 0..1_000 {
            let next = now_ms();
            assert!(next >= last);
            last = next;
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(now_ms() - first >= 20);
    }

    #[tokio::test]
    async fn test_presence_loop_sweeps_and_heartbeats() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let tracker = Arc::new(PresenceTracker::new(300, events_tx));
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracker.observe(&matched("s1"), now_ms());
        let Some(PresenceEvent::CheckIn { key, .. }) = events.recv().await else {
            panic!("expected check-in");
        };
        reports_tx
            .send(SyncReport::SessionOpened {
                key,
                session_id: "sess-7".into(),
            })
            .unwrap();

        let task = tokio::spawn(presence_loop(
            Arc::clone(&tracker),
            Duration::from_millis(10),
            Duration::from_millis(50),
            reports_rx,
            shutdown_rx,
        ));

        let mut heartbeats = 0;
        let checkout = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(PresenceEvent::Heartbeat { session_id, .. }) => {
                        assert_eq!(session_id, "sess-7");
                        heartbeats += 1;
                    }
                    Some(event @ PresenceEvent::CheckOut { .. }) => break event,
                    other => panic!("unexpected event: {other:?}"),
                }
            }
        })
        .await
        .unwrap();

        assert!(heartbeats >= 1);
        match checkout {
            PresenceEvent::CheckOut { session_id, .. } => {
                assert_eq!(session_id.as_deref(), Some("sess-7"))
            }
            _ => unreachable!(),
        }
        assert!(tracker.is_empty());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    struct CountingSource {
        calls: Arc<AtomicUsize>,
    }

    impl RosterSource for CountingSource {
        async fn fetch_roster(&self, _room: Option<&str>) -> Result<RawRoster, RosterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawRoster::from([("s1".to_string(), vec![1.0, 0.0])]))
        }
    }

    #[tokio::test]
    async fn test_refresh_on_demand() {
        let store = Arc::new(RosterStore::new(Some(2)));
        let calls = Arc::new(AtomicUsize::new(0));
        let trigger = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(roster_refresh_loop(
            Arc::clone(&store),
            CountingSource {
                calls: Arc::clone(&calls),
            },
            Some("12101".into()),
            Duration::from_secs(3600),
            Arc::clone(&trigger),
            shutdown_rx,
        ));

        trigger.notify_one();
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.refresh_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.snapshot().len(), 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
