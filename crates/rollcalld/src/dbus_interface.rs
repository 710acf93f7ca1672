use rollcall_core::{PipelineStats, PresenceTracker, RosterStore};
use std::sync::Arc;
use tokio::sync::Notify;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    roster: Arc<RosterStore>,
    tracker: Arc<PresenceTracker>,
    stats: Arc<PipelineStats>,
    refresh: Arc<Notify>,
    room_id: Option<String>,
    camera_device: String,
}

impl AttendanceService {
    pub fn new(
        roster: Arc<RosterStore>,
        tracker: Arc<PresenceTracker>,
        stats: Arc<PipelineStats>,
        refresh: Arc<Notify>,
        room_id: Option<String>,
        camera_device: String,
    ) -> Self {
        Self {
            roster,
            tracker,
            stats,
            refresh,
            room_id,
            camera_device,
        }
    }

    fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "room_id": self.room_id,
            "camera": self.camera_device,
            "roster_size": self.roster.snapshot().len(),
            "roster_refreshed_at_ms": self.roster.refreshed_at_ms(),
            "roster_refreshes": self.roster.refresh_count(),
            "present": self.tracker.len(),
            "presence_timeout_ms": self.tracker.timeout_ms(),
            "pipeline": self.stats.snapshot(),
        })
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json().to_string())
    }

    /// Currently present identities, ordered by identity-id.
    async fn present(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.tracker.snapshot())
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Ask the refresh task to reload the roster now.
    async fn refresh_roster(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("roster refresh requested over D-Bus");
        self.refresh.notify_one();
        Ok(true)
    }
}

/// Claim the bus name and serve the interface.
pub async fn serve(service: AttendanceService, session_bus: bool) -> zbus::Result<zbus::Connection> {
    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{Embedding, MatchResult, Roster};
    use tokio::sync::mpsc;

    fn service() -> (AttendanceService, Arc<PresenceTracker>, Arc<Notify>) {
        let store = Arc::new(RosterStore::new(Some(2)));
        let mut roster = Roster::new();
        roster.insert("s1", Embedding::normalized(vec![1.0, 0.0]).unwrap());
        store.replace(roster, 1_700_000_000_000);

        let (tx, _rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(PresenceTracker::new(10_000, tx));
        let refresh = Arc::new(Notify::new());
        let service = AttendanceService::new(
            store,
            Arc::clone(&tracker),
            Arc::new(PipelineStats::default()),
            Arc::clone(&refresh),
            Some("12101".into()),
            "/dev/video0".into(),
        );
        (service, tracker, refresh)
    }

    #[tokio::test]
    async fn test_status_reports_roster_and_presence() {
        let (service, tracker, _) = service();
        tracker.observe(
            &MatchResult {
                identity: "s1".into(),
                score: 0.9,
            },
            5,
        );

        let status: serde_json::Value =
            serde_json::from_str(&service.status().await.unwrap()).unwrap();
        assert_eq!(status["room_id"], "12101");
        assert_eq!(status["roster_size"], 1);
        assert_eq!(status["roster_refreshed_at_ms"], 1_700_000_000_000i64);
        assert_eq!(status["present"], 1);
        assert_eq!(status["pipeline"]["frames_processed"], 0);
    }

    #[tokio::test]
    async fn test_present_lists_records() {
        let (service, tracker, _) = service();
        for (identity, t) in [("s2", 10), ("s1", 20)] {
            tracker.observe(
                &MatchResult {
                    identity: identity.into(),
                    score: 0.7,
                },
                t,
            );
        }

        let present: serde_json::Value =
            serde_json::from_str(&service.present().await.unwrap()).unwrap();
        let records = present.as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["key"]["identity"], "s1");
        assert_eq!(records[1]["first_seen_ms"], 10);
        assert_eq!(records[0]["sync"]["state"], "pending");
    }

    #[tokio::test]
    async fn test_refresh_roster_notifies_refresh_task() {
        let (service, _, refresh) = service();
        assert!(service.refresh_roster().await.unwrap());
        tokio::time::timeout(std::time::Duration::from_secs(1), refresh.notified())
            .await
            .unwrap();
    }
}
