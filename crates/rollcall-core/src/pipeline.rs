//! One frame's worth of work: detect -> crop -> embed -> match -> track.

use crate::detector::{DetectorError, FaceDetector};
use crate::matcher::{CosineMatcher, Matcher};
use crate::presence::{PresenceTracker, Transition};
use crate::recognizer::FaceEmbedder;
use crate::roster::RosterStore;
use crate::types::{BoundingBox, Embedding, MatchResult};
use image::RgbImage;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("frame is empty")]
    EmptyFrame,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
}

/// Per-frame filtering and matching parameters.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Detections must score strictly above this.
    pub detection_threshold: f32,
    /// Minimum face box width and height in pixels.
    pub min_face_size: u32,
    /// Pixels added on each side of the box before cropping.
    pub crop_margin: u32,
    /// Expected embedding dimension.
    pub embedding_dim: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detection_threshold: 0.6,
            min_face_size: 80,
            crop_margin: 10,
            embedding_dim: None,
        }
    }
}

/// Integer crop rectangle inside the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Expand `bbox` by `margin` on every side and clamp it to the frame.
///
/// Returns `None` when nothing of the box lies inside the frame.
pub fn crop_region(frame_width: u32, frame_height: u32, bbox: &BoundingBox, margin: u32) -> Option<CropRect> {
    if !(bbox.x.is_finite() && bbox.y.is_finite() && bbox.width.is_finite() && bbox.height.is_finite()) {
        return None;
    }

    let margin = i64::from(margin);
    let x1 = (bbox.x.floor() as i64 - margin).max(0);
    let y1 = (bbox.y.floor() as i64 - margin).max(0);
    let x2 = ((bbox.x + bbox.width).floor() as i64 + margin).min(i64::from(frame_width));
    let y2 = ((bbox.y + bbox.height).floor() as i64 + margin).min(i64::from(frame_height));

    if x1 >= i64::from(frame_width) || y1 >= i64::from(frame_height) || x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(CropRect {
        x: x1 as u32,
        y: y1 as u32,
        width: (x2 - x1) as u32,
        height: (y2 - y1) as u32,
    })
}

/// Why a region produced no match attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    OutsideFrame,
    EmbedFailed(String),
    BadEmbedding(String),
    EmptyRoster,
}

/// What happened to one accepted face region.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionOutcome {
    Matched(MatchResult),
    Unknown,
    Skipped(SkipReason),
}

/// A face region that passed the size and confidence filters.
#[derive(Debug, Clone, Serialize)]
pub struct FaceRegion {
    pub bbox: BoundingBox,
    pub crop: Option<CropRect>,
    pub outcome: RegionOutcome,
}

/// Annotation data for one processed frame.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameReport {
    pub detections: usize,
    pub regions: Vec<FaceRegion>,
    pub opened: Vec<String>,
}

impl FrameReport {
    pub fn matches(&self) -> impl Iterator<Item = &MatchResult> {
        self.regions.iter().filter_map(|r| match &r.outcome {
            RegionOutcome::Matched(m) => Some(m),
            _ => None,
        })
    }
}

/// Running counters, shared with status reporting.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_processed: AtomicU64,
    frames_failed: AtomicU64,
    faces_considered: AtomicU64,
    regions_skipped: AtomicU64,
    matches: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub frames_processed: u64,
    pub frames_failed: u64,
    pub faces_considered: u64,
    pub regions_skipped: u64,
    pub matches: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            faces_considered: self.faces_considered.load(Ordering::Relaxed),
            regions_skipped: self.regions_skipped.load(Ordering::Relaxed),
            matches: self.matches.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Sequential per-frame recognition pipeline.
pub struct FramePipeline<D, E, M = CosineMatcher> {
    detector: D,
    embedder: E,
    matcher: M,
    roster: Arc<RosterStore>,
    tracker: Arc<PresenceTracker>,
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
}

impl<D, E, M> FramePipeline<D, E, M>
where
    D: FaceDetector,
    E: FaceEmbedder,
    M: Matcher,
{
    pub fn new(
        detector: D,
        embedder: E,
        matcher: M,
        roster: Arc<RosterStore>,
        tracker: Arc<PresenceTracker>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            detector,
            embedder,
            matcher,
            roster,
            tracker,
            config,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Process one frame captured at `now_ms`.
    ///
    /// Region-level failures are recorded in the report and never abort the
    /// frame. Only an empty frame or a detector failure fails the frame.
    pub fn process_frame(&mut self, frame: &RgbImage, now_ms: i64) -> Result<FrameReport, PipelineError> {
        let result = self.run(frame, now_ms);
        match &result {
            Ok(_) => PipelineStats::bump(&self.stats.frames_processed),
            Err(_) => PipelineStats::bump(&self.stats.frames_failed),
        }
        result
    }

    fn run(&mut self, frame: &RgbImage, now_ms: i64) -> Result<FrameReport, PipelineError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(PipelineError::EmptyFrame);
        }

        let detections = self.detector.detect(frame)?;
        let roster = self.roster.snapshot();
        let mut report = FrameReport {
            detections: detections.len(),
            ..FrameReport::default()
        };

        let min = self.config.min_face_size as f32;
        for bbox in detections {
            if bbox.confidence <= self.config.detection_threshold || bbox.width < min || bbox.height < min {
                continue;
            }
            PipelineStats::bump(&self.stats.faces_considered);

            let crop = crop_region(frame.width(), frame.height(), &bbox, self.config.crop_margin);
            let outcome = match crop {
                None => RegionOutcome::Skipped(SkipReason::OutsideFrame),
                Some(_) if roster.is_empty() => RegionOutcome::Skipped(SkipReason::EmptyRoster),
                Some(rect) => self.identify(frame, rect, &roster),
            };

            match &outcome {
                RegionOutcome::Matched(m) => {
                    PipelineStats::bump(&self.stats.matches);
                    if let Transition::Opened(key) = self.tracker.observe(m, now_ms) {
                        report.opened.push(key.identity);
                    }
                }
                RegionOutcome::Skipped(reason) => {
                    PipelineStats::bump(&self.stats.regions_skipped);
                    tracing::debug!(?reason, confidence = bbox.confidence, "face region skipped");
                }
                RegionOutcome::Unknown => {}
            }

            report.regions.push(FaceRegion { bbox, crop, outcome });
        }

        Ok(report)
    }

    fn identify(&mut self, frame: &RgbImage, rect: CropRect, roster: &crate::roster::Roster) -> RegionOutcome {
        let face = image::imageops::crop_imm(frame, rect.x, rect.y, rect.width, rect.height).to_image();

        let raw = match self.embedder.embed(&face) {
            Ok(raw) => raw,
            Err(err) => return RegionOutcome::Skipped(SkipReason::EmbedFailed(err.to_string())),
        };

        let probe = match self.config.embedding_dim {
            Some(dim) => Embedding::normalized_with_dim(raw, dim),
            None => Embedding::normalized(raw),
        };
        let probe = match probe {
            Ok(p) => p,
            Err(err) => return RegionOutcome::Skipped(SkipReason::BadEmbedding(err.to_string())),
        };

        match self.matcher.best_match(&probe, roster) {
            Some(m) => {
                tracing::debug!(identity = %m.identity, score = m.score, "face matched");
                RegionOutcome::Matched(m)
            }
            None => RegionOutcome::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceEvent;
    use crate::recognizer::RecognizerError;
    use crate::roster::Roster;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    struct ScriptedDetector {
        frames: VecDeque<Result<Vec<BoundingBox>, DetectorError>>,
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            self.frames.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    struct ScriptedEmbedder {
        outputs: VecDeque<Result<Vec<f32>, RecognizerError>>,
        crops: Vec<(u32, u32)>,
    }

    impl FaceEmbedder for ScriptedEmbedder {
        fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
            self.crops.push(face.dimensions());
            self.outputs
                .pop_front()
                .unwrap_or_else(|| Err(RecognizerError::InferenceFailed("script exhausted".into())))
        }
    }

    fn face(x: f32, y: f32, size: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: size, height: size, confidence }
    }

    struct Harness {
        pipeline: FramePipeline<ScriptedDetector, ScriptedEmbedder>,
        tracker: Arc<PresenceTracker>,
        events: mpsc::UnboundedReceiver<PresenceEvent>,
    }

    fn harness(
        roster_entries: &[(&str, &[f32])],
        detections: Vec<Result<Vec<BoundingBox>, DetectorError>>,
        embeddings: Vec<Result<Vec<f32>, RecognizerError>>,
    ) -> Harness {
        let store = Arc::new(RosterStore::new(Some(3)));
        let mut roster = Roster::new();
        for (id, v) in roster_entries {
            roster.insert(*id, Embedding::normalized(v.to_vec()).unwrap());
        }
        store.replace(roster, 0);

        let (tx, events) = mpsc::unbounded_channel();
        let tracker = Arc::new(PresenceTracker::new(10_000, tx));
        let config = PipelineConfig {
            embedding_dim: Some(3),
            ..PipelineConfig::default()
        };
        let pipeline = FramePipeline::new(
            ScriptedDetector { frames: detections.into() },
            ScriptedEmbedder { outputs: embeddings.into(), crops: Vec::new() },
            CosineMatcher::default(),
            store,
            Arc::clone(&tracker),
            config,
        );
        Harness { pipeline, tracker, events }
    }

    fn frame() -> RgbImage {
        RgbImage::new(640, 480)
    }

    #[test]
    fn test_crop_region_adds_margin() {
        let rect = crop_region(640, 480, &face(100.0, 100.0, 100.0, 0.9), 10).unwrap();
        assert_eq!(rect, CropRect { x: 90, y: 90, width: 120, height: 120 });
    }

    #[test]
    fn test_crop_region_clamps_to_frame() {
        let rect = crop_region(640, 480, &face(-20.0, 430.0, 100.0, 0.9), 10).unwrap();
        assert_eq!(rect, CropRect { x: 0, y: 420, width: 90, height: 60 });
    }

    #[test]
    fn test_crop_region_outside_frame() {
        assert!(crop_region(640, 480, &face(700.0, 10.0, 100.0, 0.9), 10).is_none());
        assert!(crop_region(640, 480, &face(f32::NAN, 10.0, 100.0, 0.9), 10).is_none());
    }

    #[test]
    fn test_match_opens_presence_with_score() {
        let mut h = harness(
            &[("S1", &[1.0, 0.0, 0.0])],
            vec![Ok(vec![face(100.0, 100.0, 120.0, 0.95)])],
            vec![Ok(vec![2.0, 0.0, 0.0])],
        );

        let report = h.pipeline.process_frame(&frame(), 1_234).unwrap();
        assert_eq!(report.opened, vec!["S1".to_string()]);
        let m: Vec<&MatchResult> = report.matches().collect();
        assert_eq!(m.len(), 1);
        assert!((m[0].score - 1.0).abs() < 1e-6);

        match h.events.try_recv().unwrap() {
            PresenceEvent::CheckIn { key, timestamp_ms, confidence } => {
                assert_eq!(key.identity, "S1");
                assert_eq!(timestamp_ms, 1_234);
                assert!((confidence - 1.0).abs() < 1e-6);
            }
            other => panic!("expected check-in, got {other:?}"),
        }
        assert_eq!(h.pipeline.embedder.crops, vec![(140, 140)]);
    }

    #[test]
    fn test_orthogonal_roster_matches_second_identity() {
        let mut h = harness(
            &[("S1", &[1.0, 0.0, 0.0]), ("S2", &[0.0, 1.0, 0.0])],
            vec![Ok(vec![face(100.0, 100.0, 120.0, 0.95)])],
            vec![Ok(vec![0.0, 1.0, 0.0])],
        );
        h.pipeline.process_frame(&frame(), 0).unwrap();
        assert!(h.tracker.is_present("S2"));
        assert!(!h.tracker.is_present("S1"));
    }

    #[test]
    fn test_small_and_weak_faces_are_ignored() {
        let mut h = harness(
            &[("S1", &[1.0, 0.0, 0.0])],
            vec![Ok(vec![
                face(0.0, 0.0, 79.0, 0.99),
                face(200.0, 200.0, 120.0, 0.6),
                face(300.0, 100.0, 80.0, 0.61),
            ])],
            vec![Ok(vec![1.0, 0.0, 0.0])],
        );
        let report = h.pipeline.process_frame(&frame(), 0).unwrap();
        assert_eq!(report.detections, 3);
        assert_eq!(report.regions.len(), 1);
        assert_eq!(h.pipeline.embedder.crops.len(), 1);
    }

    #[test]
    fn test_embed_failure_skips_region_only() {
        let mut h = harness(
            &[("S1", &[1.0, 0.0, 0.0]), ("S2", &[0.0, 1.0, 0.0])],
            vec![Ok(vec![
                face(10.0, 10.0, 100.0, 0.9),
                face(300.0, 10.0, 100.0, 0.8),
                face(10.0, 300.0, 100.0, 0.7),
            ])],
            vec![
                Err(RecognizerError::InferenceFailed("boom".into())),
                Ok(vec![0.0, 0.0, 0.0]),
                Ok(vec![0.0, 1.0, 0.0]),
            ],
        );
        let report = h.pipeline.process_frame(&frame(), 0).unwrap();
        assert!(matches!(
            report.regions[0].outcome,
            RegionOutcome::Skipped(SkipReason::EmbedFailed(_))
        ));
        assert!(matches!(
            report.regions[1].outcome,
            RegionOutcome::Skipped(SkipReason::BadEmbedding(_))
        ));
        assert!(h.tracker.is_present("S2"));

        let stats = h.pipeline.stats().snapshot();
        assert_eq!(stats.faces_considered, 3);
        assert_eq!(stats.regions_skipped, 2);
        assert_eq!(stats.matches, 1);
    }

    #[test]
    fn test_detector_failure_fails_frame_and_next_frame_recovers() {
        let mut h = harness(
            &[("S1", &[1.0, 0.0, 0.0])],
            vec![
                Err(DetectorError::InferenceFailed("bad tensor".into())),
                Ok(vec![face(100.0, 100.0, 100.0, 0.9)]),
            ],
            vec![Ok(vec![1.0, 0.0, 0.0])],
        );
        assert!(h.pipeline.process_frame(&frame(), 0).is_err());
        assert!(h.pipeline.process_frame(&frame(), 33).is_ok());
        assert!(h.tracker.is_present("S1"));

        let stats = h.pipeline.stats().snapshot();
        assert_eq!(stats.frames_failed, 1);
        assert_eq!(stats.frames_processed, 1);
    }

    #[test]
    fn test_empty_frame_is_rejected() {
        let mut h = harness(&[("S1", &[1.0, 0.0, 0.0])], vec![], vec![]);
        let err = h.pipeline.process_frame(&RgbImage::new(0, 0), 0).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyFrame));
    }

    #[test]
    fn test_empty_roster_skips_embedding() {
        let mut h = harness(&[], vec![Ok(vec![face(100.0, 100.0, 100.0, 0.9)])], vec![]);
        let report = h.pipeline.process_frame(&frame(), 0).unwrap();
        assert_eq!(
            report.regions[0].outcome,
            RegionOutcome::Skipped(SkipReason::EmptyRoster)
        );
        assert!(h.pipeline.embedder.crops.is_empty());
    }

    #[test]
    fn test_unknown_face_leaves_tracker_untouched() {
        let mut h = harness(
            &[("S1", &[1.0, 0.0, 0.0])],
            vec![Ok(vec![face(100.0, 100.0, 100.0, 0.9)])],
            vec![Ok(vec![0.0, 0.0, 1.0])],
        );
        let report = h.pipeline.process_frame(&frame(), 0).unwrap();
        assert_eq!(report.regions[0].outcome, RegionOutcome::Unknown);
        assert!(h.tracker.is_empty());
        assert!(h.events.try_recv().is_err());
    }

    #[test]
    fn test_repeat_sightings_refresh_presence() {
        let mut h = harness(
            &[("S1", &[1.0, 0.0, 0.0])],
            vec![
                Ok(vec![face(100.0, 100.0, 100.0, 0.9)]),
                Ok(vec![face(104.0, 100.0, 100.0, 0.9)]),
            ],
            vec![Ok(vec![1.0, 0.0, 0.0]), Ok(vec![0.9, 0.1, 0.0])],
        );
        let first = h.pipeline.process_frame(&frame(), 0).unwrap();
        let second = h.pipeline.process_frame(&frame(), 33).unwrap();
        assert_eq!(first.opened.len(), 1);
        assert!(second.opened.is_empty());
        assert_eq!(h.tracker.get("S1").unwrap().last_seen_ms, 33);
    }
}
