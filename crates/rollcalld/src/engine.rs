use crate::config::Config;
use crate::tasks::now_ms;
use rollcall_core::{
    ArcFaceEmbedder, CosineMatcher, FaceDetector, FaceEmbedder, FramePipeline, Matcher,
    PipelineConfig, PipelineStats, PresenceTracker, RosterStore, SsdDetector,
};
use rollcall_hw::{Camera, CameraError, Frame, FrameStream};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Pause after a failed capture before asking the camera again.
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] rollcall_core::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] rollcall_core::RecognizerError),
    #[error("failed to spawn frame thread: {0}")]
    Spawn(std::io::Error),
    #[error("frame thread exited during startup")]
    ThreadExited,
    #[error("frame thread panicked")]
    ThreadPanicked,
}

/// Anything that yields camera frames one at a time.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

impl FrameSource for FrameStream<'_> {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        FrameStream::next_frame(self)
    }
}

/// Counters for one run of the frame loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameLoopSummary {
    pub frames: u64,
    pub dark_skipped: u64,
    pub capture_errors: u64,
    pub pipeline_errors: u64,
}

/// Pull frames from `source` through `pipeline` until `shutdown` turns true.
///
/// Capture and pipeline failures are logged and counted; they never end
/// the loop.
pub fn run_frame_loop<S, D, E, M>(
    source: &mut S,
    pipeline: &mut FramePipeline<D, E, M>,
    shutdown: &watch::Receiver<bool>,
    frame_interval: Duration,
) -> FrameLoopSummary
where
    S: FrameSource,
    D: FaceDetector,
    E: FaceEmbedder,
    M: Matcher,
{
    let mut summary = FrameLoopSummary::default();
    let mut consecutive_errors = 0u32;

    while !*shutdown.borrow() {
        let frame = match source.next_frame() {
            Ok(frame) => {
                consecutive_errors = 0;
                frame
            }
            Err(err) => {
                summary.capture_errors += 1;
                consecutive_errors += 1;
                tracing::warn!(error = %err, consecutive = consecutive_errors, "frame capture failed");
                std::thread::sleep(CAPTURE_RETRY_DELAY);
                continue;
            }
        };
        summary.frames += 1;

        if frame.is_dark {
            summary.dark_skipped += 1;
            tracing::debug!(sequence = frame.sequence, "dark frame skipped");
        } else {
            match pipeline.process_frame(&frame.image, now_ms()) {
                Ok(report) => {
                    if !report.opened.is_empty() {
                        tracing::debug!(opened = ?report.opened, sequence = frame.sequence, "new presences");
                    }
                }
                Err(err) => {
                    summary.pipeline_errors += 1;
                    tracing::warn!(error = %err, sequence = frame.sequence, "frame skipped");
                }
            }
        }

        if !frame_interval.is_zero() {
            std::thread::sleep(frame_interval);
        }
    }

    summary
}

/// Handle to the running frame thread.
pub struct FrameLoop {
    thread: std::thread::JoinHandle<FrameLoopSummary>,
    stats: Arc<PipelineStats>,
}

impl FrameLoop {
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Block until the thread exits. Call after signalling shutdown.
    pub fn join(self) -> Result<FrameLoopSummary, EngineError> {
        self.thread.join().map_err(|_| EngineError::ThreadPanicked)
    }
}

/// Load both models, open the camera and start the frame loop on a
/// dedicated OS thread.
///
/// Returns only once the camera is streaming, so any missing model or
/// unusable camera fails startup.
pub fn spawn_frame_loop(
    config: &Config,
    roster: Arc<RosterStore>,
    tracker: Arc<PresenceTracker>,
    shutdown: watch::Receiver<bool>,
) -> Result<FrameLoop, EngineError> {
    let detector = SsdDetector::load(&config.detector_model_path())?;
    let embedder = ArcFaceEmbedder::load(&config.embedder_model_path(), config.embedding_dim)?;
    let matcher = CosineMatcher::new(config.similarity_threshold);
    let pipeline_config = PipelineConfig {
        detection_threshold: config.detection_threshold,
        min_face_size: config.min_face_size,
        crop_margin: config.crop_margin,
        embedding_dim: Some(config.embedding_dim),
    };
    let mut pipeline = FramePipeline::new(detector, embedder, matcher, roster, tracker, pipeline_config);
    let stats = pipeline.stats();

    let device = config.camera_device.clone();
    let (width, height) = (config.frame_width, config.frame_height);
    let frame_interval = config.frame_interval();
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), CameraError>>(1);

    let thread = std::thread::Builder::new()
        .name("rollcall-frames".into())
        .spawn(move || {
            let camera = match Camera::open(&device, width, height) {
                Ok(camera) => camera,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return FrameLoopSummary::default();
                }
            };
            let mut stream = match camera.stream() {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return FrameLoopSummary::default();
                }
            };
            let _ = ready_tx.send(Ok(()));

            tracing::info!(
                device = %device,
                width = camera.width,
                height = camera.height,
                format = ?camera.pixel_format(),
                "frame loop started"
            );
            let summary = run_frame_loop(&mut stream, &mut pipeline, &shutdown, frame_interval);

            drop(stream);
            drop(camera);
            tracing::info!(
                frames = summary.frames,
                dark_skipped = summary.dark_skipped,
                capture_errors = summary.capture_errors,
                pipeline_errors = summary.pipeline_errors,
                "frame loop stopped; camera released"
            );
            summary
        })
        .map_err(EngineError::Spawn)?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(FrameLoop { thread, stats }),
        Ok(Err(err)) => {
            let _ = thread.join();
            Err(err.into())
        }
        Err(_) => {
            let _ = thread.join();
            Err(EngineError::ThreadExited)
        }
    }
}
