//! rollcall-core: face recognition and presence tracking for attendance.
//!
//! Matches face embeddings against an enrolled roster and turns the match
//! stream into per-identity attendance sessions. Detection and embedding
//! run through ONNX Runtime behind the [`FaceDetector`] and
//! [`FaceEmbedder`] capability traits.

pub mod detector;
pub mod matcher;
pub mod pipeline;
pub mod presence;
pub mod recognizer;
pub mod roster;
pub mod types;

pub use detector::{DetectorError, FaceDetector, SsdDetector};
pub use matcher::{CosineMatcher, Matcher, DEFAULT_SIMILARITY_THRESHOLD};
pub use pipeline::{
    FramePipeline, FrameReport, PipelineConfig, PipelineError, PipelineStats, PipelineStatsSnapshot,
};
pub use presence::{
    PresenceEvent, PresenceRecord, PresenceTracker, SessionKey, SyncState, Transition,
    DEFAULT_PRESENCE_TIMEOUT_MS,
};
pub use recognizer::{ArcFaceEmbedder, FaceEmbedder, RecognizerError};
pub use roster::{RawRoster, Roster, RosterError, RosterSource, RosterStore};
pub use types::{BoundingBox, Embedding, EmbeddingError, MatchResult};
