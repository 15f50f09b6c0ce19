//! facetrack-core — Embedding store, face matching and attendance tracking.
//!
//! Face detection and embedding extraction are supplied by an external
//! [`FaceDetector`]; this crate owns everything downstream of the embedding:
//! persistence, nearest-neighbour matching and the presence state machine.

pub mod detector;
pub mod store;
pub mod tracker;
pub mod types;

pub use detector::{DetectedFace, DetectorError, FaceDetector};
pub use store::{EmbeddingInfo, EmbeddingStore, EmployeeRecord, StoreError, DEFAULT_MIN_FACES};
pub use tracker::{
    AttendanceEvent, AttendanceTracker, EventType, PresenceState, PresenceStatus, TrackerConfig,
};
pub use types::{BoundingBox, CosineMatcher, Embedding, Gallery, GalleryEntry, MatchResult, Matcher};
