//! facetrail-core: face tracking and identification engine.
//!
//! Runs SCRFD detection every few frames, keeps faces alive between
//! detections with per-track OpenCV KCF trackers, and labels them with ArcFace
//! embeddings matched against a gallery of known faces. Inference runs on the
//! CPU via ONNX Runtime.

pub mod alignment;
pub mod capability;
pub mod detector;
pub mod frame;
pub mod gallery;
pub mod kcf_tracker;
pub mod pipeline;
pub mod recognizer;
pub mod registry;
pub mod types;

pub use capability::{Detector, FrameSource, Recognizer, Renderer, TrackerFactory, VisualTracker};
pub use detector::FaceDetector;
pub use frame::Frame;
pub use gallery::Gallery;
pub use kcf_tracker::KcfTracker;
pub use pipeline::{FaceTracking, FrameReport, RecognizedFace, TrackedIdentity};
pub use recognizer::{FaceEncoder, OnnxRecognizer};
pub use registry::{AssociationPolicy, CurrentFaces, TrackId, TrackRegistry};
pub use types::{BoundingBox, Embedding, GalleryEntry, MatchResult, Matcher, NearestMatcher, UNKNOWN_LABEL};
