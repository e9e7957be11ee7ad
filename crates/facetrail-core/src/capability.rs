//! Collaborator contracts consumed by the track registry and the frame loop.
//!
//! Each vision capability is a black box behind a small trait so that the
//! frame loop can run against ONNX models and a V4L2 camera in production
//! and against scripted fakes in tests.

use crate::frame::Frame;
use crate::pipeline::FrameReport;
use crate::types::{BoundingBox, Embedding, GalleryEntry, MatchResult};

/// Heavyweight face detector, run only on every Nth frame.
pub trait Detector {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Face boxes above the detector's confidence threshold.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, Self::Error>;
}

/// Short-term single-target visual tracker.
pub trait VisualTracker {
    /// Seed the tracker with the target's box in `frame`.
    fn init(&mut self, frame: &Frame, bbox: &BoundingBox);

    /// Advance one step. `None` means the target is no longer trackable.
    fn update(&mut self, frame: &Frame) -> Option<BoundingBox>;
}

/// Produces a fresh, unseeded tracker for every new track.
pub trait TrackerFactory {
    type Tracker: VisualTracker;

    fn create(&mut self) -> Self::Tracker;
}

impl<F, T> TrackerFactory for F
where
    F: FnMut() -> T,
    T: VisualTracker,
{
    type Tracker = T;

    fn create(&mut self) -> T {
        self()
    }
}

/// Identity recognizer: locates faces, encodes them and matches against a gallery.
pub trait Recognizer {
    type Error: std::error::Error + Send + Sync + 'static;

    fn locate(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, Self::Error>;

    /// One embedding per box, in the same order.
    fn encode(&mut self, frame: &Frame, boxes: &[BoundingBox]) -> Result<Vec<Embedding>, Self::Error>;

    fn best_match(&self, gallery: &[GalleryEntry], probe: &Embedding) -> MatchResult;
}

/// Supplies frames until the device fails.
pub trait FrameSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn next_frame(&mut self) -> Result<Frame, Self::Error>;
}

/// Draws a frame's annotations and presents it.
pub trait Renderer {
    type Error: std::error::Error + Send + Sync + 'static;

    fn render(&mut self, frame: &Frame, report: &FrameReport) -> Result<(), Self::Error>;
}
