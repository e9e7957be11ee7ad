//! Per-frame orchestration: detection cadence, registry update, recognition and
//! the spatial join between recognized faces and tracks.

use crate::capability::{Detector, Recognizer, TrackerFactory};
use crate::frame::Frame;
use crate::gallery::Gallery;
use crate::registry::{CurrentFaces, TrackId, TrackRegistry};
use crate::types::BoundingBox;
use std::time::{Duration, Instant};
use thiserror::Error;

/// The detector runs on every frame whose 1-based number is a multiple of this.
pub const DETECTION_INTERVAL: u64 = 5;

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector: {0}")]
    Detector(#[source] BoxedError),
    #[error("recognizer: {0}")]
    Recognizer(#[source] BoxedError),
    #[error("recognizer returned {embeddings} encodings for {boxes} faces")]
    EncodingMismatch { boxes: usize, embeddings: usize },
}

/// A track whose current box contains a recognized face's top-left corner.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedIdentity {
    pub id: TrackId,
    pub bbox: BoundingBox,
    /// Time since the track was created.
    pub dwell: Duration,
}

/// One face from the recognition pass, joined to the tracks it falls in.
#[derive(Debug, Clone)]
pub struct RecognizedFace {
    pub bbox: BoundingBox,
    pub label: String,
    pub distance: f32,
    pub tracks: Vec<TrackedIdentity>,
}

/// Everything the renderer needs about one processed frame.
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    /// 1-based frame number.
    pub frame_number: u64,
    /// Whether the periodic detector ran on this frame.
    pub detected: bool,
    pub current: CurrentFaces,
    pub created: Vec<TrackId>,
    pub evicted: Vec<TrackId>,
    pub faces: Vec<RecognizedFace>,
}

/// Frame-loop state: collaborators, the track registry and the frame counter.
pub struct FaceTracking<D, R, F: TrackerFactory> {
    detector: D,
    recognizer: R,
    registry: TrackRegistry<F>,
    gallery: Gallery,
    detection_interval: u64,
    frame_count: u64,
}

impl<D, R, F> FaceTracking<D, R, F>
where
    D: Detector,
    R: Recognizer,
    F: TrackerFactory,
{
    pub fn new(detector: D, recognizer: R, registry: TrackRegistry<F>, gallery: Gallery) -> Self {
        Self {
            detector,
            recognizer,
            registry,
            gallery,
            detection_interval: DETECTION_INTERVAL,
            frame_count: 0,
        }
    }

    pub fn with_detection_interval(mut self, interval: u64) -> Self {
        self.detection_interval = interval.max(1);
        self
    }

    pub fn registry(&self) -> &TrackRegistry<F> {
        &self.registry
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Run one frame through detection (on cadence), tracking, eviction and recognition.
    pub fn process(&mut self, frame: &Frame, now: Instant) -> Result<FrameReport, PipelineError> {
        self.frame_count += 1;
        let detected = self.frame_count % self.detection_interval == 0;

        let mut current = CurrentFaces::new();
        let mut created = Vec::new();

        if detected {
            let detections = self
                .detector
                .detect(frame)
                .map_err(|e| PipelineError::Detector(Box::new(e)))?;
            tracing::debug!(frame = self.frame_count, detections = detections.len(), "detector ran");
            created = self.registry.on_detections(frame, &detections, now, &mut current);
        }

        self.registry.advance_all(frame, now, &mut current);
        let evicted = self.registry.evict_stale(&current, now);
        let faces = self.recognize(frame, &current, now)?;

        Ok(FrameReport {
            frame_number: self.frame_count,
            detected,
            current,
            created,
            evicted,
            faces,
        })
    }

    /// Independent recognition pass; each face is joined to every track whose
    /// current box contains the face's top-left corner.
    fn recognize(
        &mut self,
        frame: &Frame,
        current: &CurrentFaces,
        now: Instant,
    ) -> Result<Vec<RecognizedFace>, PipelineError> {
        let recognizer_err = |e: R::Error| PipelineError::Recognizer(Box::new(e));

        let boxes = self.recognizer.locate(frame).map_err(recognizer_err)?;
        if boxes.is_empty() {
            return Ok(Vec::new());
        }
        let embeddings = self.recognizer.encode(frame, &boxes).map_err(recognizer_err)?;
        if embeddings.len() != boxes.len() {
            return Err(PipelineError::EncodingMismatch {
                boxes: boxes.len(),
                embeddings: embeddings.len(),
            });
        }

        let faces = boxes
            .into_iter()
            .zip(embeddings)
            .map(|(bbox, embedding)| {
                let matched = self.gallery.identify(&self.recognizer, &embedding);
                let tracks = current
                    .iter()
                    .filter(|(_, tb)| tb.contains_point(bbox.x, bbox.y))
                    .filter_map(|(&id, tb)| {
                        self.registry.dwell(id, now).map(|dwell| TrackedIdentity {
                            id,
                            bbox: tb.clone(),
                            dwell,
                        })
                    })
                    .collect();

                RecognizedFace {
                    bbox,
                    label: matched.label,
                    distance: matched.distance,
                    tracks,
                }
            })
            .collect();

        Ok(faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::VisualTracker;
    use crate::types::{Embedding, GalleryEntry, MatchResult, Matcher, NearestMatcher, UNKNOWN_LABEL};
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Debug, Error)]
    #[error("fake failure")]
    struct FakeError;

    /// Returns the same boxes every time it runs; counts calls.
    struct FakeDetector {
        boxes: Vec<BoundingBox>,
        calls: Rc<Cell<usize>>,
        fail: bool,
    }

    impl Detector for FakeDetector {
        type Error = FakeError;

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>, FakeError> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                Err(FakeError)
            } else {
                Ok(self.boxes.clone())
            }
        }
    }

    /// Replays queued per-frame results: (box, embedding) pairs.
    struct FakeRecognizer {
        frames: VecDeque<Vec<(BoundingBox, Vec<f32>)>>,
        pending: Vec<Vec<f32>>,
    }

    impl Recognizer for FakeRecognizer {
        type Error = FakeError;

        fn locate(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>, FakeError> {
            let faces = self.frames.pop_front().unwrap_or_default();
            self.pending = faces.iter().map(|(_, v)| v.clone()).collect();
            Ok(faces.into_iter().map(|(b, _)| b).collect())
        }

        fn encode(&mut self, _frame: &Frame, _boxes: &[BoundingBox]) -> Result<Vec<Embedding>, FakeError> {
            Ok(self.pending.drain(..).map(Embedding::new).collect())
        }

        fn best_match(&self, gallery: &[GalleryEntry], probe: &Embedding) -> MatchResult {
            NearestMatcher.compare(probe, gallery, 0.5)
        }
    }

    /// Follows a shared target position; `None` means lost.
    struct SharedTracker {
        target: Rc<RefCell<Option<BoundingBox>>>,
    }

    impl VisualTracker for SharedTracker {
        fn init(&mut self, _frame: &Frame, bbox: &BoundingBox) {
            *self.target.borrow_mut() = Some(bbox.clone());
        }

        fn update(&mut self, _frame: &Frame) -> Option<BoundingBox> {
            self.target.borrow().clone()
        }
    }

    fn gallery() -> Gallery {
        Gallery::new(vec![
            GalleryEntry { label: "alice".into(), embedding: Embedding::new(vec![1.0, 0.0]) },
            GalleryEntry { label: "bob".into(), embedding: Embedding::new(vec![0.0, 1.0]) },
        ])
    }

    fn frame() -> Frame {
        Frame::new(vec![0u8; 4], 2, 2).unwrap()
    }

    struct Harness {
        calls: Rc<Cell<usize>>,
        target: Rc<RefCell<Option<BoundingBox>>>,
    }

    fn build(
        detections: Vec<BoundingBox>,
        recognized: Vec<Vec<(BoundingBox, Vec<f32>)>>,
        fail_detector: bool,
    ) -> (FaceTracking<FakeDetector, FakeRecognizer, impl FnMut() -> SharedTracker>, Harness) {
        let calls = Rc::new(Cell::new(0));
        let target = Rc::new(RefCell::new(None));
        let shared = target.clone();
        let registry = TrackRegistry::new(move || SharedTracker { target: shared.clone() });
        let tracking = FaceTracking::new(
            FakeDetector { boxes: detections, calls: calls.clone(), fail: fail_detector },
            FakeRecognizer { frames: recognized.into(), pending: Vec::new() },
            registry,
            gallery(),
        );
        (tracking, Harness { calls, target })
    }

    #[test]
    fn test_detector_runs_every_fifth_frame() {
        let (mut tracking, h) = build(vec![], vec![], false);
        let now = Instant::now();
        let mut detected_frames = Vec::new();
        for _ in 0..12 {
            let report = tracking.process(&frame(), now).unwrap();
            if report.detected {
                detected_frames.push(report.frame_number);
            }
        }
        assert_eq!(detected_frames, vec![5, 10]);
        assert_eq!(h.calls.get(), 2);
    }

    #[test]
    fn test_recognized_face_joined_to_track_with_dwell() {
        let a = BoundingBox::new(10.0, 10.0, 50.0, 50.0);
        let mut recognized = vec![Vec::new(); 5];
        recognized.push(vec![(BoundingBox::new(15.0, 12.0, 40.0, 40.0), vec![0.95, 0.05])]);
        let (mut tracking, h) = build(vec![a.clone()], recognized, false);

        let t0 = Instant::now();
        for i in 0..5 {
            tracking.process(&frame(), t0 + Duration::from_millis(i * 33)).unwrap();
        }
        assert_eq!(tracking.registry().len(), 1);
        let created_at = t0 + Duration::from_millis(4 * 33);

        // Frame 6: tracker moves the face; recognizer sees it.
        *h.target.borrow_mut() = Some(BoundingBox::new(12.0, 10.0, 50.0, 50.0));
        let now = created_at + Duration::from_secs(2);
        let report = tracking.process(&frame(), now).unwrap();

        assert!(!report.detected);
        assert_eq!(report.faces.len(), 1);
        let face = &report.faces[0];
        assert_eq!(face.label, "alice");
        assert_eq!(face.tracks.len(), 1);
        assert_eq!(face.tracks[0].id, TrackId(1));
        assert_eq!(face.tracks[0].dwell, Duration::from_secs(2));
        assert_eq!(face.tracks[0].bbox, BoundingBox::new(12.0, 10.0, 50.0, 50.0));
    }

    #[test]
    fn test_face_outside_tracks_is_unassociated_and_unknown() {
        let mut recognized = vec![Vec::new(); 4];
        recognized.push(vec![(BoundingBox::new(300.0, 300.0, 40.0, 40.0), vec![-1.0, -1.0])]);
        let (mut tracking, _h) = build(vec![BoundingBox::new(10.0, 10.0, 50.0, 50.0)], recognized, false);

        let now = Instant::now();
        let mut last = FrameReport::default();
        for _ in 0..5 {
            last = tracking.process(&frame(), now).unwrap();
        }
        assert_eq!(last.created, vec![TrackId(1)]);
        assert_eq!(last.faces.len(), 1);
        assert_eq!(last.faces[0].label, UNKNOWN_LABEL);
        assert!(last.faces[0].tracks.is_empty());
    }

    #[test]
    fn test_lost_track_evicted_after_grace() {
        let (mut tracking, h) = build(vec![BoundingBox::new(10.0, 10.0, 50.0, 50.0)], vec![], false);
        let t0 = Instant::now();
        for _ in 0..5 {
            tracking.process(&frame(), t0).unwrap();
        }
        assert_eq!(tracking.registry().len(), 1);

        *h.target.borrow_mut() = None;
        let report = tracking.process(&frame(), t0 + Duration::from_millis(500)).unwrap();
        assert!(report.evicted.is_empty());
        assert!(report.current.is_empty());

        let report = tracking.process(&frame(), t0 + Duration::from_millis(1500)).unwrap();
        assert_eq!(report.evicted, vec![TrackId(1)]);
        assert!(tracking.registry().is_empty());
    }

    #[test]
    fn test_detector_error_propagates() {
        let (mut tracking, _h) = build(vec![], vec![], true);
        let now = Instant::now();
        for _ in 0..4 {
            tracking.process(&frame(), now).unwrap();
        }
        let err = tracking.process(&frame(), now).unwrap_err();
        assert!(matches!(err, PipelineError::Detector(_)));
    }

    #[test]
    fn test_custom_detection_interval() {
        let (tracking, h) = build(vec![], vec![], false);
        let mut tracking = tracking.with_detection_interval(1);
        for _ in 0..3 {
            tracking.process(&frame(), Instant::now()).unwrap();
        }
        assert_eq!(h.calls.get(), 3);
        assert_eq!(tracking.frame_count(), 3);
    }
}
