use crate::config::Config;
use crate::render::{PreviewRenderer, PreviewWindow, RenderError, WINDOW_NAME};
use facetrail_core::detector::{DetectorError, DETECTION_CONFIDENCE};
use facetrail_core::gallery::GalleryError;
use facetrail_core::pipeline::PipelineError;
use facetrail_core::recognizer::RecognizerError;
use facetrail_core::{
    Detector, FaceDetector, FaceTracking, FrameSource, Gallery, KcfTracker, OnnxRecognizer, Recognizer,
    Renderer, TrackRegistry, TrackerFactory,
};
use facetrail_hw::{Camera, CameraError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    CameraOpen(#[from] CameraError),
    #[error("frame capture failed: {0}")]
    Capture(#[source] BoxedError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("frame processing failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("render failed: {0}")]
    Render(#[source] BoxedError),
    #[error("renderer setup failed: {0}")]
    RendererSetup(#[from] RenderError),
}

/// Load the recognizer models and encode the gallery directory.
pub fn load_gallery(config: &Config) -> Result<(OnnxRecognizer, Gallery), EngineError> {
    let mut recognizer = OnnxRecognizer::load(
        &config.scrfd_model_path(),
        &config.arcface_model_path(),
        config.match_threshold,
    )?;
    tracing::info!(threshold = recognizer.match_threshold(), "recognizer loaded");

    let gallery = Gallery::load_dir(&config.gallery_dir, &mut recognizer)?;
    Ok((recognizer, gallery))
}

/// Spawn the frame loop on a dedicated OS thread.
///
/// The thread loads both models and the gallery, opens the camera, then
/// processes frames until `stop` is raised or a fatal error occurs. Returns
/// the number of frames processed.
pub fn spawn_engine(config: Config, stop: Arc<AtomicBool>) -> JoinHandle<Result<u64, EngineError>> {
    std::thread::Builder::new()
        .name("facetrail-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let result = run_engine(&config, &stop);
            match &result {
                Ok(frames) => tracing::info!(frames, "engine thread exiting"),
                Err(e) => tracing::error!(error = %e, "engine thread failed"),
            }
            result
        })
        .expect("failed to spawn engine thread")
}

fn run_engine(config: &Config, stop: &Arc<AtomicBool>) -> Result<u64, EngineError> {
    let detector = FaceDetector::load(&config.scrfd_model_path(), DETECTION_CONFIDENCE)?;
    tracing::info!(
        path = %config.scrfd_model_path().display(),
        confidence = detector.confidence_threshold(),
        "SCRFD detector loaded"
    );

    let (recognizer, gallery) = load_gallery(config)?;

    let mut renderer = PreviewRenderer::new(config.preview_path.clone());
    match &config.font_path {
        Some(path) => renderer = renderer.with_font_file(path)?,
        None => tracing::warn!("no font configured; preview will show boxes without labels"),
    }
    if config.window {
        match PreviewWindow::open(WINDOW_NAME, stop.clone()) {
            Ok(window) => renderer = renderer.with_window(window),
            Err(e) => tracing::warn!(error = %e, "cannot open preview window; running headless"),
        }
    }

    let registry = TrackRegistry::new(KcfTracker::new).with_policy(config.association);
    let mut tracking = FaceTracking::new(detector, recognizer, registry, gallery);

    let mut camera = Camera::open(&config.camera_device)?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        format = ?camera.pixel_format(),
        policy = ?tracking.registry().policy(),
        "camera opened; tracking"
    );

    run_loop(&mut camera, &mut tracking, &mut renderer, stop)
}

/// Capture, process and render frames until `stop` is observed after a render.
///
/// `stop` is raised by Ctrl-C or by the renderer when the quit key is pressed.
///
/// Each frame's capture timestamp is the clock for detection, dwell and
/// staleness. Any capture, processing or render error ends the loop.
pub fn run_loop<S, D, R, F, W>(
    source: &mut S,
    tracking: &mut FaceTracking<D, R, F>,
    renderer: &mut W,
    stop: &AtomicBool,
) -> Result<u64, EngineError>
where
    S: FrameSource,
    D: Detector,
    R: Recognizer,
    F: TrackerFactory,
    W: Renderer,
{
    let mut frames = 0u64;
    loop {
        let frame = source
            .next_frame()
            .map_err(|e| EngineError::Capture(Box::new(e)))?;
        let report = tracking.process(&frame, frame.timestamp)?;

        if !report.created.is_empty() || !report.evicted.is_empty() {
            tracing::debug!(
                frame = report.frame_number,
                created = ?report.created,
                evicted = ?report.evicted,
                live = tracking.registry().len(),
                "tracks changed"
            );
        }

        renderer
            .render(&frame, &report)
            .map_err(|e| EngineError::Render(Box::new(e)))?;
        frames += 1;

        if stop.load(Ordering::Relaxed) {
            tracing::info!(frames, "stop requested");
            return Ok(frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facetrail_core::{
        BoundingBox, Embedding, Frame, FrameReport, GalleryEntry, MatchResult, Matcher, NearestMatcher,
        TrackId, VisualTracker,
    };
    use std::time::{Duration, Instant};

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct FakeError(&'static str);

    /// Yields frames 33 ms apart, then fails.
    struct FakeCamera {
        remaining: usize,
        next_at: Instant,
    }

    impl FrameSource for FakeCamera {
        type Error = FakeError;

        fn next_frame(&mut self) -> Result<Frame, FakeError> {
            if self.remaining == 0 {
                return Err(FakeError("device unplugged"));
            }
            self.remaining -= 1;
            let mut frame = Frame::new(vec![0u8; 64 * 48], 64, 48).map_err(|_| FakeError("frame"))?;
            frame.timestamp = self.next_at;
            self.next_at += Duration::from_millis(33);
            Ok(frame)
        }
    }

    struct OneFace;

    impl Detector for OneFace {
        type Error = FakeError;

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>, FakeError> {
            Ok(vec![BoundingBox::new(10.0, 10.0, 20.0, 20.0)])
        }
    }

    /// Always sees alice inside the detected box.
    struct AliceRecognizer;

    impl Recognizer for AliceRecognizer {
        type Error = FakeError;

        fn locate(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>, FakeError> {
            Ok(vec![BoundingBox::new(12.0, 12.0, 16.0, 16.0)])
        }

        fn encode(&mut self, _frame: &Frame, boxes: &[BoundingBox]) -> Result<Vec<Embedding>, FakeError> {
            Ok(boxes.iter().map(|_| Embedding::new(vec![1.0, 0.0])).collect())
        }

        fn best_match(&self, gallery: &[GalleryEntry], probe: &Embedding) -> MatchResult {
            NearestMatcher.compare(probe, gallery, 0.5)
        }
    }

    struct StillTracker(Option<BoundingBox>);

    impl VisualTracker for StillTracker {
        fn init(&mut self, _frame: &Frame, bbox: &BoundingBox) {
            self.0 = Some(bbox.clone());
        }

        fn update(&mut self, _frame: &Frame) -> Option<BoundingBox> {
            self.0.clone()
        }
    }

    /// Records reports; raises `stop` after `stop_after` renders.
    struct RecordingRenderer<'a> {
        reports: Vec<FrameReport>,
        stop: &'a AtomicBool,
        stop_after: usize,
        fail: bool,
    }

    impl Renderer for RecordingRenderer<'_> {
        type Error = FakeError;

        fn render(&mut self, _frame: &Frame, report: &FrameReport) -> Result<(), FakeError> {
            if self.fail {
                return Err(FakeError("display gone"));
            }
            self.reports.push(report.clone());
            if self.reports.len() >= self.stop_after {
                self.stop.store(true, Ordering::Relaxed);
            }
            Ok(())
        }
    }

    fn tracking() -> FaceTracking<OneFace, AliceRecognizer, impl FnMut() -> StillTracker> {
        let gallery = Gallery::new(vec![GalleryEntry {
            label: "alice".into(),
            embedding: Embedding::new(vec![1.0, 0.0]),
        }]);
        FaceTracking::new(OneFace, AliceRecognizer, TrackRegistry::new(|| StillTracker(None)), gallery)
    }

    fn camera(frames: usize) -> FakeCamera {
        FakeCamera {
            remaining: frames,
            next_at: Instant::now(),
        }
    }

    #[test]
    fn test_stop_checked_after_render() {
        let stop = AtomicBool::new(false);
        let mut renderer = RecordingRenderer { reports: Vec::new(), stop: &stop, stop_after: 7, fail: false };
        let frames = run_loop(&mut camera(100), &mut tracking(), &mut renderer, &stop).unwrap();
        assert_eq!(frames, 7);
        assert_eq!(renderer.reports.len(), 7);
    }

    #[test]
    fn test_stop_already_raised_still_renders_one_frame() {
        let stop = AtomicBool::new(true);
        let mut renderer = RecordingRenderer { reports: Vec::new(), stop: &stop, stop_after: usize::MAX, fail: false };
        let frames = run_loop(&mut camera(100), &mut tracking(), &mut renderer, &stop).unwrap();
        assert_eq!(frames, 1);
    }

    #[test]
    fn test_labelled_track_dwell_uses_frame_clock() {
        let stop = AtomicBool::new(false);
        let mut renderer = RecordingRenderer { reports: Vec::new(), stop: &stop, stop_after: 35, fail: false };
        run_loop(&mut camera(100), &mut tracking(), &mut renderer, &stop).unwrap();

        // Track 1 created on frame 5; frame 35 is 30 frames (990 ms) later.
        let last = renderer.reports.last().unwrap();
        assert_eq!(last.frame_number, 35);
        let face = &last.faces[0];
        assert_eq!(face.label, "alice");
        assert_eq!(face.tracks.len(), 1);
        assert_eq!(face.tracks[0].id, TrackId(1));
        assert_eq!(face.tracks[0].dwell, Duration::from_millis(990));
        assert!(renderer.reports.iter().all(|r| r.evicted.is_empty()));
    }

    #[test]
    fn test_camera_failure_is_fatal() {
        let stop = AtomicBool::new(false);
        let mut renderer = RecordingRenderer { reports: Vec::new(), stop: &stop, stop_after: usize::MAX, fail: false };
        let err = run_loop(&mut camera(3), &mut tracking(), &mut renderer, &stop).unwrap_err();
        assert!(matches!(err, EngineError::Capture(_)));
        assert_eq!(renderer.reports.len(), 3);
    }

    #[test]
    fn test_renderer_setup_error_message() {
        let err = EngineError::from(RenderError::InvalidFrame { width: 4, height: 3 });
        assert!(matches!(err, EngineError::RendererSetup(_)));
        assert!(err.to_string().starts_with("renderer setup failed"));
    }

    #[test]
    fn test_render_failure_is_fatal() {
        let stop = AtomicBool::new(false);
        let mut renderer = RecordingRenderer { reports: Vec::new(), stop: &stop, stop_after: usize::MAX, fail: true };
        let err = run_loop(&mut camera(10), &mut tracking(), &mut renderer, &stop).unwrap_err();
        assert!(matches!(err, EngineError::Render(_)));
    }

    #[test]
    fn test_unknown_face_outside_gallery() {
        let stop = AtomicBool::new(false);
        let mut renderer = RecordingRenderer { reports: Vec::new(), stop: &stop, stop_after: 1, fail: false };
        let mut tracking = FaceTracking::new(
            OneFace,
            AliceRecognizer,
            TrackRegistry::new(|| StillTracker(None)),
            Gallery::default(),
        );
        run_loop(&mut camera(10), &mut tracking, &mut renderer, &stop).unwrap();
        let labels: Vec<&str> = renderer.reports[0].faces.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels, vec![facetrail_core::UNKNOWN_LABEL]);
    }
}
