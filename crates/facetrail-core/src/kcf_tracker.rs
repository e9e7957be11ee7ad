//! OpenCV KCF (Kernelized Correlation Filter) tracker behind [`VisualTracker`].
//!
//! Each track owns one `TrackerKCF`. Frames are widened from grayscale to
//! BGR before they reach OpenCV, and boxes are clipped to the frame so the
//! tracker is never seeded with a region outside the image.

use crate::capability::VisualTracker;
use crate::frame::Frame;
use crate::types::BoundingBox;
use opencv::core::{self, Mat, Ptr, Rect, Scalar};
use opencv::imgproc;
use opencv::prelude::*;
use opencv::tracking::{TrackerKCF, TrackerKCF_Params};

/// Single-target KCF tracker. Unseeded until [`VisualTracker::init`] succeeds.
#[derive(Default)]
pub struct KcfTracker {
    inner: Option<Ptr<TrackerKCF>>,
}

impl KcfTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_seeded(&self) -> bool {
        self.inner.is_some()
    }
}

fn create_kcf_tracker(image: &Mat, rect: Rect) -> opencv::Result<Ptr<TrackerKCF>> {
    let params = TrackerKCF_Params::default()?;
    let mut tracker = TrackerKCF::create(params)?;
    tracker.init(image, rect)?;
    Ok(tracker)
}

impl VisualTracker for KcfTracker {
    fn init(&mut self, frame: &Frame, bbox: &BoundingBox) {
        self.inner = None;
        let Some(rect) = to_rect(bbox, frame.width, frame.height) else {
            tracing::debug!(x = bbox.x, y = bbox.y, "box outside frame; tracker not seeded");
            return;
        };
        match frame_to_bgr_mat(frame).and_then(|image| create_kcf_tracker(&image, rect)) {
            Ok(tracker) => self.inner = Some(tracker),
            Err(e) => tracing::warn!(error = %e, "KCF tracker init failed"),
        }
    }

    fn update(&mut self, frame: &Frame) -> Option<BoundingBox> {
        let tracker = self.inner.as_mut()?;
        let image = match frame_to_bgr_mat(frame) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(error = %e, "cannot convert frame for tracking");
                return None;
            }
        };

        let mut rect = Rect::default();
        match tracker.update(&image, &mut rect) {
            Ok(true) => Some(BoundingBox::new(
                rect.x as f32,
                rect.y as f32,
                rect.width as f32,
                rect.height as f32,
            )),
            Ok(false) => None,
            Err(e) => {
                tracing::trace!(error = %e, "KCF update failed");
                None
            }
        }
    }
}

/// Three-channel BGR copy of a grayscale frame.
pub fn frame_to_bgr_mat(frame: &Frame) -> opencv::Result<Mat> {
    let mut gray = Mat::new_rows_cols_with_default(
        frame.height as i32,
        frame.width as i32,
        core::CV_8UC1,
        Scalar::all(0.0),
    )?;
    let bytes = gray.data_bytes_mut()?;
    if bytes.len() != frame.data.len() {
        return Err(opencv::Error::new(
            core::StsUnmatchedSizes,
            format!("frame holds {} bytes, expected {}", frame.data.len(), bytes.len()),
        ));
    }
    bytes.copy_from_slice(&frame.data);

    let mut bgr = Mat::default();
    imgproc::cvt_color(&gray, &mut bgr, imgproc::COLOR_GRAY2BGR, 0)?;
    Ok(bgr)
}

/// Integer rect of `bbox` clipped to a `width × height` frame; `None` when nothing is left.
pub fn to_rect(bbox: &BoundingBox, width: u32, height: u32) -> Option<Rect> {
    let x1 = bbox.x.round().clamp(0.0, width as f32) as i32;
    let y1 = bbox.y.round().clamp(0.0, height as f32) as i32;
    let x2 = bbox.right().round().clamp(0.0, width as f32) as i32;
    let y2 = bbox.bottom().round().clamp(0.0, height as f32) as i32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(Rect::new(x1, y1, x2 - x1, y2 - y1))
}
