//! Annotated preview output.
//!
//! Draws a green box around every recognized face with its label above it,
//! and a yellow `ID:<id> <name> Time:<secs>s` line above each track the face
//! falls in. The result is shown in a live OpenCV window and, when
//! configured, also overwrites a preview image on disk each frame.

use ab_glyph::{FontVec, PxScale};
use facetrail_core::{Frame, FrameReport, Renderer};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use opencv::core::{self, Mat, Scalar};
use opencv::prelude::*;
use opencv::{highgui, imgproc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub const WINDOW_NAME: &str = "facetrail";
const ESC_KEY: i32 = 27;

const FACE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const TRACK_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const BOX_THICKNESS: i32 = 2;
const TEXT_SCALE: f32 = 16.0;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("cannot read font {path}: {source}")]
    FontRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid font {path}: {source}")]
    Font {
        path: PathBuf,
        source: ab_glyph::InvalidFont,
    },
    #[error("frame buffer does not match {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },
    #[error("cannot write preview {path}: {source}")]
    Save {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("display error: {0}")]
    Display(#[from] opencv::Error),
}

/// `q`, `Q` or Esc as returned by `highgui::wait_key`.
pub fn is_quit_key(key: i32) -> bool {
    if key < 0 {
        return false;
    }
    let key = key & 0xFF;
    key == 'q' as i32 || key == 'Q' as i32 || key == ESC_KEY
}

/// Live preview window. Raises `stop` when the quit key is pressed.
pub struct PreviewWindow {
    name: String,
    stop: Arc<AtomicBool>,
}

impl PreviewWindow {
    pub fn open(name: &str, stop: Arc<AtomicBool>) -> Result<Self, RenderError> {
        highgui::named_window(name, highgui::WINDOW_AUTOSIZE)?;
        Ok(Self {
            name: name.to_string(),
            stop,
        })
    }

    /// Show `image`, then poll the keyboard once.
    fn show(&self, image: &RgbImage) -> Result<(), RenderError> {
        let mat = rgb_to_bgr_mat(image)?;
        highgui::imshow(&self.name, &mat)?;
        let key = highgui::wait_key(1)?;
        if is_quit_key(key) {
            tracing::info!(key, "quit key pressed");
            self.stop.store(true, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl Drop for PreviewWindow {
    fn drop(&mut self) {
        if let Err(e) = highgui::destroy_window(&self.name) {
            tracing::debug!(error = %e, "destroy_window failed");
        }
    }
}

/// BGR copy of an RGB image, as `highgui::imshow` expects.
pub fn rgb_to_bgr_mat(image: &RgbImage) -> opencv::Result<Mat> {
    let (width, height) = image.dimensions();
    let mut rgb = Mat::new_rows_cols_with_default(height as i32, width as i32, core::CV_8UC3, Scalar::all(0.0))?;
    rgb.data_bytes_mut()?.copy_from_slice(image.as_raw());

    let mut bgr = Mat::default();
    imgproc::cvt_color(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR, 0)?;
    Ok(bgr)
}

/// Shows annotated frames in `window` and writes them to `output`, each when set.
/// Text needs a font.
pub struct PreviewRenderer {
    window: Option<PreviewWindow>,
    output: Option<PathBuf>,
    font: Option<FontVec>,
}

impl PreviewRenderer {
    pub fn new(output: Option<PathBuf>) -> Self {
        Self {
            window: None,
            output,
            font: None,
        }
    }

    pub fn with_window(mut self, window: PreviewWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_font_file(mut self, path: &Path) -> Result<Self, RenderError> {
        let bytes = std::fs::read(path).map_err(|source| RenderError::FontRead {
            path: path.to_path_buf(),
            source,
        })?;
        let font = FontVec::try_from_vec(bytes).map_err(|source| RenderError::Font {
            path: path.to_path_buf(),
            source,
        })?;
        self.font = Some(font);
        Ok(self)
    }

    /// RGB copy of `frame` with the report's faces and tracks drawn on it.
    pub fn annotate(&self, frame: &Frame, report: &FrameReport) -> Result<RgbImage, RenderError> {
        let gray = frame.to_gray_image().ok_or(RenderError::InvalidFrame {
            width: frame.width,
            height: frame.height,
        })?;
        let mut canvas = image::DynamicImage::ImageLuma8(gray).to_rgb8();

        for face in &report.faces {
            let (x, y) = (face.bbox.x.round() as i32, face.bbox.y.round() as i32);
            draw_box(&mut canvas, x, y, face.bbox.width, face.bbox.height);
            self.draw_label(&mut canvas, LABEL_COLOR, x, y - TEXT_SCALE as i32 - 2, &face.label);

            for track in &face.tracks {
                let line = format!("ID:{} {} Time:{}s", track.id, face.label, track.dwell.as_secs());
                let (tx, ty) = (track.bbox.x.round() as i32, track.bbox.y.round() as i32);
                self.draw_label(&mut canvas, TRACK_COLOR, tx, ty - 2 * TEXT_SCALE as i32 - 4, &line);
            }
        }

        Ok(canvas)
    }

    fn draw_label(&self, canvas: &mut RgbImage, color: Rgb<u8>, x: i32, y: i32, text: &str) {
        if let Some(font) = &self.font {
            draw_text_mut(canvas, color, x, y, PxScale::from(TEXT_SCALE), font, text);
        }
    }
}

fn draw_box(canvas: &mut RgbImage, x: i32, y: i32, width: f32, height: f32) {
    let (w, h) = (width.round().max(1.0) as u32, height.round().max(1.0) as u32);
    for offset in 0..BOX_THICKNESS {
        let rect = Rect::at(x - offset, y - offset).of_size(w + 2 * offset as u32, h + 2 * offset as u32);
        draw_hollow_rect_mut(canvas, rect, FACE_COLOR);
    }
}

impl Renderer for PreviewRenderer {
    type Error = RenderError;

    fn render(&mut self, frame: &Frame, report: &FrameReport) -> Result<(), RenderError> {
        for face in &report.faces {
            tracing::trace!(label = %face.label, distance = face.distance, tracks = face.tracks.len(), "face");
        }

        if self.window.is_none() && self.output.is_none() {
            return Ok(());
        }
        let image = self.annotate(frame, report)?;

        if let Some(path) = &self.output {
            image.save(path).map_err(|source| RenderError::Save {
                path: path.clone(),
                source,
            })?;
        }
        if let Some(window) = &self.window {
            window.show(&image)?;
        }
        Ok(())
    }
}
