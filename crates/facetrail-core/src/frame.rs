//! Grayscale frame buffer shared by the detector, trackers and recognizer.

use image::GrayImage;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// A captured 8-bit grayscale frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes, row-major).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl Frame {
    /// Wrap a grayscale buffer, checking that it covers `width * height` pixels.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence: 0,
        })
    }

    pub fn from_gray_image(image: GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            timestamp: Instant::now(),
            sequence: 0,
        }
    }

    pub fn to_gray_image(&self) -> Option<GrayImage> {
        GrayImage::from_raw(self.width, self.height, self.data.clone())
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width as usize + x]
    }

    /// Bilinear sample at a sub-pixel position, clamped to the frame edges.
    pub fn sample(&self, x: f32, y: f32) -> f32 {
        let w = self.width as usize;
        let h = self.height as usize;
        if w == 0 || h == 0 {
            return 0.0;
        }

        let x = x.clamp(0.0, (w - 1) as f32);
        let y = y.clamp(0.0, (h - 1) as f32);
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(w - 1);
        let y1 = (y0 + 1).min(h - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let tl = self.pixel(x0, y0) as f32;
        let tr = self.pixel(x1, y0) as f32;
        let bl = self.pixel(x0, y1) as f32;
        let br = self.pixel(x1, y1) as f32;

        tl * (1.0 - fx) * (1.0 - fy) + tr * fx * (1.0 - fy) + bl * (1.0 - fx) * fy + br * fx * fy
    }

    /// Resize to `new_w × new_h` with pixel-center-aligned bilinear interpolation.
    pub fn resize_bilinear(&self, new_w: usize, new_h: usize) -> Vec<u8> {
        let mut out = vec![0u8; new_w * new_h];
        if new_w == 0 || new_h == 0 || self.data.is_empty() {
            return out;
        }

        let sx = self.width as f32 / new_w as f32;
        let sy = self.height as f32 / new_h as f32;
        for y in 0..new_h {
            let src_y = (y as f32 + 0.5) * sy - 0.5;
            for x in 0..new_w {
                let src_x = (x as f32 + 0.5) * sx - 0.5;
                out[y * new_w + x] = self.sample(src_x, src_y).round().clamp(0.0, 255.0) as u8;
            }
        }
        out
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}
