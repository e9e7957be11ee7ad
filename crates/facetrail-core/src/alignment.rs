//! Face alignment to the canonical ArcFace 112×112 crop.
//!
//! Fits a 4-DOF similarity transform (scale, rotation, translation) from the
//! five detected landmarks to the InsightFace reference positions in closed
//! form, then warps the frame with bilinear sampling.

use crate::frame::Frame;
use crate::types::BoundingBox;

/// Side of the aligned crop fed to ArcFace.
pub const ALIGNED_SIZE: usize = 112;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// `dst = [a -b; b a] · src + (tx, ty)`
#[derive(Debug, Clone, Copy, PartialEq)]
struct SimilarityTransform {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl SimilarityTransform {
    /// Least-squares fit mapping `src` onto `dst`. `None` if `src` points coincide.
    fn estimate(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Option<Self> {
        let n = src.len().min(dst.len()) as f32;
        if n == 0.0 {
            return None;
        }
        let centroid = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (mx, my) = centroid(src);
        let (nx, ny) = centroid(dst);

        let mut var = 0.0f32;
        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let (sx, sy) = (sx - mx, sy - my);
            let (dx, dy) = (dx - nx, dy - ny);
            var += sx * sx + sy * sy;
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
        }
        if var < 1e-9 {
            return None;
        }

        let a = dot / var;
        let b = cross / var;
        Some(Self {
            a,
            b,
            tx: nx - (a * mx - b * my),
            ty: ny - (b * mx + a * my),
        })
    }

    fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Bilinear sample that reads black outside the frame.
fn sample_or_black(frame: &Frame, x: f32, y: f32) -> f32 {
    let max_x = frame.width as f32 - 1.0;
    let max_y = frame.height as f32 - 1.0;
    if x < 0.0 || y < 0.0 || x > max_x || y > max_y {
        0.0
    } else {
        frame.sample(x, y)
    }
}

/// Warp the landmarked face into a 112×112 crop. Degenerate landmarks yield a black crop.
pub fn align_face(frame: &Frame, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE];
    let Some(inv) = SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS_112)
        .and_then(|t| t.inverse())
    else {
        return out;
    };

    for oy in 0..ALIGNED_SIZE {
        for ox in 0..ALIGNED_SIZE {
            let (sx, sy) = inv.apply(ox as f32, oy as f32);
            out[oy * ALIGNED_SIZE + ox] = sample_or_black(frame, sx, sy).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Resample a plain box (no landmarks) into a 112×112 crop.
pub fn crop_face(frame: &Frame, bbox: &BoundingBox) -> Vec<u8> {
    let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE];
    let sx = bbox.width / ALIGNED_SIZE as f32;
    let sy = bbox.height / ALIGNED_SIZE as f32;
    for oy in 0..ALIGNED_SIZE {
        for ox in 0..ALIGNED_SIZE {
            let x = bbox.x + (ox as f32 + 0.5) * sx - 0.5;
            let y = bbox.y + (oy as f32 + 0.5) * sy - 0.5;
            out[oy * ALIGNED_SIZE + ox] = sample_or_black(frame, x, y).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_estimate() {
        let t = SimilarityTransform::estimate(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_scaled_estimate() {
        let src: Vec<(f32, f32)> = REFERENCE_LANDMARKS_112.iter().map(|&(x, y)| (x * 2.0, y * 2.0)).collect();
        let t = SimilarityTransform::estimate(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 0.5).abs() < 1e-4, "a = {}", t.a);
    }

    #[test]
    fn test_rotation_recovered() {
        // 90° rotation about the origin: (x, y) → (-y, x) ⇒ a = 0, b = 1.
        let src = [(1.0, 0.0), (0.0, 1.0), (-1.0, 0.0), (0.0, -1.0), (2.0, 2.0)];
        let dst: Vec<(f32, f32)> = src.iter().map(|&(x, y)| (-y, x)).collect();
        let t = SimilarityTransform::estimate(&src, &dst).unwrap();
        assert!(t.a.abs() < 1e-5 && (t.b - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = SimilarityTransform { a: 0.8, b: 0.3, tx: 12.0, ty: -4.0 };
        let inv = t.inverse().unwrap();
        let (x, y) = t.apply(17.0, 33.0);
        let (bx, by) = inv.apply(x, y);
        assert!((bx - 17.0).abs() < 1e-3 && (by - 33.0).abs() < 1e-3);
    }

    #[test]
    fn test_degenerate_landmarks() {
        let pts = [(5.0, 5.0); 5];
        assert!(SimilarityTransform::estimate(&pts, &REFERENCE_LANDMARKS_112).is_none());
        let frame = Frame::new(vec![200u8; 64 * 64], 64, 64).unwrap();
        assert!(align_face(&frame, &pts).iter().all(|&p| p == 0));
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let (w, h) = (200usize, 200usize);
        let mut data = vec![0u8; w * h];
        let src: [(f32, f32); 5] = [(80.0, 60.0), (120.0, 60.0), (100.0, 85.0), (85.0, 110.0), (115.0, 110.0)];

        // 5x5 bright patch on the left eye.
        for dy in 0..5 {
            for dx in 0..5 {
                data[(58 + dy) * w + 78 + dx] = 255;
            }
        }
        let frame = Frame::new(data, w as u32, h as u32).unwrap();
        let aligned = align_face(&frame, &src);

        let (rx, ry) = (38usize, 52usize);
        let peak = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned[y * ALIGNED_SIZE + x])
            .max()
            .unwrap();
        assert!(peak > 100, "expected bright patch near reference left eye, max={peak}");
    }

    #[test]
    fn test_crop_face_uniform() {
        let frame = Frame::new(vec![77u8; 300 * 300], 300, 300).unwrap();
        let crop = crop_face(&frame, &BoundingBox::new(50.0, 50.0, 150.0, 150.0));
        assert_eq!(crop.len(), ALIGNED_SIZE * ALIGNED_SIZE);
        assert!(crop.iter().all(|&p| p == 77));
    }
}
