//! Detection and embedding seams.
//!
//! The actual face-detection and identity-embedding models are external to
//! this system; they plug in behind [`FaceDetector`] and [`FaceEmbedder`].
//! The built-in [`LumaBlobDetector`] and [`PatchEmbedder`] are model-free
//! stand-ins for demos and integration tests: they exercise every pipeline
//! path with deterministic output but carry none of a real model's accuracy.

use crate::types::{BoundingBox, Embedding};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detection failed: {0}")]
    Detection(String),
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("frame buffer too short: expected {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },
}

/// External face-detection model: RGB24 frame in, zero or more boxes out.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// External identity-embedding model: RGB24 face crop in, embedding out.
///
/// Distinct from the per-frame appearance feature: this is the vector that
/// identity matching runs on.
pub trait FaceEmbedder: Send + Sync {
    fn embed(&self, rgb: &[u8], width: u32, height: u32) -> Result<Embedding, DetectorError>;
}

/// ITU-R BT.601 luma from an RGB pixel.
fn luma(r: u8, g: u8, b: u8) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

fn check_len(rgb: &[u8], width: u32, height: u32) -> Result<(), DetectorError> {
    let expected = (width * height * 3) as usize;
    if rgb.len() < expected {
        return Err(DetectorError::BufferTooShort {
            expected,
            actual: rgb.len(),
        });
    }
    Ok(())
}

/// Downsample the RGB region `(x0, y0, w, h)` to a `size`×`size` grayscale
/// patch via box averaging, returned row-major as f32 in [0, 255].
pub fn downsample_gray(
    rgb: &[u8],
    width: u32,
    height: u32,
    region: (u32, u32, u32, u32),
    size: u32,
) -> Vec<f32> {
    let (x0, y0, rw, rh) = region;
    let mut out = Vec::with_capacity((size * size) as usize);
    if rw == 0 || rh == 0 {
        out.resize((size * size) as usize, 0.0);
        return out;
    }

    for ty in 0..size {
        for tx in 0..size {
            let sx0 = x0 + tx * rw / size;
            let sx1 = (x0 + (tx + 1) * rw / size).max(sx0 + 1).min(width);
            let sy0 = y0 + ty * rh / size;
            let sy1 = (y0 + (ty + 1) * rh / size).max(sy0 + 1).min(height);

            let mut sum = 0.0f32;
            let mut count = 0u32;
            for y in sy0..sy1 {
                for x in sx0..sx1 {
                    let idx = ((y * width + x) * 3) as usize;
                    if idx + 2 < rgb.len() {
                        sum += luma(rgb[idx], rgb[idx + 1], rgb[idx + 2]);
                        count += 1;
                    }
                }
            }
            out.push(if count > 0 { sum / count as f32 } else { 0.0 });
        }
    }
    out
}

/// Per-frame appearance feature for tracker association: the detection's
/// crop downsampled to 32×32 grayscale and L2-normalized.
pub fn appearance_feature(rgb: &[u8], width: u32, height: u32, bbox: &BoundingBox) -> Vec<f32> {
    let x0 = (bbox.x.max(0.0) as u32).min(width.saturating_sub(1));
    let y0 = (bbox.y.max(0.0) as u32).min(height.saturating_sub(1));
    let w = (bbox.width.max(1.0) as u32).min(width - x0);
    let h = (bbox.height.max(1.0) as u32).min(height - y0);

    let mut feat = downsample_gray(rgb, width, height, (x0, y0, w, h), 32);
    let norm: f32 = feat.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut feat {
            *v /= norm;
        }
    }
    feat
}

/// Cosine similarity between two L2-normalized feature vectors.
pub fn feature_similarity(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

// Downscale target for the blob detector's threshold mask. Keeps the BFS
// cheap on high-resolution frames.
const BLOB_MASK_MAX_DIM: u32 = 160;
const BLOB_MIN_CELLS: usize = 4;

/// Bright-blob detector: thresholds luma on a downscaled mask and returns
/// the bounding box of each connected bright component.
pub struct LumaBlobDetector {
    pub threshold: f32,
}

impl Default for LumaBlobDetector {
    fn default() -> Self {
        Self { threshold: 200.0 }
    }
}

impl FaceDetector for LumaBlobDetector {
    fn detect(&self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<BoundingBox>, DetectorError> {
        check_len(rgb, width, height)?;

        let scale = (width.max(height)).div_ceil(BLOB_MASK_MAX_DIM).max(1);
        let mw = (width / scale).max(1) as usize;
        let mh = (height / scale).max(1) as usize;

        // Threshold mask sampled at cell centers.
        let mut mask = vec![false; mw * mh];
        for my in 0..mh {
            for mx in 0..mw {
                let x = (mx as u32 * scale + scale / 2).min(width - 1);
                let y = (my as u32 * scale + scale / 2).min(height - 1);
                let idx = ((y * width + x) * 3) as usize;
                mask[my * mw + mx] = luma(rgb[idx], rgb[idx + 1], rgb[idx + 2]) >= self.threshold;
            }
        }

        let mut visited = vec![false; mw * mh];
        let mut boxes = Vec::new();

        for start in 0..mask.len() {
            if !mask[start] || visited[start] {
                continue;
            }
            // BFS over the 4-connected component.
            let mut queue = std::collections::VecDeque::from([start]);
            visited[start] = true;
            let (mut min_x, mut min_y, mut max_x, mut max_y) =
                (mw - 1, mh - 1, 0usize, 0usize);
            let mut cells = 0usize;

            while let Some(idx) = queue.pop_front() {
                let (cx, cy) = (idx % mw, idx / mw);
                min_x = min_x.min(cx);
                max_x = max_x.max(cx);
                min_y = min_y.min(cy);
                max_y = max_y.max(cy);
                cells += 1;

                let mut push = |nx: usize, ny: usize| {
                    let nidx = ny * mw + nx;
                    if mask[nidx] && !visited[nidx] {
                        visited[nidx] = true;
                        queue.push_back(nidx);
                    }
                };
                if cx > 0 {
                    push(cx - 1, cy);
                }
                if cx + 1 < mw {
                    push(cx + 1, cy);
                }
                if cy > 0 {
                    push(cx, cy - 1);
                }
                if cy + 1 < mh {
                    push(cx, cy + 1);
                }
            }

            if cells < BLOB_MIN_CELLS {
                continue;
            }

            let area = (max_x - min_x + 1) * (max_y - min_y + 1);
            let fill = cells as f32 / area as f32;
            boxes.push(BoundingBox {
                x: (min_x as u32 * scale) as f32,
                y: (min_y as u32 * scale) as f32,
                width: ((max_x - min_x + 1) as u32 * scale) as f32,
                height: ((max_y - min_y + 1) as u32 * scale) as f32,
                confidence: fill.clamp(0.0, 1.0),
            });
        }

        Ok(boxes)
    }
}

const PATCH_EMBED_SIZE: u32 = 16;

/// Pixel-patch embedder: the crop downsampled to 16×16 grayscale and
/// L2-normalized. 256-dimensional.
pub struct PatchEmbedder;

impl FaceEmbedder for PatchEmbedder {
    fn embed(&self, rgb: &[u8], width: u32, height: u32) -> Result<Embedding, DetectorError> {
        check_len(rgb, width, height)?;

        let mut values =
            downsample_gray(rgb, width, height, (0, 0, width, height), PATCH_EMBED_SIZE);
        let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut values {
                *v /= norm;
            }
        }
        Ok(Embedding::new(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Solid-color frame with a bright rectangle painted at (x, y, w, h).
    fn frame_with_blob(width: u32, height: u32, blob: (u32, u32, u32, u32)) -> Vec<u8> {
        let mut rgb = vec![10u8; (width * height * 3) as usize];
        let (bx, by, bw, bh) = blob;
        for y in by..(by + bh).min(height) {
            for x in bx..(bx + bw).min(width) {
                let idx = ((y * width + x) * 3) as usize;
                rgb[idx] = 255;
                rgb[idx + 1] = 255;
                rgb[idx + 2] = 255;
            }
        }
        rgb
    }

    #[test]
    fn blob_detector_finds_bright_region() {
        let rgb = frame_with_blob(160, 120, (40, 30, 32, 32));
        let boxes = LumaBlobDetector::default().detect(&rgb, 160, 120).unwrap();
        assert_eq!(boxes.len(), 1);
        let b = &boxes[0];
        assert!((b.x - 40.0).abs() <= 2.0, "x = {}", b.x);
        assert!((b.y - 30.0).abs() <= 2.0, "y = {}", b.y);
        assert!((b.width - 32.0).abs() <= 3.0, "width = {}", b.width);
    }

    #[test]
    fn blob_detector_empty_frame() {
        let rgb = vec![10u8; 160 * 120 * 3];
        let boxes = LumaBlobDetector::default().detect(&rgb, 160, 120).unwrap();
        assert!(boxes.is_empty());
    }

    #[test]
    fn blob_detector_two_separate_blobs() {
        let mut rgb = frame_with_blob(160, 120, (10, 10, 24, 24));
        let second = frame_with_blob(160, 120, (100, 80, 24, 24));
        for (dst, src) in rgb.iter_mut().zip(second.iter()) {
            *dst = (*dst).max(*src);
        }
        let boxes = LumaBlobDetector::default().detect(&rgb, 160, 120).unwrap();
        assert_eq!(boxes.len(), 2);
    }

    #[test]
    fn blob_detector_rejects_short_buffer() {
        let rgb = vec![0u8; 10];
        assert!(LumaBlobDetector::default().detect(&rgb, 160, 120).is_err());
    }

    #[test]
    fn patch_embedder_is_normalized() {
        let rgb = frame_with_blob(64, 64, (10, 10, 20, 20));
        let emb = PatchEmbedder.embed(&rgb, 64, 64).unwrap();
        assert_eq!(emb.values.len(), 256);
        let norm: f32 = emb.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn patch_embedder_similar_crops_are_close() {
        let a = frame_with_blob(64, 64, (10, 10, 20, 20));
        let b = frame_with_blob(64, 64, (11, 10, 20, 20));
        let c = frame_with_blob(64, 64, (40, 40, 10, 10));

        let ea = PatchEmbedder.embed(&a, 64, 64).unwrap();
        let eb = PatchEmbedder.embed(&b, 64, 64).unwrap();
        let ec = PatchEmbedder.embed(&c, 64, 64).unwrap();

        assert!(ea.euclidean_distance(&eb) < ea.euclidean_distance(&ec));
    }

    #[test]
    fn appearance_feature_is_unit_length() {
        let rgb = frame_with_blob(64, 64, (0, 0, 64, 64));
        let bbox = BoundingBox { x: 8.0, y: 8.0, width: 32.0, height: 32.0, confidence: 1.0 };
        let feat = appearance_feature(&rgb, 64, 64, &bbox);
        assert_eq!(feat.len(), 32 * 32);
        let norm: f32 = feat.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn feature_similarity_of_identical_features() {
        let rgb = frame_with_blob(64, 64, (10, 10, 30, 30));
        let bbox = BoundingBox { x: 10.0, y: 10.0, width: 30.0, height: 30.0, confidence: 1.0 };
        let feat = appearance_feature(&rgb, 64, 64, &bbox);
        assert!((feature_similarity(&feat, &feat) - 1.0).abs() < 1e-4);
    }
}
