//! Exemplar quality scoring for consolidation.
//!
//! Each stored observation is scored as `blur - angle / 10`: sharpness is
//! the variance of a Laplacian edge response (higher = sharper), and the
//! angle term penalizes crops where the face sits off-center or is missing
//! entirely. Consolidation keeps the highest-scoring observation per alias.

use crate::detector::{DetectorError, FaceDetector};
use image::GrayImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QualityError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
}

/// Worst angle score: no face found in the crop.
pub const WORST_ANGLE: f64 = 180.0;

/// Sharpness as the variance of a 4-neighbor Laplacian response.
pub fn blur_score(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let mut responses = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = gray.get_pixel(x, y).0[0] as f64;
            let up = gray.get_pixel(x, y - 1).0[0] as f64;
            let down = gray.get_pixel(x, y + 1).0[0] as f64;
            let left = gray.get_pixel(x - 1, y).0[0] as f64;
            let right = gray.get_pixel(x + 1, y).0[0] as f64;
            responses.push(4.0 * c - up - down - left - right);
        }
    }

    let n = responses.len() as f64;
    let mean = responses.iter().sum::<f64>() / n;
    responses.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n
}

/// Off-axis penalty in degrees: 0 for a face centered in the crop, up to
/// [`WORST_ANGLE`] when the detector finds no face at all.
pub fn angle_score(
    rgb: &[u8],
    width: u32,
    height: u32,
    detector: &dyn FaceDetector,
) -> Result<f64, DetectorError> {
    let faces = detector.detect(rgb, width, height)?;
    let Some(face) = faces.first() else {
        return Ok(WORST_ANGLE);
    };

    let cx = (face.x + face.width / 2.0) as f64;
    let cy = (face.y + face.height / 2.0) as f64;
    let dx = cx - width as f64 / 2.0;
    let dy = cy - height as f64 / 2.0;
    Ok(dy.atan2(dx).to_degrees().abs())
}

/// Decode a stored JPEG observation and produce its combined quality score.
pub fn score_jpeg(jpeg: &[u8], detector: &dyn FaceDetector) -> Result<f64, QualityError> {
    let img = image::load_from_memory(jpeg)?;
    let rgb = img.to_rgb8();
    let gray = img.to_luma8();

    let blur = blur_score(&gray);
    let angle = angle_score(rgb.as_raw(), rgb.width(), rgb.height(), detector)?;
    Ok(blur - angle / 10.0)
}
