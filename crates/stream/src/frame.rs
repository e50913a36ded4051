//! Frame type and pixel operations: padded crops, JPEG encode, annotation.

use facewatch_core::BoundingBox;
use image::RgbImage;
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("JPEG encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// A captured RGB24 frame.
#[derive(Clone)]
pub struct Frame {
    /// Interleaved RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self, FrameError> {
        let expected = (width * height * 3) as usize;
        if data.len() < expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        })
    }

    /// Crop the bounding box with `padding` (fraction of the box size) added
    /// on each axis, clamped to frame bounds. Returns `None` when the
    /// clamped region is empty.
    pub fn crop_padded(&self, bbox: &BoundingBox, padding: f32) -> Option<RgbImage> {
        let pad_w = padding * bbox.width;
        let pad_h = padding * bbox.height;

        let x1 = (bbox.x - pad_w).max(0.0) as u32;
        let y1 = (bbox.y - pad_h).max(0.0) as u32;
        let x2 = ((bbox.x + bbox.width + pad_w) as u32).min(self.width);
        let y2 = ((bbox.y + bbox.height + pad_h) as u32).min(self.height);

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        let (w, h) = (x2 - x1, y2 - y1);
        let mut crop = RgbImage::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let src = (((y1 + y) * self.width + x1 + x) * 3) as usize;
                crop.put_pixel(
                    x,
                    y,
                    image::Rgb([self.data[src], self.data[src + 1], self.data[src + 2]]),
                );
            }
        }
        Some(crop)
    }

    /// Draw a 2px rectangle outline in-place. Label text is left to the
    /// presentation layer; the report carries the display name alongside.
    pub fn draw_box(&mut self, bbox: &BoundingBox, color: [u8; 3]) {
        let (x1, y1, x2, y2) = bbox.to_tlbr();
        let x1 = (x1.max(0.0) as u32).min(self.width.saturating_sub(1));
        let y1 = (y1.max(0.0) as u32).min(self.height.saturating_sub(1));
        let x2 = (x2.max(0.0) as u32).min(self.width.saturating_sub(1));
        let y2 = (y2.max(0.0) as u32).min(self.height.saturating_sub(1));

        for t in 0..2u32 {
            for x in x1..=x2 {
                self.set_pixel(x, (y1 + t).min(self.height - 1), color);
                self.set_pixel(x, y2.saturating_sub(t), color);
            }
            for y in y1..=y2 {
                self.set_pixel((x1 + t).min(self.width - 1), y, color);
                self.set_pixel(x2.saturating_sub(t), y, color);
            }
        }
    }

    fn set_pixel(&mut self, x: u32, y: u32, color: [u8; 3]) {
        let idx = ((y * self.width + x) * 3) as usize;
        if idx + 2 < self.data.len() {
            self.data[idx..idx + 3].copy_from_slice(&color);
        }
    }
}

/// Encode a crop as JPEG, the compact format observations are stored in.
pub fn encode_jpeg(img: &RgbImage) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img.clone())
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Jpeg)?;
    Ok(buf)
}
