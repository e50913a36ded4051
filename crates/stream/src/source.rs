//! Frame sources.
//!
//! [`FrameSource`] is the blocking read seam the ingestion thread drives.
//! [`ImageSequenceSource`] replays a directory of still images, the
//! primary offline source for the CLI and integration tests.
//! [`SyntheticSource`] generates frames with a bright moving square, enough
//! to exercise the full pipeline without any capture hardware.

use crate::frame::Frame;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to open source: {0}")]
    Open(String),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// Blocking frame source. `Ok(None)` signals end of stream.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<Option<Frame>, SourceError>;
}

/// Replays the images in a directory, sorted by file name.
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| SourceError::Open(format!("{}: {e}", dir.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("jpg") | Some("jpeg") | Some("png")
                )
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(SourceError::Open(format!(
                "no images found in {}",
                dir.display()
            )));
        }

        tracing::info!(dir = %dir.display(), frames = paths.len(), "image sequence opened");
        Ok(Self { paths, next: 0 })
    }
}

impl FrameSource for ImageSequenceSource {
    fn read(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(None);
        };
        let rgb = image::open(path)?.to_rgb8();
        let sequence = self.next as u64;
        self.next += 1;

        let (width, height) = rgb.dimensions();
        Ok(Some(
            Frame::new(rgb.into_raw(), width, height, sequence)
                .map_err(|e| SourceError::Open(e.to_string()))?,
        ))
    }
}

/// Generates `total` dark frames with a bright square drifting across them.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    total: u64,
    emitted: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, total: u64) -> Self {
        Self {
            width,
            height,
            total,
            emitted: 0,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn read(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.emitted >= self.total {
            return Ok(None);
        }
        let seq = self.emitted;
        self.emitted += 1;

        let mut data = vec![10u8; (self.width * self.height * 3) as usize];
        let size = (self.width / 5).max(8);
        // Drift one pixel per frame so the tracker sees continuous motion.
        let x0 = ((self.width / 4) + (seq as u32 % (self.width / 2).max(1)))
            .min(self.width.saturating_sub(size));
        let y0 = self.height / 3;

        for y in y0..(y0 + size).min(self.height) {
            for x in x0..(x0 + size).min(self.width) {
                let idx = ((y * self.width + x) * 3) as usize;
                data[idx] = 255;
                data[idx + 1] = 250;
                data[idx + 2] = 245;
            }
        }

        Ok(Some(Frame::new(data, self.width, self.height, seq).map_err(
            |e| SourceError::Open(e.to_string()),
        )?))
    }
}
