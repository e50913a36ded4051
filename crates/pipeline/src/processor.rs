//! Per-stream frame processor: detection, tracking, recording, annotation.

use crate::alias::AliasAllocator;
use crate::recorder::{FrameRecorder, RecordedFace};
use crate::PipelineError;
use chrono::{DateTime, Local};
use facewatch_core::detector::appearance_feature;
use facewatch_core::tracker::{Detection, FaceTracker};
use facewatch_core::{BoundingBox, FaceDetector, FaceEmbedder, IdentityTag};
use facewatch_store::FaceStore;
use facewatch_stream::Frame;
use std::sync::Arc;

/// Detections below this confidence never reach the tracker as track seeds.
pub const CONFIDENCE_FLOOR: f32 = 0.3;
/// Consecutive hits before a track is trusted enough to record.
pub const TRACKER_N_INIT: u32 = 3;
/// Missed frames a confirmed track survives.
pub const TRACKER_MAX_AGE: u32 = 100;
/// Every Nth fresh frame of a track is persisted.
pub const SAVE_INTERVAL: u32 = 7;
/// Fraction of the box added on each axis when cropping.
pub const CROP_PADDING: f32 = 0.2;

const BOX_KNOWN: [u8; 3] = [0, 220, 0];
const BOX_PENDING: [u8; 3] = [230, 60, 60];

/// Tuning knobs, defaulted to the production constants.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorOptions {
    pub confidence_floor: f32,
    pub n_init: u32,
    pub max_age: u32,
    pub save_interval: u32,
    pub crop_padding: f32,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            confidence_floor: CONFIDENCE_FLOOR,
            n_init: TRACKER_N_INIT,
            max_age: TRACKER_MAX_AGE,
            save_interval: SAVE_INTERVAL,
            crop_padding: CROP_PADDING,
        }
    }
}

/// A box drawn on the processed frame, with its display label.
#[derive(Debug, Clone)]
pub struct TrackAnnotation {
    pub bbox: BoundingBox,
    pub label: String,
}

/// Everything one frame produced.
pub struct FrameReport {
    pub sequence: u64,
    /// The frame with track boxes drawn in.
    pub frame: Frame,
    /// Faces persisted from this frame.
    pub faces: Vec<RecordedFace>,
    pub annotations: Vec<TrackAnnotation>,
    pub active_tracks: usize,
}

pub struct StreamProcessor {
    store: Arc<FaceStore>,
    detector: Arc<dyn FaceDetector>,
    tracker: FaceTracker,
    recorder: FrameRecorder,
    aliases: AliasAllocator,
    owner_id: i64,
    confidence_floor: f32,
}

impl StreamProcessor {
    pub fn new(
        store: Arc<FaceStore>,
        detector: Arc<dyn FaceDetector>,
        embedder: Arc<dyn FaceEmbedder>,
        owner_id: i64,
        opts: ProcessorOptions,
    ) -> Self {
        Self {
            recorder: FrameRecorder::new(
                store.clone(),
                embedder,
                owner_id,
                opts.save_interval,
                opts.crop_padding,
            ),
            store,
            detector,
            tracker: FaceTracker::new(opts.n_init, opts.max_age),
            aliases: AliasAllocator::new(Local::now().date_naive()),
            owner_id,
            confidence_floor: opts.confidence_floor,
        }
    }

    /// Detect, track, record, annotate. Detection failure is non-fatal: the
    /// frame passes through as a zero-detection update so tracks age
    /// normally.
    pub fn process_frame(&mut self, mut frame: Frame, now: DateTime<Local>) -> FrameReport {
        if self.aliases.roll_day(now.date_naive()) {
            self.recorder.reset();
        }

        let boxes = match self.detector.detect(&frame.data, frame.width, frame.height) {
            Ok(boxes) => boxes,
            Err(err) => {
                tracing::warn!(sequence = frame.sequence, error = %err, "detection failed, frame skipped");
                Vec::new()
            }
        };
        let detections: Vec<Detection> = boxes
            .into_iter()
            .filter(|b| b.confidence >= self.confidence_floor)
            .map(|bbox| Detection {
                feature: appearance_feature(&frame.data, frame.width, frame.height, &bbox),
                bbox,
            })
            .collect();

        self.tracker.predict();
        self.tracker.update(&detections);

        let faces = self
            .recorder
            .record(&frame, self.tracker.tracks(), &mut self.aliases, now);

        let mut annotations = Vec::new();
        let mut active_tracks = 0;
        for track in self.tracker.tracks() {
            if !track.is_confirmed() {
                continue;
            }
            active_tracks += 1;
            if track.time_since_update > 1 {
                continue;
            }
            let (label, color) = match self.recorder.tag_for(track.id) {
                Some(tag @ IdentityTag::Named { .. }) => (tag.display_name().to_string(), BOX_KNOWN),
                Some(tag) => (tag.display_name().to_string(), BOX_PENDING),
                None => ("Processing".to_string(), BOX_PENDING),
            };
            frame.draw_box(&track.bbox, color);
            annotations.push(TrackAnnotation {
                bbox: track.bbox,
                label,
            });
        }

        FrameReport {
            sequence: frame.sequence,
            frame,
            faces,
            annotations,
            active_tracks,
        }
    }

    /// Confirm who a placeholder alias is. Renames the stored identities,
    /// retags any live track still carrying the alias, and recycles the
    /// alias for the next unknown face.
    pub fn rename_alias(&mut self, old_alias: &str, name: &str) -> Result<usize, PipelineError> {
        let renamed = self.store.rename_identity(self.owner_id, old_alias, name)?;
        self.recorder.rename(old_alias, name);
        self.aliases.release(old_alias.to_string());
        Ok(renamed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::detector::{LumaBlobDetector, PatchEmbedder};

    const W: u32 = 160;
    const H: u32 = 120;

    fn processor(store: &Arc<FaceStore>, opts: ProcessorOptions) -> StreamProcessor {
        StreamProcessor::new(
            store.clone(),
            Arc::new(LumaBlobDetector::default()),
            Arc::new(PatchEmbedder),
            1,
            opts,
        )
    }

    fn frame_with_square(seq: u64, x0: u32) -> Frame {
        let mut data = vec![10u8; (W * H * 3) as usize];
        for y in 40..72 {
            for x in x0..(x0 + 32).min(W) {
                let idx = ((y * W + x) * 3) as usize;
                data[idx..idx + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        Frame::new(data, W, H, seq).unwrap()
    }

    fn dark_frame(seq: u64) -> Frame {
        Frame::new(vec![10u8; (W * H * 3) as usize], W, H, seq).unwrap()
    }

    #[test]
    fn empty_frame_reports_nothing() {
        let store = Arc::new(FaceStore::open_in_memory().unwrap());
        let mut proc = processor(&store, ProcessorOptions::default());
        let report = proc.process_frame(dark_frame(0), Local::now());
        assert_eq!(report.active_tracks, 0);
        assert!(report.faces.is_empty());
        assert!(report.annotations.is_empty());
    }

    #[test]
    fn face_is_tracked_recorded_and_annotated() {
        let store = Arc::new(FaceStore::open_in_memory().unwrap());
        let opts = ProcessorOptions {
            n_init: 1,
            save_interval: 1,
            ..ProcessorOptions::default()
        };
        let mut proc = processor(&store, opts);

        let report = proc.process_frame(frame_with_square(0, 60), Local::now());
        assert_eq!(report.active_tracks, 1);
        assert_eq!(report.faces.len(), 1);
        assert_eq!(report.faces[0].tag.key(), "unknown_001");
        assert_eq!(report.annotations.len(), 1);
        assert_eq!(report.annotations[0].label, "Processing");

        assert_eq!(store.unconsumed_observations(1).unwrap().len(), 1);
    }

    #[test]
    fn track_survives_motion_with_one_alias() {
        let store = Arc::new(FaceStore::open_in_memory().unwrap());
        let opts = ProcessorOptions {
            n_init: 1,
            ..ProcessorOptions::default()
        };
        let mut proc = processor(&store, opts);

        for seq in 0..10u64 {
            proc.process_frame(frame_with_square(seq, 60 + seq as u32), Local::now());
        }
        // One track, one appearance burst: exactly one observation at the
        // seventh frame, all under the same alias.
        let obs = store.unconsumed_observations(1).unwrap();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].alias, "unknown_001");
    }

    #[test]
    fn concurrent_faces_get_distinct_aliases() {
        let store = Arc::new(FaceStore::open_in_memory().unwrap());
        let opts = ProcessorOptions {
            n_init: 1,
            save_interval: 1,
            ..ProcessorOptions::default()
        };
        let mut proc = processor(&store, opts);

        // Two well-separated bright squares in one frame.
        let mut frame = frame_with_square(0, 10);
        for y in 40..72 {
            for x in 110..142 {
                let idx = ((y * W + x) * 3) as usize;
                frame.data[idx..idx + 3].copy_from_slice(&[255, 255, 255]);
            }
        }

        let report = proc.process_frame(frame, Local::now());
        assert_eq!(report.faces.len(), 2);
        let mut aliases: Vec<&str> = report.faces.iter().map(|f| f.tag.key()).collect();
        aliases.sort_unstable();
        assert_eq!(aliases, vec!["unknown_001", "unknown_002"]);
    }

    #[test]
    fn rename_retags_and_recycles_the_alias() {
        let store = Arc::new(FaceStore::open_in_memory().unwrap());
        let opts = ProcessorOptions {
            n_init: 1,
            save_interval: 1,
            ..ProcessorOptions::default()
        };
        let mut proc = processor(&store, opts);
        let now = Local::now();

        proc.process_frame(frame_with_square(0, 60), now);
        // Seed the canonical identity the rename targets.
        store
            .get_or_create_identity(
                1,
                "unknown_001",
                now.date_naive(),
                &[1],
                &facewatch_core::Embedding::new(vec![0.0]),
                1.0,
                now,
            )
            .unwrap();

        let renamed = proc.rename_alias("unknown_001", "Alice").unwrap();
        assert_eq!(renamed, 1);

        let report = proc.process_frame(frame_with_square(1, 61), now);
        assert_eq!(report.annotations[0].label, "Alice");
    }

    #[test]
    fn detection_failure_is_nonfatal() {
        struct FailingDetector;
        impl FaceDetector for FailingDetector {
            fn detect(
                &self,
                _rgb: &[u8],
                _width: u32,
                _height: u32,
            ) -> Result<Vec<BoundingBox>, facewatch_core::detector::DetectorError> {
                Err(facewatch_core::detector::DetectorError::Detection("model offline".into()))
            }
        }

        let store = Arc::new(FaceStore::open_in_memory().unwrap());
        let mut proc = StreamProcessor::new(
            store,
            Arc::new(FailingDetector),
            Arc::new(PatchEmbedder),
            1,
            ProcessorOptions::default(),
        );
        let report = proc.process_frame(frame_with_square(0, 60), Local::now());
        assert_eq!(report.active_tracks, 0);
    }
}
