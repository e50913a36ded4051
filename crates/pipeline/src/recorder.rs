//! Frame-entry recorder.
//!
//! Watches the tracker's confirmed tracks and persists a padded face crop
//! every `save_interval`-th frame a track stays fresh. After a save the
//! track is suppressed until it goes stale (missed more than one frame), so
//! one appearance of a face yields one burst of observations, not one per
//! frame. Recording is at-most-once: an embed or store failure drops that
//! observation with a warning and the stream moves on.

use crate::alias::AliasAllocator;
use chrono::{DateTime, Local};
use facewatch_core::tracker::Track;
use facewatch_core::{BoundingBox, FaceEmbedder, IdentityTag};
use facewatch_store::{FaceStore, NewObservation};
use facewatch_stream::frame::{encode_jpeg, Frame};
use std::collections::HashMap;
use std::sync::Arc;

/// Display format for detection times, e.g. "03:41 PM".
pub const LAST_SEEN_FMT: &str = "%I:%M %p";

struct TrackLedger {
    tag: IdentityTag,
    frames_seen: u32,
    suppressed: bool,
}

/// One newly persisted face, surfaced in the frame report.
#[derive(Debug, Clone)]
pub struct RecordedFace {
    pub tag: IdentityTag,
    pub last_seen: String,
    /// JPEG bytes of the padded crop, identical to what was stored.
    pub image: Vec<u8>,
    pub bbox: BoundingBox,
}

pub struct FrameRecorder {
    store: Arc<FaceStore>,
    embedder: Arc<dyn FaceEmbedder>,
    owner_id: i64,
    save_interval: u32,
    crop_padding: f32,
    ledger: HashMap<u32, TrackLedger>,
}

impl FrameRecorder {
    pub fn new(
        store: Arc<FaceStore>,
        embedder: Arc<dyn FaceEmbedder>,
        owner_id: i64,
        save_interval: u32,
        crop_padding: f32,
    ) -> Self {
        Self {
            store,
            embedder,
            owner_id,
            save_interval: save_interval.max(1),
            crop_padding,
            ledger: HashMap::new(),
        }
    }

    /// Run the recorder over this frame's tracks. Returns the faces
    /// persisted from this frame.
    pub fn record(
        &mut self,
        frame: &Frame,
        tracks: &[Track],
        aliases: &mut AliasAllocator,
        now: DateTime<Local>,
    ) -> Vec<RecordedFace> {
        let mut recorded = Vec::new();

        for track in tracks {
            if !track.is_confirmed() {
                continue;
            }

            // Stale track: lift suppression so the next appearance records
            // again, but persist nothing from a predicted-only box.
            if track.time_since_update > 1 {
                if let Some(entry) = self.ledger.get_mut(&track.id) {
                    entry.suppressed = false;
                }
                continue;
            }

            let entry = self.ledger.entry(track.id).or_insert_with(|| {
                let alias = aliases.next();
                tracing::debug!(track_id = track.id, alias = %alias, "alias assigned");
                TrackLedger {
                    tag: IdentityTag::Pending { alias },
                    frames_seen: 0,
                    suppressed: false,
                }
            });

            if entry.suppressed {
                continue;
            }
            entry.frames_seen += 1;
            if entry.frames_seen % self.save_interval != 0 {
                continue;
            }
            // Clone the tag out so the ledger borrow ends before persisting.
            let tag = entry.tag.clone();

            match self.persist(frame, track, &tag, now) {
                Ok(Some(face)) => {
                    if let Some(entry) = self.ledger.get_mut(&track.id) {
                        entry.suppressed = true;
                    }
                    recorded.push(face);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        track_id = track.id,
                        alias = tag.key(),
                        error = %err,
                        "observation dropped"
                    );
                }
            }
        }

        // Forget tracks the tracker has deleted.
        self.ledger.retain(|id, _| tracks.iter().any(|t| t.id == *id));
        recorded
    }

    /// Crop, encode, embed, and store one observation. `Ok(None)` means the
    /// padded box clamped to nothing.
    fn persist(
        &self,
        frame: &Frame,
        track: &Track,
        tag: &IdentityTag,
        now: DateTime<Local>,
    ) -> Result<Option<RecordedFace>, crate::PipelineError> {
        let Some(crop) = frame.crop_padded(&track.bbox, self.crop_padding) else {
            return Ok(None);
        };
        let image = encode_jpeg(&crop)?;
        let embedding = self.embedder.embed(crop.as_raw(), crop.width(), crop.height())?;

        self.store.insert_observation(&NewObservation {
            owner_id: self.owner_id,
            alias: tag.key().to_string(),
            image: image.clone(),
            embedding,
            captured_at: now,
        })?;
        tracing::debug!(
            track_id = track.id,
            alias = tag.key(),
            bytes = image.len(),
            "observation stored"
        );

        Ok(Some(RecordedFace {
            tag: tag.clone(),
            last_seen: now.format(LAST_SEEN_FMT).to_string(),
            image,
            bbox: track.bbox,
        }))
    }

    /// Identity tag currently carried by a track, if the recorder has
    /// touched it.
    pub fn tag_for(&self, track_id: u32) -> Option<&IdentityTag> {
        self.ledger.get(&track_id).map(|e| &e.tag)
    }

    /// Point live tracks carrying `old_alias` at the confirmed name.
    pub fn rename(&mut self, old_alias: &str, name: &str) {
        for entry in self.ledger.values_mut() {
            if entry.tag.key() == old_alias {
                entry.tag = IdentityTag::Named {
                    name: name.to_string(),
                };
            }
        }
    }

    /// Drop all per-track state. Called on alias-namespace rollover.
    pub fn reset(&mut self) {
        self.ledger.clear();
    }
}
