//! Multi-object face tracker.
//!
//! Two-stage association strategy: high-confidence detections are matched
//! first, then low-confidence detections fill remaining unmatched tracks,
//! so existing tracks survive momentary confidence drops without weak
//! detections spawning spurious tracks. Association blends bounding-box IoU
//! with appearance-feature similarity, which keeps identities apart when
//! boxes cross.
//!
//! Per-track state machine: tentative until `n_init` consecutive hits,
//! then confirmed; a tentative track dies on its first miss, a confirmed
//! track survives up to `max_age` missed frames. Deletion is owned here;
//! consumers only ever read [`FaceTracker::tracks`].

use crate::detector::feature_similarity;
use crate::types::BoundingBox;

/// Per-frame tracker input: a detection plus its appearance feature.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub feature: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Tentative,
    Confirmed,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u32,
    pub state: TrackState,
    pub bbox: BoundingBox,
    /// Frames since this track last matched a detection.
    pub time_since_update: u32,
    hits: u32,
    feature: Vec<f32>,
}

impl Track {
    pub fn is_confirmed(&self) -> bool {
        self.state == TrackState::Confirmed
    }
}

const HIGH_CONF: f32 = 0.5;
const ASSOC_THRESHOLD: f32 = 0.3;
const IOU_WEIGHT: f32 = 0.5;

pub struct FaceTracker {
    tracks: Vec<Track>,
    next_id: u32,
    n_init: u32,
    max_age: u32,
}

impl FaceTracker {
    pub fn new(n_init: u32, max_age: u32) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            n_init: n_init.max(1),
            max_age,
        }
    }

    /// Age every track by one frame. Call once per frame, before [`update`](Self::update).
    pub fn predict(&mut self) {
        for track in &mut self.tracks {
            track.time_since_update += 1;
        }
    }

    /// Associate this frame's detections with existing tracks.
    pub fn update(&mut self, detections: &[Detection]) {
        let (high, low): (Vec<usize>, Vec<usize>) = (0..detections.len())
            .partition(|&i| detections[i].bbox.confidence >= HIGH_CONF);

        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_matched = vec![false; detections.len()];

        self.associate(detections, &high, &mut track_matched, &mut det_matched);
        self.associate(detections, &low, &mut track_matched, &mut det_matched);

        // Unmatched high-confidence detections start new tracks. With
        // n_init of 1 there is no probation and the track is born confirmed.
        let initial_state = if self.n_init <= 1 {
            TrackState::Confirmed
        } else {
            TrackState::Tentative
        };
        for &di in &high {
            if !det_matched[di] {
                tracing::debug!(
                    track_id = self.next_id,
                    confidence = detections[di].bbox.confidence,
                    "track created"
                );
                self.tracks.push(Track {
                    id: self.next_id,
                    state: initial_state,
                    bbox: detections[di].bbox,
                    time_since_update: 0,
                    hits: 1,
                    feature: detections[di].feature.clone(),
                });
                self.next_id += 1;
            }
        }

        // Missed tracks: tentative ones die immediately, confirmed ones age out.
        for (i, track) in self.tracks.iter_mut().enumerate() {
            if i < track_matched.len() && track_matched[i] {
                continue;
            }
            match track.state {
                TrackState::Tentative if track.time_since_update > 0 => {
                    track.state = TrackState::Deleted;
                }
                TrackState::Confirmed if track.time_since_update > self.max_age => {
                    track.state = TrackState::Deleted;
                }
                _ => {}
            }
        }
        self.tracks.retain(|t| t.state != TrackState::Deleted);
    }

    /// Live tracks (tentative and confirmed) after the last update.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Greedy association over the given detection indices: all candidate
    /// pairs above the threshold, best score first, each side used once.
    fn associate(
        &mut self,
        detections: &[Detection],
        candidates: &[usize],
        track_matched: &mut [bool],
        det_matched: &mut [bool],
    ) {
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            if ti >= track_matched.len() || track_matched[ti] {
                continue;
            }
            for &di in candidates {
                let det = &detections[di];
                let iou = track.bbox.iou(&det.bbox);
                let sim = feature_similarity(&track.feature, &det.feature).max(0.0);
                let score = IOU_WEIGHT * iou + (1.0 - IOU_WEIGHT) * sim;
                if score >= ASSOC_THRESHOLD {
                    pairs.push((ti, di, score));
                }
            }
        }
        pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        for (ti, di, _) in pairs {
            if track_matched[ti] || det_matched[di] {
                continue;
            }
            track_matched[ti] = true;
            det_matched[di] = true;

            let track = &mut self.tracks[ti];
            let det = &detections[di];
            track.bbox = det.bbox;
            track.feature = det.feature.clone();
            track.time_since_update = 0;
            track.hits += 1;
            if track.state == TrackState::Tentative && track.hits >= self.n_init {
                track.state = TrackState::Confirmed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, size: f32, conf: f32) -> Detection {
        Detection {
            bbox: BoundingBox { x, y, width: size, height: size, confidence: conf },
            // Flat unit feature so association is driven by IoU in these tests.
            feature: vec![1.0 / 32.0; 1024],
        }
    }

    fn step(tracker: &mut FaceTracker, detections: &[Detection]) {
        tracker.predict();
        tracker.update(detections);
    }

    #[test]
    fn new_detection_starts_tentative() {
        let mut tracker = FaceTracker::new(3, 100);
        step(&mut tracker, &[det(10.0, 10.0, 50.0, 0.9)]);
        assert_eq!(tracker.tracks().len(), 1);
        assert_eq!(tracker.tracks()[0].state, TrackState::Tentative);
    }

    #[test]
    fn track_confirms_after_n_init_hits() {
        let mut tracker = FaceTracker::new(3, 100);
        for i in 0..3 {
            step(&mut tracker, &[det(10.0 + i as f32, 10.0, 50.0, 0.9)]);
        }
        assert_eq!(tracker.tracks().len(), 1);
        assert!(tracker.tracks()[0].is_confirmed());
    }

    #[test]
    fn id_stable_across_frames() {
        let mut tracker = FaceTracker::new(1, 100);
        step(&mut tracker, &[det(10.0, 10.0, 50.0, 0.9)]);
        let id = tracker.tracks()[0].id;
        step(&mut tracker, &[det(12.0, 11.0, 50.0, 0.9)]);
        assert_eq!(tracker.tracks()[0].id, id);
    }

    #[test]
    fn tentative_track_dies_on_first_miss() {
        let mut tracker = FaceTracker::new(3, 100);
        step(&mut tracker, &[det(10.0, 10.0, 50.0, 0.9)]);
        step(&mut tracker, &[]);
        assert!(tracker.tracks().is_empty());
    }

    #[test]
    fn confirmed_track_survives_misses_within_max_age() {
        let mut tracker = FaceTracker::new(1, 3);
        step(&mut tracker, &[det(10.0, 10.0, 50.0, 0.9)]);
        let id = tracker.tracks()[0].id;

        step(&mut tracker, &[]);
        step(&mut tracker, &[]);
        assert_eq!(tracker.tracks().len(), 1);
        assert_eq!(tracker.tracks()[0].time_since_update, 2);

        step(&mut tracker, &[det(12.0, 10.0, 50.0, 0.9)]);
        assert_eq!(tracker.tracks()[0].id, id);
        assert_eq!(tracker.tracks()[0].time_since_update, 0);
    }

    #[test]
    fn confirmed_track_deleted_past_max_age() {
        let mut tracker = FaceTracker::new(1, 2);
        step(&mut tracker, &[det(10.0, 10.0, 50.0, 0.9)]);
        for _ in 0..3 {
            step(&mut tracker, &[]);
        }
        assert!(tracker.tracks().is_empty());
    }

    #[test]
    fn low_confidence_keeps_track_but_starts_none() {
        let mut tracker = FaceTracker::new(1, 100);
        step(&mut tracker, &[det(10.0, 10.0, 50.0, 0.9)]);
        let id = tracker.tracks()[0].id;

        // A weak detection overlapping the track keeps it alive...
        step(&mut tracker, &[det(11.0, 10.0, 50.0, 0.3)]);
        assert_eq!(tracker.tracks().len(), 1);
        assert_eq!(tracker.tracks()[0].id, id);

        // ...but a weak detection far away does not spawn a track.
        step(&mut tracker, &[det(300.0, 300.0, 50.0, 0.3)]);
        assert_eq!(tracker.tracks().len(), 1);
    }

    #[test]
    fn two_faces_track_independently() {
        let mut tracker = FaceTracker::new(1, 100);
        step(
            &mut tracker,
            &[det(0.0, 0.0, 50.0, 0.9), det(200.0, 200.0, 50.0, 0.9)],
        );
        let ids: Vec<u32> = tracker.tracks().iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);

        step(
            &mut tracker,
            &[det(2.0, 2.0, 50.0, 0.9), det(202.0, 201.0, 50.0, 0.9)],
        );
        let new_ids: Vec<u32> = tracker.tracks().iter().map(|t| t.id).collect();
        assert!(new_ids.contains(&ids[0]));
        assert!(new_ids.contains(&ids[1]));
    }
}
