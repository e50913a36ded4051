use chrono::{DateTime, Local, NaiveDate};
use facewatch_core::Embedding;
use serde::Serialize;

/// A per-frame capture awaiting consolidation. Written by the recorder,
/// consumed (deleted) as a whole alias-group by one consolidation pass.
#[derive(Debug, Clone)]
pub struct TransientObservation {
    pub id: i64,
    pub owner_id: i64,
    pub alias: String,
    /// JPEG bytes of the padded face crop.
    pub image: Vec<u8>,
    pub embedding: Embedding,
    pub captured_at: DateTime<Local>,
    pub consumed: bool,
}

/// Insert payload for a new observation.
#[derive(Debug)]
pub struct NewObservation {
    pub owner_id: i64,
    pub alias: String,
    pub image: Vec<u8>,
    pub embedding: Embedding,
    pub captured_at: DateTime<Local>,
}

/// The consolidated best-quality record for one face on one day.
/// Unique per (owner_id, alias, date_seen).
#[derive(Debug, Clone)]
pub struct CanonicalIdentity {
    pub id: i64,
    pub owner_id: i64,
    pub alias: String,
    pub image: Vec<u8>,
    pub embedding: Embedding,
    pub quality_score: f64,
    pub is_known: bool,
    pub last_seen: DateTime<Local>,
    pub date_seen: NaiveDate,
}

/// One row per consolidation event. The append-only audit trail.
#[derive(Debug, Clone)]
pub struct VisitRecord {
    pub id: i64,
    pub identity_id: i64,
    pub image: Vec<u8>,
    pub detected_at: DateTime<Local>,
    pub date_seen: NaiveDate,
}

/// Durable counterpart to a live notification event.
#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub id: i64,
    pub owner_id: i64,
    pub alias: String,
    pub camera: String,
    pub detected_at: DateTime<Local>,
    pub delivered: bool,
    pub image: Vec<u8>,
}

/// Windowed visit counts, computed against "now" at call time.
#[derive(Debug, Clone, Serialize)]
pub struct FaceAnalytics {
    pub date: NaiveDate,
    pub total_faces: u64,
    pub known_faces: u64,
    pub unknown_faces: u64,
    pub known_faces_today: u64,
    pub known_faces_week: u64,
    pub known_faces_month: u64,
    pub known_faces_year: u64,
}
