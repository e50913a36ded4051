//! facewatch-store: SQLite persistence for the recognition pipeline.
//!
//! Four tables: `observations` (transient per-frame captures, consumed by
//! consolidation), `identities` (one canonical record per owner/alias/day),
//! `visits` (append-only audit trail), and `notifications` (durable
//! counterpart of live events). All rows are scoped by owner.

pub mod models;
pub mod store;

pub use models::{
    CanonicalIdentity, FaceAnalytics, NewObservation, NotificationRecord, TransientObservation,
    VisitRecord,
};
pub use store::{FaceStore, StoreError};
