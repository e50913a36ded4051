//! facewatch-core: face tracking and identity matching primitives.
//!
//! Detection and embedding models are external; this crate defines the
//! traits they plug into, the multi-object tracker that stitches their
//! per-frame output into continuous tracks, the quality score used to pick
//! one exemplar per face, and the gallery matcher.

pub mod detector;
pub mod quality;
pub mod tracker;
pub mod types;

pub use detector::{FaceDetector, FaceEmbedder};
pub use types::{BoundingBox, Embedding, GalleryEntry, IdentityTag, Matcher};
