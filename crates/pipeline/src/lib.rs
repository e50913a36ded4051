//! facewatch-pipeline: from raw frames to identities and notifications.
//!
//! Wires the stream, core, and store crates into one running pipeline per
//! video stream: the [`processor`] turns frames into tracked, recorded
//! faces; the [`consolidator`] periodically folds recorded observations
//! into canonical identities; [`notify`] fans detection events out to live
//! subscribers and the durable log; [`runtime`] owns the threads, tasks,
//! and cancellation.

pub mod alias;
pub mod consolidator;
pub mod notify;
pub mod processor;
pub mod recorder;
pub mod runtime;

pub use alias::AliasAllocator;
pub use consolidator::{Consolidator, PassSummary};
pub use notify::{LiveNotification, NotificationHub, Notifier};
pub use processor::{FrameReport, ProcessorOptions, StreamProcessor, TrackAnnotation};
pub use recorder::{FrameRecorder, RecordedFace};
pub use runtime::{open_with_retry, spawn_stream, StreamHandle, StreamOptions};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] facewatch_store::StoreError),
    #[error("detector error: {0}")]
    Detector(#[from] facewatch_core::detector::DetectorError),
    #[error("quality scoring failed: {0}")]
    Quality(#[from] facewatch_core::quality::QualityError),
    #[error("frame error: {0}")]
    Frame(#[from] facewatch_stream::frame::FrameError),
    #[error("notification payload decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("stream failed to open after {attempts} attempts: {last}")]
    StreamOpen {
        attempts: u32,
        #[source]
        last: facewatch_stream::source::SourceError,
    },
    #[error("stream worker exited")]
    ChannelClosed,
}
