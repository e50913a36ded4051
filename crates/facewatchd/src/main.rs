use anyhow::{Context, Result};
use facewatch_core::detector::{LumaBlobDetector, PatchEmbedder};
use facewatch_pipeline::runtime::{open_with_retry, spawn_stream, StreamOptions};
use facewatch_pipeline::{Consolidator, NotificationHub, Notifier, ProcessorOptions, StreamProcessor};
use facewatch_store::FaceStore;
use facewatch_stream::source::{FrameSource, ImageSequenceSource, SyntheticSource};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        camera = %config.camera,
        owner_id = config.owner_id,
        "facewatchd starting"
    );

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let store = Arc::new(FaceStore::open(&config.db_path)?);

    // Built-in model stand-ins; real detector/embedder models plug in
    // behind the same traits.
    let detector = Arc::new(LumaBlobDetector::default());
    let embedder = Arc::new(PatchEmbedder);

    let hub = Arc::new(NotificationHub::new());
    let notifier = Notifier::new(hub.clone(), store.clone(), config.camera.clone());
    let consolidator = Arc::new(Consolidator::new(
        store.clone(),
        detector.clone(),
        notifier,
        config.owner_id,
    ));
    let processor = StreamProcessor::new(
        store,
        detector,
        embedder,
        config.owner_id,
        ProcessorOptions::default(),
    );

    let frames_dir = config.frames_dir.clone();
    let source = open_with_retry(
        || match &frames_dir {
            Some(dir) => {
                Ok(Box::new(ImageSequenceSource::open(dir)?) as Box<dyn FrameSource>)
            }
            None => Ok(Box::new(SyntheticSource::new(640, 480, u64::MAX)) as Box<dyn FrameSource>),
        },
        config.open_attempts,
        config.open_retry_delay(),
    )?;

    let mut handle = spawn_stream(
        source,
        processor,
        consolidator,
        StreamOptions {
            buffer_capacity: config.buffer_capacity,
            frame_skip: config.frame_skip,
            consolidate_interval: config.consolidate_interval(),
            ..StreamOptions::default()
        },
    );
    tracing::info!("facewatchd ready");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("facewatchd shutting down");
                break;
            }
            report = handle.next_report() => match report {
                Some(report) => {
                    for face in &report.faces {
                        tracing::info!(
                            alias = face.tag.key(),
                            last_seen = %face.last_seen,
                            "face recorded"
                        );
                    }
                }
                None => {
                    tracing::info!("stream ended");
                    break;
                }
            }
        }
    }

    handle.shutdown();
    Ok(())
}
