use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::detector::{LumaBlobDetector, PatchEmbedder};
use facewatch_pipeline::runtime::{spawn_stream, StreamOptions};
use facewatch_pipeline::{
    Consolidator, NotificationHub, Notifier, ProcessorOptions, StreamProcessor,
};
use facewatch_store::FaceStore;
use facewatch_stream::source::ImageSequenceSource;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facewatch", about = "Facewatch face recognition pipeline CLI")]
struct Cli {
    /// Path to the SQLite database.
    #[arg(long, global = true, default_value = "facewatch.db")]
    db: PathBuf,

    /// Owner all records are scoped to.
    #[arg(long, global = true, default_value_t = 1)]
    owner: i64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline over a directory of still images
    Run {
        /// Directory of frames, replayed in file-name order
        dir: PathBuf,
        /// Camera label carried on notifications
        #[arg(long, default_value = "camera-1")]
        camera: String,
        /// Process every Nth frame
        #[arg(long, default_value_t = 1)]
        frame_skip: u64,
    },
    /// Print visit analytics as JSON
    Analytics,
    /// Give a placeholder alias its real name
    Rename {
        /// Placeholder alias, e.g. unknown_003
        alias: String,
        /// Confirmed name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = Arc::new(FaceStore::open(&cli.db)?);

    match cli.command {
        Commands::Run {
            dir,
            camera,
            frame_skip,
        } => run_stream(store, cli.owner, &dir, camera, frame_skip).await,
        Commands::Analytics => {
            let analytics = store.analytics(cli.owner, chrono::Local::now())?;
            println!("{}", serde_json::to_string_pretty(&analytics)?);
            Ok(())
        }
        Commands::Rename { alias, name } => {
            let renamed = store.rename_identity(cli.owner, &alias, &name)?;
            if renamed == 0 {
                anyhow::bail!("no identity found under alias {alias}");
            }
            println!("renamed {renamed} record(s): {alias} -> {name}");
            Ok(())
        }
    }
}

async fn run_stream(
    store: Arc<FaceStore>,
    owner: i64,
    dir: &PathBuf,
    camera: String,
    frame_skip: u64,
) -> Result<()> {
    let source = Box::new(
        ImageSequenceSource::open(dir)
            .with_context(|| format!("opening frame directory {}", dir.display()))?,
    );

    let detector = Arc::new(LumaBlobDetector::default());
    let hub = Arc::new(NotificationHub::new());
    let notifier = Notifier::new(hub.clone(), store.clone(), camera);
    let consolidator = Arc::new(Consolidator::new(
        store.clone(),
        detector.clone(),
        notifier,
        owner,
    ));
    let processor = StreamProcessor::new(
        store.clone(),
        detector,
        Arc::new(PatchEmbedder),
        owner,
        ProcessorOptions::default(),
    );

    // Print live notifications as they fan out.
    let mut live = hub.subscribe(owner);
    let printer = tokio::spawn(async move {
        while let Ok(event) = live.recv().await {
            println!(
                "[{}] {} seen at {} ({} b64 bytes)",
                event.camera,
                event.alias,
                event.detected_at,
                event.image.len()
            );
        }
    });

    let mut handle = spawn_stream(
        source,
        processor,
        consolidator.clone(),
        StreamOptions {
            frame_skip,
            consolidate_interval: Duration::from_secs(1),
            ..StreamOptions::default()
        },
    );

    let mut frames = 0u64;
    let mut recorded = 0usize;
    while let Some(report) = handle.next_report().await {
        frames += 1;
        recorded += report.faces.len();
    }
    handle.shutdown();

    // Sweep up observations recorded after the last timer tick.
    let summary = consolidator.run_pass()?;
    printer.abort();

    println!(
        "processed {frames} frame(s), recorded {recorded} observation(s), \
         final pass consolidated {} group(s)",
        summary.groups_processed
    );
    let analytics = store.analytics(owner, chrono::Local::now())?;
    println!("{}", serde_json::to_string_pretty(&analytics)?);
    Ok(())
}
