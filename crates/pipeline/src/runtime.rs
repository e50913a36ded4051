//! Stream runtime: threads, tasks, and cancellation for one video stream.
//!
//! Blocking work lives on dedicated OS threads, the reader driving
//! `FrameSource::read` and the worker running detection and encoding, with
//! the bounded drop-oldest buffer between them. Consolidation runs on a tokio
//! interval, each pass pushed onto the blocking pool. A shared atomic flag
//! cancels everything; `StreamHandle` joins both threads on shutdown and
//! again from `Drop`, so cleanup happens on every exit path.

use crate::consolidator::Consolidator;
use crate::processor::{FrameReport, StreamProcessor};
use crate::PipelineError;
use chrono::Local;
use facewatch_stream::buffer::{frame_buffer, BufferRecv, FrameConsumer, FrameProducer};
use facewatch_stream::source::{FrameSource, SourceError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Attempts before giving up on a stream that will not open.
pub const MAX_OPEN_ATTEMPTS: u32 = 10;
/// Fixed delay between open attempts.
pub const OPEN_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Frames buffered between reader and worker before drop-oldest kicks in.
pub const BUFFER_CAPACITY: usize = 10;
/// Process every Nth frame of the source.
pub const FRAME_SKIP: u64 = 2;
/// Period between consolidation passes.
pub const CONSOLIDATE_INTERVAL: Duration = Duration::from_secs(1);

const RECV_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub buffer_capacity: usize,
    pub frame_skip: u64,
    pub consolidate_interval: Duration,
    /// Depth of the frame-report channel to the presentation side.
    pub report_capacity: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: BUFFER_CAPACITY,
            frame_skip: FRAME_SKIP,
            consolidate_interval: CONSOLIDATE_INTERVAL,
            report_capacity: 32,
        }
    }
}

/// Open a stream with fixed-backoff retries. Transient failures are logged
/// per attempt; only exhausting every attempt is terminal.
pub fn open_with_retry<F>(
    mut open: F,
    attempts: u32,
    delay: Duration,
) -> Result<Box<dyn FrameSource>, PipelineError>
where
    F: FnMut() -> Result<Box<dyn FrameSource>, SourceError>,
{
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match open() {
            Ok(source) => {
                if attempt > 1 {
                    tracing::info!(attempt, "stream opened after retries");
                }
                return Ok(source);
            }
            Err(err) => {
                tracing::warn!(attempt, max = attempts, error = %err, "stream open failed");
                last = Some(err);
                if attempt < attempts {
                    std::thread::sleep(delay);
                }
            }
        }
    }
    Err(PipelineError::StreamOpen {
        attempts,
        last: last.unwrap_or_else(|| SourceError::Open("no attempt made".into())),
    })
}

/// Requests sent from the handle to the worker thread.
enum WorkerCommand {
    Rename {
        old_alias: String,
        name: String,
        reply: oneshot::Sender<Result<usize, PipelineError>>,
    },
}

/// Owning handle to a running stream.
pub struct StreamHandle {
    cancel: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
    consolidation: tokio::task::JoinHandle<()>,
    commands: mpsc::Sender<WorkerCommand>,
    reports: mpsc::Receiver<FrameReport>,
}

impl StreamHandle {
    /// Next processed-frame report. `None` once the stream has ended and
    /// the worker exited.
    pub async fn next_report(&mut self) -> Option<FrameReport> {
        self.reports.recv().await
    }

    /// Rename a placeholder alias on the live stream's processor.
    pub async fn rename_alias(&self, old_alias: &str, name: &str) -> Result<usize, PipelineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(WorkerCommand::Rename {
                old_alias: old_alias.to_string(),
                name: name.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| PipelineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| PipelineError::ChannelClosed)?
    }

    /// Cancel and join everything. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.consolidation.abort();
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                tracing::error!("reader thread panicked");
            }
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn the reader thread, worker thread, and consolidation task for one
/// stream. Must be called from within a tokio runtime.
pub fn spawn_stream(
    source: Box<dyn FrameSource>,
    processor: StreamProcessor,
    consolidator: Arc<Consolidator>,
    opts: StreamOptions,
) -> StreamHandle {
    let cancel = Arc::new(AtomicBool::new(false));
    let (producer, consumer) = frame_buffer(opts.buffer_capacity);
    let (report_tx, report_rx) = mpsc::channel(opts.report_capacity.max(1));
    let (command_tx, command_rx) = mpsc::channel(4);

    let reader = std::thread::Builder::new()
        .name("facewatch-reader".into())
        .spawn({
            let cancel = cancel.clone();
            move || read_loop(source, producer, cancel, opts.frame_skip)
        })
        .expect("failed to spawn reader thread");

    let worker = std::thread::Builder::new()
        .name("facewatch-worker".into())
        .spawn({
            let cancel = cancel.clone();
            move || work_loop(processor, consumer, report_tx, command_rx, cancel)
        })
        .expect("failed to spawn worker thread");

    let consolidation = tokio::spawn(consolidate_loop(
        consolidator,
        cancel.clone(),
        opts.consolidate_interval,
    ));

    StreamHandle {
        cancel,
        reader: Some(reader),
        worker: Some(worker),
        consolidation,
        commands: command_tx,
        reports: report_rx,
    }
}

fn read_loop(
    mut source: Box<dyn FrameSource>,
    mut producer: FrameProducer,
    cancel: Arc<AtomicBool>,
    frame_skip: u64,
) {
    let skip = frame_skip.max(1);
    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        match source.read() {
            Ok(Some(frame)) => {
                if frame.sequence % skip != 0 {
                    continue;
                }
                producer.push(frame);
            }
            Ok(None) => {
                tracing::info!("frame source ended");
                break;
            }
            Err(err) => {
                tracing::error!(error = %err, "frame read failed, stream stopped");
                break;
            }
        }
    }
    tracing::debug!(dropped = producer.dropped(), "reader thread exiting");
    // Dropping the producer closes the buffer and unblocks the worker.
}

fn work_loop(
    mut processor: StreamProcessor,
    consumer: FrameConsumer,
    reports: mpsc::Sender<FrameReport>,
    mut commands: mpsc::Receiver<WorkerCommand>,
    cancel: Arc<AtomicBool>,
) {
    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        while let Ok(command) = commands.try_recv() {
            match command {
                WorkerCommand::Rename {
                    old_alias,
                    name,
                    reply,
                } => {
                    let _ = reply.send(processor.rename_alias(&old_alias, &name));
                }
            }
        }
        match consumer.recv_timeout(RECV_POLL) {
            BufferRecv::Frame(frame) => {
                let report = processor.process_frame(frame, Local::now());
                // Recording already happened; a gone or lagging report
                // consumer must not stall the pipeline.
                if reports.try_send(report).is_err() {
                    tracing::trace!("frame report dropped, consumer behind");
                }
            }
            BufferRecv::Empty => continue,
            BufferRecv::Closed => break,
        }
    }
    tracing::debug!("worker thread exiting");
}

async fn consolidate_loop(
    consolidator: Arc<Consolidator>,
    cancel: Arc<AtomicBool>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        let consolidator = consolidator.clone();
        match tokio::task::spawn_blocking(move || consolidator.run_pass()).await {
            Ok(Ok(summary)) => {
                if summary.observations_consumed > 0 {
                    tracing::debug!(
                        groups = summary.groups_processed,
                        consumed = summary.observations_consumed,
                        "consolidation tick"
                    );
                }
            }
            Ok(Err(err)) => tracing::error!(error = %err, "consolidation pass failed"),
            Err(err) => tracing::error!(error = %err, "consolidation task join failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{NotificationHub, Notifier};
    use crate::processor::ProcessorOptions;
    use facewatch_core::detector::{LumaBlobDetector, PatchEmbedder};
    use facewatch_store::FaceStore;
    use facewatch_stream::source::SyntheticSource;
    use facewatch_stream::Frame;

    fn build_stream(
        store: &Arc<FaceStore>,
    ) -> (StreamProcessor, Arc<Consolidator>) {
        let detector = Arc::new(LumaBlobDetector::default());
        let processor = StreamProcessor::new(
            store.clone(),
            detector.clone(),
            Arc::new(PatchEmbedder),
            1,
            ProcessorOptions {
                n_init: 1,
                ..ProcessorOptions::default()
            },
        );
        let hub = Arc::new(NotificationHub::new());
        let notifier = Notifier::new(hub, store.clone(), "synthetic".into());
        let consolidator = Arc::new(Consolidator::new(store.clone(), detector, notifier, 1));
        (processor, consolidator)
    }

    #[test]
    fn open_retries_until_success() {
        let mut failures_left = 2;
        let source = open_with_retry(
            || {
                if failures_left > 0 {
                    failures_left -= 1;
                    Err(SourceError::Open("connection refused".into()))
                } else {
                    Ok(Box::new(SyntheticSource::new(32, 32, 1)) as Box<dyn FrameSource>)
                }
            },
            5,
            Duration::from_millis(1),
        );
        assert!(source.is_ok());
        assert_eq!(failures_left, 0);
    }

    #[test]
    fn open_exhaustion_is_terminal() {
        let mut attempts = 0;
        let result = open_with_retry(
            || {
                attempts += 1;
                Err(SourceError::Open("unreachable".into()))
            },
            3,
            Duration::from_millis(1),
        );
        assert_eq!(attempts, 3);
        assert!(matches!(
            result,
            Err(PipelineError::StreamOpen { attempts: 3, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn synthetic_stream_flows_end_to_end() {
        let store = Arc::new(FaceStore::open_in_memory().unwrap());
        let (processor, consolidator) = build_stream(&store);

        let source = Box::new(SyntheticSource::new(160, 120, 40));
        let mut handle = spawn_stream(
            source,
            processor,
            consolidator.clone(),
            StreamOptions {
                frame_skip: 1,
                consolidate_interval: Duration::from_secs(60),
                ..StreamOptions::default()
            },
        );

        let mut reports = 0;
        let mut saw_face = false;
        while let Some(report) = handle.next_report().await {
            reports += 1;
            saw_face |= !report.faces.is_empty();
        }
        assert!(reports > 0);
        assert!(saw_face, "no face recorded from the synthetic stream");
        assert!(!store.unconsumed_observations(1).unwrap().is_empty());

        // Drive consolidation directly rather than waiting for the timer.
        let summary = consolidator.run_pass().unwrap();
        assert!(summary.groups_processed >= 1);
        assert_eq!(store.notifications(1).unwrap().len(), summary.groups_processed);

        handle.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn frame_skip_halves_the_processed_frames() {
        let store = Arc::new(FaceStore::open_in_memory().unwrap());
        let (processor, consolidator) = build_stream(&store);

        let source = Box::new(SyntheticSource::new(64, 48, 20));
        let mut handle = spawn_stream(
            source,
            processor,
            consolidator,
            StreamOptions {
                frame_skip: 2,
                consolidate_interval: Duration::from_secs(60),
                report_capacity: 64,
                ..StreamOptions::default()
            },
        );

        let mut sequences = Vec::new();
        while let Some(report) = handle.next_report().await {
            sequences.push(report.sequence);
        }
        assert!(!sequences.is_empty());
        assert!(sequences.iter().all(|s| s % 2 == 0), "odd frame leaked: {sequences:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_stops_an_endless_stream() {
        /// Never-ending source; only cancellation stops the stream.
        struct EndlessSource {
            seq: u64,
        }
        impl FrameSource for EndlessSource {
            fn read(&mut self) -> Result<Option<Frame>, SourceError> {
                std::thread::sleep(Duration::from_millis(2));
                let frame = Frame::new(vec![10u8; 32 * 32 * 3], 32, 32, self.seq)
                    .map_err(|e| SourceError::Open(e.to_string()))?;
                self.seq += 1;
                Ok(Some(frame))
            }
        }

        let store = Arc::new(FaceStore::open_in_memory().unwrap());
        let (processor, consolidator) = build_stream(&store);
        let mut handle = spawn_stream(
            Box::new(EndlessSource { seq: 0 }),
            processor,
            consolidator,
            StreamOptions::default(),
        );

        // Let it run briefly, then cancel; join must not hang.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rename_reaches_the_live_processor() {
        let store = Arc::new(FaceStore::open_in_memory().unwrap());
        let (processor, consolidator) = build_stream(&store);
        let now = chrono::Local::now();
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

        let mut handle = spawn_stream(
            Box::new(SyntheticSource::new(160, 120, 1_000_000)),
            processor,
            consolidator,
            StreamOptions {
                frame_skip: 1,
                consolidate_interval: Duration::from_secs(60),
                ..StreamOptions::default()
            },
        );

        // First report means the worker is alive and polling commands.
        assert!(handle.next_report().await.is_some());
        let renamed = handle.rename_alias("unknown_001", "Alice").await.unwrap_or(0);
        assert_eq!(renamed, 1);
        handle.shutdown();
    }
}
