//! Bounded frame buffer between the reader thread and the detection worker.
//!
//! Backpressure policy is drop-oldest: when the queue is full the producer
//! discards the stalest buffered frame and enqueues the new one, so the
//! network reader never blocks and the worker always sees the freshest
//! window of frames.

use crate::frame::Frame;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

/// Create a bounded buffer of the given capacity.
pub fn frame_buffer(capacity: usize) -> (FrameProducer, FrameConsumer) {
    let (tx, rx) = bounded(capacity.max(1));
    (
        FrameProducer {
            tx,
            rx: rx.clone(),
            dropped: 0,
        },
        FrameConsumer { rx },
    )
}

/// Producer half. Held by the reader thread; dropping it closes the stream
/// for the consumer.
pub struct FrameProducer {
    tx: Sender<Frame>,
    // Clone of the consumer's receiver, used only to evict the oldest frame.
    rx: Receiver<Frame>,
    dropped: u64,
}

impl FrameProducer {
    /// Enqueue a frame without ever blocking. Evicts the oldest buffered
    /// frame when full.
    pub fn push(&mut self, frame: Frame) {
        let mut frame = frame;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    if self.rx.try_recv().is_ok() {
                        self.dropped += 1;
                        tracing::trace!(dropped = self.dropped, "frame buffer full, dropped oldest");
                    }
                    frame = returned;
                }
                // All receivers gone; the stream is shutting down.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Frames evicted so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Outcome of a consumer receive attempt.
pub enum BufferRecv {
    Frame(Frame),
    /// Nothing arrived within the timeout; the caller should re-check its
    /// cancellation flag and try again.
    Empty,
    /// Producer dropped; end of stream.
    Closed,
}

/// Consumer half. Held by the detection worker.
pub struct FrameConsumer {
    rx: Receiver<Frame>,
}

impl FrameConsumer {
    pub fn recv_timeout(&self, timeout: Duration) -> BufferRecv {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => BufferRecv::Frame(frame),
            Err(RecvTimeoutError::Timeout) => BufferRecv::Empty,
            Err(RecvTimeoutError::Disconnected) => BufferRecv::Closed,
        }
    }
}
