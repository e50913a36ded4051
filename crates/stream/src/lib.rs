//! facewatch-stream: frame acquisition and transport.
//!
//! A [`FrameSource`] produces RGB24 frames with blocking reads; the
//! [`buffer`] module decouples that producer from the detection worker with
//! a bounded drop-oldest queue so a slow consumer can never stall the
//! network read.

pub mod buffer;
pub mod frame;
pub mod source;

pub use buffer::{frame_buffer, BufferRecv, FrameConsumer, FrameProducer};
pub use frame::Frame;
pub use source::{FrameSource, ImageSequenceSource, SourceError, SyntheticSource};
