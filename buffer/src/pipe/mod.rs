//! The bounded byte channel: a fixed-capacity, FIFO, single-producer/
//! single-consumer relay with pause/resume backpressure.
//!
//! The writer pauses once occupancy reaches capacity and resumes only when a
//! read brings occupancy down to the configured resume threshold; reads block
//! while the channel is empty and the write end is open, and report
//! end-of-stream (a zero-length read) once the write end has closed and all
//! bytes are drained.

pub(crate) mod shared;

mod reader;
mod writer;

pub use reader::{PipeReader, ReadFuture};
pub use writer::{PipeWriter, WriteAllFuture, WriteFuture};

use crate::config::BufferConfig;

/// Creates a standalone bounded byte channel with the given configuration,
/// returning its two endpoints.
///
/// Most callers go through [`StreamBuffer`](crate::StreamBuffer), which adds
/// background execution and disposal on top of the same channel.
pub fn bounded(config: BufferConfig) -> (PipeWriter, PipeReader) {
  let shared = shared::PipeShared::new(&config);
  (
    PipeWriter::new(shared.clone()),
    PipeReader::new(shared),
  )
}
