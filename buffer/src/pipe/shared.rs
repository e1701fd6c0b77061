use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::BufferConfig;
use crate::error::{ReadError, WriteError};
use crate::internal::waitlist::WaitList;

/// Internal shared state for the bounded byte channel.
///
/// Storage, the pause flag, and both waiter lists live behind one mutex per
/// channel; registration and waking happen under the same lock as the
/// occupancy checks, which is what makes the park/recheck loops in the
/// endpoints race-free.
pub(crate) struct PipeShared {
  capacity: usize,
  resume_threshold: usize,
  pub(crate) state: Mutex<PipeState>,
}

pub(crate) struct PipeState {
  buf: VecDeque<u8>,
  /// Set when a write fills the buffer to capacity; cleared when a read
  /// brings occupancy down to the resume threshold. While set, every write
  /// waits, even ones that would otherwise fit (hysteresis).
  paused: bool,
  write_closed: bool,
  disposed: bool,
  pub(crate) read_waiters: WaitList,
  pub(crate) write_waiters: WaitList,
}

/// Outcome of a single non-blocking write attempt.
pub(crate) enum WriteStep {
  Wrote(usize),
  NotReady,
}

/// Outcome of a single non-blocking read attempt.
pub(crate) enum ReadStep {
  Read(usize),
  Eof,
  NotReady,
}

impl PipeShared {
  pub(crate) fn new(config: &BufferConfig) -> Arc<Self> {
    Arc::new(Self {
      capacity: config.capacity(),
      resume_threshold: config.resume_threshold(),
      state: Mutex::new(PipeState {
        buf: VecDeque::with_capacity(config.capacity()),
        paused: false,
        write_closed: false,
        disposed: false,
        read_waiters: WaitList::new(),
        write_waiters: WaitList::new(),
      }),
    })
  }

  pub(crate) fn capacity(&self) -> usize {
    self.capacity
  }

  pub(crate) fn resume_threshold(&self) -> usize {
    self.resume_threshold
  }

  pub(crate) fn len(&self) -> usize {
    self.state.lock().buf.len()
  }

  pub(crate) fn is_write_closed(&self) -> bool {
    self.state.lock().write_closed
  }

  /// Appends as many bytes as currently fit, or reports `NotReady` when the
  /// channel is paused or full. Never blocks; callers own the wait loop.
  pub(crate) fn write_step(
    &self,
    state: &mut PipeState,
    data: &[u8],
  ) -> Result<WriteStep, WriteError> {
    if state.disposed {
      return Err(WriteError::Disposed);
    }
    if state.write_closed {
      return Err(WriteError::Closed);
    }
    if state.paused || state.buf.len() >= self.capacity {
      return Ok(WriteStep::NotReady);
    }
    let n = data.len().min(self.capacity - state.buf.len());
    state.buf.extend(data[..n].iter().copied());
    if state.buf.len() >= self.capacity {
      state.paused = true;
      log::trace!(
        "pipe paused at {} bytes (resume at <= {})",
        state.buf.len(),
        self.resume_threshold
      );
    }
    state.read_waiters.wake_all();
    Ok(WriteStep::Wrote(n))
  }

  /// Removes up to `dst.len()` bytes, or reports `Eof`/`NotReady`. Never
  /// blocks; callers own the wait loop.
  pub(crate) fn read_step(
    &self,
    state: &mut PipeState,
    dst: &mut [u8],
  ) -> Result<ReadStep, ReadError> {
    if state.disposed {
      return Err(ReadError::Disposed);
    }
    if state.buf.is_empty() {
      return if state.write_closed {
        Ok(ReadStep::Eof)
      } else {
        Ok(ReadStep::NotReady)
      };
    }
    let n = dst.len().min(state.buf.len());
    for (slot, byte) in dst.iter_mut().zip(state.buf.drain(..n)) {
      *slot = byte;
    }
    if state.paused && state.buf.len() <= self.resume_threshold {
      state.paused = false;
      log::trace!("pipe resumed at {} bytes", state.buf.len());
      state.write_waiters.wake_all();
    }
    Ok(ReadStep::Read(n))
  }

  /// Marks the write end complete. Outstanding and future reads drain the
  /// remaining bytes and then report end-of-stream; nothing is discarded.
  /// Idempotent, never blocks.
  pub(crate) fn close_write(&self) {
    let mut state = self.state.lock();
    if state.write_closed || state.disposed {
      return;
    }
    state.write_closed = true;
    state.read_waiters.wake_all();
    state.write_waiters.wake_all();
  }

  /// Tears the channel down: drops buffered bytes and fails every blocked
  /// and future operation with a disposed error. Idempotent.
  pub(crate) fn dispose(&self) {
    let mut state = self.state.lock();
    if state.disposed {
      return;
    }
    state.disposed = true;
    state.buf = VecDeque::new();
    state.read_waiters.wake_all();
    state.write_waiters.wake_all();
  }
}

impl fmt::Debug for PipeShared {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("PipeShared")
      .field("capacity", &self.capacity)
      .field("resume_threshold", &self.resume_threshold)
      .field("len", &state.buf.len())
      .field("paused", &state.paused)
      .field("write_closed", &state.write_closed)
      .field("disposed", &state.disposed)
      .finish()
  }
}
