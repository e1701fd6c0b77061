use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;

use crate::cancel::CancelToken;
use crate::error::WriteError;
use crate::pipe::shared::{PipeShared, WriteStep};

/// The writing end of a bounded stream buffer.
///
/// Writes append bytes in FIFO order and suspend cooperatively while the
/// channel is paused on backpressure. Handles are cheap clones over the same
/// channel; the flow-control model assumes one active writer path at a time
/// (the background runner enforces this for background operations).
pub struct PipeWriter {
  pub(crate) shared: Arc<PipeShared>,
  pub(crate) cancel: CancelToken,
}

impl PipeWriter {
  pub(crate) fn new(shared: Arc<PipeShared>) -> Self {
    Self {
      shared,
      cancel: CancelToken::none(),
    }
  }

  /// Returns a handle whose blocking and async operations observe `token`:
  /// a suspended write unblocks promptly and reports
  /// [`WriteError::Cancelled`] once the token fires.
  pub fn bind_cancel(&self, token: CancelToken) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
      cancel: token,
    }
  }

  /// Writes up to `data.len()` bytes, blocking the current thread while the
  /// channel is paused on backpressure. Returns the number of bytes
  /// appended; writing an empty slice is a no-op returning `Ok(0)`.
  ///
  /// # Errors
  ///
  /// - [`WriteError::Closed`] after [`close`](Self::close).
  /// - [`WriteError::Cancelled`] if the bound token fires.
  /// - [`WriteError::Disposed`] after the buffer is disposed.
  pub fn write(&self, data: &[u8]) -> Result<usize, WriteError> {
    if data.is_empty() {
      return Ok(0);
    }
    if self.cancel.is_cancelled() {
      return Err(WriteError::Cancelled);
    }
    let mut state = self.shared.state.lock();
    loop {
      match self.shared.write_step(&mut state, data) {
        Ok(WriteStep::Wrote(n)) => return Ok(n),
        Err(e) => {
          state.write_waiters.unregister_current_thread();
          return Err(e);
        }
        Ok(WriteStep::NotReady) => {
          state.write_waiters.register_current_thread();
          drop(state);
          if self.cancel.register_current_thread() {
            let mut state = self.shared.state.lock();
            state.write_waiters.unregister_current_thread();
            return Err(WriteError::Cancelled);
          }
          thread::park();
          state = self.shared.state.lock();
          if self.cancel.is_cancelled() {
            state.write_waiters.unregister_current_thread();
            return Err(WriteError::Cancelled);
          }
        }
      }
    }
  }

  /// Writes the whole of `data`, blocking as needed.
  pub fn write_all(&self, data: &[u8]) -> Result<(), WriteError> {
    let mut written = 0;
    while written < data.len() {
      written += self.write(&data[written..])?;
    }
    Ok(())
  }

  /// Asynchronous variant of [`write`](Self::write).
  pub fn write_async<'a>(&'a self, data: &'a [u8]) -> WriteFuture<'a> {
    WriteFuture { writer: self, data }
  }

  /// Asynchronous variant of [`write_all`](Self::write_all).
  pub fn write_all_async<'a>(&'a self, data: &'a [u8]) -> WriteAllFuture<'a> {
    WriteAllFuture {
      writer: self,
      data,
      written: 0,
    }
  }

  /// Completes the write end: no more bytes will arrive. Buffered bytes stay
  /// readable; once drained, reads report end-of-stream. Idempotent, never
  /// blocks.
  pub fn close(&self) {
    self.shared.close_write();
  }

  /// Returns `true` once the write end has been completed.
  pub fn is_closed(&self) -> bool {
    self.shared.is_write_closed()
  }

  /// Number of bytes currently buffered.
  pub fn len(&self) -> usize {
    self.shared.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Maximum number of buffered bytes.
  pub fn capacity(&self) -> usize {
    self.shared.capacity()
  }

  /// Occupancy at or below which a paused writer resumes.
  pub fn resume_threshold(&self) -> usize {
    self.shared.resume_threshold()
  }
}

impl Clone for PipeWriter {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
      cancel: self.cancel.clone(),
    }
  }
}

impl fmt::Debug for PipeWriter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PipeWriter")
      .field("shared", &self.shared)
      .finish()
  }
}

impl io::Write for PipeWriter {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    PipeWriter::write(self, buf).map_err(Into::into)
  }

  fn flush(&mut self) -> io::Result<()> {
    // Bytes are visible to the reader as soon as `write` returns.
    Ok(())
  }
}

/// Future returned by [`PipeWriter::write_async`].
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct WriteFuture<'a> {
  writer: &'a PipeWriter,
  data: &'a [u8],
}

impl Future for WriteFuture<'_> {
  type Output = Result<usize, WriteError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    if self.data.is_empty() {
      return Poll::Ready(Ok(0));
    }
    if self.writer.cancel.register_waker(cx.waker()) {
      return Poll::Ready(Err(WriteError::Cancelled));
    }
    let mut state = self.writer.shared.state.lock();
    match self.writer.shared.write_step(&mut state, self.data) {
      Ok(WriteStep::Wrote(n)) => Poll::Ready(Ok(n)),
      Err(e) => Poll::Ready(Err(e)),
      Ok(WriteStep::NotReady) => {
        state.write_waiters.register_waker(cx.waker());
        Poll::Pending
      }
    }
  }
}

/// Future returned by [`PipeWriter::write_all_async`].
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct WriteAllFuture<'a> {
  writer: &'a PipeWriter,
  data: &'a [u8],
  written: usize,
}

impl Future for WriteAllFuture<'_> {
  type Output = Result<(), WriteError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    loop {
      if this.written >= this.data.len() {
        return Poll::Ready(Ok(()));
      }
      if this.writer.cancel.register_waker(cx.waker()) {
        return Poll::Ready(Err(WriteError::Cancelled));
      }
      let mut state = this.writer.shared.state.lock();
      match this
        .writer
        .shared
        .write_step(&mut state, &this.data[this.written..])
      {
        Ok(WriteStep::Wrote(n)) => {
          this.written += n;
        }
        Err(e) => return Poll::Ready(Err(e)),
        Ok(WriteStep::NotReady) => {
          state.write_waiters.register_waker(cx.waker());
          return Poll::Pending;
        }
      }
    }
  }
}
