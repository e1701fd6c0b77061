use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;

use crate::cancel::CancelToken;
use crate::error::ReadError;
use crate::pipe::shared::{PipeShared, ReadStep};

/// The reading end of a bounded stream buffer.
///
/// Reads remove bytes in arrival order and suspend cooperatively while the
/// channel is empty and still open. Handles are cheap clones over the same
/// channel; the flow-control model assumes one active reader path at a time
/// (the background runner enforces this for background operations).
pub struct PipeReader {
  pub(crate) shared: Arc<PipeShared>,
  pub(crate) cancel: CancelToken,
}

impl PipeReader {
  pub(crate) fn new(shared: Arc<PipeShared>) -> Self {
    Self {
      shared,
      cancel: CancelToken::none(),
    }
  }

  /// Returns a handle whose blocking and async operations observe `token`:
  /// a suspended read unblocks promptly and reports
  /// [`ReadError::Cancelled`] once the token fires.
  pub fn bind_cancel(&self, token: CancelToken) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
      cancel: token,
    }
  }

  /// Reads up to `dst.len()` bytes from the front of the buffer, blocking
  /// the current thread while the channel is empty and the write end is
  /// still open.
  ///
  /// Returns the number of bytes read. `Ok(0)` on a non-empty destination
  /// means end-of-stream: the write end closed and every byte has been
  /// drained. Reading into an empty destination returns `Ok(0)` without
  /// blocking.
  ///
  /// # Errors
  ///
  /// - [`ReadError::Cancelled`] if the bound token fires.
  /// - [`ReadError::Disposed`] after the buffer is disposed.
  pub fn read(&self, dst: &mut [u8]) -> Result<usize, ReadError> {
    if dst.is_empty() {
      return Ok(0);
    }
    if self.cancel.is_cancelled() {
      return Err(ReadError::Cancelled);
    }
    let mut state = self.shared.state.lock();
    loop {
      match self.shared.read_step(&mut state, dst) {
        Ok(ReadStep::Read(n)) => return Ok(n),
        Ok(ReadStep::Eof) => return Ok(0),
        Err(e) => {
          state.read_waiters.unregister_current_thread();
          return Err(e);
        }
        Ok(ReadStep::NotReady) => {
          state.read_waiters.register_current_thread();
          drop(state);
          if self.cancel.register_current_thread() {
            let mut state = self.shared.state.lock();
            state.read_waiters.unregister_current_thread();
            return Err(ReadError::Cancelled);
          }
          thread::park();
          state = self.shared.state.lock();
          if self.cancel.is_cancelled() {
            state.read_waiters.unregister_current_thread();
            return Err(ReadError::Cancelled);
          }
        }
      }
    }
  }

  /// Asynchronous variant of [`read`](Self::read).
  pub fn read_async<'a>(&'a self, dst: &'a mut [u8]) -> ReadFuture<'a> {
    ReadFuture { reader: self, dst }
  }

  /// Returns `true` once the write end has been completed. Buffered bytes
  /// may still remain to be drained.
  pub fn is_write_closed(&self) -> bool {
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
}

impl Clone for PipeReader {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
      cancel: self.cancel.clone(),
    }
  }
}

impl fmt::Debug for PipeReader {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PipeReader")
      .field("shared", &self.shared)
      .finish()
  }
}

impl io::Read for PipeReader {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    PipeReader::read(self, buf).map_err(Into::into)
  }
}

/// Future returned by [`PipeReader::read_async`].
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct ReadFuture<'a> {
  reader: &'a PipeReader,
  dst: &'a mut [u8],
}

impl Future for ReadFuture<'_> {
  type Output = Result<usize, ReadError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    if this.dst.is_empty() {
      return Poll::Ready(Ok(0));
    }
    if this.reader.cancel.register_waker(cx.waker()) {
      return Poll::Ready(Err(ReadError::Cancelled));
    }
    let mut state = this.reader.shared.state.lock();
    match this.reader.shared.read_step(&mut state, this.dst) {
      Ok(ReadStep::Read(n)) => Poll::Ready(Ok(n)),
      Ok(ReadStep::Eof) => Poll::Ready(Ok(0)),
      Err(e) => Poll::Ready(Err(e)),
      Ok(ReadStep::NotReady) => {
        state.read_waiters.register_waker(cx.waker());
        Poll::Pending
      }
    }
  }
}
