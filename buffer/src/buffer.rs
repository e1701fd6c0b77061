//! The stream buffer facade: a bounded byte channel plus background
//! execution of the routines that drive its two ends, with a disposal
//! protocol that guarantees no background work survives the buffer.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cancel::{CancelSource, CancelToken};
use crate::config::BufferConfig;
use crate::error::{ConfigError, DisposedError, StartError};
use crate::pipe::shared::PipeShared;
use crate::pipe::{PipeReader, PipeWriter};
use crate::task::{self, Routine, TaskHandle};

/// Bounded default applied by waits and disposal when no timeout is given.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Observable lifecycle of a [`StreamBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Normal operation.
  Open,
  /// Cancellation of background work has been requested.
  Cancelling,
  /// Waiting for background work to finish.
  Draining,
  /// Disposed; every further operation fails.
  Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CANCELLING: u8 = 1;
const STATE_DRAINING: u8 = 2;
const STATE_CLOSED: u8 = 3;

fn decode_state(raw: u8) -> LifecycleState {
  match raw {
    STATE_OPEN => LifecycleState::Open,
    STATE_CANCELLING => LifecycleState::Cancelling,
    STATE_DRAINING => LifecycleState::Draining,
    _ => LifecycleState::Closed,
  }
}

/// Per-direction background state: the dedicated cancellation source (a
/// child of the buffer's shutdown source, created once with the buffer) and
/// the slot holding the current task handle. The slot is replaced, never
/// queued; replacement is only legal once the prior task has finished.
struct Direction {
  label: &'static str,
  cancel: CancelSource,
  task: Mutex<Option<TaskHandle>>,
}

impl Direction {
  fn new(label: &'static str, shutdown: &CancelSource) -> Self {
    Self {
      label,
      cancel: CancelSource::linked([shutdown.token()]),
      task: Mutex::new(None),
    }
  }

  fn start<E>(
    &self,
    disposed: &AtomicBool,
    routine: Routine<E>,
    caller: Option<CancelToken>,
    bind: impl FnOnce(CancelToken) -> E,
  ) -> Result<TaskHandle, StartError>
  where
    E: Send + 'static,
  {
    let mut slot = self.task.lock();
    if disposed.load(Ordering::Acquire) {
      return Err(StartError::Disposed);
    }
    if let Some(existing) = slot.as_ref() {
      if !existing.is_finished() {
        return Err(StartError::AlreadyRunning);
      }
    }
    let linked = match caller {
      Some(token) => CancelSource::linked([self.cancel.token(), token]),
      None => CancelSource::linked([self.cancel.token()]),
    };
    let token = linked.token();
    // The linked source is dropped here; its token stays valid, which is
    // exactly the token/source split this crate's cancel module guarantees.
    drop(linked);
    let endpoint = bind(token.clone());
    let handle = task::spawn(self.label, endpoint, routine, token);
    *slot = Some(handle.clone());
    Ok(handle)
  }

  fn current(&self) -> Option<TaskHandle> {
    self.task.lock().clone()
  }

  /// Cancels the direction's source if a task is still running, returning
  /// the task to drain. `None` means there is nothing to wait for.
  fn request_cancel(&self) -> Option<TaskHandle> {
    match self.current() {
      Some(task) if !task.is_finished() => {
        log::debug!("cancelling background {}", self.label);
        self.cancel.cancel();
        Some(task)
      }
      _ => None,
    }
  }
}

/// A flow-controlled, in-memory byte buffer connecting a writer and a
/// reader running on independent schedules.
///
/// The buffer enforces backpressure (the writer pauses at capacity and
/// resumes at the configured threshold), runs at most one background write
/// and one background read routine at a time, and tears everything down
/// through one idempotent disposal path reachable both synchronously
/// ([`dispose`](Self::dispose)) and asynchronously
/// ([`dispose_async`](Self::dispose_async)).
///
/// # Example
///
/// ```
/// use weir::{BufferConfig, Routine, StreamBuffer};
///
/// let buffer = StreamBuffer::new(BufferConfig::with_capacity(1024)?);
/// let task = buffer.start_background_write(
///   Routine::sync(|writer: weir::PipeWriter| {
///     writer.write_all(b"hello")?;
///     writer.close();
///     Ok(())
///   }),
///   None,
/// )?;
///
/// let mut collected = Vec::new();
/// let reader = buffer.reader()?;
/// let mut chunk = [0u8; 256];
/// loop {
///   let n = reader.read(&mut chunk)?;
///   if n == 0 {
///     break;
///   }
///   collected.extend_from_slice(&chunk[..n]);
/// }
/// assert_eq!(collected, b"hello");
/// assert!(task.wait().is_completed());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct StreamBuffer {
  config: BufferConfig,
  pipe: Arc<PipeShared>,
  shutdown: CancelSource,
  write_dir: Direction,
  read_dir: Direction,
  dispose_started: AtomicBool,
  lifecycle: AtomicU8,
}

impl StreamBuffer {
  /// Creates a buffer with the given flow-control configuration.
  pub fn new(config: BufferConfig) -> Self {
    let shutdown = CancelSource::new();
    Self {
      pipe: PipeShared::new(&config),
      write_dir: Direction::new("write", &shutdown),
      read_dir: Direction::new("read", &shutdown),
      shutdown,
      config,
      dispose_started: AtomicBool::new(false),
      lifecycle: AtomicU8::new(STATE_OPEN),
    }
  }

  /// Creates a buffer with the given capacity and the default resume
  /// fraction.
  pub fn with_capacity(capacity: usize) -> Result<Self, ConfigError> {
    Ok(Self::new(BufferConfig::with_capacity(capacity)?))
  }

  /// The buffer's flow-control configuration.
  pub fn config(&self) -> BufferConfig {
    self.config
  }

  /// Current lifecycle state.
  pub fn state(&self) -> LifecycleState {
    decode_state(self.lifecycle.load(Ordering::Acquire))
  }

  /// Returns the writing end.
  pub fn writer(&self) -> Result<PipeWriter, DisposedError> {
    if self.is_disposed() {
      return Err(DisposedError);
    }
    Ok(PipeWriter {
      shared: Arc::clone(&self.pipe),
      cancel: CancelToken::none(),
    })
  }

  /// Returns the reading end.
  pub fn reader(&self) -> Result<PipeReader, DisposedError> {
    if self.is_disposed() {
      return Err(DisposedError);
    }
    Ok(PipeReader {
      shared: Arc::clone(&self.pipe),
      cancel: CancelToken::none(),
    })
  }

  /// Launches `routine` over the writing end on a background thread.
  ///
  /// The routine's endpoint is bound to a token linking the buffer's
  /// shutdown source, the write direction's source, and `token` if given:
  /// cancelling any of them unblocks and cancels the operation.
  ///
  /// # Errors
  ///
  /// - [`StartError::AlreadyRunning`] while a previous background write has
  ///   not finished: strict single-flight, never queueing.
  /// - [`StartError::Disposed`] after disposal.
  pub fn start_background_write(
    &self,
    routine: Routine<PipeWriter>,
    token: Option<CancelToken>,
  ) -> Result<TaskHandle, StartError> {
    let pipe = Arc::clone(&self.pipe);
    self
      .write_dir
      .start(&self.dispose_started, routine, token, move |cancel| {
        PipeWriter {
          shared: pipe,
          cancel,
        }
      })
  }

  /// Launches `routine` over the reading end on a background thread.
  ///
  /// See [`start_background_write`](Self::start_background_write) for the
  /// cancellation and single-flight rules; they apply per direction.
  pub fn start_background_read(
    &self,
    routine: Routine<PipeReader>,
    token: Option<CancelToken>,
  ) -> Result<TaskHandle, StartError> {
    let pipe = Arc::clone(&self.pipe);
    self
      .read_dir
      .start(&self.dispose_started, routine, token, move |cancel| {
        PipeReader {
          shared: pipe,
          cancel,
        }
      })
  }

  /// Handle of the current background write, if one was started.
  pub fn background_write_task(&self) -> Option<TaskHandle> {
    self.write_dir.current()
  }

  /// Handle of the current background read, if one was started.
  pub fn background_read_task(&self) -> Option<TaskHandle> {
    self.read_dir.current()
  }

  /// Cancels the background write and waits up to `timeout` (default
  /// [`DEFAULT_WAIT_TIMEOUT`]) for it to finish. Idempotent when the task
  /// is already complete or was never started.
  ///
  /// Returns `true` if no background write remains running. The wait never
  /// abandons the task on timeout; `wait_cancel` aborts the wait only.
  /// Cancelling a direction is permanent: its source stays cancelled, as
  /// the sources are created once with the buffer.
  pub fn cancel_background_write(
    &self,
    timeout: Option<Duration>,
    wait_cancel: Option<&CancelToken>,
  ) -> bool {
    self.cancel_direction(&self.write_dir, timeout, wait_cancel)
  }

  /// Cancels the background read and waits for it; the read-direction dual
  /// of [`cancel_background_write`](Self::cancel_background_write).
  pub fn cancel_background_read(
    &self,
    timeout: Option<Duration>,
    wait_cancel: Option<&CancelToken>,
  ) -> bool {
    self.cancel_direction(&self.read_dir, timeout, wait_cancel)
  }

  /// Cancels both directions through the shared shutdown source and waits
  /// up to `timeout` for both tasks to finish.
  pub fn cancel_all_background(
    &self,
    timeout: Option<Duration>,
    wait_cancel: Option<&CancelToken>,
  ) -> bool {
    let write = self.write_dir.current();
    let read = self.read_dir.current();
    let any_running = write.as_ref().map_or(false, |t| !t.is_finished())
      || read.as_ref().map_or(false, |t| !t.is_finished());
    if !any_running {
      return true;
    }
    log::debug!("cancelling all background work");
    self.set_state(LifecycleState::Cancelling);
    self.shutdown.cancel();
    self.set_state(LifecycleState::Draining);
    let completed = self.wait_both(Self::deadline(timeout), wait_cancel);
    self.settle_idle();
    completed
  }

  /// Waits up to `timeout` for both background tasks; returns `true` once
  /// neither is running. The wait cancels nothing.
  pub fn wait_for_background(
    &self,
    timeout: Option<Duration>,
    wait_cancel: Option<&CancelToken>,
  ) -> bool {
    self.wait_both(Self::deadline(timeout), wait_cancel)
  }

  /// Waits for the background write only.
  pub fn wait_for_background_write(
    &self,
    timeout: Option<Duration>,
    wait_cancel: Option<&CancelToken>,
  ) -> bool {
    Self::wait_task(self.write_dir.current(), Self::deadline(timeout), wait_cancel)
  }

  /// Waits for the background read only.
  pub fn wait_for_background_read(
    &self,
    timeout: Option<Duration>,
    wait_cancel: Option<&CancelToken>,
  ) -> bool {
    Self::wait_task(self.read_dir.current(), Self::deadline(timeout), wait_cancel)
  }

  /// Async variant of [`cancel_background_write`](Self::cancel_background_write).
  pub async fn cancel_background_write_async(
    &self,
    timeout: Option<Duration>,
    wait_cancel: Option<CancelToken>,
  ) -> bool {
    self
      .cancel_direction_async(&self.write_dir, timeout, wait_cancel)
      .await
  }

  /// Async variant of [`cancel_background_read`](Self::cancel_background_read).
  pub async fn cancel_background_read_async(
    &self,
    timeout: Option<Duration>,
    wait_cancel: Option<CancelToken>,
  ) -> bool {
    self
      .cancel_direction_async(&self.read_dir, timeout, wait_cancel)
      .await
  }

  /// Async variant of [`cancel_all_background`](Self::cancel_all_background).
  pub async fn cancel_all_background_async(
    &self,
    timeout: Option<Duration>,
    wait_cancel: Option<CancelToken>,
  ) -> bool {
    let write = self.write_dir.current();
    let read = self.read_dir.current();
    let any_running = write.as_ref().map_or(false, |t| !t.is_finished())
      || read.as_ref().map_or(false, |t| !t.is_finished());
    if !any_running {
      return true;
    }
    log::debug!("cancelling all background work");
    self.set_state(LifecycleState::Cancelling);
    self.shutdown.cancel();
    self.set_state(LifecycleState::Draining);
    let completed = self
      .wait_both_async(Self::deadline(timeout), wait_cancel)
      .await;
    self.settle_idle();
    completed
  }

  /// Async variant of [`wait_for_background`](Self::wait_for_background).
  pub async fn wait_for_background_async(
    &self,
    timeout: Option<Duration>,
    wait_cancel: Option<CancelToken>,
  ) -> bool {
    self
      .wait_both_async(Self::deadline(timeout), wait_cancel)
      .await
  }

  /// Async variant of [`wait_for_background_write`](Self::wait_for_background_write).
  pub async fn wait_for_background_write_async(
    &self,
    timeout: Option<Duration>,
    wait_cancel: Option<CancelToken>,
  ) -> bool {
    Self::wait_task_async(self.write_dir.current(), Self::deadline(timeout), wait_cancel).await
  }

  /// Async variant of [`wait_for_background_read`](Self::wait_for_background_read).
  pub async fn wait_for_background_read_async(
    &self,
    timeout: Option<Duration>,
    wait_cancel: Option<CancelToken>,
  ) -> bool {
    Self::wait_task_async(self.read_dir.current(), Self::deadline(timeout), wait_cancel).await
  }

  /// Completes the write end: buffered bytes remain readable and reads
  /// report end-of-stream once drained. Idempotent, never blocks, discards
  /// nothing.
  pub fn close(&self) {
    self.pipe.close_write();
  }

  /// `true` once disposal has begun.
  pub fn is_disposed(&self) -> bool {
    self.dispose_started.load(Ordering::Acquire)
  }

  /// Synchronously disposes the buffer: cancels all background work, waits
  /// up to [`DEFAULT_WAIT_TIMEOUT`] for it to drain, then releases the
  /// channel and fails every blocked or future operation with a disposed
  /// error.
  ///
  /// Idempotent and safe to call concurrently: the first caller performs
  /// the teardown, later callers return immediately. Release happens even
  /// when the drain wait times out.
  pub fn dispose(&self) {
    if self.dispose_started.swap(true, Ordering::AcqRel) {
      return;
    }
    log::debug!("disposing stream buffer");
    self.set_state(LifecycleState::Cancelling);
    self.shutdown.cancel();
    self.set_state(LifecycleState::Draining);
    if !self.wait_both(Some(Instant::now() + DEFAULT_WAIT_TIMEOUT), None) {
      log::debug!("background work still running at dispose timeout");
    }
    self.release();
  }

  /// Asynchronous disposal: awaits the cancel-and-drain step instead of
  /// blocking, then converges on the same release path as
  /// [`dispose`](Self::dispose).
  pub async fn dispose_async(&self) {
    if self.dispose_started.swap(true, Ordering::AcqRel) {
      return;
    }
    log::debug!("disposing stream buffer");
    self.set_state(LifecycleState::Cancelling);
    self.shutdown.cancel();
    self.set_state(LifecycleState::Draining);
    if !self
      .wait_both_async(Some(Instant::now() + DEFAULT_WAIT_TIMEOUT), None)
      .await
    {
      log::debug!("background work still running at dispose timeout");
    }
    self.release();
  }

  fn release(&self) {
    self.pipe.dispose();
    *self.write_dir.task.lock() = None;
    *self.read_dir.task.lock() = None;
    self.set_state(LifecycleState::Closed);
    log::debug!("stream buffer disposed");
  }

  fn cancel_direction(
    &self,
    direction: &Direction,
    timeout: Option<Duration>,
    wait_cancel: Option<&CancelToken>,
  ) -> bool {
    let Some(task) = direction.request_cancel() else {
      return true;
    };
    self.set_state(LifecycleState::Cancelling);
    self.set_state(LifecycleState::Draining);
    let completed = task.wait_until(Self::deadline(timeout), wait_cancel).is_some();
    self.settle_idle();
    completed
  }

  async fn cancel_direction_async(
    &self,
    direction: &Direction,
    timeout: Option<Duration>,
    wait_cancel: Option<CancelToken>,
  ) -> bool {
    let Some(task) = direction.request_cancel() else {
      return true;
    };
    self.set_state(LifecycleState::Cancelling);
    self.set_state(LifecycleState::Draining);
    let completed = task
      .wait_until_async(Self::deadline(timeout), wait_cancel)
      .await
      .is_some();
    self.settle_idle();
    completed
  }

  fn wait_both(&self, deadline: Option<Instant>, wait_cancel: Option<&CancelToken>) -> bool {
    Self::wait_task(self.write_dir.current(), deadline, wait_cancel)
      && Self::wait_task(self.read_dir.current(), deadline, wait_cancel)
  }

  async fn wait_both_async(
    &self,
    deadline: Option<Instant>,
    wait_cancel: Option<CancelToken>,
  ) -> bool {
    Self::wait_task_async(self.write_dir.current(), deadline, wait_cancel.clone()).await
      && Self::wait_task_async(self.read_dir.current(), deadline, wait_cancel).await
  }

  fn wait_task(
    task: Option<TaskHandle>,
    deadline: Option<Instant>,
    wait_cancel: Option<&CancelToken>,
  ) -> bool {
    match task {
      Some(task) => task.wait_until(deadline, wait_cancel).is_some(),
      None => true,
    }
  }

  async fn wait_task_async(
    task: Option<TaskHandle>,
    deadline: Option<Instant>,
    wait_cancel: Option<CancelToken>,
  ) -> bool {
    match task {
      Some(task) => task.wait_until_async(deadline, wait_cancel).await.is_some(),
      None => true,
    }
  }

  fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    Some(Instant::now() + timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT))
  }

  fn set_state(&self, next: LifecycleState) {
    let raw = match next {
      LifecycleState::Open => STATE_OPEN,
      LifecycleState::Cancelling => STATE_CANCELLING,
      LifecycleState::Draining => STATE_DRAINING,
      LifecycleState::Closed => STATE_CLOSED,
    };
    let mut current = self.lifecycle.load(Ordering::Acquire);
    loop {
      // Closed is terminal.
      if current == STATE_CLOSED {
        return;
      }
      match self.lifecycle.compare_exchange_weak(
        current,
        raw,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return,
        Err(observed) => current = observed,
      }
    }
  }

  /// Returns to `Open` after a cancel/drain episode, unless disposal has
  /// already moved the buffer past it.
  fn settle_idle(&self) {
    for transient in [STATE_DRAINING, STATE_CANCELLING] {
      let _ = self.lifecycle.compare_exchange(
        transient,
        STATE_OPEN,
        Ordering::AcqRel,
        Ordering::Acquire,
      );
    }
  }
}

impl Default for StreamBuffer {
  fn default() -> Self {
    Self::new(BufferConfig::default())
  }
}

impl Drop for StreamBuffer {
  fn drop(&mut self) {
    self.dispose();
  }
}

impl fmt::Debug for StreamBuffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StreamBuffer")
      .field("config", &self.config)
      .field("state", &self.state())
      .field("pipe", &self.pipe)
      .finish()
  }
}
