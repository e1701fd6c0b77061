//! Background execution of user-supplied read/write routines.
//!
//! A [`Routine`] is one of four call shapes (sync/async, with/without a
//! cancellation token) over an endpoint. The runner executes it on a
//! dedicated named thread (async shapes under a local `block_on`) and
//! records the result on a [`TaskHandle`]: every background operation is
//! observable and awaitable, nothing is fire-and-forget.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::error::{BoxError, ReadError, WriteError};
use crate::internal::sleep::Sleep;
use crate::internal::waitlist::WaitList;

/// A user-supplied background routine over an endpoint `E`, in exactly one
/// of the four supported call shapes.
///
/// The endpoint handed to the routine is bound to the operation's linked
/// cancellation token, so even the token-less shapes unblock promptly when
/// the operation is cancelled while suspended on the channel.
pub enum Routine<E> {
  /// Synchronous routine on the endpoint.
  Sync(Box<dyn FnOnce(E) -> Result<(), BoxError> + Send + 'static>),
  /// Synchronous routine that also receives the operation's token.
  SyncCancellable(Box<dyn FnOnce(E, CancelToken) -> Result<(), BoxError> + Send + 'static>),
  /// Asynchronous routine on the endpoint.
  Async(Box<dyn FnOnce(E) -> BoxFuture<'static, Result<(), BoxError>> + Send + 'static>),
  /// Asynchronous routine that also receives the operation's token.
  AsyncCancellable(
    Box<dyn FnOnce(E, CancelToken) -> BoxFuture<'static, Result<(), BoxError>> + Send + 'static>,
  ),
}

impl<E> Routine<E> {
  pub fn sync<F>(f: F) -> Self
  where
    F: FnOnce(E) -> Result<(), BoxError> + Send + 'static,
  {
    Routine::Sync(Box::new(f))
  }

  pub fn sync_cancellable<F>(f: F) -> Self
  where
    F: FnOnce(E, CancelToken) -> Result<(), BoxError> + Send + 'static,
  {
    Routine::SyncCancellable(Box::new(f))
  }

  pub fn asynchronous<F, Fut>(f: F) -> Self
  where
    F: FnOnce(E) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
  {
    Routine::Async(Box::new(move |endpoint| Box::pin(f(endpoint))))
  }

  pub fn async_cancellable<F, Fut>(f: F) -> Self
  where
    F: FnOnce(E, CancelToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
  {
    Routine::AsyncCancellable(Box::new(move |endpoint, token| Box::pin(f(endpoint, token))))
  }

  fn shape(&self) -> &'static str {
    match self {
      Routine::Sync(_) => "sync",
      Routine::SyncCancellable(_) => "sync+cancel",
      Routine::Async(_) => "async",
      Routine::AsyncCancellable(_) => "async+cancel",
    }
  }
}

impl<E> fmt::Debug for Routine<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Routine").field(&self.shape()).finish()
  }
}

/// Failure captured from a background routine: either the error it returned
/// or the panic it raised.
#[derive(Clone)]
pub struct TaskError {
  inner: Arc<dyn std::error::Error + Send + Sync + 'static>,
}

impl TaskError {
  fn from_box(err: BoxError) -> Self {
    Self {
      inner: Arc::from(err),
    }
  }

  fn panicked(message: String) -> Self {
    Self {
      inner: Arc::new(PanickedError { message }),
    }
  }

  /// Returns `true` if the routine panicked rather than returning an error.
  pub fn is_panic(&self) -> bool {
    self.inner.downcast_ref::<PanickedError>().is_some()
  }
}

impl fmt::Debug for TaskError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "TaskError({:?})", self.inner)
  }
}

impl fmt::Display for TaskError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&self.inner, f)
  }
}

impl std::error::Error for TaskError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    self.inner.source()
  }
}

#[derive(Debug)]
struct PanickedError {
  message: String,
}

impl std::error::Error for PanickedError {}
impl fmt::Display for PanickedError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "background routine panicked: {}", self.message)
  }
}

/// Final state of a background operation.
#[derive(Debug, Clone)]
pub enum Outcome {
  /// The routine returned successfully.
  Completed,
  /// The routine observed cancellation (its error chain carried a channel
  /// `Cancelled`), or its token was already cancelled before it started.
  Cancelled,
  /// The routine returned a non-cancellation error or panicked.
  Failed(TaskError),
}

impl Outcome {
  pub fn is_completed(&self) -> bool {
    matches!(self, Outcome::Completed)
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, Outcome::Cancelled)
  }

  pub fn is_failed(&self) -> bool {
    matches!(self, Outcome::Failed(_))
  }
}

struct TaskState {
  outcome: Option<Outcome>,
  waiters: WaitList,
}

pub(crate) struct TaskCore {
  state: Mutex<TaskState>,
}

impl TaskCore {
  fn complete(&self, outcome: Outcome) {
    let mut state = self.state.lock();
    if state.outcome.is_some() {
      return;
    }
    state.outcome = Some(outcome);
    state.waiters.wake_all();
  }
}

/// Clonable observer of one background operation.
///
/// The handle never cancels or detaches the work it observes; waits measure
/// wall-clock time and report whether completion happened, nothing more.
#[derive(Clone)]
pub struct TaskHandle {
  core: Arc<TaskCore>,
}

impl TaskHandle {
  fn new() -> Self {
    Self {
      core: Arc::new(TaskCore {
        state: Mutex::new(TaskState {
          outcome: None,
          waiters: WaitList::new(),
        }),
      }),
    }
  }

  pub fn is_finished(&self) -> bool {
    self.core.state.lock().outcome.is_some()
  }

  /// The recorded outcome, if the operation has finished.
  pub fn outcome(&self) -> Option<Outcome> {
    self.core.state.lock().outcome.clone()
  }

  /// Blocks until the operation finishes.
  pub fn wait(&self) -> Outcome {
    match self.wait_until(None, None) {
      Some(outcome) => outcome,
      None => unreachable!("unbounded wait returned without an outcome"),
    }
  }

  /// Blocks for at most `timeout`, returning the outcome if the operation
  /// finished in time.
  pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
    self.wait_until(Some(Instant::now() + timeout), None)
  }

  /// Returns a future resolving to the operation's outcome.
  pub fn wait_async(&self) -> WaitFuture {
    WaitFuture {
      core: Arc::clone(&self.core),
    }
  }

  /// Deadline/cancel-aware blocking wait. `None` means the wait either timed
  /// out or was cancelled; the observed operation keeps running either way.
  pub(crate) fn wait_until(
    &self,
    deadline: Option<Instant>,
    wait_cancel: Option<&CancelToken>,
  ) -> Option<Outcome> {
    let mut state = self.core.state.lock();
    loop {
      if let Some(outcome) = &state.outcome {
        return Some(outcome.clone());
      }
      if let Some(token) = wait_cancel {
        if token.is_cancelled() {
          state.waiters.unregister_current_thread();
          return None;
        }
      }
      let now = Instant::now();
      if let Some(deadline) = deadline {
        if now >= deadline {
          state.waiters.unregister_current_thread();
          return None;
        }
      }
      state.waiters.register_current_thread();
      drop(state);
      if let Some(token) = wait_cancel {
        if token.register_current_thread() {
          let mut state = self.core.state.lock();
          state.waiters.unregister_current_thread();
          return None;
        }
      }
      match deadline {
        Some(deadline) => thread::park_timeout(deadline.saturating_duration_since(now)),
        None => thread::park(),
      }
      state = self.core.state.lock();
    }
  }

  /// Deadline/cancel-aware async wait; the async dual of `wait_until`.
  pub(crate) fn wait_until_async(
    &self,
    deadline: Option<Instant>,
    wait_cancel: Option<CancelToken>,
  ) -> BoundedWaitFuture {
    BoundedWaitFuture {
      core: Arc::clone(&self.core),
      deadline,
      sleep: None,
      wait_cancel,
    }
  }
}

impl fmt::Debug for TaskHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskHandle")
      .field("outcome", &self.outcome())
      .finish()
  }
}

/// Future returned by [`TaskHandle::wait_async`].
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct WaitFuture {
  core: Arc<TaskCore>,
}

impl Future for WaitFuture {
  type Output = Outcome;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
    let mut state = self.core.state.lock();
    if let Some(outcome) = &state.outcome {
      return Poll::Ready(outcome.clone());
    }
    state.waiters.register_waker(cx.waker());
    Poll::Pending
  }
}

/// Deadline/cancel-aware wait future; resolves to `None` on timeout or a
/// cancelled wait.
#[must_use = "futures do nothing unless you .await or poll them"]
pub(crate) struct BoundedWaitFuture {
  core: Arc<TaskCore>,
  deadline: Option<Instant>,
  sleep: Option<Sleep>,
  wait_cancel: Option<CancelToken>,
}

impl Future for BoundedWaitFuture {
  type Output = Option<Outcome>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Outcome>> {
    let this = self.get_mut();
    {
      let mut state = this.core.state.lock();
      if let Some(outcome) = &state.outcome {
        return Poll::Ready(Some(outcome.clone()));
      }
      state.waiters.register_waker(cx.waker());
    }
    if let Some(token) = &this.wait_cancel {
      if token.register_waker(cx.waker()) {
        return Poll::Ready(None);
      }
    }
    if let Some(deadline) = this.deadline {
      let sleep = this.sleep.get_or_insert_with(|| Sleep::until(deadline));
      if Pin::new(sleep).poll(cx).is_ready() {
        // Prefer an outcome that landed while the timer fired.
        return Poll::Ready(this.core.state.lock().outcome.clone());
      }
    }
    Poll::Pending
  }
}

/// Launches `routine` over `endpoint` on a dedicated background thread and
/// returns the observing handle. A token cancelled before the thread runs
/// skips the routine entirely and records `Cancelled`.
pub(crate) fn spawn<E>(
  label: &'static str,
  endpoint: E,
  routine: Routine<E>,
  token: CancelToken,
) -> TaskHandle
where
  E: Send + 'static,
{
  let handle = TaskHandle::new();
  let core = Arc::clone(&handle.core);
  log::debug!("starting background {label} ({} shape)", routine.shape());
  let spawned = thread::Builder::new()
    .name(format!("weir-{label}"))
    .spawn(move || {
      let outcome = run_routine(endpoint, routine, token);
      match &outcome {
        Outcome::Completed => log::debug!("background {label} completed"),
        Outcome::Cancelled => log::debug!("background {label} cancelled"),
        Outcome::Failed(e) => log::debug!("background {label} failed: {e}"),
      }
      core.complete(outcome);
    });
  if let Err(e) = spawned {
    log::warn!("failed to spawn background {label} thread: {e}");
    handle
      .core
      .complete(Outcome::Failed(TaskError::from_box(Box::new(e))));
  }
  handle
}

fn run_routine<E>(endpoint: E, routine: Routine<E>, token: CancelToken) -> Outcome {
  if token.is_cancelled() {
    return Outcome::Cancelled;
  }
  let result = panic::catch_unwind(AssertUnwindSafe(|| match routine {
    Routine::Sync(f) => f(endpoint),
    Routine::SyncCancellable(f) => f(endpoint, token.clone()),
    Routine::Async(f) => futures_executor::block_on(f(endpoint)),
    Routine::AsyncCancellable(f) => futures_executor::block_on(f(endpoint, token.clone())),
  }));
  match result {
    Ok(Ok(())) => Outcome::Completed,
    Ok(Err(err)) => {
      if is_cancellation(&*err) {
        Outcome::Cancelled
      } else {
        Outcome::Failed(TaskError::from_box(err))
      }
    }
    Err(payload) => Outcome::Failed(TaskError::panicked(panic_message(payload))),
  }
}

/// Walks the error's source chain looking for a channel cancellation, so a
/// routine that bubbled a cancelled read/write up through `io::Error` (or
/// any other wrapper that preserves sources) classifies as cancelled rather
/// than failed.
fn is_cancellation(err: &(dyn std::error::Error + 'static)) -> bool {
  let mut current = Some(err);
  while let Some(e) = current {
    if matches!(e.downcast_ref::<WriteError>(), Some(WriteError::Cancelled))
      || matches!(e.downcast_ref::<ReadError>(), Some(ReadError::Cancelled))
    {
      return true;
    }
    current = e.source();
  }
  false
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&'static str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cancel::CancelSource;
  use std::io;

  #[test]
  fn sync_routine_completes() {
    let handle = spawn("write", (), Routine::sync(|()| Ok(())), CancelToken::none());
    assert!(handle.wait().is_completed());
    assert!(handle.is_finished());
  }

  #[test]
  fn routine_error_is_captured() {
    let routine = Routine::sync(|()| Err::<(), BoxError>("boom".into()));
    let handle = spawn("write", (), routine, CancelToken::none());
    match handle.wait() {
      Outcome::Failed(e) => {
        assert!(!e.is_panic());
        assert_eq!(e.to_string(), "boom");
      }
      other => panic!("expected Failed, got {other:?}"),
    }
  }

  #[test]
  fn routine_panic_is_captured() {
    let routine = Routine::sync(|()| -> Result<(), BoxError> { panic!("kaput") });
    let handle = spawn("read", (), routine, CancelToken::none());
    match handle.wait() {
      Outcome::Failed(e) => {
        assert!(e.is_panic());
        assert!(e.to_string().contains("kaput"));
      }
      other => panic!("expected Failed, got {other:?}"),
    }
  }

  #[test]
  fn pre_cancelled_token_skips_routine() {
    let source = CancelSource::new();
    source.cancel();
    let routine = Routine::sync(|()| -> Result<(), BoxError> {
      panic!("routine must not run");
    });
    let handle = spawn("write", (), routine, source.token());
    assert!(handle.wait().is_cancelled());
  }

  #[test]
  fn cancelled_channel_error_classifies_as_cancelled() {
    let routine = Routine::sync(|()| -> Result<(), BoxError> {
      // Simulates a blocked write that was cancelled and bubbled through io.
      let io_err: io::Error = WriteError::Cancelled.into();
      Err(io_err.into())
    });
    let handle = spawn("write", (), routine, CancelToken::none());
    assert!(handle.wait().is_cancelled());
  }

  #[test]
  fn async_routine_runs_on_background_thread() {
    let routine = Routine::asynchronous(|()| async { Ok(()) });
    let handle = spawn("write", (), routine, CancelToken::none());
    assert!(handle.wait().is_completed());
  }

  #[test]
  fn sync_cancellable_receives_live_token() {
    let source = CancelSource::new();
    let routine = Routine::sync_cancellable(|(), token: CancelToken| {
      assert!(!token.is_cancelled());
      Ok(())
    });
    let handle = spawn("read", (), routine, source.token());
    assert!(handle.wait().is_completed());
  }

  #[test]
  fn wait_timeout_reports_slow_task() {
    let routine = Routine::sync(|()| {
      thread::sleep(Duration::from_millis(300));
      Ok(())
    });
    let handle = spawn("write", (), routine, CancelToken::none());
    assert!(handle.wait_timeout(Duration::from_millis(50)).is_none());
    // The wait never cancels the task; it still runs to completion.
    assert!(handle.wait().is_completed());
  }

  #[tokio::test]
  async fn wait_async_resolves() {
    let routine = Routine::sync(|()| {
      thread::sleep(Duration::from_millis(50));
      Ok(())
    });
    let handle = spawn("read", (), routine, CancelToken::none());
    let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait_async())
      .await
      .expect("background task never finished");
    assert!(outcome.is_completed());
  }
}
