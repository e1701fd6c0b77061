//! Cooperative cancellation: sources that own the signal, tokens that
//! observe it.
//!
//! A [`CancelSource`] owns the right to cancel; [`CancelToken`]s are cheap,
//! clonable handles that can only query and wait. Tokens stay valid after
//! their source is dropped: dropping a `CancelSource` never implies
//! cancellation, and a linked source may be dropped immediately after its
//! token has been handed out: the token keeps working. Composition code in
//! this crate relies on that deliberately.
//!
//! Cancellation fans out through a listener list: every suspended operation
//! registers a parked thread or a task waker with the tokens it honors, and
//! `cancel` wakes them all. Linked sources form a tree; cancelling a parent
//! cancels all live descendants.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::internal::waitlist::WaitList;

struct CancelState {
  cancelled: bool,
  waiters: WaitList,
  children: Vec<Weak<CancelInner>>,
}

struct CancelInner {
  state: Mutex<CancelState>,
}

impl CancelInner {
  fn new() -> Arc<Self> {
    Arc::new(Self {
      state: Mutex::new(CancelState {
        cancelled: false,
        waiters: WaitList::new(),
        children: Vec::new(),
      }),
    })
  }
}

fn cancel_inner(inner: &Arc<CancelInner>) {
  let children = {
    let mut state = inner.state.lock();
    if state.cancelled {
      return;
    }
    state.cancelled = true;
    state.waiters.wake_all();
    std::mem::take(&mut state.children)
  };
  // Propagate outside the lock; the tree is shallow (shutdown -> direction
  // -> per-call) so recursion depth is bounded.
  for child in children {
    if let Some(child) = child.upgrade() {
      cancel_inner(&child);
    }
  }
}

/// Owns a cancellation signal.
///
/// Dropping the source releases it without cancelling; outstanding
/// [`CancelToken`]s remain queryable and simply never fire.
pub struct CancelSource {
  inner: Arc<CancelInner>,
}

impl CancelSource {
  pub fn new() -> Self {
    Self {
      inner: CancelInner::new(),
    }
  }

  /// Creates a source whose token cancels as soon as any of the given parent
  /// tokens cancels. Cancelling the returned source does not affect the
  /// parents.
  pub fn linked<I>(parents: I) -> Self
  where
    I: IntoIterator<Item = CancelToken>,
  {
    let source = Self::new();
    for parent in parents {
      let Some(parent_inner) = parent.inner else {
        continue; // the never-cancelled token contributes nothing
      };
      let already_cancelled = {
        let mut state = parent_inner.state.lock();
        if state.cancelled {
          true
        } else {
          state.children.push(Arc::downgrade(&source.inner));
          false
        }
      };
      if already_cancelled {
        source.cancel();
        break;
      }
    }
    source
  }

  /// Returns a token observing this source.
  pub fn token(&self) -> CancelToken {
    CancelToken {
      inner: Some(Arc::clone(&self.inner)),
    }
  }

  /// Requests cancellation. Idempotent; wakes every registered waiter and
  /// cancels all live linked descendants.
  pub fn cancel(&self) {
    cancel_inner(&self.inner);
  }

  /// Schedules cancellation after `delay` without blocking the caller.
  ///
  /// The timer holds only a weak reference: if every source and token is
  /// gone before the delay elapses, nothing happens.
  pub fn cancel_after(&self, delay: Duration) {
    let weak = Arc::downgrade(&self.inner);
    let spawned = thread::Builder::new()
      .name("weir-cancel-timer".into())
      .spawn(move || {
        thread::sleep(delay);
        if let Some(inner) = weak.upgrade() {
          cancel_inner(&inner);
        }
      });
    if spawned.is_err() {
      log::warn!("failed to spawn cancel timer thread; cancelling immediately");
      self.cancel();
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.state.lock().cancelled
  }
}

impl Default for CancelSource {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for CancelSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CancelSource")
      .field("cancelled", &self.is_cancelled())
      .finish()
  }
}

/// Cheap, clonable handle observing a [`CancelSource`].
#[derive(Clone)]
pub struct CancelToken {
  // `None` is the never-cancelled token: queries are constant, registrations
  // are no-ops, so it can be bound everywhere a token is optional.
  inner: Option<Arc<CancelInner>>,
}

impl CancelToken {
  /// A token that never cancels.
  pub fn none() -> Self {
    Self { inner: None }
  }

  pub fn is_cancelled(&self) -> bool {
    match &self.inner {
      Some(inner) => inner.state.lock().cancelled,
      None => false,
    }
  }

  /// Returns a future that resolves once this token is cancelled. The future
  /// for a never-cancelled token stays pending forever.
  pub fn cancelled(&self) -> CancelledFuture {
    CancelledFuture {
      token: self.clone(),
    }
  }

  /// Registers the calling thread to be unparked on cancellation.
  ///
  /// Returns `true` if the token is already cancelled (nothing registered).
  pub(crate) fn register_current_thread(&self) -> bool {
    match &self.inner {
      Some(inner) => {
        let mut state = inner.state.lock();
        if state.cancelled {
          return true;
        }
        state.waiters.register_current_thread();
        false
      }
      None => false,
    }
  }

  /// Registers a waker to be woken on cancellation.
  ///
  /// Returns `true` if the token is already cancelled (nothing registered).
  pub(crate) fn register_waker(&self, waker: &Waker) -> bool {
    match &self.inner {
      Some(inner) => {
        let mut state = inner.state.lock();
        if state.cancelled {
          return true;
        }
        state.waiters.register_waker(waker);
        false
      }
      None => false,
    }
  }
}

impl fmt::Debug for CancelToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CancelToken")
      .field("cancelled", &self.is_cancelled())
      .finish()
  }
}

/// Future returned by [`CancelToken::cancelled`].
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct CancelledFuture {
  token: CancelToken,
}

impl Future for CancelledFuture {
  type Output = ();

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
    if self.token.register_waker(cx.waker()) {
      Poll::Ready(())
    } else {
      Poll::Pending
    }
  }
}
