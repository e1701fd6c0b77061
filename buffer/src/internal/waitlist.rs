//! A unified list of synchronous (parked thread) and asynchronous (waker)
//! waiters.
//!
//! The list itself is not synchronized; owners embed it in state guarded by a
//! `parking_lot::Mutex`, so registration and waking happen under the same
//! lock as the condition they wait on. That ordering is what rules out lost
//! wakeups: a waiter registers while holding the lock, re-checks the
//! condition, and only then parks/returns `Pending`. An unpark that lands
//! before the park is buffered by the thread's park token, and a waker fired
//! before `Pending` is returned simply schedules an immediate re-poll.

use std::task::Waker;
use std::thread::{self, Thread};

/// A single suspended party: a parked thread or a pending task.
#[derive(Debug)]
pub(crate) enum Waiter {
  Thread(Thread),
  Task(Waker),
}

impl Waiter {
  fn wake(self) {
    match self {
      Waiter::Thread(thread) => thread.unpark(),
      Waiter::Task(waker) => waker.wake(),
    }
  }
}

/// Small waiter list. The channels built on this have at most one writer and
/// one reader path, so the list holds a handful of entries at most and wakes
/// everything on every transition; stale entries cost one spurious unpark.
#[derive(Debug, Default)]
pub(crate) struct WaitList {
  waiters: Vec<Waiter>,
}

impl WaitList {
  pub(crate) const fn new() -> Self {
    Self { waiters: Vec::new() }
  }

  /// Registers the current thread, if it is not already registered.
  pub(crate) fn register_current_thread(&mut self) {
    let current = thread::current();
    let present = self.waiters.iter().any(|w| match w {
      Waiter::Thread(t) => t.id() == current.id(),
      Waiter::Task(_) => false,
    });
    if !present {
      self.waiters.push(Waiter::Thread(current));
    }
  }

  /// Removes the current thread's registration, if any.
  pub(crate) fn unregister_current_thread(&mut self) {
    let id = thread::current().id();
    self.waiters.retain(|w| match w {
      Waiter::Thread(t) => t.id() != id,
      Waiter::Task(_) => true,
    });
  }

  /// Registers a task waker, if an equivalent one is not already registered.
  pub(crate) fn register_waker(&mut self, waker: &Waker) {
    let present = self.waiters.iter().any(|w| match w {
      Waiter::Task(existing) => existing.will_wake(waker),
      Waiter::Thread(_) => false,
    });
    if !present {
      self.waiters.push(Waiter::Task(waker.clone()));
    }
  }

  /// Drains the list, waking every registered waiter.
  pub(crate) fn wake_all(&mut self) {
    for waiter in self.waiters.drain(..) {
      waiter.wake();
    }
  }

  #[cfg(test)]
  pub(crate) fn len(&self) -> usize {
    self.waiters.len()
  }
}
