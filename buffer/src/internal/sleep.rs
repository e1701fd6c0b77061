//! A deadline future backed by a dedicated timer thread.
//!
//! Used by the bounded asynchronous waits (`wait_for_background_async`,
//! `dispose_async`) so the crate stays runtime-agnostic: no timer wheel is
//! borrowed from any executor. The timer thread is spawned lazily on the
//! first poll that actually has to wait, sleeps out the remaining time, and
//! fires the most recently registered waker.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;

#[derive(Default)]
struct SleepState {
  elapsed: bool,
  waker: Option<Waker>,
}

/// Future that resolves once `deadline` has passed.
pub(crate) struct Sleep {
  deadline: Instant,
  shared: Option<Arc<Mutex<SleepState>>>,
}

impl Sleep {
  pub(crate) fn until(deadline: Instant) -> Self {
    Self {
      deadline,
      shared: None,
    }
  }
}

impl Future for Sleep {
  type Output = ();

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
    let now = Instant::now();
    if now >= self.deadline {
      return Poll::Ready(());
    }

    match &self.shared {
      Some(shared) => {
        let mut state = shared.lock();
        if state.elapsed {
          return Poll::Ready(());
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
      }
      None => {
        let shared = Arc::new(Mutex::new(SleepState {
          elapsed: false,
          waker: Some(cx.waker().clone()),
        }));
        let remaining = self.deadline - now;
        let timer_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
          .name("weir-sleep".into())
          .spawn(move || {
            thread::sleep(remaining);
            let mut state = timer_shared.lock();
            state.elapsed = true;
            if let Some(waker) = state.waker.take() {
              waker.wake();
            }
          });
        if spawned.is_err() {
          // No timer thread available; resolve rather than hang the wait.
          log::warn!("failed to spawn timer thread; deadline resolves early");
          return Poll::Ready(());
        }
        self.shared = Some(shared);
        Poll::Pending
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn sleep_resolves_after_deadline() {
    let start = Instant::now();
    Sleep::until(start + Duration::from_millis(50)).await;
    assert!(start.elapsed() >= Duration::from_millis(50));
  }

  #[tokio::test]
  async fn sleep_in_the_past_resolves_immediately() {
    Sleep::until(Instant::now()).await;
  }
}
