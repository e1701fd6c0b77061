//! Flow-controlled, in-memory bounded byte buffer for Rust.
//!
//! Weir connects a producer ("writer") and a consumer ("reader") running on
//! independent schedules through a fixed-capacity FIFO byte relay with
//! pause/resume backpressure, and can run the producing/consuming routines
//! as cancellable background tasks with a strict one-task-per-direction
//! protocol. Both synchronous and asynchronous APIs are offered, without
//! tying the crate to any particular async runtime.

pub mod cancel;
pub mod config;
pub mod error;
pub mod pipe;
pub mod task;

mod buffer;

// Internal utilities - not part of public API but exposed for crate use
mod internal;

// Public re-exports for convenience
pub use buffer::{LifecycleState, StreamBuffer, DEFAULT_WAIT_TIMEOUT};
pub use cancel::{CancelSource, CancelToken};
pub use config::BufferConfig;
pub use error::{BoxError, ConfigError, DisposedError, ReadError, StartError, WriteError};
pub use pipe::{PipeReader, PipeWriter};
pub use task::{Outcome, Routine, TaskError, TaskHandle};
