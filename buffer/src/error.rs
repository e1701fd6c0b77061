// src/error.rs

use core::fmt;
use std::io;

/// Boxed error type returned by background routines.
///
/// Routines typically bubble up `io::Error` or the channel's own error enums
/// through `?`; anything that implements `std::error::Error` works.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned when a `BufferConfig` is constructed with invalid values.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConfigError {
  /// The capacity was zero; the buffer must admit at least one byte.
  ZeroCapacity,
  /// The resume fraction was not in `(0.0, 1.0]` (or was not finite).
  InvalidResumeFraction,
}
impl std::error::Error for ConfigError {}
impl fmt::Display for ConfigError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ConfigError::ZeroCapacity => write!(f, "buffer capacity must be greater than 0"),
      ConfigError::InvalidResumeFraction => {
        write!(f, "resume fraction must be a finite value in (0.0, 1.0]")
      }
    }
  }
}

/// Error returned by write operations on the buffer's write end.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum WriteError {
  /// The write end has been closed; no more bytes may be appended.
  Closed,
  /// The bound cancellation token fired while the write was in progress
  /// or suspended on backpressure.
  Cancelled,
  /// The buffer has been disposed.
  Disposed,
}
impl std::error::Error for WriteError {}
impl fmt::Display for WriteError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      WriteError::Closed => write!(f, "channel closed"),
      WriteError::Cancelled => write!(f, "write cancelled"),
      WriteError::Disposed => write!(f, "buffer disposed"),
    }
  }
}

/// Error returned by read operations on the buffer's read end.
///
/// End-of-stream is not an error: a read that returns `Ok(0)` on a non-empty
/// destination means the write end closed and all bytes have been drained.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ReadError {
  /// The bound cancellation token fired while the read was in progress or
  /// suspended waiting for data.
  Cancelled,
  /// The buffer has been disposed.
  Disposed,
}
impl std::error::Error for ReadError {}
impl fmt::Display for ReadError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ReadError::Cancelled => write!(f, "read cancelled"),
      ReadError::Disposed => write!(f, "buffer disposed"),
    }
  }
}

/// Error returned by `start_background_write` / `start_background_read`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StartError {
  /// A background operation for this direction is still in flight. The
  /// buffer is single-producer/single-consumer; a second start is a usage
  /// error, never a queued request.
  AlreadyRunning,
  /// The buffer has been disposed.
  Disposed,
}
impl std::error::Error for StartError {}
impl fmt::Display for StartError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StartError::AlreadyRunning => {
        write!(f, "background operation already in progress for this direction")
      }
      StartError::Disposed => write!(f, "buffer disposed"),
    }
  }
}

/// Error returned when an operation is invoked on a disposed buffer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct DisposedError;
impl std::error::Error for DisposedError {}
impl fmt::Display for DisposedError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "buffer disposed")
  }
}

// io::Error conversions keep the channel error as the source so callers (and
// the task outcome classifier) can recover it from a chain of io errors.

impl From<WriteError> for io::Error {
  fn from(e: WriteError) -> io::Error {
    let kind = match e {
      WriteError::Closed => io::ErrorKind::BrokenPipe,
      WriteError::Cancelled => io::ErrorKind::Other,
      WriteError::Disposed => io::ErrorKind::BrokenPipe,
    };
    io::Error::new(kind, e)
  }
}

impl From<ReadError> for io::Error {
  fn from(e: ReadError) -> io::Error {
    let kind = match e {
      ReadError::Cancelled => io::ErrorKind::Other,
      ReadError::Disposed => io::ErrorKind::BrokenPipe,
    };
    io::Error::new(kind, e)
  }
}
