mod common;

use std::sync::Arc;
use std::thread;
use weir::{
  LifecycleState, PipeWriter, ReadError, Routine, StartError, StreamBuffer, WriteError,
};

#[test]
fn dispose_is_idempotent_and_terminal() {
  common::init_logging();
  let buffer = StreamBuffer::with_capacity(64).unwrap();
  assert_eq!(buffer.state(), LifecycleState::Open);
  assert!(!buffer.is_disposed());

  let writer = buffer.writer().unwrap();
  let reader = buffer.reader().unwrap();

  buffer.dispose();
  buffer.dispose(); // no-op
  assert!(buffer.is_disposed());
  assert_eq!(buffer.state(), LifecycleState::Closed);

  // Every further operation fails with a disposed error.
  assert!(buffer.writer().is_err());
  assert!(buffer.reader().is_err());
  assert_eq!(writer.write(b"x"), Err(WriteError::Disposed));
  let mut chunk = [0u8; 4];
  assert_eq!(reader.read(&mut chunk), Err(ReadError::Disposed));

  let start = buffer.start_background_write(
    Routine::sync(|_writer: PipeWriter| Ok(())),
    None,
  );
  assert_eq!(start.err(), Some(StartError::Disposed));
}

#[test]
fn concurrent_dispose_is_safe() {
  let buffer = Arc::new(StreamBuffer::with_capacity(64).unwrap());

  // A background writer parks on backpressure so disposal has real work to
  // cancel while the racing callers pile in.
  buffer
    .start_background_write(
      Routine::sync(|writer: PipeWriter| {
        writer.write_all(&[0u8; 4096])?;
        Ok(())
      }),
      None,
    )
    .unwrap();

  let mut disposers = Vec::new();
  for _ in 0..8 {
    let buffer = Arc::clone(&buffer);
    disposers.push(thread::spawn(move || buffer.dispose()));
  }
  for handle in disposers {
    handle.join().expect("dispose must never panic");
  }

  assert!(buffer.is_disposed());
  assert_eq!(buffer.state(), LifecycleState::Closed);
}

#[test]
fn dispose_unblocks_direct_callers() {
  let buffer = Arc::new(StreamBuffer::with_capacity(16).unwrap());
  let writer = buffer.writer().unwrap();

  let blocked = thread::spawn(move || {
    // Fills the channel and then parks with no cancellation token bound.
    writer.write_all(&[0u8; 1024])
  });

  thread::sleep(common::SHORT_TIMEOUT);
  assert!(!blocked.is_finished());

  buffer.dispose();
  assert_eq!(blocked.join().unwrap(), Err(WriteError::Disposed));
}

#[test]
fn no_background_task_survives_dispose() {
  let buffer = StreamBuffer::with_capacity(64).unwrap();

  let task = buffer
    .start_background_write(
      Routine::sync(|writer: PipeWriter| {
        writer.write_all(&[0u8; 8192])?;
        Ok(())
      }),
      None,
    )
    .unwrap();
  assert!(task.wait_timeout(common::SHORT_TIMEOUT).is_none());

  buffer.dispose();
  assert!(
    task.is_finished(),
    "cooperative background work must settle before dispose returns"
  );
  assert!(task.outcome().unwrap().is_cancelled());
  // Dispose drops the stored handles.
  assert!(buffer.background_write_task().is_none());
}

#[test]
fn drop_performs_disposal() {
  let task;
  {
    let buffer = StreamBuffer::with_capacity(64).unwrap();
    task = buffer
      .start_background_write(
        Routine::sync(|writer: PipeWriter| {
          writer.write_all(&[0u8; 8192])?;
          Ok(())
        }),
        None,
      )
      .unwrap();
    assert!(task.wait_timeout(common::SHORT_TIMEOUT).is_none());
    // Buffer dropped here.
  }
  assert!(task.is_finished());
  assert!(task.outcome().unwrap().is_cancelled());
}

#[test]
fn close_then_dispose_keeps_graceful_semantics() {
  let buffer = StreamBuffer::with_capacity(64).unwrap();
  let writer = buffer.writer().unwrap();
  let reader = buffer.reader().unwrap();

  writer.write_all(b"drain me").unwrap();
  buffer.close();

  // Close is graceful: buffered bytes drain to end-of-stream.
  let mut out = [0u8; 16];
  let n = reader.read(&mut out).unwrap();
  assert_eq!(&out[..n], b"drain me");
  assert_eq!(reader.read(&mut out).unwrap(), 0);

  // Dispose is destructive: afterwards even reads fail.
  buffer.dispose();
  assert_eq!(reader.read(&mut out), Err(ReadError::Disposed));
}

#[tokio::test]
async fn dispose_async_converges_on_the_same_teardown() {
  let buffer = StreamBuffer::with_capacity(64).unwrap();

  let task = buffer
    .start_background_write(
      Routine::async_cancellable(|writer: PipeWriter, _token| async move {
        writer.write_all_async(&[0u8; 8192]).await?;
        Ok(())
      }),
      None,
    )
    .unwrap();

  tokio::time::sleep(std::time::Duration::from_millis(100)).await;
  assert!(!task.is_finished());

  buffer.dispose_async().await;
  assert!(buffer.is_disposed());
  assert_eq!(buffer.state(), LifecycleState::Closed);
  assert!(task.is_finished());
  assert!(task.outcome().unwrap().is_cancelled());

  buffer.dispose_async().await; // idempotent
  buffer.dispose(); // and convergent with the sync entry point
}
