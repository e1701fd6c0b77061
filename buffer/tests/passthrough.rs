mod common;

use common::{crc32, random_bytes, Crc32};
use serial_test::serial;
use std::thread;
use weir::{BufferConfig, StreamBuffer, WriteError};

#[test]
fn basic_pass_through() {
  common::init_logging();
  const TEST_SIZE: usize = 4096;

  let buffer = StreamBuffer::default();
  let source = random_bytes(1, TEST_SIZE);
  let expected = crc32(&source);

  let writer = buffer.writer().unwrap();
  let producer = thread::spawn(move || {
    writer.write_all(&source).unwrap();
    writer.close();
  });

  let reader = buffer.reader().unwrap();
  let mut digest = Crc32::new();
  let mut chunk = [0u8; 256];
  let mut total = 0;
  loop {
    let n = reader.read(&mut chunk).unwrap();
    if n == 0 {
      break;
    }
    digest.update(&chunk[..n]);
    total += n;
  }

  producer.join().unwrap();
  assert_eq!(total, TEST_SIZE);
  assert_eq!(digest.finalize(), expected);
}

#[test]
fn fifo_ordering_of_interleaved_writes() {
  let buffer = StreamBuffer::with_capacity(64).unwrap();
  let writer = buffer.writer().unwrap();
  let reader = buffer.reader().unwrap();

  for chunk in [&b"A"[..], b"B", b"CD", b"E"] {
    writer.write_all(chunk).unwrap();
  }
  writer.close();

  let mut out = Vec::new();
  let mut chunk = [0u8; 8];
  loop {
    let n = reader.read(&mut chunk).unwrap();
    if n == 0 {
      break;
    }
    out.extend_from_slice(&chunk[..n]);
  }
  assert_eq!(out, b"ABCDE");
}

#[test]
fn end_of_stream_after_close_and_drain() {
  let buffer = StreamBuffer::with_capacity(32).unwrap();
  let writer = buffer.writer().unwrap();
  let reader = buffer.reader().unwrap();

  writer.write_all(b"last words").unwrap();
  writer.close();

  let mut collected = Vec::new();
  let mut chunk = [0u8; 4];
  loop {
    let n = reader.read(&mut chunk).unwrap();
    if n == 0 {
      break;
    }
    collected.extend_from_slice(&chunk[..n]);
  }
  assert_eq!(collected, b"last words");
  // Repeat reads keep reporting end-of-stream without blocking or erroring.
  assert_eq!(reader.read(&mut chunk).unwrap(), 0);

  // The write end is finished for good.
  assert_eq!(writer.write(b"more"), Err(WriteError::Closed));
}

#[test]
#[serial]
fn full_buffer_blocks_write_until_resume_threshold() {
  common::init_logging();
  // Capacity 1024, resume fraction 0.5: the writer pauses at 1024 buffered
  // bytes and resumes only once occupancy drops to 512 or fewer.
  const CAPACITY: usize = 1024;
  const TEST_SIZE: usize = 4096;

  let buffer = StreamBuffer::new(BufferConfig::new(CAPACITY, 0.5).unwrap());
  let source = random_bytes(7, TEST_SIZE);
  let expected = crc32(&source);

  let writer = buffer.writer().unwrap();
  let to_write = source.clone();
  let producer = thread::spawn(move || {
    writer.write_all(&to_write).unwrap();
    writer.close();
  });

  // The writer fills the buffer to capacity and pauses.
  thread::sleep(common::SHORT_TIMEOUT);
  assert!(!producer.is_finished(), "writer should pause at capacity");
  let reader = buffer.reader().unwrap();
  assert_eq!(reader.len(), CAPACITY);

  // Draining 511 bytes leaves occupancy at 513, above the threshold: the
  // writer stays paused.
  let mut sink = vec![0u8; 511];
  let mut digest = Crc32::new();
  read_exactly(&reader, &mut sink, &mut digest);
  thread::sleep(common::SHORT_TIMEOUT);
  assert_eq!(reader.len(), CAPACITY - 511);
  assert!(
    !producer.is_finished(),
    "writer must not resume above the resume threshold"
  );

  // One more byte read reaches the threshold; the writer resumes and the
  // rest of the transfer drains.
  let mut rest = vec![0u8; TEST_SIZE - 511];
  read_exactly(&reader, &mut rest, &mut digest);

  producer.join().unwrap();
  let mut tail = [0u8; 1];
  assert_eq!(reader.read(&mut tail).unwrap(), 0, "stream should be drained");
  assert_eq!(digest.finalize(), expected);
}

fn read_exactly(reader: &weir::PipeReader, dst: &mut [u8], digest: &mut Crc32) {
  let mut filled = 0;
  while filled < dst.len() {
    let n = reader.read(&mut dst[filled..]).unwrap();
    assert_ne!(n, 0, "unexpected end of stream");
    digest.update(&dst[filled..filled + n]);
    filled += n;
  }
}

#[tokio::test]
async fn async_pass_through() {
  const TEST_SIZE: usize = 2048;

  let buffer = StreamBuffer::with_capacity(256).unwrap();
  let source = random_bytes(11, TEST_SIZE);
  let expected = crc32(&source);

  let writer = buffer.writer().unwrap();
  let to_write = source.clone();
  let producer = tokio::spawn(async move {
    writer.write_all_async(&to_write).await.unwrap();
    writer.close();
  });

  let reader = buffer.reader().unwrap();
  let consumer = tokio::spawn(async move {
    let mut digest = Crc32::new();
    let mut chunk = [0u8; 128];
    loop {
      let n = reader.read_async(&mut chunk).await.unwrap();
      if n == 0 {
        break;
      }
      digest.update(&chunk[..n]);
    }
    digest.finalize()
  });

  tokio::time::timeout(common::LONG_TIMEOUT, async {
    producer.await.unwrap();
    assert_eq!(consumer.await.unwrap(), expected);
  })
  .await
  .expect("async pass-through stalled");
}
