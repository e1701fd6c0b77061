// examples/relay.rs
//
// Pump bytes from a producer to a consumer through a small bounded buffer,
// watching backpressure pause and resume the writer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use weir::{BufferConfig, PipeReader, PipeWriter, Routine, StreamBuffer};

fn main() -> Result<(), Box<dyn std::error::Error>> {
  env_logger::init();

  const TRANSFER: usize = 64 * 1024;
  let buffer = StreamBuffer::new(BufferConfig::new(4096, 0.5)?);
  let delivered = Arc::new(AtomicUsize::new(0));

  buffer.start_background_write(
    Routine::sync(|writer: PipeWriter| {
      let chunk = [0xABu8; 1024];
      let mut sent = 0;
      while sent < TRANSFER {
        writer.write_all(&chunk)?;
        sent += chunk.len();
      }
      writer.close();
      println!("[writer] {} bytes written", sent);
      Ok(())
    }),
    None,
  )?;

  let delivered_clone = Arc::clone(&delivered);
  buffer.start_background_read(
    Routine::sync(move |reader: PipeReader| {
      let mut chunk = [0u8; 512];
      loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
          break;
        }
        delivered_clone.fetch_add(n, Ordering::Relaxed);
        // A deliberately slow consumer: the writer spends most of its time
        // paused on backpressure.
        thread::sleep(Duration::from_millis(1));
      }
      Ok(())
    }),
    None,
  )?;

  while !buffer.wait_for_background(Some(Duration::from_millis(200)), None) {
    println!(
      "[main] {} / {} bytes delivered, {} buffered",
      delivered.load(Ordering::Relaxed),
      TRANSFER,
      buffer.reader()?.len()
    );
  }

  println!("[main] done: {} bytes", delivered.load(Ordering::Relaxed));
  buffer.dispose();
  Ok(())
}
