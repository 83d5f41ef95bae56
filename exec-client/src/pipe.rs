// Byte pipe between the remote process's forwarded output and a console reader
//
// Single producer, single consumer. Writes never block (the ring grows),
// reads block until data arrives or the pipe is closed.

use std::io::{self, Read};
use std::sync::{Arc, Condvar, Mutex};

/// Starting ring capacity; doubled whenever a write finds the ring full.
pub const INITIAL_SIZE: usize = 128;

#[derive(Debug)]
struct Ring {
    buf: Box<[u8]>,
    head: usize,
    len: usize,
    closed: bool,
}

impl Ring {
    fn grow(&mut self) {
        let mut bigger = vec![0u8; self.buf.len() * 2].into_boxed_slice();
        // Linearize: pending bytes land at the front of the new ring in
        // logical order, head resets to zero.
        let cap = self.buf.len();
        let first = cap - self.head;
        if self.len <= first {
            bigger[..self.len].copy_from_slice(&self.buf[self.head..self.head + self.len]);
        } else {
            bigger[..first].copy_from_slice(&self.buf[self.head..]);
            bigger[first..self.len].copy_from_slice(&self.buf[..self.len - first]);
        }
        self.buf = bigger;
        self.head = 0;
    }

    fn push(&mut self, byte: u8) {
        if self.len == self.buf.len() {
            self.grow();
        }
        let tail = (self.head + self.len) % self.buf.len();
        self.buf[tail] = byte;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let byte = self.buf[self.head];
        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        Some(byte)
    }
}

/// Blocking FIFO byte pipe with an auto-growing ring buffer.
///
/// `read` returns `None` once the pipe is closed and drained; writing to a
/// closed pipe is a caller bug and panics.
#[derive(Debug)]
pub struct Pipe {
    ring: Mutex<Ring>,
    readable: Condvar,
}

impl Pipe {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "pipe capacity must be non-zero");
        Self {
            ring: Mutex::new(Ring {
                buf: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                len: 0,
                closed: false,
            }),
            readable: Condvar::new(),
        }
    }

    /// Append one byte, growing the ring if full, and wake a blocked reader.
    ///
    /// # Panics
    /// Panics if the pipe has been closed.
    pub fn write(&self, byte: u8) {
        let mut ring = self.ring.lock().unwrap();
        assert!(!ring.closed, "write to closed pipe");
        ring.push(byte);
        self.readable.notify_one();
    }

    /// Append a whole buffer under one lock acquisition.
    ///
    /// # Panics
    /// Panics if the pipe has been closed.
    pub fn write_all(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut ring = self.ring.lock().unwrap();
        assert!(!ring.closed, "write to closed pipe");
        for &byte in bytes {
            ring.push(byte);
        }
        self.readable.notify_one();
    }

    /// Append a buffer unless the pipe is already closed. Used by the
    /// channel demux task, which may race with `close_streams`; output
    /// arriving after closure is dropped, not an error.
    pub(crate) fn write_all_if_open(&self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        let mut ring = self.ring.lock().unwrap();
        if ring.closed {
            return false;
        }
        for &byte in bytes {
            ring.push(byte);
        }
        self.readable.notify_one();
        true
    }

    /// Next byte in FIFO order; blocks while the pipe is empty and open.
    /// `None` is the end-of-stream sentinel: the pipe is closed and drained,
    /// and every subsequent call returns `None` as well.
    pub fn read(&self) -> Option<u8> {
        let mut ring = self.ring.lock().unwrap();
        while ring.len == 0 && !ring.closed {
            ring = self.readable.wait(ring).unwrap();
        }
        ring.pop()
    }

    /// Drain up to `out.len()` pending bytes, blocking for the first one.
    /// Returns 0 only at end of stream.
    pub fn read_into(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let mut ring = self.ring.lock().unwrap();
        while ring.len == 0 && !ring.closed {
            ring = self.readable.wait(ring).unwrap();
        }
        let mut count = 0;
        while count < out.len() {
            match ring.pop() {
                Some(byte) => {
                    out[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// Close the pipe and wake all blocked readers. Idempotent. Pending
    /// bytes remain readable; only a drained closed pipe reports end of
    /// stream.
    pub fn close(&self) {
        let mut ring = self.ring.lock().unwrap();
        ring.closed = true;
        self.readable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.ring.lock().unwrap().closed
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

/// `std::io::Read` adapter over a shared pipe, for output pump threads.
#[derive(Debug, Clone)]
pub struct PipeReader {
    pipe: Arc<Pipe>,
}

impl PipeReader {
    pub fn new(pipe: Arc<Pipe>) -> Self {
        Self { pipe }
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.pipe.read_into(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn bytes_come_back_in_write_order() {
        let pipe = Pipe::new();
        pipe.write(1);
        pipe.write(2);
        pipe.write(3);
        assert_eq!(pipe.read(), Some(1));
        assert_eq!(pipe.read(), Some(2));
        assert_eq!(pipe.read(), Some(3));
    }

    #[test]
    fn fifo_survives_growth() {
        let pipe = Pipe::new();
        let payload: Vec<u8> = (0..=255).cycle().take(INITIAL_SIZE * 3 + 17).collect();
        for &byte in &payload {
            pipe.write(byte);
        }
        for &expected in &payload {
            assert_eq!(pipe.read(), Some(expected));
        }
    }

    #[test]
    fn growth_from_wrapped_state_keeps_order() {
        // Advance head, then refill past capacity so the pending bytes wrap
        // around the ring edge when the resize copies them out.
        let pipe = Pipe::with_capacity(8);
        for byte in 0..8 {
            pipe.write(byte);
        }
        for byte in 0..5 {
            assert_eq!(pipe.read(), Some(byte));
        }
        for byte in 8..30 {
            pipe.write(byte);
        }
        for expected in 5..30 {
            assert_eq!(pipe.read(), Some(expected));
        }
    }

    #[test]
    fn close_drains_then_signals_end_of_stream() {
        let pipe = Pipe::new();
        pipe.write_all(&[10, 20]);
        pipe.close();
        assert_eq!(pipe.read(), Some(10));
        assert_eq!(pipe.read(), Some(20));
        assert_eq!(pipe.read(), None);
        assert_eq!(pipe.read(), None);
    }

    #[test]
    fn close_before_any_write_reads_end_of_stream_immediately() {
        let pipe = Pipe::new();
        pipe.close();
        assert_eq!(pipe.read(), None);
    }

    #[test]
    fn close_is_idempotent() {
        let pipe = Pipe::new();
        pipe.close();
        pipe.close();
        assert!(pipe.is_closed());
    }

    #[test]
    fn blocked_reader_wakes_on_close() {
        let pipe = Arc::new(Pipe::new());
        pipe.write_all(&[1, 2, 3]);
        assert_eq!(pipe.read(), Some(1));
        assert_eq!(pipe.read(), Some(2));
        assert_eq!(pipe.read(), Some(3));

        let reader = Arc::clone(&pipe);
        let handle = thread::spawn(move || reader.read());
        thread::sleep(Duration::from_millis(50));
        pipe.close();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn blocked_reader_wakes_on_write() {
        let pipe = Arc::new(Pipe::new());
        let reader = Arc::clone(&pipe);
        let handle = thread::spawn(move || reader.read());
        thread::sleep(Duration::from_millis(50));
        pipe.write(42);
        assert_eq!(handle.join().unwrap(), Some(42));
    }

    #[test]
    #[should_panic(expected = "write to closed pipe")]
    fn write_after_close_is_a_usage_error() {
        let pipe = Pipe::new();
        pipe.close();
        pipe.write(1);
    }

    #[test]
    fn reader_adapter_drains_in_chunks() {
        let pipe = Arc::new(Pipe::new());
        pipe.write_all(b"hello world");
        pipe.close();

        let mut reader = PipeReader::new(Arc::clone(&pipe));
        let mut collected = Vec::new();
        let mut chunk = [0u8; 4];
        loop {
            let n = reader.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(collected, b"hello world");
    }
}
