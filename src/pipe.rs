//! In-memory duplex plumbing: a one-directional blocking byte pipe.
//!
//! The stream-translation layer builds two of these per connection to stand
//! in for the wire between the loop and the translator. Reads block until
//! bytes or EOF arrive; writes never block (the buffer is unbounded and
//! drained by the loop).

use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Default)]
struct Inner {
    buf: Vec<u8>,
    write_closed: bool,
    read_closed: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    cond: Condvar,
}

pub(crate) fn pipe() -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner::default()),
        cond: Condvar::new(),
    });
    (
        PipeReader {
            shared: shared.clone(),
        },
        PipeWriter { shared },
    )
}

pub(crate) struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    pub fn close(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.read_closed = true;
        self.shared.cond.notify_all();
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.shared.inner.lock().unwrap();
        loop {
            if !inner.buf.is_empty() {
                let n = buf.len().min(inner.buf.len());
                buf[..n].copy_from_slice(&inner.buf[..n]);
                inner.buf.drain(..n);
                return Ok(n);
            }
            if inner.write_closed || inner.read_closed {
                return Ok(0);
            }
            inner = self.shared.cond.wait(inner).unwrap();
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    pub fn close(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.write_closed = true;
        self.shared.cond.notify_all();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.read_closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        if inner.write_closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write end closed"));
        }
        inner.buf.extend_from_slice(buf);
        self.shared.cond.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}
