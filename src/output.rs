//! The shared per-processor output buffer.
//!
//! Probe handlers may run in contexts that cannot block, so the buffer is
//! only ever acquired with a non-blocking `try_lock`; contention degrades to
//! "no output" rather than waiting. The buffer has two modes: flush-through
//! (every write is pushed to the real sink) and capture (writes accumulate
//! so a front end can copy them out as a string).

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

/// Capacity of one per-processor buffer.
pub const LOG_BUF_SIZE: usize = 8192;

/// The real sink behind a buffer (relay channel, console, test capture).
pub trait OutputSink {
    fn write(&self, bytes: &[u8]);
}

struct LogInner {
    buf: Vec<u8>,
    no_flush: bool,
    is_full: bool,
}

/// One processor's output buffer. Embedders create one per CPU; firings on
/// that CPU share it, which is why acquisition must never wait.
pub struct LogBuffer {
    sink: Arc<dyn OutputSink + Send + Sync>,
    inner: Mutex<LogInner>,
}

impl LogBuffer {
    pub fn new(sink: Arc<dyn OutputSink + Send + Sync>) -> LogBuffer {
        LogBuffer {
            sink,
            inner: Mutex::new(LogInner {
                buf: Vec::with_capacity(LOG_BUF_SIZE),
                no_flush: false,
                is_full: false,
            }),
        }
    }

    /// Exclusive, non-blocking acquire. `None` on contention (or a poisoned
    /// lock); the caller degrades its result instead of waiting.
    pub fn try_lock(&self) -> Option<LogGuard<'_>> {
        match self.inner.try_lock() {
            Ok(inner) => Some(LogGuard {
                inner,
                sink: &*self.sink,
            }),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(_)) => None,
        }
    }
}

/// Scoped access to a locked buffer. Dropping the guard releases the lock on
/// every path.
pub struct LogGuard<'a> {
    inner: MutexGuard<'a, LogInner>,
    sink: &'a (dyn OutputSink + Send + Sync),
}

impl LogGuard<'_> {
    /// Bytes currently held in the buffer (only meaningful in capture mode;
    /// flush-through leaves the buffer empty).
    pub fn bytes(&self) -> &[u8] {
        &self.inner.buf
    }

    /// Whether a capture overran the buffer and dropped bytes.
    pub fn is_full(&self) -> bool {
        self.inner.is_full
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let room = LOG_BUF_SIZE - self.inner.buf.len();
        if bytes.len() > room {
            let take = &bytes[..room];
            self.inner.buf.extend_from_slice(take);
            self.inner.is_full = true;
        } else {
            self.inner.buf.extend_from_slice(bytes);
        }
        if !self.inner.no_flush {
            self.flush();
        }
    }

    /// Push buffered bytes to the sink and reset.
    pub fn flush(&mut self) {
        if !self.inner.buf.is_empty() {
            self.sink.write(&self.inner.buf);
            self.inner.buf.clear();
        }
        self.inner.is_full = false;
    }

    /// Enter capture mode: anything already pending goes to the sink first,
    /// then writes accumulate in the buffer.
    pub fn begin_capture(&mut self) {
        self.flush();
        self.inner.no_flush = true;
    }

    /// Leave capture mode, discarding captured bytes and restoring
    /// flush-through behavior.
    pub fn end_capture(&mut self) {
        self.inner.no_flush = false;
        self.inner.is_full = false;
        self.inner.buf.clear();
    }
}

impl fmt::Write for LogGuard<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}
