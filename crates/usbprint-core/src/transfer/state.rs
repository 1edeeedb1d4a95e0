//! State shared by the writer, the back-channel reader and the side-channel
//! thread for the duration of one job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::turnstile::Turnstile;
use crate::transport::lock;

/// Print bytes read from the source but not yet accepted by the printer.
#[derive(Debug, Default)]
pub struct PendingData {
    buf: Vec<u8>,
    sent: usize,
}

impl PendingData {
    pub fn is_empty(&self) -> bool {
        self.sent >= self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.sent
    }

    /// Bytes still to be written.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.sent..]
    }

    /// Replace the contents with `data`.
    pub fn fill(&mut self, data: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(data);
        self.sent = 0;
    }

    /// Mark `n` bytes as written.
    pub fn consume(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.buf.len());
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.sent = 0;
    }
}

/// Stop request and completion report for one worker thread.
#[derive(Debug, Default)]
pub struct ThreadSignal {
    stop: AtomicBool,
    done: Mutex<bool>,
    cond: Condvar,
}

impl ThreadSignal {
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn mark_done(&self) {
        *lock(&self.done) = true;
        self.cond.notify_all();
    }

    pub fn is_done(&self) -> bool {
        *lock(&self.done)
    }

    /// Wait up to `timeout` for the thread to report done.
    pub fn wait_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = lock(&self.done);
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            done = match self.cond.wait_timeout(done, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *done
    }

    /// Marks the thread done when dropped, panics included.
    pub fn done_guard(&self) -> DoneGuard<'_> {
        DoneGuard(self)
    }
}

pub struct DoneGuard<'a>(&'a ThreadSignal);

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.0.mark_done();
    }
}

/// Everything the three job threads share.
#[derive(Debug)]
pub struct TransferSession {
    pub turnstile: Turnstile,
    pub pending: Mutex<PendingData>,
    /// Keep the reader going after a stop request.
    pub wait_eof: AtomicBool,
    /// Set by the side channel, cleared once output is drained.
    pub drain_requested: AtomicBool,
    /// The printer is still claimed.
    pub connected: AtomicBool,
    pub reader: ThreadSignal,
    pub side: ThreadSignal,
}

impl TransferSession {
    /// Fresh state with the turnstile held by the writer.
    pub fn new(wait_eof: bool) -> Self {
        Self {
            turnstile: Turnstile::new_held(),
            pending: Mutex::new(PendingData::default()),
            wait_eof: AtomicBool::new(wait_eof),
            drain_requested: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            reader: ThreadSignal::default(),
            side: ThreadSignal::default(),
        }
    }

    pub fn wait_eof(&self) -> bool {
        self.wait_eof.load(Ordering::SeqCst)
    }

    /// Whether the back-channel reader should run another iteration.
    pub fn reader_should_continue(&self) -> bool {
        self.wait_eof() || !self.reader.stop_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pending_data() {
        let mut pending = PendingData::default();
        assert!(pending.is_empty());

        pending.fill(b"abcdef");
        pending.consume(4);
        assert_eq!(pending.remaining(), b"ef");
        assert_eq!(pending.len(), 2);

        pending.consume(10);
        assert!(pending.is_empty());

        pending.fill(b"xy");
        pending.clear();
        assert!(pending.is_empty());
    }

    #[test]
    fn test_wait_done_times_out() {
        let signal = ThreadSignal::default();
        let start = Instant::now();
        assert!(!signal.wait_done(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_done_guard_signals_waiter() {
        let signal = Arc::new(ThreadSignal::default());
        let worker = {
            let signal = signal.clone();
            thread::spawn(move || {
                let _done = signal.done_guard();
                thread::sleep(Duration::from_millis(20));
            })
        };
        assert!(signal.wait_done(Duration::from_secs(5)));
        worker.join().unwrap();
        assert!(signal.is_done());
    }

    #[test]
    fn test_reader_continuation() {
        let session = TransferSession::new(true);
        session.reader.request_stop();
        assert!(session.reader_should_continue());
        session.wait_eof.store(false, Ordering::SeqCst);
        assert!(!session.reader_should_continue());

        let session = TransferSession::new(false);
        assert!(session.reader_should_continue());
        session.reader.request_stop();
        assert!(!session.reader_should_continue());
    }
}
