//! Read/write turnstile.
//!
//! The writer holds the turnstile except while it waits for print data. A
//! soft reset may only touch the device while holding it, so a reset and a
//! bulk write are never in flight together.

use std::sync::{Condvar, Mutex};

use tracing::trace;

use crate::protocol::constants::TURNSTILE_SIGNAL_INTERVAL;
use crate::transport::lock;

#[derive(Debug)]
pub struct Turnstile {
    held: Mutex<bool>,
    cond: Condvar,
}

impl Turnstile {
    pub fn new_held() -> Self {
        Self {
            held: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    pub fn is_held(&self) -> bool {
        *lock(&self.held)
    }

    /// Block until free, then take it.
    ///
    /// Waiters wake every second and poke the other side in case a signal
    /// was missed.
    pub fn acquire(&self) {
        let mut held = lock(&self.held);
        while *held {
            let (guard, timeout) = match self.cond.wait_timeout(held, TURNSTILE_SIGNAL_INTERVAL) {
                Ok(result) => result,
                Err(poisoned) => poisoned.into_inner(),
            };
            held = guard;
            if timeout.timed_out() && *held {
                trace!("Still waiting for the turnstile");
                self.cond.notify_all();
            }
        }
        *held = true;
    }

    pub fn release(&self) {
        *lock(&self.held) = false;
        self.cond.notify_all();
    }

    /// Run `f` with the turnstile released, taking it back afterwards even
    /// if `f` panics.
    pub fn released<T>(&self, f: impl FnOnce() -> T) -> T {
        self.release();
        let _reacquire = Reacquire(self);
        f()
    }

    /// Run `f` while holding the turnstile.
    pub fn hold<T>(&self, f: impl FnOnce() -> T) -> T {
        self.acquire();
        let _release = Release(self);
        f()
    }
}

struct Reacquire<'a>(&'a Turnstile);

impl Drop for Reacquire<'_> {
    fn drop(&mut self) {
        self.0.acquire();
    }
}

struct Release<'a>(&'a Turnstile);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}
