//! Wall clock access for slot alignment and sampling windows.
//!
//! Waiting is always done by polling: sleeping is far too coarse for the
//! millisecond alignment both ends rely on.

use std::cell::Cell;
use std::hint::spin_loop;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// The system wall clock. Both ends of the channel read it independently to
/// agree on slot boundaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Deterministic clock: every read returns the current time, then advances
/// it by `step` milliseconds. `advance` lets simulated work consume time.
#[derive(Debug)]
pub struct SteppingClock {
    now: Cell<u64>,
    step: u64,
}

impl SteppingClock {
    pub fn new(start: u64, step: u64) -> Self {
        Self {
            now: Cell::new(start),
            step,
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }

    pub fn set(&self, ms: u64) {
        self.now.set(ms);
    }

    /// Current time without advancing.
    pub fn peek(&self) -> u64 {
        self.now.get()
    }
}

impl Clock for SteppingClock {
    fn now_ms(&self) -> u64 {
        let now = self.now.get();
        self.now.set(now + self.step);
        now
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

impl<C: Clock + ?Sized> Clock for Rc<C> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// Busy-wait until the clock reads an exact multiple of `period_ms`.
/// Returns the reading that matched.
///
/// A boundary skipped by a late read (preemption) is not caught up: the wait
/// continues to the next one.
pub fn spin_until_boundary<C: Clock + ?Sized>(clock: &C, period_ms: u64) -> u64 {
    loop {
        let now = clock.now_ms();
        if now % period_ms == 0 {
            return now;
        }
        spin_loop();
    }
}

/// Busy-wait until the clock reads at least `deadline_ms`.
pub fn spin_until<C: Clock + ?Sized>(clock: &C, deadline_ms: u64) -> u64 {
    loop {
        let now = clock.now_ms();
        if now >= deadline_ms {
            return now;
        }
        spin_loop();
    }
}
