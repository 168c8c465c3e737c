//! Rate limiting for hardware callbacks.
//!
//! Both types are driven by explicit `Instant`s so the worker threads that own
//! them stay thin and the timing rules are testable without sleeping.

use std::time::{Duration, Instant};

/// Emits the most recent value offered during each interval.
///
/// Bounds the rate at which volume/mute chatter reaches observers while never
/// dropping the final value of a burst.
#[derive(Debug)]
pub struct Sampler<T> {
    interval: Duration,
    latest: Option<T>,
    next_tick: Instant,
}

impl<T> Sampler<T> {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            latest: None,
            next_tick: now + interval,
        }
    }

    /// Record a value, replacing anything not yet emitted.
    pub fn offer(&mut self, value: T) {
        self.latest = Some(value);
    }

    /// Return the pending value if the current interval has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        if now < self.next_tick {
            return None;
        }
        self.next_tick = now + self.interval;
        self.latest.take()
    }

    pub fn next_tick(&self) -> Instant {
        self.next_tick
    }

    pub fn has_pending(&self) -> bool {
        self.latest.is_some()
    }
}

/// Fires once after a quiet period following the last trigger.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Arm or re-arm the window.
    pub fn trigger(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    /// True exactly once when the armed window has elapsed.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
