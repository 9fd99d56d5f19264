//! Physical timer hosts
//!
//! The scheduler consumes a single one-shot physical timer and a millisecond
//! clock from its host. Firing is driven from outside: whoever owns the host
//! calls [`crate::Scheduler::fire`] with the armed handle once its deadline passes.
//!
//! - `VirtualClock`: manually advanced time, for offline stepping and replay
//! - `WallClock`: `Instant`-anchored time with an optional rate multiplier

use crate::callback::{CallbackError, CallbackId};
use crate::domain::DomainLabel;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

/// Opaque handle of an armed physical timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// The currently armed physical timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArmedTimer {
    pub handle: TimerHandle,
    /// Physical time (ms) at which the timer fires.
    pub deadline: u64,
}

/// What the scheduler needs from its host.
pub trait TimerHost {
    /// Current physical time in milliseconds.
    fn now_ms(&self) -> u64;

    /// Arm a one-shot timer `delay_ms` from now.
    fn arm(&mut self, delay_ms: u64) -> TimerHandle;

    /// Cancel an armed timer. Unknown or already-fired handles are ignored.
    fn cancel(&mut self, handle: TimerHandle);

    /// Diagnostic channel for callback failures with no error handler.
    fn report_failure(&mut self, label: &DomainLabel, id: CallbackId, error: &CallbackError) {
        tracing::error!(domain = %label, id = id.0, %error, "delayed callback failed");
    }
}

/// Single-slot timer bookkeeping shared by both hosts.
#[derive(Debug, Default)]
struct TimerSlot {
    armed: Option<ArmedTimer>,
    next_handle: u64,
    armed_count: u64,
    cancelled_count: u64,
}

impl TimerSlot {
    fn arm(&mut self, deadline: u64) -> TimerHandle {
        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        self.armed = Some(ArmedTimer { handle, deadline });
        self.armed_count += 1;
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if self.armed.map(|t| t.handle) == Some(handle) {
            self.armed = None;
            self.cancelled_count += 1;
        }
    }

    /// Consume the armed timer if it is due at `now`.
    fn take_due(&mut self, now: u64) -> Option<ArmedTimer> {
        match self.armed {
            Some(t) if t.deadline <= now => self.armed.take(),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct VirtualState {
    now: u64,
    slot: TimerSlot,
}

/// Manually advanced clock. Clones share state, so a runner can keep one
/// clone while the scheduler owns another.
#[derive(Clone, Debug, Default)]
pub struct VirtualClock {
    inner: Rc<RefCell<VirtualState>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start at `now` instead of zero.
    pub fn starting_at(now: u64) -> Self {
        let c = Self::default();
        c.inner.borrow_mut().now = now;
        c
    }

    pub fn now(&self) -> u64 {
        self.inner.borrow().now
    }

    /// Move time forward. Never moves backwards.
    pub fn set_now(&self, t: u64) {
        let mut s = self.inner.borrow_mut();
        s.now = s.now.max(t);
    }

    pub fn advance(&self, dt: u64) {
        let mut s = self.inner.borrow_mut();
        s.now = s.now.saturating_add(dt);
    }

    pub fn armed(&self) -> Option<ArmedTimer> {
        self.inner.borrow().slot.armed
    }

    /// Take the armed timer if its deadline has passed.
    pub fn take_due(&self) -> Option<ArmedTimer> {
        let mut s = self.inner.borrow_mut();
        let now = s.now;
        s.slot.take_due(now)
    }

    /// Timers armed so far.
    pub fn armed_count(&self) -> u64 {
        self.inner.borrow().slot.armed_count
    }

    pub fn cancelled_count(&self) -> u64 {
        self.inner.borrow().slot.cancelled_count
    }

    /// Physical timers currently outstanding (0 or 1).
    pub fn outstanding(&self) -> usize {
        usize::from(self.inner.borrow().slot.armed.is_some())
    }
}

impl TimerHost for VirtualClock {
    fn now_ms(&self) -> u64 {
        self.now()
    }

    fn arm(&mut self, delay_ms: u64) -> TimerHandle {
        let mut s = self.inner.borrow_mut();
        let deadline = s.now.saturating_add(delay_ms);
        s.slot.arm(deadline)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.inner.borrow_mut().slot.cancel(handle);
    }
}

#[derive(Debug)]
struct WallState {
    rate: f64,
    wall_anchor: Instant,
    logical_anchor_ms: f64,
    slot: TimerSlot,
}

/// Physical clock backed by `Instant`. Time is milliseconds since creation,
/// scaled by `rate`.
#[derive(Clone, Debug)]
pub struct WallClock {
    inner: Rc<RefCell<WallState>>,
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock {
    pub fn new() -> Self {
        Self::with_rate(1.0)
    }

    pub fn with_rate(rate: f64) -> Self {
        let c = Self {
            inner: Rc::new(RefCell::new(WallState {
                rate: 1.0,
                wall_anchor: Instant::now(),
                logical_anchor_ms: 0.0,
                slot: TimerSlot::default(),
            })),
        };
        c.set_rate(rate);
        c
    }

    fn now_f64(&self) -> f64 {
        let s = self.inner.borrow();
        let dt = s.wall_anchor.elapsed().as_secs_f64() * 1000.0;
        s.logical_anchor_ms + dt * s.rate
    }

    pub fn now(&self) -> u64 {
        self.now_f64() as u64
    }

    /// Set the dilation rate; re-anchors so time stays continuous.
    pub fn set_rate(&self, rate: f64) {
        let r = if rate.is_finite() && rate > 0.0 {
            rate
        } else {
            1.0
        };
        let l = self.now_f64();
        let mut s = self.inner.borrow_mut();
        s.logical_anchor_ms = l;
        s.wall_anchor = Instant::now();
        s.rate = r;
    }

    pub fn rate(&self) -> f64 {
        self.inner.borrow().rate
    }

    pub fn armed(&self) -> Option<ArmedTimer> {
        self.inner.borrow().slot.armed
    }

    pub fn take_due(&self) -> Option<ArmedTimer> {
        let now = self.now();
        self.inner.borrow_mut().slot.take_due(now)
    }
}

impl TimerHost for WallClock {
    fn now_ms(&self) -> u64 {
        self.now()
    }

    fn arm(&mut self, delay_ms: u64) -> TimerHandle {
        let deadline = self.now().saturating_add(delay_ms);
        self.inner.borrow_mut().slot.arm(deadline)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.inner.borrow_mut().slot.cancel(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_clock_single_slot() {
        let mut clock = VirtualClock::new();
        let h1 = clock.arm(100);
        assert_eq!(clock.armed().map(|t| t.deadline), Some(100));

        clock.cancel(h1);
        assert_eq!(clock.outstanding(), 0);
        // Cancelling again is a no-op
        clock.cancel(h1);
        assert_eq!(clock.cancelled_count(), 1);

        let h2 = clock.arm(50);
        assert_ne!(h1, h2);
        assert_eq!(clock.armed_count(), 2);
    }

    #[test]
    fn test_take_due() {
        let mut clock = VirtualClock::starting_at(10);
        let h = clock.arm(5);
        assert!(clock.take_due().is_none());
        clock.advance(5);
        assert_eq!(clock.take_due().map(|t| t.handle), Some(h));
        assert_eq!(clock.outstanding(), 0);
    }

    #[test]
    fn test_virtual_clock_is_monotonic() {
        let clock = VirtualClock::starting_at(30);
        clock.set_now(10);
        assert_eq!(clock.now(), 30);
    }

    #[test]
    fn test_wall_clock_rate() {
        let clock = WallClock::with_rate(f64::NAN);
        assert_eq!(clock.rate(), 1.0);
        clock.set_rate(4.0);
        assert_eq!(clock.rate(), 4.0);
        let t0 = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.now() >= t0 + 5);
    }
}
