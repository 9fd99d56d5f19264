//! Engine - offline and realtime drivers for the physical timer
//!
//! The scheduler only arms and cancels a timer; something has to wait for it
//! and call `fire`. The engine provides the two usual drivers:
//! - Offline: a `VirtualClock` stepped explicitly, faster than realtime and replayable
//! - Realtime: a `WallClock` with spin_sleep for precise waits

use crate::callback::{CallbackId, CallbackOptions, CallbackResult};
use crate::error::SchedulerError;
use crate::host::{VirtualClock, WallClock};
use crate::queue::{ExecutionQueue, SortedQueue};
use crate::scheduler::{DrainReport, Scheduler, SchedulerConfig};
use spin_sleep::SpinSleeper;
use std::time::Duration;

/// Configuration for the runners.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Realtime dilation: physical milliseconds per wall millisecond.
    pub rate: f64,
    /// Realtime polling sleep when waiting on an external condition with nothing armed.
    pub idle_sleep_ms: u64,
    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate: 1.0,
            idle_sleep_ms: 1,
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Steps a virtual clock and fires the scheduler's timer at each deadline.
pub struct OfflineRunner<Q: ExecutionQueue = SortedQueue> {
    clock: VirtualClock,
    scheduler: Scheduler<VirtualClock, Q>,
}

impl OfflineRunner<SortedQueue> {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }
}

impl Default for OfflineRunner<SortedQueue> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Q: ExecutionQueue> OfflineRunner<Q> {
    pub fn with_config(config: EngineConfig) -> Self {
        Self::starting_at(0, config)
    }

    /// Start the virtual clock at `t0` milliseconds.
    pub fn starting_at(t0: u64, config: EngineConfig) -> Self {
        let clock = VirtualClock::starting_at(t0);
        let scheduler = Scheduler::with_config(clock.clone(), config.scheduler);
        Self { clock, scheduler }
    }

    pub fn scheduler(&self) -> Scheduler<VirtualClock, Q> {
        self.scheduler.clone()
    }

    pub fn clock(&self) -> VirtualClock {
        self.clock.clone()
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn schedule_once<F>(
        &self,
        action: F,
        timeout_ms: i64,
        opts: CallbackOptions,
    ) -> Result<CallbackId, SchedulerError>
    where
        F: FnMut() -> CallbackResult + 'static,
    {
        self.scheduler.schedule_once(action, timeout_ms, opts)
    }

    pub fn schedule_repeating<F>(
        &self,
        action: F,
        interval_ms: i64,
        opts: CallbackOptions,
    ) -> Result<CallbackId, SchedulerError>
    where
        F: FnMut() -> CallbackResult + 'static,
    {
        self.scheduler.schedule_repeating(action, interval_ms, opts)
    }

    /// Fire the armed timer once if its deadline has passed.
    pub fn fire_due(&mut self) -> Result<Option<DrainReport>, SchedulerError> {
        match self.clock.take_due() {
            Some(timer) => self.scheduler.fire(timer.handle).map(Some),
            None => Ok(None),
        }
    }

    /// Advance to `target`, firing at every armed deadline on the way.
    /// Each fire happens with the clock exactly at its deadline.
    pub fn advance_to(&mut self, target: u64) -> Result<DrainReport, SchedulerError> {
        let mut total = DrainReport::default();
        loop {
            let Some(timer) = self.clock.armed() else {
                break;
            };
            if timer.deadline > target {
                break;
            }
            self.clock.set_now(timer.deadline);
            if let Some(report) = self.fire_due()? {
                merge(&mut total, report);
            }
        }
        self.clock.set_now(target);
        Ok(total)
    }

    /// Advance by `dt` milliseconds.
    pub fn step_ms(&mut self, dt: u64) -> Result<DrainReport, SchedulerError> {
        let target = self.clock.now().saturating_add(dt);
        self.advance_to(target)
    }

    /// Move time to `t` without firing anything, as if the host stalled.
    /// The next `fire_due` then has to catch up on everything overdue.
    pub fn jump_to(&mut self, t: u64) {
        self.clock.set_now(t);
    }

    /// Keep firing until nothing is pending. Jumps straight to each deadline.
    /// Returns the number of fires; stops after `max_fires`.
    pub fn run_until_idle(&mut self, max_fires: usize) -> Result<usize, SchedulerError> {
        let mut fires = 0;
        while fires < max_fires {
            let Some(timer) = self.clock.armed() else {
                break;
            };
            self.clock.set_now(timer.deadline);
            self.fire_due()?;
            fires += 1;
        }
        Ok(fires)
    }
}

/// Sleeps until the armed deadline and fires, on the wall clock.
pub struct RealtimeRunner<Q: ExecutionQueue = SortedQueue> {
    clock: WallClock,
    scheduler: Scheduler<WallClock, Q>,
    sleeper: SpinSleeper,
    idle_sleep: Duration,
}

impl RealtimeRunner<SortedQueue> {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }
}

impl Default for RealtimeRunner<SortedQueue> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Q: ExecutionQueue> RealtimeRunner<Q> {
    pub fn with_config(config: EngineConfig) -> Self {
        let clock = WallClock::with_rate(config.rate);
        let scheduler = Scheduler::with_config(clock.clone(), config.scheduler);
        Self {
            clock,
            scheduler,
            sleeper: SpinSleeper::default(),
            idle_sleep: Duration::from_millis(config.idle_sleep_ms.max(1)),
        }
    }

    pub fn scheduler(&self) -> Scheduler<WallClock, Q> {
        self.scheduler.clone()
    }

    pub fn clock(&self) -> WallClock {
        self.clock.clone()
    }

    /// Run until no timer is armed.
    pub fn run_until_idle(&mut self) -> Result<DrainReport, SchedulerError> {
        let mut total = DrainReport::default();
        while self.clock.armed().is_some() {
            if let Some(report) = self.wait_and_fire()? {
                merge(&mut total, report);
            }
        }
        Ok(total)
    }

    /// Run until `is_done` returns true, idling while nothing is armed.
    pub fn run_until<F>(&mut self, is_done: F) -> Result<DrainReport, SchedulerError>
    where
        F: Fn() -> bool,
    {
        let mut total = DrainReport::default();
        while !is_done() {
            if self.clock.armed().is_none() {
                self.sleeper.sleep(self.idle_sleep);
                continue;
            }
            if let Some(report) = self.wait_and_fire()? {
                merge(&mut total, report);
            }
        }
        Ok(total)
    }

    fn wait_and_fire(&mut self) -> Result<Option<DrainReport>, SchedulerError> {
        let Some(timer) = self.clock.armed() else {
            return Ok(None);
        };
        let now = self.clock.now();
        if timer.deadline > now {
            // Sleep until due
            let dt_wall_ms = (timer.deadline - now) as f64 / self.clock.rate();
            self.sleeper.sleep(Duration::from_secs_f64(dt_wall_ms / 1000.0));
        }
        match self.clock.take_due() {
            Some(t) => self.scheduler.fire(t.handle).map(Some),
            None => Ok(None),
        }
    }
}

fn merge(total: &mut DrainReport, r: DrainReport) {
    total.executed += r.executed;
    total.failed += r.failed;
    total.ticks += r.ticks;
    total.yielded |= r.yielded;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_offline_basic() {
        let counter = Rc::new(Cell::new(0));
        let mut runner = OfflineRunner::new();

        let c = counter.clone();
        runner
            .schedule_once(
                move || {
                    c.set(c.get() + 1);
                    Ok(())
                },
                100,
                CallbackOptions::new(),
            )
            .unwrap();

        // Initially nothing has run
        assert_eq!(counter.get(), 0);

        runner.step_ms(99).unwrap();
        assert_eq!(counter.get(), 0);

        runner.step_ms(1).unwrap();
        assert_eq!(counter.get(), 1);
        assert!(runner.scheduler().is_idle());
        assert_eq!(runner.now(), 100);
    }

    #[test]
    fn test_offline_repeating() {
        let fired_at = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut runner = OfflineRunner::new();
        let clock = runner.clock();

        let f = fired_at.clone();
        runner
            .schedule_repeating(
                move || {
                    f.borrow_mut().push(clock.now());
                    Ok(())
                },
                30,
                CallbackOptions::new().domain("tick"),
            )
            .unwrap();

        runner.advance_to(100).unwrap();
        assert_eq!(*fired_at.borrow(), vec![30, 60, 90]);
        assert_eq!(runner.scheduler().next_tick(), Some(120));
    }

    #[test]
    fn test_run_until_idle() {
        let mut runner = OfflineRunner::new();
        for t in [5, 50, 500] {
            runner.schedule_once(|| Ok(()), t, CallbackOptions::new()).unwrap();
        }
        let fires = runner.run_until_idle(10).unwrap();
        assert_eq!(fires, 3);
        assert_eq!(runner.now(), 500);
        assert!(runner.scheduler().is_idle());
    }

    #[test]
    fn test_realtime_basic() {
        let counter = Rc::new(Cell::new(0));
        let mut runner: RealtimeRunner = RealtimeRunner::with_config(EngineConfig {
            rate: 10.0,
            ..Default::default()
        });

        for t in [10, 20, 30] {
            let c = counter.clone();
            runner
                .scheduler()
                .schedule_once(
                    move || {
                        c.set(c.get() + 1);
                        Ok(())
                    },
                    t,
                    CallbackOptions::new().domain("rt"),
                )
                .unwrap();
        }

        let report = runner.run_until_idle().unwrap();
        assert_eq!(report.executed, 3);
        assert_eq!(counter.get(), 3);
        assert!(runner.scheduler().is_idle());
    }
}
