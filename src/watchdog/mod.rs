//! Idle watchdog and profile-based refresh scheduler
//!
//! This module provides:
//! - A countdown watchdog that fires a callback once per countdown cycle,
//!   used to deactivate the background balance refresh when the UI goes idle
//! - A periodic-action scheduler with named cadence profiles; elevated
//!   profiles run faster for a bounded duration, then revert to the default

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Ticks a fresh watchdog counts down before firing.
pub const DEFAULT_TIMEOUT_TICKS: u32 = 10;

/// Countdown state driven by an external tick signal. Reaching zero invokes
/// the action exactly once, then the watchdog stays expired until `reset()`.
pub struct Watchdog {
    timeout: u32,
    default_timeout: u32,
    fired: bool,
    action: Option<Box<dyn FnMut() + Send>>,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT_TICKS)
    }

    pub fn with_timeout(ticks: u32) -> Self {
        Self {
            timeout: ticks,
            default_timeout: ticks,
            fired: false,
            action: None,
        }
    }

    pub fn set_action<F: FnMut() + Send + 'static>(&mut self, action: F) {
        self.action = Some(Box::new(action));
    }

    pub fn set_timeout(&mut self, ticks: u32) {
        self.timeout = ticks;
        self.fired = false;
    }

    pub fn remaining(&self) -> u32 {
        self.timeout
    }

    /// One external tick. Fires the action when the countdown first reaches
    /// zero; further ticks are no-ops until reset.
    pub fn tick(&mut self) {
        self.timeout = self.timeout.saturating_sub(1);
        debug!("watchdog tick, {} remaining", self.timeout);
        if self.timeout == 0 && !self.fired {
            self.fired = true;
            if let Some(action) = self.action.as_mut() {
                debug!("watchdog expired, running action");
                action();
            }
        }
    }

    /// Re-arm the countdown at its default timeout.
    pub fn reset(&mut self) {
        self.timeout = self.default_timeout;
        self.fired = false;
    }
}

/// Named cadence profiles for the background refresh action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleState {
    Default,
    AddressCopied,
    BalanceChangePresumed,
}

/// One profile's timing: action interval, optional bounded duration after
/// which the scheduler reverts to [`ScheduleState::Default`], and optional
/// first-run latency.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleItem {
    pub interval: Duration,
    pub duration: Option<Duration>,
    pub latency: Option<Duration>,
}

impl ScheduleItem {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            duration: None,
            latency: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

pub type Schedule = HashMap<ScheduleState, ScheduleItem>;

/// The production cadences: a slow default refresh, and two elevated
/// profiles used after an address copy or a presumed balance change.
pub fn default_schedule() -> Schedule {
    HashMap::from([
        (
            ScheduleState::Default,
            ScheduleItem::new(Duration::from_secs(600)),
        ),
        (
            ScheduleState::AddressCopied,
            ScheduleItem::new(Duration::from_secs(30))
                .with_duration(Duration::from_secs(1200))
                .with_latency(Duration::from_secs(120)),
        ),
        (
            ScheduleState::BalanceChangePresumed,
            ScheduleItem::new(Duration::from_secs(30)).with_duration(Duration::from_secs(1200)),
        ),
    ])
}

struct SchedulerInner {
    schedule: Schedule,
    state: ScheduleState,
    active: bool,
    action: Option<Arc<dyn Fn() + Send + Sync>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerInner {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Periodic-action scheduler with profile switching. Switching profiles
/// cancels the previous profile's timers and starts fresh ones.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Mutex<SchedulerInner>>,
}

impl Scheduler {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SchedulerInner {
                schedule,
                state: ScheduleState::Default,
                active: false,
                action: None,
                tasks: Vec::new(),
            })),
        }
    }

    pub fn set_action<F: Fn() + Send + Sync + 'static>(&self, action: F) {
        self.inner.lock().unwrap().action = Some(Arc::new(action));
    }

    pub fn activate(&self) {
        self.inner.lock().unwrap().active = true;
    }

    pub fn deactivate(&self) {
        self.inner.lock().unwrap().active = false;
    }

    pub fn state(&self) -> ScheduleState {
        self.inner.lock().unwrap().state
    }

    fn run_action(inner: &Arc<Mutex<SchedulerInner>>) {
        let action = {
            let guard = inner.lock().unwrap();
            if !guard.active {
                return;
            }
            guard.action.clone()
        };
        if let Some(action) = action {
            action();
        }
    }

    /// Switch to a profile: cancel all pending timers of the previous one,
    /// then start the new profile's action loop and, for bounded profiles,
    /// its expiry timer.
    pub fn change_state_to(&self, state: ScheduleState) {
        debug!("scheduler state change to {state:?}");
        let item = {
            let mut guard = self.inner.lock().unwrap();
            guard.abort_tasks();
            guard.state = state;
            match guard.schedule.get(&state) {
                Some(item) => *item,
                None => return,
            }
        };

        let inner = Arc::clone(&self.inner);
        let action_loop = tokio::spawn(async move {
            if let Some(latency) = item.latency {
                sleep(latency).await;
            }
            loop {
                Scheduler::run_action(&inner);
                sleep(item.interval).await;
            }
        });
        self.inner.lock().unwrap().tasks.push(action_loop);

        if let Some(duration) = item.duration {
            let scheduler = self.clone();
            let total = item.latency.unwrap_or(Duration::ZERO) + duration;
            let expiry = tokio::spawn(async move {
                sleep(total).await;
                scheduler.change_state_to(ScheduleState::Default);
            });
            self.inner.lock().unwrap().tasks.push(expiry);
        }
    }

    /// Cancel all timers. The scheduler can be restarted with
    /// `change_state_to` afterwards.
    pub fn stop(&self) {
        self.inner.lock().unwrap().abort_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_watchdog_fires_once_and_stays_expired() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let mut watchdog = Watchdog::with_timeout(3);
        watchdog.set_action(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        watchdog.tick();
        watchdog.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        watchdog.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Stays at zero without re-firing
        watchdog.tick();
        watchdog.tick();
        assert_eq!(watchdog.remaining(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watchdog_reset_rearms() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let mut watchdog = Watchdog::with_timeout(1);
        watchdog.set_action(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        watchdog.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        watchdog.reset();
        assert_eq!(watchdog.remaining(), 1);
        watchdog.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    fn fast_schedule() -> Schedule {
        HashMap::from([
            (
                ScheduleState::Default,
                ScheduleItem::new(Duration::from_secs(10)),
            ),
            (
                ScheduleState::AddressCopied,
                ScheduleItem::new(Duration::from_secs(1))
                    .with_duration(Duration::from_secs(5))
                    .with_latency(Duration::from_secs(2)),
            ),
            (
                ScheduleState::BalanceChangePresumed,
                ScheduleItem::new(Duration::from_secs(1)).with_duration(Duration::from_secs(5)),
            ),
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_default_cadence() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let scheduler = Scheduler::new(fast_schedule());
        scheduler.set_action(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.activate();
        scheduler.change_state_to(ScheduleState::Default);

        // First run is immediate
        sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Two more runs at the 10 s cadence
        sleep(Duration::from_secs(25)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_inactive_suppresses_action() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let scheduler = Scheduler::new(fast_schedule());
        scheduler.set_action(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.change_state_to(ScheduleState::Default);

        sleep(Duration::from_secs(15)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        scheduler.activate();
        sleep(Duration::from_secs(10)).await;
        assert!(count.load(Ordering::SeqCst) > 0);

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_elevated_profile_reverts_to_default() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let scheduler = Scheduler::new(fast_schedule());
        scheduler.set_action(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.activate();
        scheduler.change_state_to(ScheduleState::AddressCopied);
        assert_eq!(scheduler.state(), ScheduleState::AddressCopied);

        // Latency window: nothing yet
        sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Elevated cadence runs after the 2 s latency
        sleep(Duration::from_millis(1500)).await;
        assert!(count.load(Ordering::SeqCst) >= 1);

        // After latency + duration the profile reverts to Default
        sleep(Duration::from_secs(6)).await;
        assert_eq!(scheduler.state(), ScheduleState::Default);

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_switch_cancels_previous_timers() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let scheduler = Scheduler::new(fast_schedule());
        scheduler.set_action(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.activate();
        scheduler.change_state_to(ScheduleState::BalanceChangePresumed);

        sleep(Duration::from_millis(2500)).await;
        let elevated_runs = count.load(Ordering::SeqCst);
        assert!(elevated_runs >= 2);

        // Switching to Default cancels the 1 s cadence
        scheduler.change_state_to(ScheduleState::Default);
        let at_switch = count.load(Ordering::SeqCst);
        sleep(Duration::from_secs(3)).await;
        // Only the immediate Default run may have been added
        assert!(count.load(Ordering::SeqCst) <= at_switch + 1);

        scheduler.stop();
    }
}
