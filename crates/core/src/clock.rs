//! Simulated AVR clock.
//!
//! [`AvrClock`] owns a set of [`AvrTimer`]s and the current simulated time.
//! Each scheduling step converts elapsed wall time into ticks at the
//! configured target clock speed, then services every timer whose next
//! compare match falls inside the step, earliest first. A timer that is due
//! several times within one step fires once per period; its next match is
//! advanced by exactly one period each time so late steps never lose or merge
//! periods. Timers due at the same instant fire in registration order.
//!
//! The scheduling core is [`AvrClock::advance`], which is purely tick-driven
//! and deterministic. [`AvrClock::run_step`] adds the wall-clock conversion.
//! [`ClockDriver`] runs steps on a dedicated thread, paced by [`CpuUsage`].

use crate::stats::{ClockStats, SpeedSample};
use crate::ticks::Ticks;
use crate::timer::AvrTimer;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// RP6 main board clock: 8 MHz
pub const RP6_CLOCK_HZ: u64 = 8_000_000;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Opaque reference to a timer registered with an [`AvrClock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerHandle(u32);

impl TimerHandle {
    pub fn id(&self) -> u32 { self.0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Stopped,
    Running,
}

/// Host CPU budget for the simulation.
///
/// Controls how long the driver sleeps between steps and how many time-outs
/// a single step may service. Ticks left over when the cap is hit are carried
/// into the next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CpuUsage {
    Low,
    #[default]
    Normal,
    High,
    Max,
}

impl CpuUsage {
    pub fn sleep_interval(self) -> Duration {
        match self {
            CpuUsage::Low => Duration::from_millis(2),
            CpuUsage::Normal => Duration::from_micros(500),
            CpuUsage::High => Duration::from_micros(50),
            CpuUsage::Max => Duration::ZERO,
        }
    }

    pub fn max_timeouts_per_step(self) -> Option<usize> {
        match self {
            CpuUsage::Low => Some(1_000),
            CpuUsage::Normal => Some(10_000),
            CpuUsage::High => Some(50_000),
            CpuUsage::Max => None,
        }
    }
}

impl FromStr for CpuUsage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(CpuUsage::Low),
            "normal" => Ok(CpuUsage::Normal),
            "high" => Ok(CpuUsage::High),
            "max" => Ok(CpuUsage::Max),
            other => Err(format!("unknown CPU usage '{}' (expected low, normal, high or max)", other)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("unknown timer handle {0:?}")]
    UnknownTimer(TimerHandle),
    #[error("clock driver thread panicked")]
    DriverPanicked,
}

/// Result of one [`AvrClock::advance`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvanceOutcome {
    /// Time-outs serviced
    pub fired: usize,
    /// True if the per-step cap deferred some ticks to the next step
    pub deferred: bool,
}

/// Result of one wall-clock scheduling step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    pub fired: usize,
    /// Ticks produced from wall time this step
    pub ticks: u64,
    pub deferred: bool,
    /// Set once per second of wall time
    pub speed: Option<SpeedSample>,
}

pub struct AvrClock {
    target_clock_speed: u64,
    cpu_usage: CpuUsage,
    timers: Vec<(TimerHandle, AvrTimer)>,
    next_handle: u32,
    current: Ticks,
    /// Ticks owed from a capped step
    remaining_ticks: u64,
    /// Sub-tick remainder of the wall-time conversion, in tick-nanoseconds
    tick_fraction: u128,
    state: ClockState,
    last_step: Option<Instant>,
    stats: ClockStats,
}

impl AvrClock {
    pub fn new() -> Self {
        AvrClock {
            target_clock_speed: RP6_CLOCK_HZ,
            cpu_usage: CpuUsage::default(),
            timers: Vec::new(),
            next_handle: 0,
            current: Ticks::ZERO,
            remaining_ticks: 0,
            tick_fraction: 0,
            state: ClockState::Stopped,
            last_step: None,
            stats: ClockStats::new(),
        }
    }

    pub fn target_clock_speed(&self) -> u64 { self.target_clock_speed }

    /// Takes effect on the next scheduling step.
    pub fn set_target_clock_speed(&mut self, hz: u64) {
        self.target_clock_speed = hz;
    }

    pub fn cpu_usage(&self) -> CpuUsage { self.cpu_usage }

    pub fn set_cpu_usage(&mut self, usage: CpuUsage) {
        self.cpu_usage = usage;
    }

    pub fn current_ticks(&self) -> Ticks { self.current }
    pub fn remaining_ticks(&self) -> u64 { self.remaining_ticks }
    pub fn state(&self) -> ClockState { self.state }
    pub fn is_active(&self) -> bool { self.state == ClockState::Running }
    pub fn stats(&self) -> &ClockStats { &self.stats }

    // ─── Timer registry ─────────────────────────────────────────────────────

    /// Register a new, disabled timer.
    pub fn create_timer<F>(&mut self, time_out: F) -> TimerHandle
    where
        F: FnMut(Ticks) + Send + 'static,
    {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.timers.push((handle, AvrTimer::new(Some(Box::new(time_out)))));
        handle
    }

    pub fn remove_timer(&mut self, handle: TimerHandle) -> Result<(), ClockError> {
        let idx = self.index_of(handle)?;
        self.timers.remove(idx);
        Ok(())
    }

    /// Enable or disable a timer. Enabling arms the next match one full
    /// period after the current simulated time.
    pub fn enable_timer(&mut self, handle: TimerHandle, enabled: bool) -> Result<(), ClockError> {
        let now = self.current;
        let timer = self.timer_mut(handle)?;
        if timer.is_enabled() != enabled {
            if enabled {
                timer.arm(now);
            }
            timer.set_enabled(enabled);
        }
        Ok(())
    }

    pub fn set_compare_value(&mut self, handle: TimerHandle, compare: u32) -> Result<(), ClockError> {
        let now = self.current;
        self.timer_mut(handle)?.set_compare_value(compare, now);
        Ok(())
    }

    pub fn set_prescaler(&mut self, handle: TimerHandle, prescaler: u32) -> Result<(), ClockError> {
        let now = self.current;
        self.timer_mut(handle)?.set_prescaler(prescaler, now);
        Ok(())
    }

    pub fn timer(&self, handle: TimerHandle) -> Option<&AvrTimer> {
        self.timers.iter().find(|(h, _)| *h == handle).map(|(_, t)| t)
    }

    /// Timers in registration order.
    pub fn timers(&self) -> impl Iterator<Item = (TimerHandle, &AvrTimer)> {
        self.timers.iter().map(|(h, t)| (*h, t))
    }

    fn index_of(&self, handle: TimerHandle) -> Result<usize, ClockError> {
        self.timers
            .iter()
            .position(|(h, _)| *h == handle)
            .ok_or(ClockError::UnknownTimer(handle))
    }

    fn timer_mut(&mut self, handle: TimerHandle) -> Result<&mut AvrTimer, ClockError> {
        let idx = self.index_of(handle)?;
        Ok(&mut self.timers[idx].1)
    }

    /// Index of the schedulable timer with the earliest next match.
    /// Ties go to the earliest registered timer.
    fn closest_timer(&self) -> Option<usize> {
        let mut closest: Option<usize> = None;
        for (i, (_, timer)) in self.timers.iter().enumerate() {
            if !timer.is_schedulable() {
                continue;
            }
            match closest {
                Some(c) if self.timers[c].1.next_tick() <= timer.next_tick() => {}
                _ => closest = Some(i),
            }
        }
        closest
    }

    // ─── Scheduling ─────────────────────────────────────────────────────────

    pub fn start(&mut self) {
        if self.state == ClockState::Stopped {
            self.state = ClockState::Running;
            self.last_step = None;
            info!(target_hz = self.target_clock_speed, "AVR clock started");
        }
    }

    pub fn stop(&mut self) {
        if self.state == ClockState::Running {
            self.state = ClockState::Stopped;
            info!(ticks = %self.current, "AVR clock stopped");
        }
    }

    /// Return to tick zero with every timer disabled.
    pub fn reset(&mut self) {
        self.current.reset();
        self.remaining_ticks = 0;
        self.tick_fraction = 0;
        self.last_step = None;
        self.stats.reset();
        for (_, timer) in self.timers.iter_mut() {
            timer.set_enabled(false);
        }
    }

    /// Advance simulated time by `delta` ticks (plus any ticks carried over
    /// from a capped step), servicing every compare match on the way.
    pub fn advance(&mut self, delta: u64) -> AdvanceOutcome {
        let target = self.current + self.remaining_ticks + delta;
        self.remaining_ticks = 0;
        let cap = self.cpu_usage.max_timeouts_per_step();
        let mut fired = 0;

        while let Some(idx) = self.closest_timer() {
            let timer = &mut self.timers[idx].1;
            let at = timer.next_tick();
            if at > target {
                break;
            }
            if cap.is_some_and(|c| fired >= c) {
                self.remaining_ticks = target.saturating_sub(self.current).get_u64();
                debug!(fired, owed = self.remaining_ticks, "time-out cap reached, deferring ticks");
                return AdvanceOutcome { fired, deferred: true };
            }
            if at > self.current {
                self.current = at;
            }
            timer.time_out(at);
            timer.rearm();
            fired += 1;
        }

        self.current = target;
        AdvanceOutcome { fired, deferred: false }
    }

    /// One wall-clock driven step. The first step after [`start`](Self::start)
    /// only records the reference time.
    pub fn run_step(&mut self, now: Instant) -> StepReport {
        if self.state != ClockState::Running {
            return StepReport::default();
        }
        let Some(last) = self.last_step.replace(now) else {
            return StepReport::default();
        };

        let elapsed = now.saturating_duration_since(last);
        let scaled = self.target_clock_speed as u128 * elapsed.as_nanos() + self.tick_fraction;
        let ticks = u64::try_from(scaled / NANOS_PER_SEC).unwrap_or(u64::MAX);
        self.tick_fraction = scaled % NANOS_PER_SEC;

        let outcome = self.advance(ticks);
        let delta_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let speed = self.stats.record(delta_us, outcome.fired as u64, ticks);
        if let Some(s) = speed {
            debug!(
                ticks_per_sec = s.ticks_per_sec,
                runs_per_sec = s.runs_per_sec,
                timeouts_per_sec = s.timeouts_per_sec,
                avg_delta_us = s.avg_delta_us,
                "AVR clock speed"
            );
        }

        StepReport { fired: outcome.fired, ticks, deferred: outcome.deferred, speed }
    }

    // ─── Save state ─────────────────────────────────────────────────────────

    /// Capture clock and timer state for save state.
    pub fn save_state(&self) -> crate::savestate::ClockSnapshot {
        crate::savestate::ClockSnapshot {
            current: self.current,
            remaining_ticks: self.remaining_ticks,
            target_clock_speed: self.target_clock_speed,
            cpu_usage: self.cpu_usage,
            timers: self
                .timers
                .iter()
                .map(|(h, t)| crate::savestate::TimerSnapshot {
                    id: h.id(),
                    enabled: t.is_enabled(),
                    compare: t.compare_value(),
                    prescaler: t.prescaler(),
                    next_tick: t.next_tick(),
                })
                .collect(),
        }
    }

    /// Restore state from save state. Timers are matched by id; ids with no
    /// registered timer are skipped and counted in the return value.
    pub fn load_state(&mut self, s: &crate::savestate::ClockSnapshot) -> usize {
        self.current = s.current;
        self.remaining_ticks = s.remaining_ticks;
        self.target_clock_speed = s.target_clock_speed;
        self.cpu_usage = s.cpu_usage;
        self.tick_fraction = 0;
        self.last_step = None;

        let mut skipped = 0;
        for ts in &s.timers {
            match self.timer_mut(TimerHandle(ts.id)) {
                Ok(timer) => timer.restore(ts.enabled, ts.compare, ts.prescaler, ts.next_tick),
                Err(_) => skipped += 1,
            }
        }
        skipped
    }
}

impl Default for AvrClock {
    fn default() -> Self { Self::new() }
}

// ─── Threaded driver ────────────────────────────────────────────────────────

/// A `u32` shared between the simulation thread and the main loop.
///
/// This is the only state that crosses threads: sensor readings, light
/// levels, motor values and the effective clock speed.
#[derive(Debug, Clone, Default)]
pub struct SharedValue(Arc<AtomicU32>);

impl SharedValue {
    pub fn new(v: u32) -> Self {
        SharedValue(Arc::new(AtomicU32::new(v)))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, v: u32) {
        self.0.store(v, Ordering::Relaxed);
    }
}

/// Control messages for a running [`ClockDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockCommand {
    SetTargetSpeed(u64),
    SetCpuUsage(CpuUsage),
    Stop,
}

/// Runs an [`AvrClock`] scheduling loop on its own thread.
pub struct ClockDriver {
    tx: mpsc::Sender<ClockCommand>,
    handle: Option<JoinHandle<AvrClock>>,
    speed: SharedValue,
}

impl ClockDriver {
    pub fn spawn(mut clock: AvrClock) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let speed = SharedValue::new(0);
        let published = speed.clone();

        let handle = thread::Builder::new()
            .name("avr-clock".into())
            .spawn(move || {
                clock.start();
                loop {
                    loop {
                        match rx.try_recv() {
                            Ok(ClockCommand::SetTargetSpeed(hz)) => clock.set_target_clock_speed(hz),
                            Ok(ClockCommand::SetCpuUsage(usage)) => clock.set_cpu_usage(usage),
                            Ok(ClockCommand::Stop) | Err(TryRecvError::Disconnected) => {
                                clock.stop();
                                return clock;
                            }
                            Err(TryRecvError::Empty) => break,
                        }
                    }

                    let report = clock.run_step(Instant::now());
                    if let Some(s) = report.speed {
                        published.set(u32::try_from(s.ticks_per_sec).unwrap_or(u32::MAX));
                    }

                    let sleep = clock.cpu_usage().sleep_interval();
                    if sleep.is_zero() {
                        thread::yield_now();
                    } else {
                        thread::sleep(sleep);
                    }
                }
            })?;

        Ok(ClockDriver { tx, handle: Some(handle), speed })
    }

    /// Returns false if the driver thread has already exited.
    pub fn send(&self, cmd: ClockCommand) -> bool {
        self.tx.send(cmd).is_ok()
    }

    /// Effective ticks per second over the last full sample window.
    pub fn effective_speed(&self) -> u32 {
        self.speed.get()
    }

    /// Stop the loop and hand the clock back.
    pub fn stop(mut self) -> Result<AvrClock, ClockError> {
        self.shutdown().ok_or(ClockError::DriverPanicked)
    }

    fn shutdown(&mut self) -> Option<AvrClock> {
        let handle = self.handle.take()?;
        let _ = self.tx.send(ClockCommand::Stop);
        handle.join().ok()
    }
}

impl Drop for ClockDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_timer(clock: &mut AvrClock, log: &Arc<Mutex<Vec<(char, u128)>>>, tag: char) -> TimerHandle {
        let log = log.clone();
        clock.create_timer(move |at| log.lock().unwrap().push((tag, at.get())))
    }

    #[test]
    fn test_late_step_fires_every_period() {
        let mut clock = AvrClock::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let t = recording_timer(&mut clock, &log, 'a');
        clock.set_compare_value(t, 100).unwrap();
        clock.enable_timer(t, true).unwrap();

        let out = clock.advance(350);
        assert_eq!(out.fired, 3);
        let fired: Vec<u128> = log.lock().unwrap().iter().map(|(_, at)| *at).collect();
        assert_eq!(fired, vec![100, 200, 300]);
        assert_eq!(clock.timer(t).unwrap().next_tick().get(), 400);
        assert_eq!(clock.current_ticks().get(), 350);
    }

    #[test]
    fn test_ties_fire_in_registration_order() {
        let mut clock = AvrClock::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recording_timer(&mut clock, &log, 'a');
        let b = recording_timer(&mut clock, &log, 'b');
        for h in [a, b] {
            clock.set_compare_value(h, 50).unwrap();
            clock.enable_timer(h, true).unwrap();
        }
        clock.advance(100);
        let order: Vec<char> = log.lock().unwrap().iter().map(|(c, _)| *c).collect();
        assert_eq!(order, vec!['a', 'b', 'a', 'b']);
    }

    #[test]
    fn test_disabled_and_removed_timers_do_not_fire() {
        let mut clock = AvrClock::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recording_timer(&mut clock, &log, 'a');
        let b = recording_timer(&mut clock, &log, 'b');
        clock.set_compare_value(a, 10).unwrap();
        clock.set_compare_value(b, 10).unwrap();
        clock.enable_timer(b, true).unwrap();
        clock.advance(5);
        clock.remove_timer(b).unwrap();
        clock.advance(100);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(clock.remove_timer(b), Err(ClockError::UnknownTimer(b)));
        assert_eq!(clock.enable_timer(b, true), Err(ClockError::UnknownTimer(b)));
    }

    #[test]
    fn test_enable_arms_relative_to_now() {
        let mut clock = AvrClock::new();
        let t = clock.create_timer(|_| {});
        clock.set_compare_value(t, 10).unwrap();
        clock.set_prescaler(t, 8).unwrap();
        clock.advance(1_000);
        clock.enable_timer(t, true).unwrap();
        assert_eq!(clock.timer(t).unwrap().next_tick().get(), 1_080);
    }

    #[test]
    fn test_cap_defers_without_losing_ticks() {
        let mut clock = AvrClock::new();
        clock.set_cpu_usage(CpuUsage::Low);
        let cap = CpuUsage::Low.max_timeouts_per_step().unwrap();
        let t = clock.create_timer(|_| {});
        clock.set_compare_value(t, 1).unwrap();
        clock.enable_timer(t, true).unwrap();

        let total = (cap as u64) * 2 + 10;
        let first = clock.advance(total);
        assert!(first.deferred);
        assert_eq!(first.fired, cap);
        assert_eq!(clock.current_ticks().get() + clock.remaining_ticks() as u128, total as u128);

        let second = clock.advance(0);
        let third = clock.advance(0);
        assert_eq!(first.fired + second.fired + third.fired, total as usize);
        assert!(!third.deferred);
        assert_eq!(clock.current_ticks().get(), total as u128);
    }

    #[test]
    fn test_zero_period_timer_is_ignored() {
        let mut clock = AvrClock::new();
        let t = clock.create_timer(|_| {});
        clock.enable_timer(t, true).unwrap();
        assert_eq!(clock.advance(1_000).fired, 0);
    }

    #[test]
    fn test_run_step_requires_running() {
        let mut clock = AvrClock::new();
        let t0 = Instant::now();
        assert_eq!(clock.run_step(t0), StepReport::default());
        clock.start();
        // First step only establishes the reference time
        assert_eq!(clock.run_step(t0).ticks, 0);
        let report = clock.run_step(t0 + Duration::from_millis(1));
        assert_eq!(report.ticks, 8_000);
        assert_eq!(clock.current_ticks().get(), 8_000);
        clock.stop();
        clock.stop();
        assert_eq!(clock.state(), ClockState::Stopped);
    }

    #[test]
    fn test_speed_change_applies_to_next_step() {
        let mut clock = AvrClock::new();
        let t0 = Instant::now();
        clock.start();
        clock.run_step(t0);
        clock.run_step(t0 + Duration::from_millis(1));
        clock.set_target_clock_speed(1_000_000);
        assert_eq!(clock.current_ticks().get(), 8_000);
        clock.run_step(t0 + Duration::from_millis(2));
        assert_eq!(clock.current_ticks().get(), 9_000);
    }

    #[test]
    fn test_reset_disables_timers() {
        let mut clock = AvrClock::new();
        let t = clock.create_timer(|_| {});
        clock.set_compare_value(t, 5).unwrap();
        clock.enable_timer(t, true).unwrap();
        clock.advance(12);
        clock.reset();
        assert_eq!(clock.current_ticks(), Ticks::ZERO);
        assert!(!clock.timer(t).unwrap().is_enabled());
    }

    #[test]
    fn test_cpu_usage_from_str() {
        assert_eq!("HIGH".parse::<CpuUsage>(), Ok(CpuUsage::High));
        assert!("turbo".parse::<CpuUsage>().is_err());
    }

    #[test]
    fn test_driver_runs_and_returns_clock() {
        let fired = SharedValue::new(0);
        let f = fired.clone();
        let mut clock = AvrClock::new();
        clock.set_cpu_usage(CpuUsage::High);
        let t = clock.create_timer(move |_| f.set(f.get() + 1));
        clock.set_compare_value(t, 8_000).unwrap(); // 1 ms at 8 MHz
        clock.enable_timer(t, true).unwrap();

        let driver = ClockDriver::spawn(clock).unwrap();
        assert!(driver.send(ClockCommand::SetCpuUsage(CpuUsage::Normal)));
        thread::sleep(Duration::from_millis(50));
        let clock = driver.stop().unwrap();
        assert_eq!(clock.state(), ClockState::Stopped);
        assert_eq!(clock.cpu_usage(), CpuUsage::Normal);
        assert!(fired.get() > 0);
    }
}
