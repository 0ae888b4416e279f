//! Simulated AVR timer/counter.
//!
//! Not really an 8 or 16 bit timer: the compare value and prescaler are folded
//! into a single "true compare" tick count, and the timer only tracks the
//! absolute tick of its next compare match. The owning [`AvrClock`] decides
//! when that tick has been reached and calls [`AvrTimer::time_out`].
//!
//! Changing the compare value or prescaler mid-period rebases the next match
//! so the fraction of the period already elapsed is kept: a timer that was
//! 3/4 of the way to its match stays 3/4 of the way under the new period.
//!
//! [`AvrClock`]: crate::clock::AvrClock

use crate::ticks::Ticks;

/// Compare-match callback. Receives the simulated instant of the match.
pub type TimeOutFn = Box<dyn FnMut(Ticks) + Send>;

pub struct AvrTimer {
    enabled: bool,
    compare: u32,
    prescaler: u32,
    true_compare: u64,
    next_tick: Ticks,
    time_out: Option<TimeOutFn>,
    /// Number of compare matches serviced
    pub dbg_fire_count: u64,
}

impl AvrTimer {
    pub fn new(time_out: Option<TimeOutFn>) -> Self {
        AvrTimer {
            enabled: false,
            compare: 0,
            prescaler: 1,
            true_compare: 0,
            next_tick: Ticks::ZERO,
            time_out,
            dbg_fire_count: 0,
        }
    }

    pub fn is_enabled(&self) -> bool { self.enabled }
    pub fn compare_value(&self) -> u32 { self.compare }
    pub fn prescaler(&self) -> u32 { self.prescaler }
    pub fn true_compare_value(&self) -> u64 { self.true_compare }
    pub fn next_tick(&self) -> Ticks { self.next_tick }

    /// Set the enabled flag without touching the schedule.
    ///
    /// [`AvrClock::enable_timer`](crate::clock::AvrClock::enable_timer) also
    /// arms the timer relative to the current time; use that from firmware code.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_time_out(&mut self, time_out: TimeOutFn) {
        self.time_out = Some(time_out);
    }

    pub fn set_compare_value(&mut self, compare: u32, now: Ticks) {
        self.compare = compare;
        self.rebase(compare as u64 * self.prescaler as u64, now);
    }

    pub fn set_prescaler(&mut self, prescaler: u32, now: Ticks) {
        self.prescaler = prescaler;
        self.rebase(self.compare as u64 * prescaler as u64, now);
    }

    /// Switch to a new period, keeping the elapsed fraction of the current one.
    pub fn rebase(&mut self, new: u64, now: Ticks) {
        let old = self.true_compare;
        self.true_compare = new;

        if !self.enabled {
            return;
        }
        if old == 0 {
            self.next_tick = now + new;
            return;
        }

        // Scale the distance still to go; the elapsed fraction stays the same.
        let remaining = self.next_tick.saturating_sub(now).get();
        let scaled = (remaining * new as u128 + old as u128 / 2) / old as u128;
        self.next_tick = now + u64::try_from(scaled).unwrap_or(u64::MAX);
    }

    /// Schedule the next match one full period after `now`.
    pub fn arm(&mut self, now: Ticks) {
        self.next_tick = now + self.true_compare;
    }

    /// True when the timer participates in scheduling.
    ///
    /// A zero true-compare value would match on every instant, so such a
    /// timer never becomes due.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && self.true_compare > 0
    }

    pub fn is_due(&self, at: Ticks) -> bool {
        self.is_schedulable() && self.next_tick <= at
    }

    /// Advance the next match by one period, keeping any overshoot.
    pub fn rearm(&mut self) {
        self.next_tick += self.true_compare;
    }

    /// Invoke the compare-match callback once.
    pub fn time_out(&mut self, at: Ticks) {
        self.dbg_fire_count += 1;
        if let Some(cb) = self.time_out.as_mut() {
            cb(at);
        }
    }

    pub(crate) fn restore(&mut self, enabled: bool, compare: u32, prescaler: u32, next_tick: Ticks) {
        self.enabled = enabled;
        self.compare = compare;
        self.prescaler = prescaler;
        self.true_compare = compare as u64 * prescaler as u64;
        self.next_tick = next_tick;
    }

    pub fn dbg_info(&self) -> String {
        format!("en={} ocr={} ps={} true={} next={} fires={}",
            self.enabled, self.compare, self.prescaler, self.true_compare,
            self.next_tick, self.dbg_fire_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn enabled_timer(compare: u32, prescaler: u32) -> AvrTimer {
        let mut t = AvrTimer::new(None);
        t.set_enabled(true);
        t.set_prescaler(prescaler, Ticks::ZERO);
        t.set_compare_value(compare, Ticks::ZERO);
        t
    }

    #[test]
    fn test_true_compare_is_product() {
        let t = enabled_timer(250, 64);
        assert_eq!(t.true_compare_value(), 16_000);
        assert_eq!(t.next_tick().get(), 16_000);
    }

    #[test]
    fn test_prescaler_change_preserves_fraction() {
        let mut t = enabled_timer(100, 8); // period 800
        let now = Ticks::new(600); // 3/4 of the way
        t.set_prescaler(64, now); // period 6400
        // 1/4 of the new period remains
        assert_eq!(t.next_tick().get(), 600 + 1600);
        let progress = 1.0 - (t.next_tick() - now).get() as f64 / t.true_compare_value() as f64;
        assert!((progress - 0.75).abs() < 1.0 / 6400.0 + f64::EPSILON);
    }

    #[test]
    fn test_compare_change_shrinks_remaining() {
        let mut t = enabled_timer(1000, 1);
        let now = Ticks::new(250);
        t.set_compare_value(500, now);
        assert_eq!(t.next_tick().get(), 250 + 375);
    }

    #[test]
    fn test_disabled_timer_not_rebased() {
        let mut t = AvrTimer::new(None);
        t.set_compare_value(10, Ticks::new(5));
        assert_eq!(t.next_tick(), Ticks::ZERO);
        assert!(!t.is_schedulable());
    }

    #[test]
    fn test_zero_period_never_due() {
        let mut t = AvrTimer::new(None);
        t.set_enabled(true);
        assert!(!t.is_due(Ticks::new(1_000)));
    }

    #[test]
    fn test_time_out_invokes_callback_once() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let mut t = AvrTimer::new(Some(Box::new(move |_| { h.fetch_add(1, Ordering::Relaxed); })));
        t.time_out(Ticks::new(1));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(t.dbg_fire_count, 1);
    }
}
