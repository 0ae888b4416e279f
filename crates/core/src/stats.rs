//! Clock throughput statistics.
//!
//! Tracks how the scheduling loop keeps up with wall time:
//! - Wall-clock microseconds covered by scheduling steps
//! - Steps (runs), serviced time-outs, and simulated ticks
//!
//! Once a full second of wall time has been accumulated, [`ClockStats::record`]
//! returns a [`SpeedSample`] and the counters start over. The sample's
//! `ticks_per_sec` is the effective simulated clock speed, which the UI shows
//! next to the configured target speed.

/// Wall-clock microseconds per sample window.
const SAMPLE_WINDOW_US: u64 = 1_000_000;

/// Effective speed over one sample window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedSample {
    pub runs_per_sec: u64,
    pub timeouts_per_sec: u64,
    pub ticks_per_sec: u64,
    /// Average wall-clock gap between scheduling steps
    pub avg_delta_us: u64,
}

#[derive(Debug, Default)]
pub struct ClockStats {
    total_delta_us: u64,
    runs: u64,
    timeouts: u64,
    ticks: u64,
    /// Most recent completed sample
    last: Option<SpeedSample>,
}

impl ClockStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = ClockStats::new();
    }

    /// Record one scheduling step.
    pub fn record(&mut self, delta_us: u64, timeouts: u64, ticks: u64) -> Option<SpeedSample> {
        self.total_delta_us += delta_us;
        self.runs += 1;
        self.timeouts += timeouts;
        self.ticks += ticks;

        if self.total_delta_us < SAMPLE_WINDOW_US {
            return None;
        }

        // Normalize to exactly one second in case the window overran
        let scale = |v: u64| (v as u128 * SAMPLE_WINDOW_US as u128 / self.total_delta_us as u128) as u64;
        let sample = SpeedSample {
            runs_per_sec: scale(self.runs),
            timeouts_per_sec: scale(self.timeouts),
            ticks_per_sec: scale(self.ticks),
            avg_delta_us: self.total_delta_us / self.runs,
        };
        self.total_delta_us = 0;
        self.runs = 0;
        self.timeouts = 0;
        self.ticks = 0;
        self.last = Some(sample);
        Some(sample)
    }

    pub fn last_sample(&self) -> Option<SpeedSample> {
        self.last
    }
}
