//! Clock save state.
//!
//! Captures simulated time and every timer's schedule so a simulation can be
//! stopped and resumed later at the same tick. Callbacks are code, not data:
//! restoring only touches timers that are already registered under the same
//! handle ids.
//!
//! ## File format
//!
//! ```text
//! +------------------+
//! | Magic "RP6C"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```

use crate::clock::CpuUsage;
use crate::ticks::Ticks;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Magic bytes identifying a clock save state file.
const MAGIC: &[u8; 4] = b"RP6C";
/// Current save state format version.
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum SavestateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file too small")]
    Truncated,
    #[error("invalid save state file (bad magic)")]
    BadMagic,
    #[error("unsupported save state version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
    #[error("decompress error: {0}")]
    Decompress(String),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub id: u32,
    pub enabled: bool,
    pub compare: u32,
    pub prescaler: u32,
    pub next_tick: Ticks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSnapshot {
    pub current: Ticks,
    pub remaining_ticks: u64,
    pub target_clock_speed: u64,
    pub cpu_usage: CpuUsage,
    pub timers: Vec<TimerSnapshot>,
}

/// Serialize a snapshot with header and deflate compression.
pub fn to_bytes(state: &ClockSnapshot) -> Result<Vec<u8>, SavestateError> {
    let payload = bincode::serialize(state)?;
    let compressed = miniz_oxide::deflate::compress_to_vec(&payload, 6);

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Parse a snapshot, verifying magic and version.
pub fn from_bytes(data: &[u8]) -> Result<ClockSnapshot, SavestateError> {
    if data.len() < HEADER_LEN {
        return Err(SavestateError::Truncated);
    }
    if &data[0..4] != MAGIC {
        return Err(SavestateError::BadMagic);
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != FORMAT_VERSION {
        return Err(SavestateError::Version { found: version, expected: FORMAT_VERSION });
    }

    let decompressed = miniz_oxide::inflate::decompress_to_vec(&data[HEADER_LEN..])
        .map_err(|e| SavestateError::Decompress(format!("{:?}", e)))?;
    Ok(bincode::deserialize(&decompressed)?)
}

pub fn save_to_file(state: &ClockSnapshot, path: &Path) -> Result<(), SavestateError> {
    std::fs::write(path, to_bytes(state)?)?;
    Ok(())
}

pub fn load_from_file(path: &Path) -> Result<ClockSnapshot, SavestateError> {
    from_bytes(&std::fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::AvrClock;

    fn running_clock() -> AvrClock {
        let mut clock = AvrClock::new();
        let a = clock.create_timer(|_| {});
        let b = clock.create_timer(|_| {});
        clock.set_compare_value(a, 250).unwrap();
        clock.set_prescaler(a, 8).unwrap();
        clock.enable_timer(a, true).unwrap();
        clock.set_compare_value(b, 77).unwrap();
        clock.set_cpu_usage(CpuUsage::High);
        clock.advance(12_345);
        clock
    }

    #[test]
    fn test_restore_resumes_schedule() {
        let clock = running_clock();
        let bytes = to_bytes(&clock.save_state()).unwrap();
        assert_eq!(&bytes[0..4], b"RP6C");

        let mut fresh = running_clock();
        fresh.reset();
        let skipped = fresh.load_state(&from_bytes(&bytes).unwrap());
        assert_eq!(skipped, 0);
        assert_eq!(fresh.current_ticks(), clock.current_ticks());
        assert_eq!(fresh.cpu_usage(), CpuUsage::High);
        let timers: Vec<_> = fresh.timers().map(|(_, t)| (t.is_enabled(), t.next_tick())).collect();
        let expected: Vec<_> = clock.timers().map(|(_, t)| (t.is_enabled(), t.next_tick())).collect();
        assert_eq!(timers, expected);
    }

    #[test]
    fn test_unknown_timer_ids_are_skipped() {
        let snapshot = running_clock().save_state();
        let mut clock = AvrClock::new();
        clock.create_timer(|_| {});
        assert_eq!(clock.load_state(&snapshot), 1);
    }

    #[test]
    fn test_rejects_bad_header() {
        assert!(matches!(from_bytes(b"RP6"), Err(SavestateError::Truncated)));
        assert!(matches!(from_bytes(b"ABES\x01\0\0\0"), Err(SavestateError::BadMagic)));
        assert!(matches!(
            from_bytes(b"RP6C\x09\0\0\0"),
            Err(SavestateError::Version { found: 9, expected: 1 })
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let path = std::env::temp_dir().join(format!("rp6-clock-{}.state", std::process::id()));
        let snapshot = running_clock().save_state();
        save_to_file(&snapshot, &path).unwrap();
        let loaded = load_from_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, snapshot);
    }
}
