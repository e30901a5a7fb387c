//! Cycle counter access and conversion of cycle timestamps to calendar time.
//!
//! Writers stamp every message with the raw hardware counter (cheap, and
//! monotonic on one core). A trace file records two (cycle, monotonic,
//! wall-clock) samples taken at least 0.1 s apart; readers derive the counter
//! frequency from them and turn any stamp into local time.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::_rdtsc;

use chrono::{Local, TimeZone};
use nix::time::{clock_gettime, ClockId};
use tracing::warn;

use crate::layout::TraceFileHeader;

/// Returns the free-running cycle counter.
///
/// - x86_64: RDTSC
/// - aarch64: CNTVCT_EL0
/// - anything else: nanoseconds since the epoch
#[inline(always)]
pub fn tsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        _rdtsc()
    }

    #[cfg(target_arch = "aarch64")]
    unsafe {
        let mut value: u64;
        std::arch::asm!("mrs {}, cntvct_el0", out(reg) value);
        value
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

static CLOCK_FAULT_LOGGED: AtomicBool = AtomicBool::new(false);

/// Reads `clock`. A failing clock reads as zero and is logged once per
/// process.
fn read_clock(clock: ClockId) -> (i64, i64) {
    match clock_gettime(clock) {
        Ok(ts) => (ts.tv_sec() as i64, ts.tv_nsec() as i64),
        Err(e) => {
            if !CLOCK_FAULT_LOGGED.swap(true, Ordering::Relaxed) {
                warn!(clock = ?clock, error = %e, "clock_gettime failed; timestamps read as zero");
            }
            (0, 0)
        }
    }
}

fn clock_seconds(clock: ClockId) -> f64 {
    let (sec, nsec) = read_clock(clock);
    sec as f64 + nsec as f64 * 1e-9
}

/// CLOCK_MONOTONIC in seconds.
pub fn monotime() -> f64 {
    clock_seconds(ClockId::CLOCK_MONOTONIC)
}

/// Seconds since the Unix epoch.
pub fn utc_now() -> f64 {
    clock_seconds(ClockId::CLOCK_REALTIME)
}

/// `(seconds, microseconds)` since the Unix epoch, the layout embedded by
/// wall-clock stamped messages.
pub fn wall_clock_now() -> (u64, u64) {
    let (sec, nsec) = read_clock(ClockId::CLOCK_REALTIME);
    (sec as u64, nsec as u64 / 1000)
}

/// Converts cycle stamps of one trace file into local calendar time.
///
/// Rebuild it (see [`TimestampFormatter::new`]) whenever the file's running
/// calibration sample changes; the writer refreshes it on every wrap.
///
/// # Examples
///
/// ```
/// # use ringtrace::clock::TimestampFormatter;
/// # use ringtrace::layout::TraceFileHeader;
/// let header = TraceFileHeader {
///     tsc0: 1_000,
///     monotime0: 10.0,
///     tsc1: 2_001_000,
///     monotime1: 12.0,
///     utc1: 1_700_000_002.0,
///     ..Default::default()
/// };
/// let tsf = TimestampFormatter::new(&header);
/// assert_eq!(tsf.ticks_per_sec(), 1_000_000.0);
/// assert_eq!(tsf.seconds(1_000), 1_700_000_000.0);
/// ```
#[derive(Clone, Debug)]
pub struct TimestampFormatter {
    tsc0: u64,
    ticks_per_sec: f64,
    utc0: f64,
    cached_sec: i64,
    cached_prefix: String,
}

impl Default for TimestampFormatter {
    fn default() -> Self {
        Self {
            tsc0: 0,
            ticks_per_sec: 1.0,
            utc0: 0.0,
            cached_sec: i64::MIN,
            cached_prefix: String::new(),
        }
    }
}

impl TimestampFormatter {
    pub fn new(header: &TraceFileHeader) -> Self {
        let elapsed = header.monotime1 - header.monotime0;
        let ticks = header.tsc1.wrapping_sub(header.tsc0) as f64;
        let ticks_per_sec = if elapsed > 0.0 && ticks > 0.0 { ticks / elapsed } else { 1.0 };
        Self {
            tsc0: header.tsc0,
            ticks_per_sec,
            utc0: header.utc1 - elapsed,
            ..Default::default()
        }
    }

    pub fn ticks_per_sec(&self) -> f64 {
        self.ticks_per_sec
    }

    /// Seconds since the epoch at cycle stamp `tsc`.
    pub fn seconds(&self, tsc: u64) -> f64 {
        let delta = tsc as i128 - self.tsc0 as i128;
        self.utc0 + delta as f64 / self.ticks_per_sec
    }

    /// Appends `YYYY-mm-dd HH:MM:SS.uuuuuu` (local time) for `tsc`.
    pub fn format(&mut self, tsc: u64, out: &mut String) {
        let t = self.seconds(tsc);
        let mut sec = t.floor() as i64;
        let mut usec = ((t - t.floor()) * 1e6).round() as u64;
        if usec >= 1_000_000 {
            sec += 1;
            usec -= 1_000_000;
        }
        self.format_parts(sec, usec, out);
    }

    /// Appends the same layout for an embedded `(seconds, microseconds)` pair.
    pub fn format_wall_clock(&mut self, sec: u64, usec: u64, out: &mut String) {
        self.format_parts(sec as i64 + (usec / 1_000_000) as i64, usec % 1_000_000, out);
    }

    fn format_parts(&mut self, sec: i64, usec: u64, out: &mut String) {
        if sec != self.cached_sec {
            self.cached_prefix.clear();
            match Local.timestamp_opt(sec, 0).single() {
                Some(dt) => {
                    let _ = write!(self.cached_prefix, "{}", dt.format("%Y-%m-%d %H:%M:%S"));
                }
                None => {
                    let _ = write!(self.cached_prefix, "@{}", sec);
                }
            }
            self.cached_sec = sec;
        }
        out.push_str(&self.cached_prefix);
        let _ = write!(out, ".{:06}", usec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_microseconds_round_up_into_next_second() {
        let header = TraceFileHeader {
            tsc0: 0,
            monotime0: 0.0,
            tsc1: 1_000_000_000,
            monotime1: 1.0,
            utc1: 1.0,
            ..Default::default()
        };
        let mut tsf = TimestampFormatter::new(&header);
        let mut a = String::new();
        tsf.format(999_999_800, &mut a);
        assert!(a.ends_with(".000000"), "{}", a);
        let mut b = String::new();
        tsf.format(500_000_000, &mut b);
        assert!(b.ends_with(".500000"), "{}", b);
    }

    #[test]
    fn test_clock_reads_agree() {
        assert!(monotime() > 0.0);
        let utc = utc_now();
        let (sec, usec) = wall_clock_now();
        assert!(usec < 1_000_000);
        let wall = sec as f64 + usec as f64 * 1e-6;
        assert!((wall - utc).abs() < 1.0, "wall {} utc {}", wall, utc);
        assert!(!CLOCK_FAULT_LOGGED.load(Ordering::Relaxed));
    }

    #[test]
    fn test_wall_clock_layout() {
        let mut tsf = TimestampFormatter::default();
        let mut out = String::new();
        tsf.format_wall_clock(1_700_000_000, 42, &mut out);
        assert_eq!(out.len(), "2023-11-14 22:13:20.000042".len());
        assert!(out.ends_with(".000042"));
    }
}
