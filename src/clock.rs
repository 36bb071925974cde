//! Timestamps and duration arithmetic shared by the client, the send loop
//! and the log hub.
//!
//! Elapsed times are measured on the tokio clock so that paused-time tests
//! observe the same durations the loop acts on. Wall-clock timestamps are
//! only used for labelling events.

use chrono::{DateTime, Utc};
use tokio::time::{Duration, Instant};

/// Wall-clock time used to stamp log events.
pub fn wall_now() -> DateTime<Utc> {
    Utc::now()
}

/// Formats a wall timestamp as `HH:MM:SS.mmm` for cycle banners.
pub fn clock_time(ts: &DateTime<Utc>) -> String {
    ts.format("%H:%M:%S%.3f").to_string()
}

/// A started measurement on the monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Time between two optional stage marks, if both were recorded.
pub fn span(from: Option<Instant>, to: Option<Instant>) -> Option<Duration> {
    match (from, to) {
        (Some(a), Some(b)) => Some(b.saturating_duration_since(a)),
        _ => None,
    }
}

/// Renders a duration the way operators read stage timings: `850µs`,
/// `42ms`, `1.204s`, `2m5.300s`.
pub fn fmt_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros < 1_000 {
        format!("{}µs", micros)
    } else if micros < 1_000_000 {
        let ms = d.as_secs_f64() * 1_000.0;
        if ms >= 100.0 {
            format!("{:.0}ms", ms)
        } else {
            format!("{:.1}ms", ms).replace(".0ms", "ms")
        }
    } else if d.as_secs() < 60 {
        format!("{:.3}s", d.as_secs_f64())
    } else {
        let mins = d.as_secs() / 60;
        let rest = d.as_secs_f64() - (mins * 60) as f64;
        format!("{}m{:.3}s", mins, rest)
    }
}

/// Whole milliseconds, for fields that are compared against intervals.
pub fn as_millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}
