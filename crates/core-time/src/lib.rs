//! Time domain of the event loop.
//!
//! All timestamps are `i64` counts of 100 ns ticks ("DateTime" resolution).
//! The monotonic reading is anchored once per process and offset by the Unix
//! epoch so that monotonic values still print as normal dates when logged.

use std::sync::LazyLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Timestamp in 100 ns ticks. Monotonic or wall clock depending on origin.
pub type DateTime = i64;

pub const DATETIME_USEC: i64 = 10;
pub const DATETIME_MSEC: i64 = 10_000;
pub const DATETIME_SEC: i64 = 10_000_000;

/// Anchor taken once: wall-clock ticks at the instant of the first use of
/// this module, paired with the `Instant` read at the same moment.
struct Anchor {
    wall_ticks: i64,
    instant: Instant,
}

static ANCHOR: LazyLock<Anchor> = LazyLock::new(|| Anchor {
    wall_ticks: system_time_ticks(),
    instant: Instant::now(),
});

fn system_time_ticks() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_nanos() / 100) as i64,
        Err(_) => 0,
    }
}

/// Wall-clock time since the Unix epoch, in ticks. Suitable for external
/// timestamps; may jump when the clock is adjusted.
pub fn now() -> DateTime {
    system_time_ticks()
}

/// Monotonic time in ticks, offset by the Unix epoch so a "normal" value is
/// produced when a normal clock source is configured. Never decreases.
pub fn now_monotonic() -> DateTime {
    let anchor = &*ANCHOR;
    anchor.wall_ticks + (anchor.instant.elapsed().as_nanos() / 100) as i64
}

/// Offset of local time relative to UTC, in ticks.
pub fn local_time_utc_offset() -> i64 {
    use chrono::Offset;
    let offset = chrono::Local::now().offset().fix();
    i64::from(offset.local_minus_utc()) * DATETIME_SEC
}

/// Convert a tick count to milliseconds, rounding toward zero.
pub fn ticks_to_millis(ticks: DateTime) -> i64 {
    ticks / DATETIME_MSEC
}

/// Convert milliseconds to ticks.
pub fn millis_to_ticks(ms: i64) -> DateTime {
    ms * DATETIME_MSEC
}
