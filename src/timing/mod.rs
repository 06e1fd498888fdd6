mod tempo;

pub use tempo::{TempoChange, TempoMap, TempoMapEntry};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Ticks per quarter note in the Metered domain.
pub const TICKS_PER_QUARTER: u32 = 480;

/// Tolerance, in domain units, when testing whether the seek time has
/// reached a repeat frame's end. Tunable; `repeat_boundary_tolerance` in
/// the task tests pins the current value.
pub const REPEAT_EPSILON: u32 = 3;

/// How far past the seek time a task consumes track events in steady
/// state, so output commands are queued slightly ahead of the clock.
pub const PLAY_AHEAD: u32 = 48;

/// How far before its next due event a task schedules its wake-up.
pub const WAKE_MARGIN: u32 = 12;

/// Ceiling on the control loop's sleep, bounding worst-case dispatch
/// latency when no event is pending.
pub const MAX_SLEEP: Duration = Duration::from_millis(100);

/// Steady-state bound on track lock acquisition; past it the task gives
/// up and reschedules instead of blocking the control loop.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(2);

/// How shortly after a failed lock acquisition a task retries.
pub const LOCK_RETRY: u32 = 5;

/// Events executed per locate batch before the worker re-checks for a
/// superseding request.
pub const LOCATE_BATCH: usize = 64;

/// Which of the two clocks a time value, track, or stack belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClockDomain {
    /// Wall-clock milliseconds, independent of tempo.
    Real,
    /// Musical ticks (480 per quarter note), stretched by tempo.
    Metered,
}

/// A schedule time in one clock domain. Comparisons are wraparound-safe
/// for spans under half the 32-bit range, so the engine keeps working
/// across counter wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SchedTime(pub u32);

impl SchedTime {
    pub fn offset(self, delta: u32) -> SchedTime {
        SchedTime(self.0.wrapping_add(delta))
    }

    pub fn back(self, delta: u32) -> SchedTime {
        SchedTime(self.0.wrapping_sub(delta))
    }

    /// True if `self` is strictly later than `other`.
    pub fn is_after(self, other: SchedTime) -> bool {
        self.0.wrapping_sub(other.0) as i32 > 0
    }

    /// True if `self` is at or before `now`.
    pub fn is_due(self, now: SchedTime) -> bool {
        !self.is_after(now)
    }

    /// Signed distance from `other` to `self`.
    pub fn delta(self, other: SchedTime) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }
}

impl From<u32> for SchedTime {
    fn from(t: u32) -> Self {
        SchedTime(t)
    }
}
