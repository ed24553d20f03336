use serde::Serialize;
use thiserror::Error;

use super::types::SimTime;

/// Error returned when a window ends before it starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("window end {end} is before start {start}")]
pub struct WindowError {
    pub start: SimTime,
    pub end: SimTime,
}

/// Closed daily time-of-day interval `[start, end]` over simulated time.
///
/// Both boundaries are inside the window. The window repeats every simulated
/// day; only the time of day of a timestamp is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    start: SimTime,
    end: SimTime,
}

impl TimeWindow {
    /// Creates a window from two times of day.
    ///
    /// # Errors
    ///
    /// Returns a `WindowError` if `end` is earlier in the day than `start`.
    pub fn new(start: SimTime, end: SimTime) -> Result<Self, WindowError> {
        let start = SimTime::from_minutes(start.time_of_day());
        let end = SimTime::from_minutes(end.time_of_day());
        if end < start {
            return Err(WindowError { start, end });
        }
        Ok(Self { start, end })
    }

    /// Returns `true` when `t` falls within the window, boundaries included.
    pub fn contains(&self, t: SimTime) -> bool {
        let tod = t.time_of_day();
        tod >= self.start.minutes() && tod <= self.end.minutes()
    }

    /// First time of day inside the window.
    pub fn start(&self) -> SimTime {
        self.start
    }

    /// Last time of day inside the window.
    pub fn end(&self) -> SimTime {
        self.end
    }
}
