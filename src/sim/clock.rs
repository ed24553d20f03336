use super::types::{SimConfig, SimTime};

/// A simulation clock that hands out ticks strictly in time order.
///
/// Each tick is issued exactly once; there is no way to rewind or skip, which
/// is what lets the engine treat every tick as atomic.
///
/// # Examples
///
/// ```
/// use microgrid_market::sim::clock::Clock;
/// use microgrid_market::sim::types::{SimConfig, SimTime};
///
/// let cfg = SimConfig::new(3, 30, SimTime::hm(6, 0), 0);
/// let mut clock = Clock::new(&cfg);
/// let mut stamps = Vec::new();
///
/// clock.run(|tick| stamps.push(tick.timestamp.to_string()));
/// assert_eq!(stamps, vec!["06:00", "06:30", "07:00"]);
/// ```
#[derive(Debug, Clone)]
pub struct Clock {
    next: usize,
    total: usize,
    start: SimTime,
    step_minutes: u32,
}

/// One issued tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Zero-based tick index.
    pub step: usize,
    /// Simulated time at the start of the tick.
    pub timestamp: SimTime,
}

impl Clock {
    /// Creates a clock covering every tick of `config`.
    pub fn new(config: &SimConfig) -> Self {
        Self {
            next: 0,
            total: config.total_steps(),
            start: config.start,
            step_minutes: config.step_minutes,
        }
    }

    /// Issues the next tick, or `None` once all ticks have been handed out.
    pub fn tick(&mut self) -> Option<Tick> {
        if self.next >= self.total {
            return None;
        }
        let step = self.next;
        self.next += 1;
        let offset = u32::try_from(step)
            .unwrap_or(u32::MAX)
            .saturating_mul(self.step_minutes);
        Some(Tick {
            step,
            timestamp: self.start.plus_minutes(offset),
        })
    }

    /// Number of ticks not yet issued.
    pub fn remaining(&self) -> usize {
        self.total - self.next
    }

    /// Calls `f` for each remaining tick.
    pub fn run(&mut self, mut f: impl FnMut(Tick)) {
        while let Some(tick) = self.tick() {
            f(tick);
        }
    }
}
