//! Core simulation types: configuration, participants, tick context, and tick records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::feed::FeedFrame;

use super::balance::NetPosition;
use super::flow::Flow;
use super::matching::Rejection;
use super::policy::{Action, PolicyFallback};
use super::settlement::Adjustment;

/// Absolute tolerance for energy and money comparisons.
pub const EPSILON: f64 = 1e-9;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Simulated wall-clock time in whole minutes since 00:00 of day 0.
///
/// # Examples
///
/// ```
/// use microgrid_market::sim::types::SimTime;
///
/// let t: SimTime = "18:30".parse().unwrap();
/// assert_eq!(t.minutes(), 18 * 60 + 30);
/// assert_eq!(t.to_string(), "18:30");
/// assert_eq!(t.plus_minutes(24 * 60).to_string(), "d1 18:30");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SimTime(u32);

/// Error returned when a clock string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid clock time \"{0}\" (expected HH:MM, HH:MM:SS or dN HH:MM)")]
pub struct TimeParseError(pub String);

impl SimTime {
    /// Midnight of day 0.
    pub const MIDNIGHT: SimTime = SimTime(0);

    /// Creates a time from minutes since the start of day 0.
    pub fn from_minutes(minutes: u32) -> Self {
        Self(minutes)
    }

    /// Creates a time of day on day 0.
    ///
    /// # Panics
    ///
    /// Panics if `hour >= 24` or `minute >= 60`.
    pub fn hm(hour: u32, minute: u32) -> Self {
        assert!(hour < 24 && minute < 60);
        Self(hour * 60 + minute)
    }

    /// Minutes since 00:00 of day 0.
    pub fn minutes(self) -> u32 {
        self.0
    }

    /// Minutes since midnight of the current day.
    pub fn time_of_day(self) -> u32 {
        self.0 % MINUTES_PER_DAY
    }

    /// Zero-based simulated day index.
    pub fn day(self) -> u32 {
        self.0 / MINUTES_PER_DAY
    }

    /// Hour of the current day (0..24).
    pub fn hour(self) -> u32 {
        self.time_of_day() / 60
    }

    /// Returns this time shifted forward by `minutes`.
    pub fn plus_minutes(self, minutes: u32) -> Self {
        Self(self.0 + minutes)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tod = self.time_of_day();
        if self.day() > 0 {
            write!(f, "d{} ", self.day())?;
        }
        write!(f, "{:02}:{:02}", tod / 60, tod % 60)
    }
}

impl FromStr for SimTime {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TimeParseError(s.to_string());
        let trimmed = s.trim();

        let (day, clock) = match trimmed.split_once(' ') {
            Some((d, rest)) => {
                let day = d
                    .strip_prefix('d')
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(err)?;
                (day, rest.trim())
            }
            None => (0, trimmed),
        };

        let mut parts = clock.split(':');
        let hour = parts.next().and_then(|p| p.parse::<u32>().ok()).ok_or_else(err)?;
        let minute = parts.next().and_then(|p| p.parse::<u32>().ok()).ok_or_else(err)?;
        // Seconds are accepted for compatibility with HH:MM:SS feeds but must be zero.
        if let Some(sec) = parts.next() {
            if sec.parse::<u32>().ok() != Some(0) {
                return Err(err());
            }
        }
        if parts.next().is_some() || hour >= 24 || minute >= 60 {
            return Err(err());
        }

        Ok(Self(day * MINUTES_PER_DAY + hour * 60 + minute))
    }
}

impl TryFrom<String> for SimTime {
    type Error = TimeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SimTime> for String {
    fn from(value: SimTime) -> Self {
        value.to_string()
    }
}

/// Centralized simulation timing configuration.
///
/// # Examples
///
/// ```
/// use microgrid_market::sim::types::{SimConfig, SimTime};
///
/// let cfg = SimConfig::new(48, 30, SimTime::MIDNIGHT, 42);
/// assert_eq!(cfg.dt_hours(), 0.5);
/// assert_eq!(cfg.timestamp_at(3).to_string(), "01:30");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimConfig {
    /// Number of ticks to simulate.
    pub steps: usize,
    /// Length of one tick in simulated minutes.
    pub step_minutes: u32,
    /// Simulated time of tick 0.
    pub start: SimTime,
    /// Master random seed for reproducibility.
    pub seed: u64,
}

impl SimConfig {
    /// Creates a new simulation configuration.
    ///
    /// # Panics
    ///
    /// Panics if `steps` or `step_minutes` is zero.
    pub fn new(steps: usize, step_minutes: u32, start: SimTime, seed: u64) -> Self {
        assert!(steps > 0, "steps must be > 0");
        assert!(step_minutes > 0, "step_minutes must be > 0");
        Self {
            steps,
            step_minutes,
            start,
            seed,
        }
    }

    /// Total number of ticks.
    pub fn total_steps(&self) -> usize {
        self.steps
    }

    /// Duration of one tick in hours.
    pub fn dt_hours(&self) -> f64 {
        f64::from(self.step_minutes) / 60.0
    }

    /// Simulated time at the start of tick `step`.
    pub fn timestamp_at(&self, step: usize) -> SimTime {
        let offset = u32::try_from(step)
            .unwrap_or(u32::MAX)
            .saturating_mul(self.step_minutes);
        self.start.plus_minutes(offset)
    }
}

/// Role a participant plays in one tick, derived from the sign of its net position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Net surplus this tick.
    Producer,
    /// Net deficit this tick.
    Consumer,
    /// Zero net position; always treated as hold.
    Neutral,
}

impl Role {
    /// Classifies a signed net position.
    pub fn from_net(net: f64) -> Self {
        if net > EPSILON {
            Role::Producer
        } else if net < -EPSILON {
            Role::Consumer
        } else {
            Role::Neutral
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
            Role::Neutral => "neutral",
        }
    }
}

/// One household or node in the microgrid.
///
/// Only the settlement ledger mutates these fields once a run has started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Unique identifier.
    pub id: String,
    /// Energy currently stored (kWh), within `[0, battery_capacity]`.
    pub battery_stored: f64,
    /// Physical storage limit (kWh).
    pub battery_capacity: f64,
    /// Monetary balance, never negative at tick boundaries.
    pub wallet_balance: f64,
    /// An ask must be strictly above this price to trade.
    pub min_ask_price: f64,
}

impl Participant {
    /// Creates a participant with no minimum ask price.
    pub fn new(id: &str, battery_stored: f64, battery_capacity: f64, wallet_balance: f64) -> Self {
        Self {
            id: id.to_string(),
            battery_stored,
            battery_capacity,
            wallet_balance,
            min_ask_price: 0.0,
        }
    }

    /// Sets the minimum acceptable ask price.
    pub fn with_min_ask(mut self, min_ask_price: f64) -> Self {
        self.min_ask_price = min_ask_price;
        self
    }

    /// Free storage space (kWh).
    pub fn battery_headroom(&self) -> f64 {
        (self.battery_capacity - self.battery_stored).max(0.0)
    }

    /// Stored energy as a fraction of capacity.
    pub fn battery_fraction(&self) -> f64 {
        if self.battery_capacity > 0.0 {
            self.battery_stored / self.battery_capacity
        } else {
            0.0
        }
    }
}

/// Grid and pricing parameters that apply when the feed does not override them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarketParams {
    /// Default utility tariff for grid purchases.
    pub grid_price: f64,
    /// Separate export tariff; `None` sells at the purchase tariff.
    pub grid_sell_price: Option<f64>,
    /// Per-unit wheeling cost added to every P2P trade.
    pub transmission_cost_per_unit: f64,
}

impl Default for MarketParams {
    fn default() -> Self {
        Self {
            grid_price: 38.0,
            grid_sell_price: None,
            transmission_cost_per_unit: 3.0,
        }
    }
}

/// Immutable per-tick market conditions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TickContext {
    /// Tick index.
    pub step: usize,
    /// Simulated wall-clock time of the tick.
    pub timestamp: SimTime,
    /// Prevailing grid purchase tariff.
    pub grid_price: f64,
    /// Tariff paid for energy exported to the grid.
    pub grid_sell_price: f64,
    /// `false` during a modeled blackout.
    pub grid_available: bool,
    /// Per-unit wheeling cost added to P2P trades.
    pub transmission_cost_per_unit: f64,
}

impl TickContext {
    /// Builds the context for one tick, letting the feed frame override grid
    /// price and availability.
    pub fn new(
        step: usize,
        timestamp: SimTime,
        market: &MarketParams,
        frame: Option<&FeedFrame>,
    ) -> Self {
        let grid_price = frame
            .and_then(|f| f.grid_price)
            .unwrap_or(market.grid_price);
        let grid_available = frame.and_then(|f| f.grid_available).unwrap_or(true);
        Self {
            step,
            timestamp,
            grid_price,
            grid_sell_price: market.grid_sell_price.unwrap_or(grid_price).max(0.0),
            grid_available,
            transmission_cost_per_unit: market.transmission_cost_per_unit,
        }
    }
}

/// Cumulative communal energy sink.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CommunityLedger {
    /// Total energy donated so far (kWh); never decreases.
    pub total_donated_energy: f64,
}

impl CommunityLedger {
    pub(crate) fn credit(&mut self, quantity: f64) {
        if quantity > 0.0 {
            self.total_donated_energy += quantity;
        }
    }
}

/// Complete externally visible record of one settled tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    /// Tick index.
    pub step: usize,
    /// Simulated wall-clock time.
    pub timestamp: SimTime,
    /// Market conditions for this tick.
    pub context: TickContext,
    /// Net position per participant.
    pub positions: BTreeMap<String, NetPosition>,
    /// Proposal per participant after timeout/malformed fallback.
    pub proposals: BTreeMap<String, Action>,
    /// Proposals the matching engine refused.
    pub rejections: Vec<Rejection>,
    /// Policy calls that resolved to hold.
    pub fallbacks: Vec<PolicyFallback>,
    /// Settled flow records.
    pub flows: Vec<Flow>,
    /// Bound clamps applied by settlement.
    pub adjustments: Vec<Adjustment>,
    /// Net grid exchange this tick (kWh; positive = import).
    pub grid_net_energy: f64,
    /// Whether the grid exchange stayed within the connection limits.
    pub grid_within_limits: bool,
    /// Participant state after settlement.
    pub participants: Vec<Participant>,
    /// Community ledger after settlement.
    pub community: CommunityLedger,
}

impl TickReport {
    fn sum_flows(&self, pick: impl Fn(&Flow) -> bool) -> f64 {
        self.flows
            .iter()
            .filter(|f| pick(f))
            .map(Flow::quantity)
            .sum()
    }

    /// Energy traded peer-to-peer.
    pub fn p2p_energy(&self) -> f64 {
        self.sum_flows(|f| matches!(f, Flow::P2p { .. }))
    }

    /// Energy donated to the community.
    pub fn donated_energy(&self) -> f64 {
        self.sum_flows(|f| matches!(f, Flow::Donation { .. }))
    }

    /// Energy bought from the grid.
    pub fn grid_import_energy(&self) -> f64 {
        self.sum_flows(|f| matches!(f, Flow::GridImport { .. }))
    }

    /// Energy sold to the grid.
    pub fn grid_export_energy(&self) -> f64 {
        self.sum_flows(|f| matches!(f, Flow::GridExport { .. }))
    }

    /// Surplus lost to curtailment.
    pub fn curtailed_energy(&self) -> f64 {
        self.sum_flows(|f| matches!(f, Flow::Curtailment { .. }))
    }

    /// Deficit left uncovered.
    pub fn unmet_energy(&self) -> f64 {
        self.sum_flows(|f| matches!(f, Flow::UnmetLoad { .. }))
    }

    /// Returns the settled state of one participant.
    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }
}

impl fmt::Display for TickReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let grid = if self.context.grid_available {
            "ON "
        } else {
            "OFF"
        };
        write!(
            f,
            "t={:>3} ({}) | grid={} @{:>6.2} | p2p={:>6.2} kWh  donate={:>5.2}  \
             import={:>6.2}  export={:>6.2}  curtail={:>5.2}  unmet={:>5.2} | \
             rejects={} fallbacks={}",
            self.step,
            self.timestamp,
            grid,
            self.context.grid_price,
            self.p2p_energy(),
            self.donated_energy(),
            self.grid_import_energy(),
            self.grid_export_energy(),
            self.curtailed_energy(),
            self.unmet_energy(),
            self.rejections.len(),
            self.fallbacks.len(),
        )
    }
}
