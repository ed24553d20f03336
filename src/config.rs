//! TOML-based scenario configuration and preset definitions.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::feed::synthetic::{Profile, SyntheticDay};
use crate::sim::donation::DonationPolicy;
use crate::sim::grid::GridConnection;
use crate::sim::policy::{BuiltinPolicy, HeuristicPolicy, HoldPolicy};
use crate::sim::reconcile::InitialStateSource;
use crate::sim::types::{MarketParams, Participant, SimConfig, SimTime};
use crate::sim::window::TimeWindow;

/// Top-level scenario configuration parsed from TOML.
///
/// All fields have defaults matching the baseline scenario. Load from
/// TOML with [`ScenarioConfig::from_toml_file`] or use
/// [`ScenarioConfig::baseline`] for the built-in default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Simulation timing and global parameters.
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Tariffs and transmission cost.
    #[serde(default)]
    pub market: MarketConfig,
    /// Decision policy selection.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Donation window and limits.
    #[serde(default)]
    pub donation: DonationConfig,
    /// Data feed source.
    #[serde(default)]
    pub feed: FeedConfig,
    /// Grid connection limits.
    #[serde(default)]
    pub grid: GridConfig,
    /// Participants in the microgrid.
    #[serde(default = "default_participants")]
    pub participants: Vec<ParticipantConfig>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            simulation: SimulationConfig::default(),
            market: MarketConfig::default(),
            policy: PolicyConfig::default(),
            donation: DonationConfig::default(),
            feed: FeedConfig::default(),
            grid: GridConfig::default(),
            participants: default_participants(),
        }
    }
}

/// Simulation timing and global parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Number of ticks (must be > 0).
    pub steps: usize,
    /// Tick length in minutes (must be > 0).
    pub step_minutes: u32,
    /// Simulated time of the first tick.
    pub start: SimTime,
    /// Master random seed.
    pub seed: u64,
    /// Which source wins when configured and observed battery levels differ.
    pub initial_state: InitialStateSource,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            steps: 48,
            step_minutes: 30,
            start: SimTime::MIDNIGHT,
            seed: 42,
            initial_state: InitialStateSource::Config,
        }
    }
}

/// Tariffs and transmission cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarketConfig {
    /// Grid purchase tariff used when the feed gives none.
    pub grid_price: f64,
    /// Separate export tariff; unset sells at the purchase tariff.
    pub grid_sell_price: Option<f64>,
    /// Per-unit cost added to every P2P trade.
    pub transmission_cost_per_unit: f64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            grid_price: 38.0,
            grid_sell_price: None,
            transmission_cost_per_unit: 3.0,
        }
    }
}

/// Decision policy selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Policy type: `"heuristic"` or `"hold"`.
    pub kind: String,
    /// Heuristic sellers ask this much below the grid tariff.
    pub sell_spread: f64,
    /// Heuristic ask during a blackout.
    pub blackout_price: f64,
    /// Deadline for one policy call (ms); later replies count as hold.
    pub timeout_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            kind: "heuristic".to_string(),
            sell_spread: 8.0,
            blackout_price: 35.0,
            timeout_ms: 2000,
        }
    }
}

/// Donation window and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DonationConfig {
    pub enabled: bool,
    /// First time of day inside the window (inclusive).
    pub window_start: SimTime,
    /// Last time of day inside the window (inclusive).
    pub window_end: SimTime,
    /// Remaining surplus must be strictly above this to donate (kWh).
    pub min_surplus: f64,
    /// Largest donation per participant per tick (kWh).
    pub max_per_tick: f64,
    /// Minimum battery fill (0.0–1.0) for a participant to donate.
    pub min_battery_fraction: f64,
}

impl Default for DonationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_start: SimTime::hm(18, 0),
            window_end: SimTime::hm(21, 0),
            min_surplus: 0.1,
            max_per_tick: 0.5,
            min_battery_fraction: 0.0,
        }
    }
}

/// Data feed source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedConfig {
    /// CSV feed; unset generates a synthetic day from participant profiles.
    pub path: Option<PathBuf>,
    /// Noise on the synthetic profiles.
    pub noise_std: f64,
}

/// Grid connection limits (kWh per tick).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GridConfig {
    pub max_import_kwh: f64,
    pub max_export_kwh: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            max_import_kwh: f64::INFINITY,
            max_export_kwh: f64::INFINITY,
        }
    }
}

/// One participant: starting state plus synthetic profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParticipantConfig {
    pub id: String,
    /// Storage limit (kWh, must be > 0).
    pub battery_capacity: f64,
    /// Starting stored energy (kWh).
    pub battery_stored: f64,
    /// Starting wallet balance.
    pub wallet_balance: f64,
    /// Asks must be strictly above this.
    pub min_ask_price: f64,
    /// Synthetic solar peak (kW).
    pub solar_kw_peak: f64,
    /// Synthetic all-day load (kW).
    pub base_load_kw: f64,
    /// Synthetic extra evening load (kW).
    pub evening_load_kw: f64,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            battery_capacity: 10.0,
            battery_stored: 5.0,
            wallet_balance: 1000.0,
            min_ask_price: 0.0,
            solar_kw_peak: 0.0,
            base_load_kw: 1.0,
            evening_load_kw: 0.0,
        }
    }
}

impl ParticipantConfig {
    fn house(id: &str, stored: f64, wallet: f64, solar: f64, base: f64, evening: f64) -> Self {
        Self {
            id: id.to_string(),
            battery_stored: stored,
            wallet_balance: wallet,
            solar_kw_peak: solar,
            base_load_kw: base,
            evening_load_kw: evening,
            ..Self::default()
        }
    }
}

/// Producer with rooftop solar and a full battery, consumer without panels.
fn default_participants() -> Vec<ParticipantConfig> {
    vec![
        ParticipantConfig::house("house_a", 8.5, 5000.0, 5.0, 0.5, 0.5),
        ParticipantConfig::house("house_b", 1.5, 2000.0, 0.0, 1.0, 1.5),
    ]
}

/// Configuration error with field path and constraint description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("config error: {field}: {message}")]
pub struct ConfigError {
    /// Dotted field path (e.g., `"market.transmission_cost_per_unit"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl ConfigError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

fn non_negative(errors: &mut Vec<ConfigError>, field: &str, value: f64) {
    if !(value >= 0.0 && value.is_finite()) {
        errors.push(ConfigError::new(field, format!("must be a finite value >= 0, got {value}")));
    }
}

impl ScenarioConfig {
    /// Returns the baseline scenario: two houses, default tariffs.
    pub fn baseline() -> Self {
        Self::default()
    }

    /// Returns the echo-grid preset: baseline houses with a low export
    /// tariff, so leftover surplus is worth more traded or donated.
    pub fn echo_grid() -> Self {
        Self {
            market: MarketConfig {
                grid_sell_price: Some(11.0),
                ..MarketConfig::default()
            },
            ..Self::baseline()
        }
    }

    /// Returns the high-transmission preset: wheeling cost high enough that
    /// P2P trades rarely beat the grid.
    pub fn high_transmission() -> Self {
        Self {
            market: MarketConfig {
                transmission_cost_per_unit: 20.0,
                ..MarketConfig::default()
            },
            ..Self::baseline()
        }
    }

    /// Returns the neighborhood preset: four houses with mixed solar and
    /// storage, and a donation threshold on battery fill.
    pub fn neighborhood() -> Self {
        let mut participants = default_participants();
        participants.push(ParticipantConfig::house("house_c", 4.0, 1500.0, 3.0, 0.7, 1.0));
        participants.push(ParticipantConfig {
            battery_capacity: 5.0,
            ..ParticipantConfig::house("house_d", 1.0, 800.0, 0.0, 0.8, 2.0)
        });
        Self {
            market: MarketConfig {
                grid_sell_price: Some(11.0),
                ..MarketConfig::default()
            },
            donation: DonationConfig {
                min_battery_fraction: 0.5,
                ..DonationConfig::default()
            },
            participants,
            ..Self::default()
        }
    }

    /// Available preset names.
    pub const PRESETS: &[&str] = &["baseline", "echo_grid", "high_transmission", "neighborhood"];

    /// Loads a scenario from a named preset.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the preset name is unknown.
    pub fn from_preset(name: &str) -> Result<Self, ConfigError> {
        match name {
            "baseline" => Ok(Self::baseline()),
            "echo_grid" => Ok(Self::echo_grid()),
            "high_transmission" => Ok(Self::high_transmission()),
            "neighborhood" => Ok(Self::neighborhood()),
            _ => Err(ConfigError::new(
                "preset",
                format!(
                    "unknown preset \"{name}\", available: {}",
                    Self::PRESETS.join(", ")
                ),
            )),
        }
    }

    /// Parses a scenario from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::new("scenario", format!("cannot read \"{}\": {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a scenario from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::new("toml", e.to_string()))
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        let s = &self.simulation;
        if s.steps == 0 {
            errors.push(ConfigError::new("simulation.steps", "must be > 0"));
        }
        if s.step_minutes == 0 {
            errors.push(ConfigError::new("simulation.step_minutes", "must be > 0"));
        }

        let m = &self.market;
        non_negative(&mut errors, "market.grid_price", m.grid_price);
        if let Some(sell) = m.grid_sell_price {
            non_negative(&mut errors, "market.grid_sell_price", sell);
        }
        non_negative(
            &mut errors,
            "market.transmission_cost_per_unit",
            m.transmission_cost_per_unit,
        );

        let p = &self.policy;
        if p.kind != "heuristic" && p.kind != "hold" {
            errors.push(ConfigError::new(
                "policy.kind",
                format!("must be \"heuristic\" or \"hold\", got \"{}\"", p.kind),
            ));
        }
        non_negative(&mut errors, "policy.sell_spread", p.sell_spread);
        non_negative(&mut errors, "policy.blackout_price", p.blackout_price);
        if p.timeout_ms == 0 {
            errors.push(ConfigError::new("policy.timeout_ms", "must be > 0"));
        }

        let d = &self.donation;
        if let Err(e) = TimeWindow::new(d.window_start, d.window_end) {
            errors.push(ConfigError::new("donation.window_end", e.to_string()));
        }
        non_negative(&mut errors, "donation.min_surplus", d.min_surplus);
        non_negative(&mut errors, "donation.max_per_tick", d.max_per_tick);
        if !(0.0..=1.0).contains(&d.min_battery_fraction) {
            errors.push(ConfigError::new(
                "donation.min_battery_fraction",
                "must be in [0.0, 1.0]",
            ));
        }

        non_negative(&mut errors, "feed.noise_std", self.feed.noise_std);

        let g = &self.grid;
        if !(g.max_import_kwh >= 0.0) {
            errors.push(ConfigError::new("grid.max_import_kwh", "must be >= 0"));
        }
        if !(g.max_export_kwh >= 0.0) {
            errors.push(ConfigError::new("grid.max_export_kwh", "must be >= 0"));
        }

        if self.participants.is_empty() {
            errors.push(ConfigError::new("participants", "at least one participant is required"));
        }
        let mut seen = BTreeSet::new();
        for (i, pc) in self.participants.iter().enumerate() {
            let at = |name: &str| format!("participants[{i}].{name}");
            if pc.id.trim().is_empty() {
                errors.push(ConfigError::new(at("id"), "must not be empty"));
            } else if !seen.insert(pc.id.as_str()) {
                errors.push(ConfigError::new(at("id"), format!("duplicate id \"{}\"", pc.id)));
            }
            if !(pc.battery_capacity > 0.0 && pc.battery_capacity.is_finite()) {
                errors.push(ConfigError::new(at("battery_capacity"), "must be > 0"));
            }
            if !(0.0..=pc.battery_capacity).contains(&pc.battery_stored) {
                errors.push(ConfigError::new(
                    at("battery_stored"),
                    format!("must be in [0, {}]", pc.battery_capacity),
                ));
            }
            non_negative(&mut errors, &at("wallet_balance"), pc.wallet_balance);
            non_negative(&mut errors, &at("min_ask_price"), pc.min_ask_price);
            non_negative(&mut errors, &at("solar_kw_peak"), pc.solar_kw_peak);
            non_negative(&mut errors, &at("base_load_kw"), pc.base_load_kw);
            non_negative(&mut errors, &at("evening_load_kw"), pc.evening_load_kw);
        }

        errors
    }

    /// Timing configuration.
    ///
    /// # Panics
    ///
    /// Panics if `steps` or `step_minutes` is zero; call [`Self::validate`] first.
    pub fn sim_config(&self) -> SimConfig {
        let s = &self.simulation;
        SimConfig::new(s.steps, s.step_minutes, s.start, s.seed)
    }

    pub fn market_params(&self) -> MarketParams {
        MarketParams {
            grid_price: self.market.grid_price,
            grid_sell_price: self.market.grid_sell_price,
            transmission_cost_per_unit: self.market.transmission_cost_per_unit,
        }
    }

    /// The configured built-in policy, without its deadline.
    pub fn builtin_policy(&self) -> BuiltinPolicy {
        match self.policy.kind.as_str() {
            "hold" => BuiltinPolicy::Hold(HoldPolicy),
            _ => BuiltinPolicy::Heuristic(HeuristicPolicy {
                sell_spread: self.policy.sell_spread,
                blackout_price: self.policy.blackout_price,
            }),
        }
    }

    pub fn policy_timeout(&self) -> Duration {
        Duration::from_millis(self.policy.timeout_ms)
    }

    /// Donation policy, or a disabled one when donations are off.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the window ends before it starts.
    pub fn donation_policy(&self) -> Result<DonationPolicy, ConfigError> {
        let d = &self.donation;
        if !d.enabled {
            return Ok(DonationPolicy::disabled());
        }
        let window = TimeWindow::new(d.window_start, d.window_end)
            .map_err(|e| ConfigError::new("donation.window_end", e.to_string()))?;
        Ok(DonationPolicy::new(
            window,
            d.min_surplus,
            d.max_per_tick,
            d.min_battery_fraction,
        ))
    }

    pub fn grid_connection(&self) -> GridConnection {
        GridConnection::with_limits(
            "pcc",
            self.grid.max_import_kwh.max(0.0),
            self.grid.max_export_kwh.max(0.0),
        )
    }

    /// Configured starting state, before reconciliation with the feed.
    pub fn initial_participants(&self) -> Vec<Participant> {
        self.participants
            .iter()
            .map(|pc| {
                Participant::new(
                    &pc.id,
                    pc.battery_stored,
                    pc.battery_capacity,
                    pc.wallet_balance,
                )
                .with_min_ask(pc.min_ask_price)
            })
            .collect()
    }

    /// Synthetic profiles for every participant.
    pub fn profiles(&self) -> Vec<Profile> {
        self.participants
            .iter()
            .map(|pc| Profile {
                id: pc.id.clone(),
                solar_kw_peak: pc.solar_kw_peak,
                base_load_kw: pc.base_load_kw,
                evening_load_kw: pc.evening_load_kw,
            })
            .collect()
    }

    pub fn synthetic_day(&self) -> SyntheticDay {
        SyntheticDay {
            noise_std: self.feed.noise_std,
            ..SyntheticDay::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_preset_valid() {
        let cfg = ScenarioConfig::baseline();
        let errors = cfg.validate();
        assert!(errors.is_empty(), "baseline should be valid: {errors:?}");
        assert_eq!(cfg.participants.len(), 2);
    }

    #[test]
    fn from_preset_unknown() {
        let err = ScenarioConfig::from_preset("nonexistent");
        assert!(err.is_err());
        let e = err.unwrap_err();
        assert!(e.message.contains("unknown preset"));
    }

    #[test]
    fn all_presets_are_valid() {
        for name in ScenarioConfig::PRESETS {
            let cfg = ScenarioConfig::from_preset(name);
            assert!(cfg.is_ok(), "preset \"{name}\" should load");
            let errors = cfg.as_ref().map(|c| c.validate()).unwrap_or_default();
            assert!(
                errors.is_empty(),
                "preset \"{name}\" should be valid: {errors:?}"
            );
        }
    }

    #[test]
    fn high_transmission_raises_wheeling_cost() {
        let base = ScenarioConfig::baseline();
        let high = ScenarioConfig::high_transmission();
        assert!(
            high.market.transmission_cost_per_unit > base.market.transmission_cost_per_unit
        );
    }

    #[test]
    fn neighborhood_has_four_houses() {
        let cfg = ScenarioConfig::neighborhood();
        assert_eq!(cfg.participants.len(), 4);
        assert_eq!(cfg.market_params().grid_sell_price, Some(11.0));
    }

    #[test]
    fn valid_toml_parses() {
        let toml = r#"
[simulation]
steps = 24
step_minutes = 60
start = "06:00"
seed = 99
initial_state = "feed"

[market]
grid_price = 40.0
grid_sell_price = 11.0
transmission_cost_per_unit = 2.5

[policy]
kind = "hold"
timeout_ms = 500

[donation]
enabled = true
window_start = "17:30"
window_end = "20:00"
max_per_tick = 1.0

[feed]
noise_std = 0.05

[grid]
max_import_kwh = 10.0

[[participants]]
id = "north"
battery_capacity = 12.0
battery_stored = 6.0
wallet_balance = 300.0
solar_kw_peak = 4.0

[[participants]]
id = "south"
battery_stored = 0.0
"#;
        let cfg = ScenarioConfig::from_toml_str(toml);
        assert!(cfg.is_ok(), "valid TOML should parse: {:?}", cfg.err());
        let cfg = cfg.ok();
        let cfg = cfg.as_ref();
        assert_eq!(cfg.map(|c| c.simulation.start), Some(SimTime::hm(6, 0)));
        assert_eq!(
            cfg.map(|c| c.simulation.initial_state),
            Some(InitialStateSource::Feed)
        );
        assert_eq!(cfg.map(|c| c.participants.len()), Some(2));
        assert_eq!(cfg.map(|c| c.participants[1].battery_capacity), Some(10.0));
        assert_eq!(cfg.map(|c| c.validate().len()), Some(0));
        assert_eq!(
            cfg.map(|c| c.builtin_policy()),
            Some(BuiltinPolicy::Hold(HoldPolicy))
        );
    }

    #[test]
    fn invalid_toml_unknown_field() {
        let toml = r#"
[market]
grid_price = 38.0
bogus_field = true
"#;
        assert!(ScenarioConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let cfg = ScenarioConfig::from_toml_str("[simulation]\nseed = 7\n");
        let cfg = cfg.ok();
        assert_eq!(cfg.as_ref().map(|c| c.simulation.seed), Some(7));
        assert_eq!(cfg.as_ref().map(|c| c.simulation.steps), Some(48));
        assert_eq!(cfg.as_ref().map(|c| c.participants.len()), Some(2));
    }

    #[test]
    fn validation_catches_negative_transmission() {
        let mut cfg = ScenarioConfig::baseline();
        cfg.market.transmission_cost_per_unit = -1.0;
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.field == "market.transmission_cost_per_unit"));
    }

    #[test]
    fn validation_catches_inverted_donation_window() {
        let mut cfg = ScenarioConfig::baseline();
        cfg.donation.window_start = SimTime::hm(21, 0);
        cfg.donation.window_end = SimTime::hm(18, 0);
        assert!(cfg.validate().iter().any(|e| e.field == "donation.window_end"));
        assert!(cfg.donation_policy().is_err());
    }

    #[test]
    fn validation_reports_every_problem() {
        let mut cfg = ScenarioConfig::baseline();
        cfg.simulation.steps = 0;
        cfg.policy.kind = "oracle".into();
        cfg.policy.timeout_ms = 0;
        cfg.participants[1].id = "house_a".into();
        cfg.participants[0].battery_stored = 11.0;
        cfg.participants[0].wallet_balance = -5.0;
        let fields: Vec<_> = cfg.validate().into_iter().map(|e| e.field).collect();
        for expected in [
            "simulation.steps",
            "policy.kind",
            "policy.timeout_ms",
            "participants[1].id",
            "participants[0].battery_stored",
            "participants[0].wallet_balance",
        ] {
            assert!(fields.iter().any(|f| f == expected), "missing {expected}");
        }
    }

    #[test]
    fn validation_requires_participants() {
        let mut cfg = ScenarioConfig::baseline();
        cfg.participants.clear();
        assert!(cfg.validate().iter().any(|e| e.field == "participants"));
    }

    #[test]
    fn disabled_donation_builds_inactive_policy() {
        let mut cfg = ScenarioConfig::baseline();
        cfg.donation.enabled = false;
        assert_eq!(cfg.donation_policy(), Ok(DonationPolicy::disabled()));
    }
}
