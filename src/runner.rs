//! Scenario wiring: configuration, feed, starting state, engine.

use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, ScenarioConfig};
use crate::feed::{Feed, FeedError, synthetic};
use crate::sim::engine::{Engine, SimError};
use crate::sim::kpi::MarketKpis;
use crate::sim::policy::{BuiltinPolicy, TimedPolicy};
use crate::sim::reconcile::{self, Discrepancy, ReconcileError};
use crate::sim::types::{CommunityLedger, Participant, TickReport};

/// Engine type built from a scenario: a built-in policy behind a deadline.
pub type MarketEngine = Engine<TimedPolicy<BuiltinPolicy>>;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid configuration: {}", list(.0))]
    Config(Vec<ConfigError>),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Sim(#[from] SimError),
}

impl From<ConfigError> for RunError {
    fn from(err: ConfigError) -> Self {
        Self::Config(vec![err])
    }
}

fn list(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// An engine at tick 0 and what reconciliation found on the way.
pub struct Prepared {
    pub engine: MarketEngine,
    pub discrepancies: Vec<Discrepancy>,
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub config: ScenarioConfig,
    pub reports: Vec<TickReport>,
    pub kpis: MarketKpis,
    pub discrepancies: Vec<Discrepancy>,
    pub participants: Vec<Participant>,
    pub community: CommunityLedger,
}

/// Reads the configured CSV feed, or generates a synthetic day from the
/// participant profiles when no path is set.
///
/// # Errors
///
/// Returns a [`FeedError`] if the CSV cannot be read or is malformed.
pub fn load_feed(config: &ScenarioConfig) -> Result<Feed, FeedError> {
    let sim = config.sim_config();
    let feed = match &config.feed.path {
        Some(path) => {
            info!(path = %path.display(), "loading feed");
            Feed::from_csv_path(path, sim.start, sim.step_minutes)?
        }
        None => synthetic::generate(&sim, &config.profiles(), &config.synthetic_day()),
    };

    let ids = feed.participant_ids();
    for p in &config.participants {
        if !ids.contains(p.id.as_str()) {
            warn!(participant = %p.id, "no feed readings, every tick is an input gap");
        }
    }
    for id in ids {
        if !config.participants.iter().any(|p| p.id == id) {
            warn!(column = id, "feed readings for unknown participant ignored");
        }
    }
    Ok(feed)
}

/// Validates `config` and builds an engine positioned before tick 0.
///
/// # Errors
///
/// Returns [`RunError::Config`] with every validation error, or the first
/// feed or reconciliation error.
pub fn build_engine(config: &ScenarioConfig) -> Result<Prepared, RunError> {
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(RunError::Config(errors));
    }

    let feed = load_feed(config)?;
    let reconciled = reconcile::initial_state(
        config.initial_participants(),
        feed.frame(0),
        config.simulation.initial_state,
    )?;
    let policy = TimedPolicy::new(config.builtin_policy(), config.policy_timeout());

    let engine = Engine::new(
        config.sim_config(),
        config.market_params(),
        feed,
        policy,
        config.donation_policy()?,
        config.grid_connection(),
        reconciled.participants,
    );
    Ok(Prepared {
        engine,
        discrepancies: reconciled.discrepancies,
    })
}

/// Runs every remaining tick of `prepared` and aggregates the KPIs.
///
/// `on_tick` sees each report as soon as its tick is committed.
///
/// # Errors
///
/// Returns [`RunError::Sim`] from the first tick that fails to settle.
pub fn run_prepared(
    config: &ScenarioConfig,
    prepared: Prepared,
    mut on_tick: impl FnMut(&TickReport),
) -> Result<RunOutput, RunError> {
    let Prepared {
        mut engine,
        discrepancies,
    } = prepared;

    let mut reports = Vec::with_capacity(config.simulation.steps);
    while let Some(report) = engine.step()? {
        on_tick(&report);
        reports.push(report);
    }

    let kpis = MarketKpis::from_reports(&reports);
    Ok(RunOutput {
        config: config.clone(),
        reports,
        kpis,
        discrepancies,
        participants: engine.participants().to_vec(),
        community: engine.community(),
    })
}

/// Builds and runs a scenario end to end.
///
/// # Errors
///
/// See [`build_engine`] and [`run_prepared`].
pub fn run_scenario(config: &ScenarioConfig) -> Result<RunOutput, RunError> {
    let prepared = build_engine(config)?;
    run_prepared(config, prepared, |_| {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::export::write_flows_csv;

    #[test]
    fn same_scenario_and_seed_is_deterministic() {
        let mut scenario = ScenarioConfig::neighborhood();
        scenario.feed.noise_std = 0.1;
        scenario.simulation.seed = 777;

        let run_a = run_scenario(&scenario).expect("first run should succeed");
        let run_b = run_scenario(&scenario).expect("second run should succeed");

        let mut out_a = Vec::new();
        write_flows_csv(&run_a.reports, &mut out_a).expect("first export should succeed");
        let mut out_b = Vec::new();
        write_flows_csv(&run_b.reports, &mut out_b).expect("second export should succeed");

        assert_eq!(out_a, out_b);
        assert_eq!(run_a.kpis, run_b.kpis);
    }

    #[test]
    fn invalid_config_reports_all_errors() {
        let mut scenario = ScenarioConfig::baseline();
        scenario.simulation.steps = 0;
        scenario.market.transmission_cost_per_unit = -1.0;

        match run_scenario(&scenario) {
            Err(RunError::Config(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected config errors, got {other:?}"),
        }
    }

    #[test]
    fn run_covers_every_tick() {
        let out = run_scenario(&ScenarioConfig::echo_grid()).expect("run should succeed");
        assert_eq!(out.reports.len(), 48);
        assert_eq!(out.kpis.ticks, 48);
        assert_eq!(out.kpis.blackout_ticks, 4);
        assert_eq!(out.participants.len(), 2);
    }

    #[test]
    fn on_tick_sees_reports_in_order() {
        let scenario = ScenarioConfig::baseline();
        let prepared = build_engine(&scenario).expect("engine should build");
        let mut seen = Vec::new();
        run_prepared(&scenario, prepared, |r| seen.push(r.step)).expect("run should succeed");
        assert_eq!(seen, (0..48).collect::<Vec<_>>());
    }
}
