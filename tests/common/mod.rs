//! Shared test fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;

use microgrid_market::feed::{Feed, FeedFrame, Reading};
use microgrid_market::sim::donation::DonationPolicy;
use microgrid_market::sim::engine::Engine;
use microgrid_market::sim::grid::GridConnection;
use microgrid_market::sim::policy::{Action, DecisionPolicy, PolicyFault, PolicyRequest};
use microgrid_market::sim::types::{MarketParams, Participant, SimConfig, SimTime, TickReport};

/// Tolerance for comparing settled energy and money.
pub const TOL: f64 = 1e-9;

/// Policy that replies with a fixed action per participant, hold otherwise.
#[derive(Debug, Clone, Default)]
pub struct FixedPolicy {
    actions: BTreeMap<String, Action>,
}

impl FixedPolicy {
    pub fn new(actions: &[(&str, Action)]) -> Self {
        Self {
            actions: actions
                .iter()
                .map(|(id, a)| ((*id).to_string(), *a))
                .collect(),
        }
    }
}

impl DecisionPolicy for FixedPolicy {
    fn decide(&self, request: &PolicyRequest) -> Result<Action, PolicyFault> {
        Ok(self
            .actions
            .get(&request.participant_id)
            .copied()
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Market with no separate export tariff.
pub fn market(grid_price: f64, transmission: f64) -> MarketParams {
    MarketParams {
        grid_price,
        grid_sell_price: None,
        transmission_cost_per_unit: transmission,
    }
}

/// One frame with `(id, generation, consumption)` readings.
pub fn frame(t: SimTime, grid_available: bool, readings: &[(&str, f64, f64)]) -> FeedFrame {
    FeedFrame {
        timestamp: t,
        grid_available: Some(grid_available),
        grid_price: None,
        readings: readings
            .iter()
            .map(|&(id, generation, consumption)| {
                (
                    id.to_string(),
                    Reading {
                        generation,
                        consumption,
                        battery: None,
                    },
                )
            })
            .collect(),
    }
}

/// Engine over `frames` with 30-minute ticks starting at the first frame.
pub fn engine<P: DecisionPolicy>(
    market: MarketParams,
    frames: Vec<FeedFrame>,
    policy: P,
    donation: DonationPolicy,
    participants: Vec<Participant>,
) -> Engine<P> {
    let start = frames.first().map_or(SimTime::MIDNIGHT, |f| f.timestamp);
    let steps = frames
        .last()
        .map_or(1, |f| (f.timestamp.minutes() - start.minutes()) as usize / 30 + 1);
    let config = SimConfig::new(steps, 30, start, 42);
    let feed = Feed::from_frames(start, 30, frames).expect("frames should be aligned");
    Engine::new(
        config,
        market,
        feed,
        policy,
        donation,
        GridConnection::new("pcc"),
        participants,
    )
}

/// Runs `engine` to completion and returns the single report of a one-tick run.
pub fn single_tick<P: DecisionPolicy>(mut engine: Engine<P>) -> TickReport {
    let mut reports = engine.run().expect("tick should settle");
    assert_eq!(reports.len(), 1);
    reports.remove(0)
}

/// Asserts bounds and per-participant energy conservation for one tick.
pub fn assert_tick_invariants(before: &[Participant], report: &TickReport) {
    for p in &report.participants {
        assert!(p.wallet_balance >= 0.0, "{} wallet {}", p.id, p.wallet_balance);
        assert!(
            p.battery_stored >= 0.0 && p.battery_stored <= p.battery_capacity,
            "{} battery {} of {}",
            p.id,
            p.battery_stored,
            p.battery_capacity
        );

        let prior = before
            .iter()
            .find(|b| b.id == p.id)
            .expect("participant existed before the tick");
        let net = report.positions.get(&p.id).map_or(0.0, |pos| pos.net);
        let flows: f64 = report.flows.iter().map(|f| f.energy_delta_for(&p.id)).sum();
        let delta = p.battery_stored - prior.battery_stored;
        assert!(
            (delta - (net + flows)).abs() < 1e-6,
            "{} battery delta {delta} != net {net} + flows {flows}",
            p.id
        );
    }
}
