//! Tick scheduler that drives balance, policy, matching, donation, grid
//! fallback, and settlement in a fixed order.

use std::collections::BTreeMap;
use std::thread;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::feed::Feed;

use super::balance::{NetPosition, net_positions};
use super::clock::{Clock, Tick};
use super::donation::DonationPolicy;
use super::flow::{Flow, SignalSink};
use super::grid::GridConnection;
use super::matching::match_trades;
use super::policy::{self, Action, DecisionPolicy, PolicyFallback, PolicyFault, PolicyRequest};
use super::settlement::{Ledger, Settlement, SettlementError};
use super::snapshot::{MarketSnapshot, StateSink};
use super::types::{
    CommunityLedger, EPSILON, MarketParams, Participant, Role, SimConfig, TickContext, TickReport,
};

/// Largest per-participant energy imbalance accepted at commit (kWh).
const CONSERVATION_TOLERANCE: f64 = 1e-6;

/// Errors that halt the run before the failing tick is committed.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Settlement(#[from] SettlementError),
    #[error("step {step}: energy balance off by {residual:e} kWh")]
    ConservationViolated { step: usize, residual: f64 },
    #[error("step {step}: participant \"{participant}\" out of bounds: {detail}")]
    BoundViolated {
        step: usize,
        participant: String,
        detail: String,
    },
}

/// Simulation engine owning market state and every per-tick component.
///
/// Generic over `P: DecisionPolicy` for static dispatch. The engine is the
/// only writer of participant and community state; everything else sees
/// immutable snapshots.
pub struct Engine<P: DecisionPolicy> {
    config: SimConfig,
    market: MarketParams,
    feed: Feed,
    policy: P,
    donation: DonationPolicy,
    grid: GridConnection,
    ledger: Ledger,
    clock: Clock,
    signal_sinks: Vec<Box<dyn SignalSink>>,
    state_sink: Option<Box<dyn StateSink>>,
}

impl<P: DecisionPolicy> Engine<P> {
    /// Creates a new engine positioned before tick 0.
    ///
    /// # Arguments
    ///
    /// * `config` - Tick count, tick length, start time, and seed
    /// * `market` - Default tariffs and transmission cost
    /// * `feed` - Per-tick generation, consumption, and grid state
    /// * `policy` - Decision policy consulted for every participant
    /// * `donation` - Donation window and limits
    /// * `grid` - Grid connection with exchange limits
    /// * `participants` - Reconciled starting state
    pub fn new(
        config: SimConfig,
        market: MarketParams,
        feed: Feed,
        policy: P,
        donation: DonationPolicy,
        grid: GridConnection,
        participants: Vec<Participant>,
    ) -> Self {
        info!(
            participants = participants.len(),
            steps = config.total_steps(),
            policy = policy.name(),
            "engine ready"
        );
        Self {
            clock: Clock::new(&config),
            config,
            market,
            feed,
            policy,
            donation,
            grid,
            ledger: Ledger::new(participants),
            signal_sinks: Vec::new(),
            state_sink: None,
        }
    }

    /// Adds a subscriber to the physical signal channel.
    pub fn subscribe(&mut self, sink: impl SignalSink + 'static) {
        self.signal_sinks.push(Box::new(sink));
    }

    /// Sets the sink that receives a snapshot after every tick.
    pub fn with_state_sink(mut self, sink: impl StateSink + 'static) -> Self {
        self.state_sink = Some(Box::new(sink));
        self
    }

    /// Executes the next tick.
    ///
    /// Returns `Ok(None)` once every tick has run.
    ///
    /// # Errors
    ///
    /// Returns a [`SimError`] if settlement fails or the settled state breaks
    /// energy balance or resource bounds. Nothing from that tick is committed.
    pub fn step(&mut self) -> Result<Option<TickReport>, SimError> {
        let Some(Tick { step, timestamp }) = self.clock.tick() else {
            return Ok(None);
        };

        // 1. Tick context and net positions
        let frame = self.feed.frame(step);
        let ctx = TickContext::new(step, timestamp, &self.market, frame);
        let before = self.ledger.participants().to_vec();
        let positions = net_positions(&before, frame);

        // 2. Advisory proposals, all participants in parallel
        let (proposals, fallbacks) = self.collect_proposals(&ctx, &before, &positions);

        // 3. P2P matching
        let outcome = match_trades(&ctx, &before, &positions, &proposals);
        let mut remaining = outcome.remaining;

        // 4. Donation on remaining surplus
        let donations = self.donation.apply(&ctx, &before, &mut remaining);

        // 5. Grid fallback on whatever is left
        let grid_flows = self
            .grid
            .resolve(&ctx, &before, &remaining, &outcome.wallet_delta);

        // 6. Settlement: prepare, verify, commit
        let mut flows = outcome.trades;
        flows.extend(donations);
        flows.extend(grid_flows);
        let settlement = self.ledger.prepare(step, &positions, flows)?;
        verify(step, &settlement, &positions)?;
        let settlement = self.ledger.commit(step, settlement).clone();

        let grid_net_energy = grid_net(&settlement.flows);
        self.grid.reset();
        self.grid.add_net_kwh(grid_net_energy);

        let report = TickReport {
            step,
            timestamp,
            context: ctx,
            positions,
            proposals,
            rejections: outcome.rejections,
            fallbacks,
            flows: settlement.flows,
            adjustments: settlement.adjustments,
            grid_net_energy,
            grid_within_limits: self.grid.within_limits(),
            participants: settlement.participants,
            community: self.ledger.community(),
        };

        // 7. Externalize committed state
        self.publish(&report);
        info!(
            step,
            time = %timestamp,
            grid = ctx.grid_available,
            p2p = report.p2p_energy(),
            donated = report.donated_energy(),
            import = report.grid_import_energy(),
            export = report.grid_export_energy(),
            unmet = report.unmet_energy(),
            "tick settled"
        );
        Ok(Some(report))
    }

    /// Executes all remaining ticks and returns their reports.
    ///
    /// # Errors
    ///
    /// Stops at the first failing tick and returns its [`SimError`].
    pub fn run(&mut self) -> Result<Vec<TickReport>, SimError> {
        let mut reports = Vec::with_capacity(self.clock.remaining());
        while let Some(report) = self.step()? {
            reports.push(report);
        }
        Ok(reports)
    }

    /// Committed participant state.
    pub fn participants(&self) -> &[Participant] {
        self.ledger.participants()
    }

    /// Committed community ledger.
    pub fn community(&self) -> CommunityLedger {
        self.ledger.community()
    }

    /// Returns a reference to the simulation configuration.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Default market parameters.
    pub fn market(&self) -> &MarketParams {
        &self.market
    }

    fn collect_proposals(
        &self,
        ctx: &TickContext,
        participants: &[Participant],
        positions: &BTreeMap<String, NetPosition>,
    ) -> (BTreeMap<String, Action>, Vec<PolicyFallback>) {
        let mut proposals = BTreeMap::new();
        let mut requests: Vec<PolicyRequest> = Vec::new();
        for p in participants {
            let net = positions.get(&p.id).map_or(0.0, |pos| pos.net);
            if Role::from_net(net) == Role::Neutral {
                proposals.insert(p.id.clone(), Action::Hold);
            } else {
                requests.push(policy::request_for(ctx, p, net));
            }
        }

        let policy = &self.policy;
        let replies: Vec<Result<Action, PolicyFault>> = thread::scope(|s| {
            let handles: Vec<_> = requests
                .iter()
                .map(|req| s.spawn(move || policy.decide(req)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(PolicyFault::Malformed("policy call panicked".into()))
                    })
                })
                .collect()
        });

        let mut fallbacks = Vec::new();
        for (req, reply) in requests.iter().zip(replies) {
            let (action, fallback) = policy::resolve(&req.participant_id, reply);
            if let Some(fallback) = fallback {
                warn!(
                    participant = %fallback.participant,
                    reason = %fallback.reason,
                    "policy fell back to hold"
                );
                fallbacks.push(fallback);
            }
            proposals.insert(req.participant_id.clone(), action);
        }
        (proposals, fallbacks)
    }

    fn publish(&mut self, report: &TickReport) {
        for flow in &report.flows {
            debug!(step = report.step, %flow, "flow");
            let event = flow.signal(report.step, report.timestamp);
            for sink in &mut self.signal_sinks {
                sink.emit(&event);
            }
        }

        if let Some(sink) = self.state_sink.as_mut() {
            if let Err(err) = sink.publish(&MarketSnapshot::from_report(report)) {
                warn!(step = report.step, error = %err, "state sink failed");
            }
        }
    }
}

fn grid_net(flows: &[Flow]) -> f64 {
    flows
        .iter()
        .map(|f| match f {
            Flow::GridImport { quantity, .. } => *quantity,
            Flow::GridExport { quantity, .. } => -*quantity,
            _ => 0.0,
        })
        .sum()
}

fn verify(
    step: usize,
    settlement: &Settlement,
    positions: &BTreeMap<String, NetPosition>,
) -> Result<(), SimError> {
    let residual = settlement.conservation_residual(positions);
    if residual > CONSERVATION_TOLERANCE {
        return Err(SimError::ConservationViolated { step, residual });
    }
    for p in &settlement.participants {
        let detail = if p.wallet_balance < 0.0 {
            Some(format!("wallet {}", p.wallet_balance))
        } else if p.battery_stored < 0.0 || p.battery_stored > p.battery_capacity + EPSILON {
            Some(format!(
                "battery {} of {}",
                p.battery_stored, p.battery_capacity
            ))
        } else {
            None
        };
        if let Some(detail) = detail {
            return Err(SimError::BoundViolated {
                step,
                participant: p.id.clone(),
                detail,
            });
        }
    }
    Ok(())
}
