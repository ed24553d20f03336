//! Settlement ledger: the only place where battery and wallet state change.
//!
//! [`settle`] reduces a tick's flows to one battery delta and one wallet delta
//! per participant. Battery movement is not a flow; it is whatever the flows
//! leave of the net position:
//!
//! `battery_delta = net_position + Σ inflows − Σ outflows`
//!
//! so per-participant energy balance holds by construction. Bound violations
//! are clamped into extra curtailment or unmet-load flows and recorded as
//! [`Adjustment`]s.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use super::balance::NetPosition;
use super::flow::Flow;
use super::types::{CommunityLedger, EPSILON, Participant};

/// A bound clamp applied during settlement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Adjustment {
    /// Battery would exceed capacity; `amount` was curtailed.
    BatteryOverflow { participant: String, amount: f64 },
    /// Battery would go below zero; `amount` became unmet load.
    BatteryUnderflow { participant: String, amount: f64 },
    /// Wallet would go negative by `amount`; `trimmed_energy` of purchases
    /// was cancelled and recorded as unmet load.
    WalletShortfall {
        participant: String,
        amount: f64,
        trimmed_energy: f64,
    },
}

/// Errors that stop a tick before anything is committed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettlementError {
    #[error("step {step} arrived after step {last} was already settled")]
    OutOfOrder { step: usize, last: usize },
    #[error("flow references unknown participant \"{0}\"")]
    UnknownParticipant(String),
}

/// Result of settling one tick. Nothing is applied until it is committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settlement {
    /// Participant state after the tick.
    pub participants: Vec<Participant>,
    /// Final flows, including any added by clamps.
    pub flows: Vec<Flow>,
    pub adjustments: Vec<Adjustment>,
    pub battery_deltas: BTreeMap<String, f64>,
    pub wallet_deltas: BTreeMap<String, f64>,
    /// Energy donated this tick.
    pub donated: f64,
}

impl Settlement {
    /// Largest per-participant gap between the battery delta and
    /// `net + Σ inflows − Σ outflows`. Zero up to rounding for any settlement
    /// produced by [`settle`].
    pub fn conservation_residual(&self, positions: &BTreeMap<String, NetPosition>) -> f64 {
        self.battery_deltas
            .iter()
            .map(|(id, delta)| {
                let net = positions.get(id).map_or(0.0, |p| p.net);
                let flows: f64 = self.flows.iter().map(|f| f.energy_delta_for(id)).sum();
                (delta - (net + flows)).abs()
            })
            .fold(0.0, f64::max)
    }
}

fn wallet_delta(flows: &[Flow], id: &str) -> f64 {
    flows.iter().map(|f| f.wallet_delta_for(id)).sum()
}

fn energy_delta(flows: &[Flow], id: &str) -> f64 {
    flows.iter().map(|f| f.energy_delta_for(id)).sum()
}

/// Cancels paid inflows of `id` until `shortfall` is covered.
///
/// Grid imports go first, then P2P purchases, most recent first. Returns the
/// energy cancelled.
fn trim_purchases(flows: &mut [Flow], id: &str, mut shortfall: f64) -> f64 {
    let mut trimmed = 0.0;
    for pass_imports in [true, false] {
        for flow in flows.iter_mut().rev() {
            if shortfall <= EPSILON {
                return trimmed;
            }
            let unit_price = flow.unit_price();
            let quantity = match flow {
                Flow::GridImport {
                    participant,
                    quantity,
                    ..
                } if pass_imports && participant.as_str() == id => quantity,
                Flow::P2p {
                    buyer, quantity, ..
                } if !pass_imports && buyer.as_str() == id => quantity,
                _ => continue,
            };
            if unit_price <= 0.0 {
                continue;
            }
            let cut = quantity.min(shortfall / unit_price);
            *quantity -= cut;
            shortfall -= cut * unit_price;
            trimmed += cut;
        }
    }
    trimmed
}

fn snap(value: f64, lo: f64, hi: f64) -> f64 {
    if (value - lo).abs() < EPSILON {
        lo
    } else if (value - hi).abs() < EPSILON {
        hi
    } else {
        value
    }
}

/// Reduces one tick's flows to the participants' next state.
///
/// Pure: the same inputs always give the same settlement, and `before` is not
/// touched.
///
/// # Errors
///
/// Returns [`SettlementError::UnknownParticipant`] if a flow names an id that
/// is not in `before`.
pub fn settle(
    before: &[Participant],
    positions: &BTreeMap<String, NetPosition>,
    flows: Vec<Flow>,
) -> Result<Settlement, SettlementError> {
    let known: BTreeSet<&str> = before.iter().map(|p| p.id.as_str()).collect();
    if let Some(id) = flows
        .iter()
        .flat_map(Flow::participants)
        .find(|id| !known.contains(id))
    {
        return Err(SettlementError::UnknownParticipant(id.to_string()));
    }

    let mut flows = flows;
    let mut adjustments = Vec::new();

    // Wallet pass: no debit may take a wallet below zero.
    for p in before {
        let balance = p.wallet_balance + wallet_delta(&flows, &p.id);
        if balance >= -EPSILON {
            continue;
        }
        let shortfall = -balance;
        let trimmed = trim_purchases(&mut flows, &p.id, shortfall);
        warn!(participant = %p.id, shortfall, trimmed, "wallet shortfall, purchase trimmed");
        flows.retain(|f| f.quantity() > EPSILON);
        if trimmed > EPSILON {
            flows.push(Flow::UnmetLoad {
                participant: p.id.clone(),
                quantity: trimmed,
            });
        }
        adjustments.push(Adjustment::WalletShortfall {
            participant: p.id.clone(),
            amount: shortfall,
            trimmed_energy: trimmed,
        });
    }

    // Battery pass: storage stays within [0, capacity].
    for p in before {
        let net = positions.get(&p.id).map_or(0.0, |pos| pos.net);
        let stored = p.battery_stored + net + energy_delta(&flows, &p.id);
        if stored > p.battery_capacity + EPSILON {
            let amount = stored - p.battery_capacity;
            warn!(participant = %p.id, amount, "battery overflow, curtailing");
            flows.push(Flow::Curtailment {
                participant: p.id.clone(),
                quantity: amount,
            });
            adjustments.push(Adjustment::BatteryOverflow {
                participant: p.id.clone(),
                amount,
            });
        } else if stored < -EPSILON {
            let amount = -stored;
            warn!(participant = %p.id, amount, "battery underflow, recording unmet load");
            flows.push(Flow::UnmetLoad {
                participant: p.id.clone(),
                quantity: amount,
            });
            adjustments.push(Adjustment::BatteryUnderflow {
                participant: p.id.clone(),
                amount,
            });
        }
    }

    let mut after = Vec::with_capacity(before.len());
    let mut battery_deltas = BTreeMap::new();
    let mut wallet_deltas = BTreeMap::new();
    for p in before {
        let net = positions.get(&p.id).map_or(0.0, |pos| pos.net);
        let battery = net + energy_delta(&flows, &p.id);
        let wallet = wallet_delta(&flows, &p.id);

        let mut next = p.clone();
        next.battery_stored = snap(p.battery_stored + battery, 0.0, p.battery_capacity);
        next.wallet_balance = snap(p.wallet_balance + wallet, 0.0, f64::INFINITY);
        battery_deltas.insert(p.id.clone(), battery);
        wallet_deltas.insert(p.id.clone(), wallet);
        after.push(next);
    }

    let donated = flows
        .iter()
        .filter(|f| matches!(f, Flow::Donation { .. }))
        .map(Flow::quantity)
        .sum();

    Ok(Settlement {
        participants: after,
        flows,
        adjustments,
        battery_deltas,
        wallet_deltas,
        donated,
    })
}

/// Single ownership point for participant and community state.
///
/// Steps must arrive in increasing order. Applying the step that was just
/// settled again returns the recorded settlement without changing anything.
#[derive(Debug, Clone)]
pub struct Ledger {
    participants: Vec<Participant>,
    community: CommunityLedger,
    last: Option<(usize, Settlement)>,
}

impl Ledger {
    pub fn new(participants: Vec<Participant>) -> Self {
        Self {
            participants,
            community: CommunityLedger::default(),
            last: None,
        }
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn community(&self) -> CommunityLedger {
        self.community
    }

    /// Step of the most recent commit.
    pub fn last_settled_step(&self) -> Option<usize> {
        self.last.as_ref().map(|(step, _)| *step)
    }

    /// Settles `step` against the current state without committing it.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::OutOfOrder`] if `step` is not after the last
    /// committed step, or any error from [`settle`].
    pub fn prepare(
        &self,
        step: usize,
        positions: &BTreeMap<String, NetPosition>,
        flows: Vec<Flow>,
    ) -> Result<Settlement, SettlementError> {
        if let Some(last) = self.last_settled_step() {
            if step <= last {
                return Err(SettlementError::OutOfOrder { step, last });
            }
        }
        settle(&self.participants, positions, flows)
    }

    /// Makes a prepared settlement the current state.
    pub fn commit(&mut self, step: usize, settlement: Settlement) -> &Settlement {
        self.participants = settlement.participants.clone();
        self.community.credit(settlement.donated);
        &self.last.insert((step, settlement)).1
    }

    /// Settles and commits `step` in one call.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::OutOfOrder`] for a step before the last
    /// committed one, or any error from [`settle`].
    pub fn apply(
        &mut self,
        step: usize,
        positions: &BTreeMap<String, NetPosition>,
        flows: Vec<Flow>,
    ) -> Result<&Settlement, SettlementError> {
        if self.last_settled_step() == Some(step) {
            return self
                .last
                .as_ref()
                .map(|(_, s)| s)
                .ok_or(SettlementError::OutOfOrder { step, last: step });
        }
        let settlement = self.prepare(step, positions, flows)?;
        Ok(self.commit(step, settlement))
    }
}
