//! Negotiation and matching engine.
//!
//! Pairs surplus and deficit participants into P2P trades. Proposals from the
//! decision policy are checked against the physical position first; the price
//! rule then decides whether a trade beats the buyer's grid alternative.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use super::balance::NetPosition;
use super::flow::Flow;
use super::policy::Action;
use super::types::{EPSILON, Participant, TickContext};

/// Why a proposal did not take part in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Offer to sell with a net position of zero or less.
    SellWithoutSurplus,
    /// Offer to sell with nothing generated this tick.
    SellWithoutGeneration,
    /// Request to buy with a net position of zero or more.
    BuyWithoutDeficit,
    /// Ask not strictly above the seller's minimum price.
    AskBelowMinimum,
    /// Ask plus transmission is not cheaper than the grid tariff.
    NotCompetitiveWithGrid,
}

impl RejectReason {
    /// Returns `true` for proposals the physical position rules out.
    pub fn is_infeasible(self) -> bool {
        matches!(
            self,
            RejectReason::SellWithoutSurplus
                | RejectReason::SellWithoutGeneration
                | RejectReason::BuyWithoutDeficit
        )
    }
}

/// A refused proposal. The participant is treated as holding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub participant: String,
    pub proposed: Action,
    pub reason: RejectReason,
}

/// Result of one matching round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    /// Settled P2P flows in match order.
    pub trades: Vec<Flow>,
    /// Signed net position left after matching, per participant.
    pub remaining: BTreeMap<String, f64>,
    /// Money moved by the trades, per participant.
    pub wallet_delta: BTreeMap<String, f64>,
    /// Proposals refused by the feasibility gate or the price rule.
    pub rejections: Vec<Rejection>,
}

struct Seller<'a> {
    id: &'a str,
    ask: f64,
}

struct Buyer<'a> {
    id: &'a str,
    deficit: f64,
    ceiling: Option<f64>,
    wallet: f64,
}

fn feasibility(action: Action, position: &NetPosition) -> Option<RejectReason> {
    match action {
        Action::Hold => None,
        Action::OfferSell { .. } if position.net <= EPSILON => Some(RejectReason::SellWithoutSurplus),
        Action::OfferSell { .. } if position.generation <= EPSILON => {
            Some(RejectReason::SellWithoutGeneration)
        }
        Action::OfferSell { .. } => None,
        Action::RequestBuy { .. } if position.net >= -EPSILON => {
            Some(RejectReason::BuyWithoutDeficit)
        }
        Action::RequestBuy { .. } => None,
    }
}

/// Matches surplus against deficit for one tick.
///
/// Buyers are served largest deficit first; each buyer takes from the
/// cheapest eligible sellers, ties broken by id. A trade moves
/// `min(seller surplus, buyer deficit, affordable quantity)`. The outcome is a
/// pure function of its inputs.
///
/// # Arguments
///
/// * `ctx` - Market conditions for the tick
/// * `participants` - Participant state before the tick
/// * `positions` - Net position per participant
/// * `proposals` - Resolved policy action per participant
pub fn match_trades(
    ctx: &TickContext,
    participants: &[Participant],
    positions: &BTreeMap<String, NetPosition>,
    proposals: &BTreeMap<String, Action>,
) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();
    let mut sellers = Vec::new();
    let mut buyers = Vec::new();
    let transmission = ctx.transmission_cost_per_unit;

    for p in participants {
        let position = positions.get(&p.id).copied().unwrap_or_default();
        outcome.remaining.insert(p.id.clone(), position.net);
        let proposed = proposals.get(&p.id).copied().unwrap_or_default();

        // An infeasible proposal counts as HOLD.
        let action = match feasibility(proposed, &position) {
            Some(reason) => {
                warn!(participant = %p.id, action = %proposed, net = position.net, ?reason, "advisory reject");
                outcome.rejections.push(Rejection {
                    participant: p.id.clone(),
                    proposed,
                    reason,
                });
                Action::Hold
            }
            None => proposed,
        };

        match action {
            Action::OfferSell { price } => {
                let reason = if price <= p.min_ask_price {
                    Some(RejectReason::AskBelowMinimum)
                } else if ctx.grid_available && price + transmission >= ctx.grid_price {
                    Some(RejectReason::NotCompetitiveWithGrid)
                } else {
                    None
                };
                match reason {
                    Some(reason) => {
                        debug!(participant = %p.id, price, ?reason, "offer not viable");
                        outcome.rejections.push(Rejection {
                            participant: p.id.clone(),
                            proposed: action,
                            reason,
                        });
                    }
                    None => sellers.push(Seller { id: &p.id, ask: price }),
                }
            }
            _ if position.net < -EPSILON => buyers.push(Buyer {
                id: &p.id,
                deficit: position.deficit(),
                ceiling: match action {
                    Action::RequestBuy { max_price } => Some(max_price),
                    _ => None,
                },
                wallet: p.wallet_balance,
            }),
            _ => {}
        }
    }

    sellers.sort_by(|a, b| match a.ask.total_cmp(&b.ask) {
        Ordering::Equal => a.id.cmp(b.id),
        other => other,
    });
    buyers.sort_by(|a, b| match b.deficit.total_cmp(&a.deficit) {
        Ordering::Equal => a.id.cmp(b.id),
        other => other,
    });

    for buyer in &mut buyers {
        for seller in &sellers {
            if buyer.deficit <= EPSILON {
                break;
            }
            let unit_cost = seller.ask + transmission;
            if buyer.ceiling.is_some_and(|max| unit_cost > max) {
                // Sellers are sorted by ask, so no later seller fits either.
                debug!(buyer = buyer.id, unit_cost, "remaining asks above buyer ceiling");
                break;
            }
            let supply = outcome.remaining.get(seller.id).copied().unwrap_or(0.0);
            if supply <= EPSILON {
                continue;
            }
            let affordable = if unit_cost > 0.0 {
                buyer.wallet / unit_cost
            } else {
                f64::INFINITY
            };
            let quantity = buyer.deficit.min(supply).min(affordable);
            if quantity <= EPSILON {
                debug!(buyer = buyer.id, wallet = buyer.wallet, "buyer cannot afford more");
                break;
            }

            let cost = unit_cost * quantity;
            let income = seller.ask * quantity;
            buyer.deficit -= quantity;
            buyer.wallet = (buyer.wallet - cost).max(0.0);
            if let Some(r) = outcome.remaining.get_mut(seller.id) {
                *r -= quantity;
            }
            if let Some(r) = outcome.remaining.get_mut(buyer.id) {
                *r += quantity;
            }
            *outcome.wallet_delta.entry(seller.id.to_string()).or_default() += income;
            *outcome.wallet_delta.entry(buyer.id.to_string()).or_default() -= cost;

            debug!(
                seller = seller.id,
                buyer = buyer.id,
                quantity,
                ask = seller.ask,
                "p2p trade"
            );
            outcome.trades.push(Flow::P2p {
                seller: seller.id.to_string(),
                buyer: buyer.id.to_string(),
                quantity,
                ask_price: seller.ask,
                transmission_cost: transmission,
            });
        }
    }

    for r in outcome.remaining.values_mut() {
        if r.abs() < EPSILON {
            *r = 0.0;
        }
    }
    outcome
}
