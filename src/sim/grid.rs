//! Grid fallback for residual surplus and deficit.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::flow::Flow;
use super::types::{EPSILON, Participant, TickContext};

/// Point of common coupling between the microgrid and the utility grid.
///
/// Resolves whatever net position is left after matching and donation, and
/// accumulates the tick's net grid exchange for limit checks.
///
/// Net exchange convention:
/// - Positive values are imports from the grid
/// - Negative values are exports to the grid
#[derive(Debug, Clone)]
pub struct GridConnection {
    name: &'static str,
    net_kwh: f64,
    max_import_kwh: f64,
    max_export_kwh: f64,
}

impl GridConnection {
    /// Creates a connection with no exchange limits.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            net_kwh: 0.0,
            max_import_kwh: f64::INFINITY,
            max_export_kwh: f64::INFINITY,
        }
    }

    /// Creates a connection with per-tick import and export limits.
    ///
    /// Limits are reporting thresholds; exceeding them is flagged on the tick
    /// report, not enforced.
    ///
    /// # Panics
    ///
    /// Panics if `max_import_kwh` or `max_export_kwh` is negative.
    pub fn with_limits(name: &'static str, max_import_kwh: f64, max_export_kwh: f64) -> Self {
        assert!(max_import_kwh >= 0.0);
        assert!(max_export_kwh >= 0.0);

        Self {
            name,
            net_kwh: 0.0,
            max_import_kwh,
            max_export_kwh,
        }
    }

    /// Resets accumulated exchange to zero.
    pub fn reset(&mut self) {
        self.net_kwh = 0.0;
    }

    /// Adds a signed contribution to the net exchange.
    pub fn add_net_kwh(&mut self, kwh: f64) {
        self.net_kwh += kwh;
    }

    /// Net exchange accumulated this tick.
    pub fn net_kwh(&self) -> f64 {
        self.net_kwh
    }

    /// Returns `true` when the net exchange is within the import/export limits.
    pub fn within_limits(&self) -> bool {
        self.net_kwh >= -self.max_export_kwh && self.net_kwh <= self.max_import_kwh
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Resolves residual positions against battery and grid.
    ///
    /// Surplus is exported when the grid is up. In a blackout it goes to the
    /// battery, and anything beyond the free capacity is curtailed. Deficit is
    /// drawn from the battery first, then bought from the grid if it is up and
    /// only as far as the wallet allows; the rest is unmet load.
    ///
    /// Battery draws and charges produce no flow: settlement derives them from
    /// the net position and the flows returned here.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Market conditions for the tick
    /// * `participants` - Participant state before the tick
    /// * `remaining` - Signed position left after matching and donation
    /// * `wallet_delta` - Money already committed this tick, per participant
    pub fn resolve(
        &mut self,
        ctx: &TickContext,
        participants: &[Participant],
        remaining: &BTreeMap<String, f64>,
        wallet_delta: &BTreeMap<String, f64>,
    ) -> Vec<Flow> {
        self.reset();
        let mut flows = Vec::new();

        for p in participants {
            let residual = remaining.get(&p.id).copied().unwrap_or(0.0);

            if residual > EPSILON {
                if ctx.grid_available {
                    self.add_net_kwh(-residual);
                    flows.push(Flow::GridExport {
                        participant: p.id.clone(),
                        quantity: residual,
                        unit_price: ctx.grid_sell_price,
                    });
                    continue;
                }
                let excess = residual - p.battery_headroom();
                if excess > EPSILON {
                    warn!(participant = %p.id, excess, "battery full during blackout, curtailing");
                    flows.push(Flow::Curtailment {
                        participant: p.id.clone(),
                        quantity: excess,
                    });
                }
            } else if residual < -EPSILON {
                let mut need = -residual;
                need -= need.min(p.battery_stored);

                if need > EPSILON && ctx.grid_available {
                    let spent = wallet_delta.get(&p.id).copied().unwrap_or(0.0);
                    let wallet = (p.wallet_balance + spent).max(0.0);
                    let affordable = if ctx.grid_price > 0.0 {
                        wallet / ctx.grid_price
                    } else {
                        f64::INFINITY
                    };
                    let quantity = need.min(affordable);
                    if quantity > EPSILON {
                        self.add_net_kwh(quantity);
                        debug!(participant = %p.id, quantity, price = ctx.grid_price, "grid import");
                        flows.push(Flow::GridImport {
                            participant: p.id.clone(),
                            quantity,
                            unit_price: ctx.grid_price,
                        });
                        need -= quantity;
                    }
                }

                if need > EPSILON {
                    warn!(participant = %p.id, need, grid = ctx.grid_available, "unmet load");
                    flows.push(Flow::UnmetLoad {
                        participant: p.id.clone(),
                        quantity: need,
                    });
                }
            }
        }
        flows
    }
}
