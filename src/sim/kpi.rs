//! Post-hoc market KPIs computed from tick reports.

use std::fmt;

use serde::Serialize;

use super::flow::Flow;
use super::types::TickReport;

/// Aggregate market indicators for a complete run.
///
/// Computed post-hoc from `&[TickReport]` so the reported figures always
/// agree with the per-tick records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarketKpis {
    /// Number of ticks covered.
    pub ticks: usize,
    /// Number of P2P trades.
    pub trade_count: usize,
    /// Energy traded peer-to-peer (kWh).
    pub p2p_energy: f64,
    /// Money paid by P2P buyers, transmission included.
    pub p2p_value: f64,
    /// Transmission fees charged on P2P trades.
    pub transmission_fees: f64,
    pub grid_import_energy: f64,
    pub grid_import_cost: f64,
    pub grid_export_energy: f64,
    pub grid_export_revenue: f64,
    pub donated_energy: f64,
    pub curtailed_energy: f64,
    pub unmet_energy: f64,
    /// Total consumption across participants (kWh).
    pub consumption: f64,
    /// Share of consumption served without the grid (%).
    pub self_sufficiency_pct: f64,
    /// Largest single-tick net grid import (kWh).
    pub peak_import: f64,
    /// Largest single-tick net grid export (kWh, positive magnitude).
    pub peak_export: f64,
    /// Ticks with the grid down.
    pub blackout_ticks: usize,
    /// Ticks where the net grid exchange broke the connection limits.
    pub grid_limit_violations: usize,
    /// Proposals refused as physically infeasible.
    pub advisory_rejects: usize,
    /// Feasible offers refused by the price rule.
    pub unviable_offers: usize,
    /// Policy calls that timed out or returned garbage.
    pub policy_fallbacks: usize,
    /// Bound clamps applied by settlement.
    pub settlement_adjustments: usize,
}

impl MarketKpis {
    /// Computes all KPIs from the complete report vector.
    pub fn from_reports(reports: &[TickReport]) -> Self {
        let mut k = Self {
            ticks: reports.len(),
            ..Self::default()
        };

        for r in reports {
            for flow in &r.flows {
                match flow {
                    Flow::P2p {
                        quantity,
                        transmission_cost,
                        ..
                    } => {
                        k.trade_count += 1;
                        k.p2p_energy += quantity;
                        k.p2p_value += flow.amount();
                        k.transmission_fees += quantity * transmission_cost;
                    }
                    Flow::GridImport { quantity, .. } => {
                        k.grid_import_energy += quantity;
                        k.grid_import_cost += flow.amount();
                    }
                    Flow::GridExport { quantity, .. } => {
                        k.grid_export_energy += quantity;
                        k.grid_export_revenue += flow.amount();
                    }
                    Flow::Donation { quantity, .. } => k.donated_energy += quantity,
                    Flow::Curtailment { quantity, .. } => k.curtailed_energy += quantity,
                    Flow::UnmetLoad { quantity, .. } => k.unmet_energy += quantity,
                }
            }

            k.consumption += r.positions.values().map(|p| p.consumption).sum::<f64>();
            k.peak_import = k.peak_import.max(r.grid_net_energy);
            k.peak_export = k.peak_export.max(-r.grid_net_energy);
            if !r.context.grid_available {
                k.blackout_ticks += 1;
            }
            if !r.grid_within_limits {
                k.grid_limit_violations += 1;
            }
            for rejection in &r.rejections {
                if rejection.reason.is_infeasible() {
                    k.advisory_rejects += 1;
                } else {
                    k.unviable_offers += 1;
                }
            }
            k.policy_fallbacks += r.fallbacks.len();
            k.settlement_adjustments += r.adjustments.len();
        }

        k.self_sufficiency_pct = if k.consumption > 0.0 {
            let served = (k.consumption - k.grid_import_energy - k.unmet_energy).max(0.0);
            100.0 * served / k.consumption
        } else {
            0.0
        };
        k
    }
}

impl fmt::Display for MarketKpis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Market KPI Report ({} ticks) ---", self.ticks)?;
        writeln!(
            f,
            "P2P traded:            {:.2} kWh in {} trades ({:.2} paid, {:.2} transmission)",
            self.p2p_energy, self.trade_count, self.p2p_value, self.transmission_fees
        )?;
        writeln!(
            f,
            "Grid import:           {:.2} kWh (cost {:.2}, peak {:.2} kWh)",
            self.grid_import_energy, self.grid_import_cost, self.peak_import
        )?;
        writeln!(
            f,
            "Grid export:           {:.2} kWh (revenue {:.2}, peak {:.2} kWh)",
            self.grid_export_energy, self.grid_export_revenue, self.peak_export
        )?;
        writeln!(f, "Donated:               {:.2} kWh", self.donated_energy)?;
        writeln!(f, "Curtailed:             {:.2} kWh", self.curtailed_energy)?;
        writeln!(f, "Unmet load:            {:.2} kWh", self.unmet_energy)?;
        writeln!(f, "Self-sufficiency:      {:.1}%", self.self_sufficiency_pct)?;
        writeln!(f, "Blackout ticks:        {}", self.blackout_ticks)?;
        writeln!(f, "Grid limit violations: {}", self.grid_limit_violations)?;
        writeln!(
            f,
            "Rejected proposals:    {} infeasible, {} unviable",
            self.advisory_rejects, self.unviable_offers
        )?;
        writeln!(f, "Policy fallbacks:      {}", self.policy_fallbacks)?;
        write!(f, "Settlement clamps:     {}", self.settlement_adjustments)
    }
}
