//! API response and query types.

use serde::{Deserialize, Serialize};

use crate::config::ScenarioConfig;
use crate::sim::flow::Flow;
use crate::sim::kpi::MarketKpis;
use crate::sim::snapshot::MarketSnapshot;
use crate::sim::types::{Participant, TickReport};

/// Combined state response: scenario, KPIs, and the last committed snapshot.
#[derive(Debug, Serialize)]
pub struct StateResponse {
    /// Scenario the run was built from.
    pub config: ScenarioConfig,
    /// Aggregate market KPIs.
    pub kpis: MarketKpis,
    /// State after the last tick; `null` for an empty run.
    pub latest: Option<MarketSnapshot>,
}

/// Final state of one participant with its run totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantSummary {
    #[serde(flatten)]
    pub participant: Participant,
    /// Battery fill (0.0 to 1.0).
    pub battery_fraction: f64,
    pub p2p_sold_kwh: f64,
    pub p2p_bought_kwh: f64,
    pub donated_kwh: f64,
    pub grid_import_kwh: f64,
    pub grid_export_kwh: f64,
    pub curtailed_kwh: f64,
    pub unmet_kwh: f64,
}

impl ParticipantSummary {
    /// Totals for `participant` over every flow in `reports`.
    pub fn from_reports(participant: &Participant, reports: &[TickReport]) -> Self {
        let mut s = Self {
            participant: participant.clone(),
            battery_fraction: participant.battery_fraction(),
            p2p_sold_kwh: 0.0,
            p2p_bought_kwh: 0.0,
            donated_kwh: 0.0,
            grid_import_kwh: 0.0,
            grid_export_kwh: 0.0,
            curtailed_kwh: 0.0,
            unmet_kwh: 0.0,
        };
        let id = participant.id.as_str();

        for flow in reports.iter().flat_map(|r| &r.flows) {
            match flow {
                Flow::P2p {
                    seller,
                    buyer,
                    quantity,
                    ..
                } => {
                    if seller == id {
                        s.p2p_sold_kwh += quantity;
                    }
                    if buyer == id {
                        s.p2p_bought_kwh += quantity;
                    }
                }
                Flow::Donation { donor, quantity } if donor == id => s.donated_kwh += quantity,
                Flow::GridImport {
                    participant,
                    quantity,
                    ..
                } if participant == id => s.grid_import_kwh += quantity,
                Flow::GridExport {
                    participant,
                    quantity,
                    ..
                } if participant == id => s.grid_export_kwh += quantity,
                Flow::Curtailment {
                    participant,
                    quantity,
                } if participant == id => s.curtailed_kwh += quantity,
                Flow::UnmetLoad {
                    participant,
                    quantity,
                } if participant == id => s.unmet_kwh += quantity,
                _ => {}
            }
        }
        s
    }
}

/// Optional range query parameters for the ticks endpoint.
#[derive(Debug, Deserialize)]
pub struct TickQuery {
    /// First step (inclusive).
    pub from: Option<usize>,
    /// Last step (inclusive).
    pub to: Option<usize>,
}

/// Error response body for 400-class errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::sim::types::{CommunityLedger, MarketParams, SimTime, TickContext};

    fn report(flows: Vec<Flow>) -> TickReport {
        TickReport {
            step: 0,
            timestamp: SimTime::MIDNIGHT,
            context: TickContext::new(0, SimTime::MIDNIGHT, &MarketParams::default(), None),
            positions: BTreeMap::new(),
            proposals: BTreeMap::new(),
            rejections: Vec::new(),
            fallbacks: Vec::new(),
            flows,
            adjustments: Vec::new(),
            grid_net_energy: 0.0,
            grid_within_limits: true,
            participants: Vec::new(),
            community: CommunityLedger::default(),
        }
    }

    #[test]
    fn summary_totals_only_own_flows() {
        let a = Participant::new("a", 5.0, 10.0, 100.0);
        let reports = [
            report(vec![
                Flow::P2p {
                    seller: "a".into(),
                    buyer: "b".into(),
                    quantity: 2.0,
                    ask_price: 30.0,
                    transmission_cost: 3.0,
                },
                Flow::Donation {
                    donor: "a".into(),
                    quantity: 0.5,
                },
            ]),
            report(vec![
                Flow::GridImport {
                    participant: "a".into(),
                    quantity: 1.0,
                    unit_price: 38.0,
                },
                Flow::GridImport {
                    participant: "b".into(),
                    quantity: 4.0,
                    unit_price: 38.0,
                },
            ]),
        ];

        let s = ParticipantSummary::from_reports(&a, &reports);
        assert_eq!(s.p2p_sold_kwh, 2.0);
        assert_eq!(s.p2p_bought_kwh, 0.0);
        assert_eq!(s.donated_kwh, 0.5);
        assert_eq!(s.grid_import_kwh, 1.0);
        assert_eq!(s.battery_fraction, 0.5);
    }

    #[test]
    fn summary_serializes_flat() {
        let a = Participant::new("a", 5.0, 10.0, 100.0);
        let json = serde_json::to_value(ParticipantSummary::from_reports(&a, &[])).unwrap();
        assert_eq!(json["id"], "a");
        assert_eq!(json["wallet_balance"], 100.0);
        assert_eq!(json["unmet_kwh"], 0.0);
    }
}
