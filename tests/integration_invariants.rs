//! Property tests: conservation, bounds, and determinism over random markets.

mod common;

use std::collections::BTreeMap;

use common::{FixedPolicy, assert_tick_invariants, engine, frame, market};
use microgrid_market::sim::balance::net_positions;
use microgrid_market::sim::donation::DonationPolicy;
use microgrid_market::sim::matching::match_trades;
use microgrid_market::sim::policy::Action;
use microgrid_market::sim::types::{Participant, SimTime, TickContext};
use microgrid_market::sim::window::TimeWindow;
use proptest::prelude::*;

const IDS: [&str; 5] = ["p0", "p1", "p2", "p3", "p4"];

#[derive(Debug, Clone)]
struct Node {
    capacity: f64,
    fill: f64,
    wallet: f64,
    action: Action,
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::Hold),
        (0.0..80.0f64).prop_map(|price| Action::OfferSell { price }),
        (0.0..80.0f64).prop_map(|max_price| Action::RequestBuy { max_price }),
    ]
}

fn node() -> impl Strategy<Value = Node> {
    (0.5..20.0f64, 0.0..=1.0f64, 0.0..500.0f64, action()).prop_map(
        |(capacity, fill, wallet, action)| Node {
            capacity,
            fill,
            wallet,
            action,
        },
    )
}

/// Per tick: grid availability and `(generation, consumption)` per node.
fn ticks(n: usize) -> impl Strategy<Value = Vec<(bool, Vec<(f64, f64)>)>> {
    prop::collection::vec(
        (
            prop::bool::weighted(0.7),
            prop::collection::vec((0.0..8.0f64, 0.0..8.0f64), n),
        ),
        1..6,
    )
}

fn market_case() -> impl Strategy<Value = (Vec<Node>, Vec<(bool, Vec<(f64, f64)>)>, f64, f64)> {
    prop::collection::vec(node(), 2..=5).prop_flat_map(|nodes| {
        let n = nodes.len();
        (Just(nodes), ticks(n), 10.0..60.0f64, 0.0..10.0f64)
    })
}

fn participants(nodes: &[Node]) -> Vec<Participant> {
    nodes
        .iter()
        .zip(IDS)
        .map(|(n, id)| Participant::new(id, n.capacity * n.fill, n.capacity, n.wallet))
        .collect()
}

proptest! {
    #[test]
    fn every_tick_conserves_energy_and_respects_bounds(
        (nodes, tick_data, grid_price, transmission) in market_case()
    ) {
        let start = SimTime::hm(17, 0);
        let frames: Vec<_> = tick_data
            .iter()
            .enumerate()
            .map(|(i, (grid, readings))| {
                let readings: Vec<_> = readings
                    .iter()
                    .zip(IDS)
                    .map(|(&(g, c), id)| (id, g, c))
                    .collect();
                frame(start.plus_minutes(30 * i as u32), *grid, &readings)
            })
            .collect();
        let policy = FixedPolicy::new(
            &nodes.iter().zip(IDS).map(|(n, id)| (id, n.action)).collect::<Vec<_>>(),
        );
        let window = TimeWindow::new(SimTime::hm(18, 0), SimTime::hm(19, 0)).unwrap();

        let mut before = participants(&nodes);
        let mut e = engine(
            market(grid_price, transmission),
            frames,
            policy,
            DonationPolicy::new(window, 0.1, 0.5, 0.0),
            before.clone(),
        );

        while let Some(report) = e.step().unwrap() {
            assert_tick_invariants(&before, &report);
            before = report.participants.clone();
        }
    }

    #[test]
    fn matching_is_a_pure_function_of_inputs(
        (nodes, tick_data, grid_price, transmission) in market_case()
    ) {
        let people = participants(&nodes);
        let (grid, readings) = &tick_data[0];
        let readings: Vec<_> = readings
            .iter()
            .zip(IDS)
            .map(|(&(g, c), id)| (id, g, c))
            .collect();
        let f = frame(SimTime::MIDNIGHT, *grid, &readings);
        let ctx = TickContext::new(0, SimTime::MIDNIGHT, &market(grid_price, transmission), Some(&f));
        let positions = net_positions(&people, Some(&f));
        let proposals: BTreeMap<String, Action> = nodes
            .iter()
            .zip(IDS)
            .map(|(n, id)| (id.to_string(), n.action))
            .collect();

        let first = match_trades(&ctx, &people, &positions, &proposals);
        let second = match_trades(&ctx, &people, &positions, &proposals);
        prop_assert_eq!(&first, &second);

        // No participant trades on both sides, and nobody sells more than
        // their surplus or buys more than their deficit.
        for p in &people {
            let pos = positions[&p.id];
            let sold: f64 = first.trades.iter().filter(|t| t.participants()[0] == p.id).map(|t| t.quantity()).sum();
            let bought: f64 = first.trades.iter().filter(|t| t.participants()[1] == p.id).map(|t| t.quantity()).sum();
            prop_assert!(sold == 0.0 || bought == 0.0);
            prop_assert!(sold <= pos.surplus() + 1e-9);
            prop_assert!(bought <= pos.deficit() + 1e-9);
        }
    }
}
