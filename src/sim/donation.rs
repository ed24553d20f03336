use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use super::flow::Flow;
use super::types::{EPSILON, Participant, TickContext};
use super::window::TimeWindow;

/// Redirects leftover surplus to the community sink inside a daily window.
///
/// Runs after P2P matching and before grid fallback. A participant donates
/// when its remaining surplus is strictly above `min_surplus` and its battery
/// is at least `min_battery_fraction` full; the donation is capped at
/// `max_per_tick` and is taken out of the remaining surplus like a sale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DonationPolicy {
    window: Option<TimeWindow>,
    min_surplus: f64,
    max_per_tick: f64,
    min_battery_fraction: f64,
}

impl DonationPolicy {
    /// Creates an active donation policy.
    ///
    /// # Panics
    ///
    /// Panics if `min_surplus` or `max_per_tick` is negative.
    pub fn new(
        window: TimeWindow,
        min_surplus: f64,
        max_per_tick: f64,
        min_battery_fraction: f64,
    ) -> Self {
        assert!(min_surplus >= 0.0);
        assert!(max_per_tick >= 0.0);
        Self {
            window: Some(window),
            min_surplus,
            max_per_tick,
            min_battery_fraction,
        }
    }

    /// A policy that never donates.
    pub fn disabled() -> Self {
        Self {
            window: None,
            min_surplus: 0.0,
            max_per_tick: 0.0,
            min_battery_fraction: 0.0,
        }
    }

    /// Returns `true` when donations may happen in this tick.
    pub fn is_active(&self, ctx: &TickContext) -> bool {
        self.window.is_some_and(|w| w.contains(ctx.timestamp))
    }

    pub fn window(&self) -> Option<TimeWindow> {
        self.window
    }

    /// Moves eligible surplus out of `remaining` and returns the donation flows.
    pub fn apply(
        &self,
        ctx: &TickContext,
        participants: &[Participant],
        remaining: &mut BTreeMap<String, f64>,
    ) -> Vec<Flow> {
        if !self.is_active(ctx) || self.max_per_tick <= EPSILON {
            return Vec::new();
        }

        let mut flows = Vec::new();
        for p in participants {
            let Some(surplus) = remaining.get_mut(&p.id) else {
                continue;
            };
            if *surplus <= self.min_surplus || *surplus <= EPSILON {
                continue;
            }
            if p.battery_fraction() + EPSILON < self.min_battery_fraction {
                debug!(participant = %p.id, "battery below donation threshold");
                continue;
            }
            let quantity = surplus.min(self.max_per_tick);
            *surplus -= quantity;
            if surplus.abs() < EPSILON {
                *surplus = 0.0;
            }
            debug!(participant = %p.id, quantity, "donation");
            flows.push(Flow::Donation {
                donor: p.id.clone(),
                quantity,
            });
        }
        flows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::types::{MarketParams, SimTime};

    fn policy() -> DonationPolicy {
        let window = TimeWindow::new(SimTime::hm(18, 0), SimTime::hm(21, 0)).unwrap();
        DonationPolicy::new(window, 0.1, 2.0, 0.0)
    }

    fn ctx_at(t: SimTime) -> TickContext {
        TickContext::new(0, t, &MarketParams::default(), None)
    }

    fn remaining(surplus: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("a".to_string(), surplus), ("b".to_string(), -1.0)])
    }

    fn participants() -> Vec<Participant> {
        vec![
            Participant::new("a", 5.0, 10.0, 0.0),
            Participant::new("b", 5.0, 10.0, 0.0),
        ]
    }

    #[test]
    fn donation_capped_per_tick() {
        let mut rem = remaining(4.0);
        let flows = policy().apply(&ctx_at(SimTime::hm(19, 0)), &participants(), &mut rem);
        assert_eq!(
            flows,
            vec![Flow::Donation {
                donor: "a".into(),
                quantity: 2.0
            }]
        );
        assert_eq!(rem["a"], 2.0);
        assert_eq!(rem["b"], -1.0);
    }

    #[test]
    fn window_boundaries_donate_outside_does_not() {
        let p = policy();
        for (t, expect) in [
            (SimTime::hm(17, 59), 0),
            (SimTime::hm(18, 0), 1),
            (SimTime::hm(21, 0), 1),
            (SimTime::hm(21, 1), 0),
        ] {
            let mut rem = remaining(1.0);
            assert_eq!(p.apply(&ctx_at(t), &participants(), &mut rem).len(), expect, "{t}");
        }
    }

    #[test]
    fn surplus_must_exceed_threshold() {
        let mut rem = remaining(0.1);
        assert!(policy()
            .apply(&ctx_at(SimTime::hm(19, 0)), &participants(), &mut rem)
            .is_empty());
        assert_eq!(rem["a"], 0.1);
    }

    #[test]
    fn battery_threshold_blocks_donation() {
        let window = TimeWindow::new(SimTime::hm(18, 0), SimTime::hm(21, 0)).unwrap();
        let p = DonationPolicy::new(window, 0.0, 1.0, 0.8);
        let mut rem = remaining(1.0);
        assert!(p
            .apply(&ctx_at(SimTime::hm(19, 0)), &participants(), &mut rem)
            .is_empty());
    }

    #[test]
    fn disabled_policy_never_donates() {
        let mut rem = remaining(5.0);
        let p = DonationPolicy::disabled();
        assert!(!p.is_active(&ctx_at(SimTime::hm(19, 0))));
        assert!(p
            .apply(&ctx_at(SimTime::hm(19, 0)), &participants(), &mut rem)
            .is_empty());
    }
}
