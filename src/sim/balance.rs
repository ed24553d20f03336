//! Balance calculator: per-participant net energy position.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::feed::FeedFrame;

use super::types::{EPSILON, Participant, Role};

/// Physical energy position of one participant for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct NetPosition {
    /// Energy generated this tick (kWh).
    pub generation: f64,
    /// Energy consumed this tick (kWh).
    pub consumption: f64,
    /// `generation - consumption`; positive is surplus.
    pub net: f64,
}

impl NetPosition {
    /// Role implied by the sign of the net position.
    pub fn role(&self) -> Role {
        Role::from_net(self.net)
    }

    /// Positive part of the net position.
    pub fn surplus(&self) -> f64 {
        self.net.max(0.0)
    }

    /// Magnitude of the negative part of the net position.
    pub fn deficit(&self) -> f64 {
        (-self.net).max(0.0)
    }
}

/// Computes a net position from generation and consumption.
///
/// Differences within [`EPSILON`] collapse to exactly zero so that a balanced
/// participant is never mistaken for a tiny seller or buyer.
///
/// # Examples
///
/// ```
/// use microgrid_market::sim::balance::net_position;
///
/// assert_eq!(net_position(3.0, 1.0).net, 2.0);
/// assert_eq!(net_position(0.0, 0.0).net, 0.0);
/// ```
pub fn net_position(generation: f64, consumption: f64) -> NetPosition {
    let mut net = generation - consumption;
    if net.abs() < EPSILON {
        net = 0.0;
    }
    NetPosition {
        generation,
        consumption,
        net,
    }
}

/// Computes the net position of every participant for one tick.
///
/// A missing frame or a participant without a reading is an input gap and
/// counts as zero generation and zero consumption.
pub fn net_positions(
    participants: &[Participant],
    frame: Option<&FeedFrame>,
) -> BTreeMap<String, NetPosition> {
    participants
        .iter()
        .map(|p| {
            let position = match frame.and_then(|f| f.readings.get(&p.id)) {
                Some(r) => net_position(r.generation, r.consumption),
                None => {
                    debug!(participant = %p.id, "no feed reading, treating as zero flow");
                    NetPosition::default()
                }
            };
            (p.id.clone(), position)
        })
        .collect()
}
