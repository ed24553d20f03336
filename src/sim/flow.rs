//! Flow records and the physical signal channel.
//!
//! Every energy movement decided during a tick is a [`Flow`]. Battery movements
//! are not flows: settlement derives them from the net position and the flows,
//! so the energy balance of each participant holds by construction.
//!
//! Sign convention for [`Flow::energy_delta_for`]: energy that reaches the
//! participant's side of the meter is positive (P2P purchase, grid import, and
//! unmet load, which stands in for energy that never arrived); energy that
//! leaves is negative (P2P sale, donation, grid export, curtailment).

use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::types::SimTime;

/// Endpoint label for the utility grid.
pub const GRID: &str = "grid";
/// Endpoint label for the communal donation sink.
pub const COMMUNITY: &str = "community";

/// One settled energy movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Flow {
    /// Peer-to-peer trade. The buyer pays `ask_price + transmission_cost` per
    /// unit; the seller receives `ask_price` per unit.
    P2p {
        seller: String,
        buyer: String,
        quantity: f64,
        ask_price: f64,
        transmission_cost: f64,
    },
    /// Surplus given to the community sink at no charge.
    Donation { donor: String, quantity: f64 },
    /// Surplus sold to the grid.
    GridExport {
        participant: String,
        quantity: f64,
        unit_price: f64,
    },
    /// Deficit bought from the grid.
    GridImport {
        participant: String,
        quantity: f64,
        unit_price: f64,
    },
    /// Surplus that could not be used and was lost.
    Curtailment { participant: String, quantity: f64 },
    /// Deficit that nothing could cover.
    UnmetLoad { participant: String, quantity: f64 },
}

impl Flow {
    /// Energy moved (kWh).
    pub fn quantity(&self) -> f64 {
        match self {
            Flow::P2p { quantity, .. }
            | Flow::Donation { quantity, .. }
            | Flow::GridExport { quantity, .. }
            | Flow::GridImport { quantity, .. }
            | Flow::Curtailment { quantity, .. }
            | Flow::UnmetLoad { quantity, .. } => *quantity,
        }
    }

    /// Per-unit price paid by the receiving side, or 0 for unpriced flows.
    pub fn unit_price(&self) -> f64 {
        match self {
            Flow::P2p {
                ask_price,
                transmission_cost,
                ..
            } => ask_price + transmission_cost,
            Flow::GridExport { unit_price, .. } | Flow::GridImport { unit_price, .. } => {
                *unit_price
            }
            _ => 0.0,
        }
    }

    /// Record kind, as serialized in the `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Flow::P2p { .. } => "p2p",
            Flow::Donation { .. } => "donation",
            Flow::GridExport { .. } => "grid_export",
            Flow::GridImport { .. } => "grid_import",
            Flow::Curtailment { .. } => "curtailment",
            Flow::UnmetLoad { .. } => "unmet_load",
        }
    }

    /// Money paid by the receiving side.
    pub fn amount(&self) -> f64 {
        self.quantity() * self.unit_price()
    }

    /// Source and destination labels.
    pub fn endpoints(&self) -> (&str, &str) {
        match self {
            Flow::P2p { seller, buyer, .. } => (seller, buyer),
            Flow::Donation { donor, .. } => (donor, COMMUNITY),
            Flow::GridExport { participant, .. } => (participant, GRID),
            Flow::GridImport { participant, .. } => (GRID, participant),
            Flow::Curtailment { participant, .. } => (participant, "curtailed"),
            Flow::UnmetLoad { participant, .. } => ("unserved", participant),
        }
    }

    /// Returns `true` when `id` is a participant side of this flow.
    pub fn involves(&self, id: &str) -> bool {
        match self {
            Flow::P2p { seller, buyer, .. } => seller == id || buyer == id,
            Flow::Donation { donor, .. } => donor == id,
            Flow::GridExport { participant, .. }
            | Flow::GridImport { participant, .. }
            | Flow::Curtailment { participant, .. }
            | Flow::UnmetLoad { participant, .. } => participant == id,
        }
    }

    /// Participant ids referenced by this flow.
    pub fn participants(&self) -> Vec<&str> {
        match self {
            Flow::P2p { seller, buyer, .. } => vec![seller, buyer],
            Flow::Donation { donor, .. } => vec![donor],
            Flow::GridExport { participant, .. }
            | Flow::GridImport { participant, .. }
            | Flow::Curtailment { participant, .. }
            | Flow::UnmetLoad { participant, .. } => vec![participant],
        }
    }

    /// Signed energy this flow contributes to participant `id`'s balance.
    pub fn energy_delta_for(&self, id: &str) -> f64 {
        match self {
            Flow::P2p {
                seller,
                buyer,
                quantity,
                ..
            } => {
                if buyer == id {
                    *quantity
                } else if seller == id {
                    -*quantity
                } else {
                    0.0
                }
            }
            Flow::Donation { donor, quantity } if donor == id => -*quantity,
            Flow::GridExport {
                participant,
                quantity,
                ..
            }
            | Flow::Curtailment {
                participant,
                quantity,
            } if participant == id => -*quantity,
            Flow::GridImport {
                participant,
                quantity,
                ..
            }
            | Flow::UnmetLoad {
                participant,
                quantity,
            } if participant == id => *quantity,
            _ => 0.0,
        }
    }

    /// Signed money this flow contributes to participant `id`'s wallet.
    pub fn wallet_delta_for(&self, id: &str) -> f64 {
        match self {
            Flow::P2p {
                seller,
                buyer,
                quantity,
                ask_price,
                transmission_cost,
            } => {
                if buyer == id {
                    -(ask_price + transmission_cost) * quantity
                } else if seller == id {
                    ask_price * quantity
                } else {
                    0.0
                }
            }
            Flow::GridExport {
                participant,
                quantity,
                unit_price,
            } if participant == id => quantity * unit_price,
            Flow::GridImport {
                participant,
                quantity,
                unit_price,
            } if participant == id => -(quantity * unit_price),
            _ => 0.0,
        }
    }

    /// Signal type emitted on the physical channel for this flow.
    pub fn signal_kind(&self) -> SignalKind {
        match self {
            Flow::P2p { .. } => SignalKind::P2pTrade,
            Flow::Donation { .. } => SignalKind::Donation,
            Flow::GridExport { .. } | Flow::GridImport { .. } => SignalKind::GridCharge,
            Flow::Curtailment { .. } => SignalKind::Curtailment,
            Flow::UnmetLoad { .. } => SignalKind::UnmetLoad,
        }
    }

    /// Builds the signal event for this flow.
    pub fn signal(&self, step: usize, timestamp: SimTime) -> SignalEvent {
        let (from, to) = self.endpoints();
        SignalEvent {
            step,
            timestamp,
            kind: self.signal_kind(),
            from: from.to_string(),
            to: to.to_string(),
            quantity: self.quantity(),
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (from, to) = self.endpoints();
        write!(
            f,
            "{:<12} {from} -> {to} {:.3} kWh",
            self.signal_kind().as_str(),
            self.quantity()
        )?;
        if self.unit_price() > 0.0 {
            write!(f, " @ {:.2}", self.unit_price())?;
        }
        Ok(())
    }
}

/// Typed event kinds on the physical signal channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    P2pTrade,
    Donation,
    GridCharge,
    Curtailment,
    UnmetLoad,
}

impl SignalKind {
    /// Wire name of the signal.
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::P2pTrade => "P2P_TRADE",
            SignalKind::Donation => "DONATION",
            SignalKind::GridCharge => "GRID_CHARGE",
            SignalKind::Curtailment => "CURTAILMENT",
            SignalKind::UnmetLoad => "UNMET_LOAD",
        }
    }
}

/// Event published for each settled flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub step: usize,
    pub timestamp: SimTime,
    pub kind: SignalKind,
    pub from: String,
    pub to: String,
    pub quantity: f64,
}

/// Subscriber on the physical signal channel.
///
/// Sinks observe settled flows only; nothing they do feeds back into settlement.
pub trait SignalSink: Send {
    fn emit(&mut self, event: &SignalEvent);
}

/// In-memory signal recorder whose clones share one buffer.
#[derive(Debug, Clone, Default)]
pub struct SignalLog {
    events: Arc<Mutex<Vec<SignalEvent>>>,
}

impl SignalLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event recorded so far.
    pub fn events(&self) -> Vec<SignalEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SignalSink for SignalLog {
    fn emit(&mut self, event: &SignalEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Forwards events into an `mpsc` channel; a dropped receiver is ignored.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Sender<SignalEvent>,
}

impl ChannelSink {
    pub fn new(tx: Sender<SignalEvent>) -> Self {
        Self { tx }
    }
}

impl SignalSink for ChannelSink {
    fn emit(&mut self, event: &SignalEvent) {
        let _ = self.tx.send(event.clone());
    }
}
