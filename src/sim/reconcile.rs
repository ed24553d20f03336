//! Initial-state reconciliation between configuration and the data feed.
//!
//! The configured battery levels and the first feed row do not always agree.
//! This runs once before the first tick and decides which one wins.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::feed::FeedFrame;

use super::types::{EPSILON, Participant};

/// Which source supplies the starting battery level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialStateSource {
    /// Keep configured levels; feed readings are only compared.
    #[default]
    Config,
    /// Adopt the battery reading of the first feed frame where present.
    Feed,
}

/// A participant whose configured and observed starting levels differ.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discrepancy {
    pub participant: String,
    pub configured: f64,
    pub feed: f64,
    /// Level the run starts from.
    pub adopted: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconcileError {
    #[error("feed battery reading {reading} for \"{participant}\" is outside [0, {capacity}]")]
    OutOfBounds {
        participant: String,
        reading: f64,
        capacity: f64,
    },
}

/// Participants ready for tick 0, plus every disagreement found.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub participants: Vec<Participant>,
    pub discrepancies: Vec<Discrepancy>,
}

/// Resolves starting battery levels against the first feed frame.
///
/// # Errors
///
/// With [`InitialStateSource::Feed`], a reading outside
/// `[0, battery_capacity]` is a [`ReconcileError::OutOfBounds`].
pub fn initial_state(
    mut participants: Vec<Participant>,
    first_frame: Option<&FeedFrame>,
    source: InitialStateSource,
) -> Result<Reconciled, ReconcileError> {
    let mut discrepancies = Vec::new();
    let Some(frame) = first_frame else {
        return Ok(Reconciled {
            participants,
            discrepancies,
        });
    };

    for p in &mut participants {
        let Some(reading) = frame.readings.get(&p.id).and_then(|r| r.battery) else {
            continue;
        };

        if source == InitialStateSource::Feed
            && !(-EPSILON..=p.battery_capacity + EPSILON).contains(&reading)
        {
            return Err(ReconcileError::OutOfBounds {
                participant: p.id.clone(),
                reading,
                capacity: p.battery_capacity,
            });
        }
        if (reading - p.battery_stored).abs() <= EPSILON {
            continue;
        }

        let configured = p.battery_stored;
        if source == InitialStateSource::Feed {
            p.battery_stored = reading.clamp(0.0, p.battery_capacity);
        }
        warn!(
            participant = %p.id,
            configured,
            feed = reading,
            adopted = p.battery_stored,
            "initial battery level disagrees with feed"
        );
        discrepancies.push(Discrepancy {
            participant: p.id.clone(),
            configured,
            feed: reading,
            adopted: p.battery_stored,
        });
    }

    info!(
        ?source,
        discrepancies = discrepancies.len(),
        "initial state reconciled"
    );
    Ok(Reconciled {
        participants,
        discrepancies,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::feed::Reading;
    use crate::sim::types::SimTime;

    fn frame(battery: Option<f64>) -> FeedFrame {
        let mut readings = BTreeMap::new();
        readings.insert(
            "a".to_string(),
            Reading {
                generation: 0.0,
                consumption: 0.5,
                battery,
            },
        );
        FeedFrame {
            timestamp: SimTime::MIDNIGHT,
            grid_available: None,
            grid_price: None,
            readings,
        }
    }

    fn participants() -> Vec<Participant> {
        vec![
            Participant::new("a", 8.5, 10.0, 5000.0),
            Participant::new("b", 1.5, 10.0, 2000.0),
        ]
    }

    #[test]
    fn config_mode_keeps_configured_level() {
        let out = initial_state(
            participants(),
            Some(&frame(Some(3.0))),
            InitialStateSource::Config,
        )
        .unwrap();
        assert_eq!(out.participants[0].battery_stored, 8.5);
        assert_eq!(
            out.discrepancies,
            vec![Discrepancy {
                participant: "a".into(),
                configured: 8.5,
                feed: 3.0,
                adopted: 8.5
            }]
        );
    }

    #[test]
    fn feed_mode_adopts_reading() {
        let out = initial_state(
            participants(),
            Some(&frame(Some(3.0))),
            InitialStateSource::Feed,
        )
        .unwrap();
        assert_eq!(out.participants[0].battery_stored, 3.0);
        assert_eq!(out.participants[1].battery_stored, 1.5);
        assert_eq!(out.discrepancies[0].adopted, 3.0);
    }

    #[test]
    fn feed_mode_rejects_reading_outside_capacity() {
        let err = initial_state(
            participants(),
            Some(&frame(Some(12.0))),
            InitialStateSource::Feed,
        );
        assert!(matches!(err, Err(ReconcileError::OutOfBounds { .. })));
    }

    #[test]
    fn agreeing_or_missing_readings_are_not_discrepancies() {
        for f in [frame(Some(8.5)), frame(None)] {
            let out = initial_state(participants(), Some(&f), InitialStateSource::Feed).unwrap();
            assert!(out.discrepancies.is_empty());
        }
        let out = initial_state(participants(), None, InitialStateSource::Feed).unwrap();
        assert_eq!(out.participants, participants());
    }
}
