//! End-of-tick state publication.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use thiserror::Error;

use super::flow::Flow;
use super::types::{CommunityLedger, Participant, SimTime, TickReport};

/// Full externally visible state after one settled tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub step: usize,
    pub timestamp: SimTime,
    pub participants: Vec<Participant>,
    pub community: CommunityLedger,
    pub flows: Vec<Flow>,
}

impl MarketSnapshot {
    /// State committed by the tick behind `report`.
    pub fn from_report(report: &TickReport) -> Self {
        Self {
            step: report.step,
            timestamp: report.timestamp,
            participants: report.participants.clone(),
            community: report.community,
            flows: report.flows.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Receiver of end-of-tick snapshots, last write wins.
///
/// The engine publishes after the tick is committed; a failing sink is logged
/// and does not stop the run.
pub trait StateSink: Send {
    /// Stores `snapshot`, replacing whatever was stored before.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if the snapshot could not be stored.
    fn publish(&mut self, snapshot: &MarketSnapshot) -> Result<(), SinkError>;
}

/// In-memory latest snapshot whose clones share one slot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    latest: Arc<RwLock<Option<MarketSnapshot>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently published snapshot.
    pub fn latest(&self) -> Option<MarketSnapshot> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StateSink for SnapshotStore {
    fn publish(&mut self, snapshot: &MarketSnapshot) -> Result<(), SinkError> {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        Ok(())
    }
}

/// Writes each snapshot as pretty JSON, replacing the file atomically.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateSink for JsonFileSink {
    fn publish(&mut self, snapshot: &MarketSnapshot) -> Result<(), SinkError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(step: usize) -> MarketSnapshot {
        MarketSnapshot {
            step,
            timestamp: SimTime::hm(0, 30),
            participants: vec![Participant::new("a", 1.0, 10.0, 5.0)],
            community: CommunityLedger::default(),
            flows: vec![Flow::Donation {
                donor: "a".into(),
                quantity: 0.5,
            }],
        }
    }

    #[test]
    fn store_keeps_last_write() {
        let store = SnapshotStore::new();
        let mut writer = store.clone();
        assert!(store.latest().is_none());
        writer.publish(&snapshot(1)).unwrap();
        writer.publish(&snapshot(2)).unwrap();
        assert_eq!(store.latest().map(|s| s.step), Some(2));
    }

    #[test]
    fn json_sink_overwrites_file() {
        let path = std::env::temp_dir().join(format!(
            "microgrid_snapshot_test_{}.json",
            std::process::id()
        ));
        let mut sink = JsonFileSink::new(&path);
        sink.publish(&snapshot(1)).unwrap();
        sink.publish(&snapshot(7)).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["step"], 7);
        assert_eq!(value["timestamp"], "00:30");
        assert_eq!(value["flows"][0]["kind"], "donation");
        fs::remove_file(&path).unwrap();
    }
}
