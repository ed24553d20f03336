//! Exogenous data feed: per-tick generation, consumption, and grid state.
//!
//! Frames are keyed by tick index. A tick without a frame, or a participant
//! without a reading in its frame, is an input gap and reads as zero flow.

pub mod synthetic;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::sim::types::{SimTime, TimeParseError};

/// One participant's physical readings for one tick (kWh).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Reading {
    pub generation: f64,
    pub consumption: f64,
    /// Observed stored energy, if the source reports it.
    pub battery: Option<f64>,
}

/// Everything the feed says about one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedFrame {
    pub timestamp: SimTime,
    /// `None` keeps the configured default (grid up).
    pub grid_available: Option<bool>,
    /// `None` keeps the configured tariff.
    pub grid_price: Option<f64>,
    pub readings: BTreeMap<String, Reading>,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("cannot open feed {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("feed has no \"timestamp\" column")]
    MissingTimestamp,
    #[error("line {line}: {source}")]
    Timestamp {
        line: usize,
        #[source]
        source: TimeParseError,
    },
    #[error("line {line}: timestamp {timestamp} does not follow {previous}")]
    NonMonotonic {
        line: usize,
        timestamp: SimTime,
        previous: SimTime,
    },
    #[error("line {line}: timestamp {timestamp} is not on the {step_minutes}-minute grid from {start}")]
    Misaligned {
        line: usize,
        timestamp: SimTime,
        start: SimTime,
        step_minutes: u32,
    },
    #[error("line {line}: unknown grid status \"{value}\"")]
    GridStatus { line: usize, value: String },
    #[error("line {line}: column {column}: \"{value}\" is not a number")]
    Value {
        line: usize,
        column: String,
        value: String,
    },
}

/// Time-indexed feed aligned to the simulation tick grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    start: SimTime,
    step_minutes: u32,
    frames: BTreeMap<usize, FeedFrame>,
}

impl Feed {
    /// A feed with no data: every tick is an input gap.
    pub fn empty(start: SimTime, step_minutes: u32) -> Self {
        Self {
            start,
            step_minutes,
            frames: BTreeMap::new(),
        }
    }

    /// Builds a feed from frames, checking order and alignment.
    ///
    /// Frame `i` of the input is reported as line `i + 1` in errors.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::NonMonotonic`] if timestamps do not strictly
    /// increase, [`FeedError::Misaligned`] if a timestamp is before `start`
    /// or off the `step_minutes` grid, and [`FeedError::Value`] for a negative
    /// grid price.
    pub fn from_frames(
        start: SimTime,
        step_minutes: u32,
        frames: impl IntoIterator<Item = FeedFrame>,
    ) -> Result<Self, FeedError> {
        let mut feed = Self::empty(start, step_minutes);
        for (i, frame) in frames.into_iter().enumerate() {
            feed.push(i + 1, frame)?;
        }
        Ok(feed)
    }

    fn push(&mut self, line: usize, frame: FeedFrame) -> Result<(), FeedError> {
        if let Some(price) = frame.grid_price.filter(|p| *p < 0.0) {
            return Err(FeedError::Value {
                line,
                column: "grid_price".to_string(),
                value: price.to_string(),
            });
        }
        if let Some(previous) = self.frames.values().next_back().map(|f| f.timestamp) {
            if frame.timestamp <= previous {
                return Err(FeedError::NonMonotonic {
                    line,
                    timestamp: frame.timestamp,
                    previous,
                });
            }
        }
        let step = self.step_of(frame.timestamp).ok_or(FeedError::Misaligned {
            line,
            timestamp: frame.timestamp,
            start: self.start,
            step_minutes: self.step_minutes,
        })?;
        self.frames.insert(step, frame);
        Ok(())
    }

    /// Tick index of `timestamp`, if it lies on the tick grid.
    pub fn step_of(&self, timestamp: SimTime) -> Option<usize> {
        let offset = timestamp.minutes().checked_sub(self.start.minutes())?;
        if self.step_minutes == 0 || offset % self.step_minutes != 0 {
            return None;
        }
        usize::try_from(offset / self.step_minutes).ok()
    }

    /// Reads a wide-format CSV feed.
    ///
    /// Required column: `timestamp` (`HH:MM`, `HH:MM:SS` or `dN HH:MM`).
    /// Optional columns: `grid_status` (`ON`/`ONLINE`/`OFF`/`BLACKOUT`),
    /// `grid_price`, and per participant `<id>_solar` or `<id>_generation`,
    /// `<id>_load` or `<id>_consumption`, `<id>_battery`. Other columns are
    /// ignored. Empty cells are gaps.
    ///
    /// # Errors
    ///
    /// Returns a [`FeedError`] for malformed CSV, unparsable cells, a negative
    /// grid price, or timestamps that are out of order or off the tick grid.
    pub fn from_csv_reader<R: io::Read>(
        reader: R,
        start: SimTime,
        step_minutes: u32,
    ) -> Result<Self, FeedError> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let columns = Columns::from_headers(rdr.headers()?)?;
        let mut feed = Self::empty(start, step_minutes);

        for (i, record) in rdr.records().enumerate() {
            let record = record?;
            let line = i + 2;
            let frame = columns.frame(line, &record)?;
            feed.push(line, frame)?;
        }
        Ok(feed)
    }

    /// Reads a wide-format CSV feed from disk. See [`Feed::from_csv_reader`].
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Io`] if the file cannot be opened, or any error
    /// from [`Feed::from_csv_reader`].
    pub fn from_csv_path(
        path: impl AsRef<Path>,
        start: SimTime,
        step_minutes: u32,
    ) -> Result<Self, FeedError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|source| FeedError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_csv_reader(file, start, step_minutes)
    }

    /// Frame for tick `step`, if the feed has one.
    pub fn frame(&self, step: usize) -> Option<&FeedFrame> {
        self.frames.get(&step)
    }

    /// Number of frames present.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Every participant id that has at least one reading.
    pub fn participant_ids(&self) -> BTreeSet<&str> {
        self.frames
            .values()
            .flat_map(|f| f.readings.keys().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Generation,
    Consumption,
    Battery,
}

struct Columns {
    timestamp: usize,
    grid_status: Option<usize>,
    grid_price: Option<usize>,
    readings: Vec<ReadingColumn>,
}

struct ReadingColumn {
    idx: usize,
    header: String,
    participant: String,
    field: Field,
}

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self, FeedError> {
        let mut timestamp = None;
        let mut grid_status = None;
        let mut grid_price = None;
        let mut readings = Vec::new();

        for (idx, name) in headers.iter().enumerate() {
            match name {
                "timestamp" => timestamp = Some(idx),
                "grid_status" => grid_status = Some(idx),
                "grid_price" => grid_price = Some(idx),
                _ => {
                    let Some((id, suffix)) = name.rsplit_once('_') else {
                        continue;
                    };
                    let field = match suffix {
                        "solar" | "generation" => Field::Generation,
                        "load" | "consumption" => Field::Consumption,
                        "battery" => Field::Battery,
                        _ => continue,
                    };
                    if !id.is_empty() {
                        readings.push(ReadingColumn {
                            idx,
                            header: name.to_string(),
                            participant: id.to_string(),
                            field,
                        });
                    }
                }
            }
        }

        Ok(Self {
            timestamp: timestamp.ok_or(FeedError::MissingTimestamp)?,
            grid_status,
            grid_price,
            readings,
        })
    }

    fn frame(&self, line: usize, record: &csv::StringRecord) -> Result<FeedFrame, FeedError> {
        let timestamp = record
            .get(self.timestamp)
            .unwrap_or_default()
            .parse::<SimTime>()
            .map_err(|source| FeedError::Timestamp { line, source })?;

        let grid_available = match cell(record, self.grid_status) {
            None => None,
            Some(v) => Some(parse_grid_status(v).ok_or_else(|| FeedError::GridStatus {
                line,
                value: v.to_string(),
            })?),
        };
        let grid_price = match self.grid_price {
            Some(idx) => number(record, idx, line, "grid_price")?,
            None => None,
        };

        let mut readings: BTreeMap<String, Reading> = BTreeMap::new();
        for col in &self.readings {
            let Some(value) = number(record, col.idx, line, &col.header)? else {
                continue;
            };
            let reading = readings.entry(col.participant.clone()).or_default();
            match col.field {
                Field::Generation => reading.generation = value,
                Field::Consumption => reading.consumption = value,
                Field::Battery => reading.battery = Some(value),
            }
        }

        Ok(FeedFrame {
            timestamp,
            grid_available,
            grid_price,
            readings,
        })
    }
}

fn cell(record: &csv::StringRecord, idx: Option<usize>) -> Option<&str> {
    idx.and_then(|i| record.get(i)).filter(|v| !v.is_empty())
}

fn number(
    record: &csv::StringRecord,
    idx: usize,
    line: usize,
    column: &str,
) -> Result<Option<f64>, FeedError> {
    match cell(record, Some(idx)) {
        None => Ok(None),
        Some(v) => v
            .parse::<f64>()
            .ok()
            .filter(|x| x.is_finite())
            .map(Some)
            .ok_or_else(|| FeedError::Value {
                line,
                column: column.to_string(),
                value: v.to_string(),
            }),
    }
}

fn parse_grid_status(value: &str) -> Option<bool> {
    match value.to_ascii_uppercase().as_str() {
        "ON" | "ONLINE" | "UP" => Some(true),
        "OFF" | "OFFLINE" | "BLACKOUT" | "DOWN" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\
timestamp,grid_status,grid_price,peak_period,house_a_solar,house_a_load,house_b_solar,house_b_load
00:00:00,ON,38.0,OFF_PEAK,0.0,0.5,0.0,1.0
00:30:00,ON,38.0,OFF_PEAK,0.0,0.5,0.0,1.0
19:00:00,OFF,0,PEAK,0.29,1.0,0.0,2.5
";

    #[test]
    fn parses_wide_csv() {
        let feed = Feed::from_csv_reader(CSV.as_bytes(), SimTime::MIDNIGHT, 30).unwrap();
        assert_eq!(feed.len(), 3);

        let f0 = feed.frame(0).unwrap();
        assert_eq!(f0.grid_available, Some(true));
        assert_eq!(f0.grid_price, Some(38.0));
        assert_eq!(f0.readings["house_b"].consumption, 1.0);

        let f38 = feed.frame(38).unwrap();
        assert_eq!(f38.grid_available, Some(false));
        assert_eq!(f38.readings["house_a"].generation, 0.29);
        assert!(feed.frame(2).is_none());

        let ids: Vec<_> = feed.participant_ids().into_iter().collect();
        assert_eq!(ids, vec!["house_a", "house_b"]);
    }

    #[test]
    fn empty_cells_are_gaps() {
        let csv = "timestamp,grid_status,a_solar,a_load,b_load\n00:00,,1.5,,\n";
        let feed = Feed::from_csv_reader(csv.as_bytes(), SimTime::MIDNIGHT, 30).unwrap();
        let f = feed.frame(0).unwrap();
        assert_eq!(f.grid_available, None);
        assert_eq!(f.readings["a"].generation, 1.5);
        assert_eq!(f.readings["a"].consumption, 0.0);
        assert!(!f.readings.contains_key("b"));
    }

    #[test]
    fn battery_column_is_read() {
        let csv = "timestamp,a_battery\n00:00,4.25\n";
        let feed = Feed::from_csv_reader(csv.as_bytes(), SimTime::MIDNIGHT, 30).unwrap();
        assert_eq!(feed.frame(0).unwrap().readings["a"].battery, Some(4.25));
    }

    #[test]
    fn rejects_out_of_order_rows() {
        let csv = "timestamp,a_load\n01:00,1\n00:30,1\n";
        let err = Feed::from_csv_reader(csv.as_bytes(), SimTime::MIDNIGHT, 30).unwrap_err();
        assert!(matches!(err, FeedError::NonMonotonic { line: 3, .. }));
    }

    #[test]
    fn rejects_off_grid_timestamps() {
        let csv = "timestamp,a_load\n00:15,1\n";
        let err = Feed::from_csv_reader(csv.as_bytes(), SimTime::MIDNIGHT, 30).unwrap_err();
        assert!(matches!(err, FeedError::Misaligned { line: 2, .. }));

        let csv = "timestamp,a_load\n05:00,1\n";
        let err = Feed::from_csv_reader(csv.as_bytes(), SimTime::hm(6, 0), 30).unwrap_err();
        assert!(matches!(err, FeedError::Misaligned { .. }));
    }

    #[test]
    fn rejects_bad_cells() {
        let csv = "timestamp,grid_status\n00:00,MAYBE\n";
        assert!(matches!(
            Feed::from_csv_reader(csv.as_bytes(), SimTime::MIDNIGHT, 30),
            Err(FeedError::GridStatus { .. })
        ));

        let csv = "timestamp,a_load\n00:00,lots\n";
        assert!(matches!(
            Feed::from_csv_reader(csv.as_bytes(), SimTime::MIDNIGHT, 30),
            Err(FeedError::Value { .. })
        ));

        let csv = "time,a_load\n00:00,1\n";
        assert!(matches!(
            Feed::from_csv_reader(csv.as_bytes(), SimTime::MIDNIGHT, 30),
            Err(FeedError::MissingTimestamp)
        ));

        let csv = "timestamp,a_load\nnoon,1\n";
        assert!(matches!(
            Feed::from_csv_reader(csv.as_bytes(), SimTime::MIDNIGHT, 30),
            Err(FeedError::Timestamp { line: 2, .. })
        ));
    }

    #[test]
    fn rejects_negative_grid_price() {
        let csv = "timestamp,grid_status,grid_price,a_solar\n00:00,ON,38,1\n00:30,ON,-5,1\n";
        let err = Feed::from_csv_reader(csv.as_bytes(), SimTime::MIDNIGHT, 30).unwrap_err();
        assert!(matches!(
            err,
            FeedError::Value { line: 3, ref column, .. } if column == "grid_price"
        ));

        let frame = FeedFrame {
            timestamp: SimTime::MIDNIGHT,
            grid_available: Some(true),
            grid_price: Some(-5.0),
            readings: BTreeMap::new(),
        };
        assert!(matches!(
            Feed::from_frames(SimTime::MIDNIGHT, 30, [frame]),
            Err(FeedError::Value { line: 1, .. })
        ));
    }

    #[test]
    fn from_frames_checks_order() {
        let frame = |t: SimTime| FeedFrame {
            timestamp: t,
            grid_available: None,
            grid_price: None,
            readings: BTreeMap::new(),
        };
        let feed = Feed::from_frames(
            SimTime::MIDNIGHT,
            30,
            [frame(SimTime::MIDNIGHT), frame(SimTime::hm(1, 0))],
        )
        .unwrap();
        assert!(feed.frame(2).is_some());
        assert!(feed.frame(1).is_none());

        let err = Feed::from_frames(
            SimTime::MIDNIGHT,
            30,
            [frame(SimTime::hm(1, 0)), frame(SimTime::hm(1, 0))],
        );
        assert!(matches!(err, Err(FeedError::NonMonotonic { line: 2, .. })));
    }
}
