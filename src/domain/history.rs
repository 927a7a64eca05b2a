//! Historical operations log
//!
//! Rows whose timestamp or numeric columns cannot be parsed are dropped, as are
//! rows that would break timestamp ordering. Spacing is otherwise trusted.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::{io, path::Path};
use tracing::{debug, info};

use super::TimeSeries;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H.%M.%S",
    "%d.%m.%Y %H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoricalRecord {
    pub timestamp: DateTime<FixedOffset>,
    /// m³ per 15-minute step
    pub inflow_m3: f64,
    pub price_per_kwh: f64,
    pub level_m: f64,
}

#[derive(Debug, Deserialize)]
struct RawRow {
    timestamp: String,
    inflow: String,
    price: String,
    level: String,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryTable {
    records: Vec<HistoricalRecord>,
}

impl HistoryTable {
    /// Keeps records in the given order, dropping any that do not advance time.
    pub fn new(records: impl IntoIterator<Item = HistoricalRecord>) -> Self {
        let mut kept: Vec<HistoricalRecord> = Vec::new();
        for r in records {
            if kept.last().is_some_and(|last| r.timestamp <= last.timestamp) {
                debug!(timestamp = %r.timestamp, "dropping out-of-order history row");
                continue;
            }
            kept.push(r);
        }
        Self { records: kept }
    }

    /// CSV with header `timestamp,inflow,price,level`. Naive timestamps are
    /// interpreted in `offset`.
    pub fn from_csv_reader<R: io::Read>(reader: R, offset: FixedOffset) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        let mut records = Vec::new();
        let mut dropped = 0usize;
        for row in rdr.deserialize::<RawRow>() {
            let Ok(row) = row else {
                dropped += 1;
                continue;
            };
            match parse_row(&row, offset) {
                Some(r) => records.push(r),
                None => dropped += 1,
            }
        }
        let table = Self::new(records);
        info!(rows = table.len(), dropped, "loaded operations history");
        Ok(table)
    }

    pub fn from_csv_path(path: impl AsRef<Path>, offset: FixedOffset) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening history file {}", path.display()))?;
        Self::from_csv_reader(file, offset)
    }

    pub fn records(&self) -> &[HistoricalRecord] {
        &self.records
    }

    pub fn latest(&self) -> Option<&HistoricalRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn inflow_series(&self) -> TimeSeries {
        self.series(|r| r.inflow_m3)
    }

    pub fn price_series(&self) -> TimeSeries {
        self.series(|r| r.price_per_kwh)
    }

    fn series(&self, f: impl Fn(&HistoricalRecord) -> f64) -> TimeSeries {
        self.records
            .iter()
            .map(|r| super::SeriesPoint {
                timestamp: r.timestamp,
                value: f(r),
            })
            .collect()
    }
}

fn parse_row(row: &RawRow, offset: FixedOffset) -> Option<HistoricalRecord> {
    let timestamp = parse_timestamp(&row.timestamp, offset)?;
    let number = |s: &str| s.replace(',', ".").parse::<f64>().ok().filter(|v| v.is_finite());
    Some(HistoricalRecord {
        timestamp,
        inflow_m3: number(&row.inflow)?,
        price_per_kwh: number(&row.price)?,
        level_m: number(&row.level)?,
    })
}

/// Accepts RFC 3339 and the naive day-first / ISO layouts found in plant logs,
/// including times written with dots (`15.11.2024 0.15.00`).
pub fn parse_timestamp(raw: &str, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts);
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .and_then(|naive| offset.from_local_datetime(&naive).single())
}
