//! Feature engineering for the rolling forecasters
//!
//! A feature row is the calendar encoding of the target timestamp followed by
//! the target series' values at each configured lag offset.

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::ForecastError;
use crate::domain::{step_duration, TimeSeries};

/// Number of calendar columns in front of the lag columns
pub const CALENDAR_WIDTH: usize = 3;

/// Calendar features for one timestamp
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalendarFeatures {
    /// Fractional hour of day (0.0-23.75)
    pub hour_of_day: f64,
    /// Day of week (0=Monday, 6=Sunday)
    pub day_of_week: u32,
}

impl CalendarFeatures {
    pub fn at(timestamp: &DateTime<FixedOffset>) -> Self {
        Self {
            hour_of_day: f64::from(timestamp.hour()) + f64::from(timestamp.minute()) / 60.0,
            day_of_week: timestamp.weekday().num_days_from_monday(),
        }
    }

    /// Hour on the unit circle so 23:45 and 00:00 are neighbours.
    pub fn encode(&self) -> [f64; CALENDAR_WIDTH] {
        let angle = 2.0 * std::f64::consts::PI * self.hour_of_day / 24.0;
        [angle.sin(), angle.cos(), f64::from(self.day_of_week)]
    }
}

/// Sorted, de-duplicated, strictly positive lag offsets in steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagSet {
    offsets: Vec<usize>,
}

impl LagSet {
    pub fn new(offsets: impl IntoIterator<Item = usize>) -> Result<Self, ForecastError> {
        let mut offsets: Vec<usize> = offsets.into_iter().collect();
        offsets.sort_unstable();
        offsets.dedup();
        if offsets.is_empty() {
            return Err(ForecastError::InvalidLags("no lag offsets given".to_string()));
        }
        if offsets[0] == 0 {
            return Err(ForecastError::InvalidLags("lag offsets must be positive".to_string()));
        }
        Ok(Self { offsets })
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn max_lag(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Width of a full feature row
    pub fn row_width(&self) -> usize {
        CALENDAR_WIDTH + self.offsets.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingTable {
    pub features: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
}

impl TrainingTable {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// One row per observation whose every lag is defined and finite.
pub fn build_training_table(series: &TimeSeries, lags: &LagSet) -> TrainingTable {
    let points = series.points();
    let mut table = TrainingTable::default();
    for t in lags.max_lag()..points.len() {
        let target = points[t].value;
        if !target.is_finite() {
            continue;
        }
        let lagged: Vec<f64> = lags.offsets().iter().map(|&l| points[t - l].value).collect();
        if lagged.iter().any(|v| !v.is_finite()) {
            continue;
        }
        let mut row = CalendarFeatures::at(&points[t].timestamp).encode().to_vec();
        row.extend(lagged);
        table.features.push(row);
        table.targets.push(target);
    }
    table
}

/// Most recent `max_lag` values of the target plus the timestamp of the next
/// value to predict.
///
/// The window holds every offset up to the largest lag, so advancing is a single
/// shift: each offset takes the value previously held one step closer, and
/// offset 1 takes the new value.
#[derive(Debug, Clone, PartialEq)]
pub struct LagFeatureState {
    lags: LagSet,
    window: VecDeque<f64>,
    next_timestamp: DateTime<FixedOffset>,
}

impl LagFeatureState {
    /// `None` when the series is too short or its tail contains gaps.
    pub fn from_history(series: &TimeSeries, lags: &LagSet, next_timestamp: DateTime<FixedOffset>) -> Option<Self> {
        let points = series.points();
        let max_lag = lags.max_lag();
        if points.len() < max_lag {
            return None;
        }
        let window: VecDeque<f64> = points[points.len() - max_lag..].iter().map(|p| p.value).collect();
        if window.iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some(Self {
            lags: lags.clone(),
            window,
            next_timestamp,
        })
    }

    /// Value `lag` steps before the next timestamp. `lag` must be within 1..=max_lag.
    pub fn value_at(&self, lag: usize) -> f64 {
        self.window[self.window.len() - lag]
    }

    pub fn latest(&self) -> f64 {
        self.value_at(1)
    }

    pub fn next_timestamp(&self) -> DateTime<FixedOffset> {
        self.next_timestamp
    }

    pub fn calendar(&self) -> CalendarFeatures {
        CalendarFeatures::at(&self.next_timestamp)
    }

    pub fn feature_row(&self) -> Vec<f64> {
        let mut row = Vec::with_capacity(self.lags.row_width());
        row.extend_from_slice(&self.calendar().encode());
        row.extend(self.lags.offsets().iter().map(|&l| self.value_at(l)));
        row
    }

    /// Record `value` as the observation at `next_timestamp` and move one step on.
    pub fn advance(&mut self, value: f64) {
        self.window.pop_front();
        self.window.push_back(value);
        self.next_timestamp += step_duration();
    }
}
