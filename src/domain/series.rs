use chrono::{DateTime, Duration, FixedOffset};
use serde::{Deserialize, Serialize};

/// Control and forecast cadence
pub const STEP_MINUTES: i64 = 15;
pub const STEPS_PER_HOUR: f64 = 60.0 / STEP_MINUTES as f64;

pub fn step_duration() -> Duration {
    Duration::minutes(STEP_MINUTES)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: DateTime<FixedOffset>,
    pub value: f64,
}

/// Ordered (timestamp, value) pairs at fixed cadence. Timestamps are strictly
/// increasing under every constructor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    points: Vec<SeriesPoint>,
}

impl TimeSeries {
    /// Lay `values` out on a regular grid starting at `start`.
    pub fn from_values(start: DateTime<FixedOffset>, values: impl IntoIterator<Item = f64>) -> Self {
        let points = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| SeriesPoint {
                timestamp: start + step_duration() * i as i32,
                value,
            })
            .collect();
        Self { points }
    }

    /// `horizon` copies of `value`, used when nothing better is available.
    pub fn constant(start: DateTime<FixedOffset>, horizon: usize, value: f64) -> Self {
        Self::from_values(start, std::iter::repeat(value).take(horizon))
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[SeriesPoint] {
        &self.points
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn timestamps(&self) -> Vec<DateTime<FixedOffset>> {
        self.points.iter().map(|p| p.timestamp).collect()
    }

    pub fn first(&self) -> Option<&SeriesPoint> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&SeriesPoint> {
        self.points.last()
    }
}

impl FromIterator<SeriesPoint> for TimeSeries {
    /// Points that do not advance time are skipped.
    fn from_iter<I: IntoIterator<Item = SeriesPoint>>(iter: I) -> Self {
        let mut points: Vec<SeriesPoint> = Vec::new();
        for p in iter {
            if points.last().is_some_and(|last| p.timestamp <= last.timestamp) {
                continue;
            }
            points.push(p);
        }
        Self { points }
    }
}
