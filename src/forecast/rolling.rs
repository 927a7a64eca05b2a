//! Recursive single-step-ahead forecasting
//!
//! The regressor only ever predicts one step. A horizon is produced by feeding
//! each prediction back into the lag state before predicting the next step.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::iter::FusedIterator;
use tracing::{info, warn};

use super::{build_training_table, ForecastError, LagFeatureState, LagSet};
use crate::domain::{SeriesPoint, TimeSeries};
use crate::ml::{in_sample_metrics, Regressor, ValidationMetrics};

/// Value domain a forecast is clamped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesDomain {
    NonNegative,
    Unbounded,
}

impl SeriesDomain {
    pub fn clamp(self, value: f64) -> f64 {
        match self {
            Self::NonNegative => value.max(0.0),
            Self::Unbounded => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastTarget {
    /// m³ per step into the tunnel
    Inflow,
    /// Electricity price per kWh; markets allow negative prices
    Price,
}

impl ForecastTarget {
    pub fn domain(self) -> SeriesDomain {
        match self {
            Self::Inflow => SeriesDomain::NonNegative,
            Self::Price => SeriesDomain::Unbounded,
        }
    }
}

impl std::fmt::Display for ForecastTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inflow => write!(f, "inflow"),
            Self::Price => write!(f, "price"),
        }
    }
}

/// Where a forecast's values came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastSource {
    LiveQuote,
    Model,
    ConstantFallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct Forecast {
    pub target: ForecastTarget,
    pub source: ForecastSource,
    pub series: TimeSeries,
    pub training: Option<ValidationMetrics>,
}

pub struct RollingForecaster<R: Regressor> {
    target: ForecastTarget,
    lags: LagSet,
    regressor: R,
    /// Used only when the history holds no finite value at all
    default_value: f64,
}

impl<R: Regressor> RollingForecaster<R> {
    pub fn new(target: ForecastTarget, lags: LagSet, regressor: R, default_value: f64) -> Self {
        Self {
            target,
            lags,
            regressor,
            default_value,
        }
    }

    pub fn target(&self) -> ForecastTarget {
        self.target
    }

    pub fn lags(&self) -> &LagSet {
        &self.lags
    }

    /// Fit the regressor on the lag/calendar table derived from `history`.
    pub fn fit(&mut self, history: &TimeSeries) -> Result<ValidationMetrics, ForecastError> {
        let table = build_training_table(history, &self.lags);
        if table.is_empty() {
            return Err(ForecastError::InsufficientHistory {
                available: history.len(),
                needed: self.lags.max_lag() + 1,
            });
        }
        self.regressor.fit(&table.features, &table.targets)?;
        let metrics = in_sample_metrics(&self.regressor, &table.features, &table.targets)?;
        info!(
            series = %self.target,
            model = ?self.regressor.model_type(),
            rows = table.len(),
            mae = metrics.mae,
            rmse = metrics.rmse,
            r2 = metrics.r2,
            "forecast model trained"
        );
        Ok(metrics)
    }

    /// Lazily roll the fitted model forward `horizon` steps from `state`.
    pub fn rollout(&self, state: LagFeatureState, horizon: usize) -> RecursiveForecast<'_, R> {
        RecursiveForecast {
            regressor: &self.regressor,
            target: self.target,
            last: state.latest(),
            state,
            remaining: horizon,
        }
    }

    /// Fit on `history` and produce exactly `horizon` values starting at `start`.
    /// Never fails: without usable history the result is a constant series.
    pub fn forecast(&mut self, history: &TimeSeries, start: DateTime<FixedOffset>, horizon: usize) -> Forecast {
        let fitted = self.fit(history).and_then(|metrics| {
            LagFeatureState::from_history(history, &self.lags, start)
                .map(|state| (metrics, state))
                .ok_or(ForecastError::InsufficientHistory {
                    available: history.len(),
                    needed: self.lags.max_lag(),
                })
        });

        match fitted {
            Ok((metrics, state)) => Forecast {
                target: self.target,
                source: ForecastSource::Model,
                series: self.rollout(state, horizon).collect(),
                training: Some(metrics),
            },
            Err(e) => {
                let value = self.target.domain().clamp(self.last_known(history));
                warn!(
                    series = %self.target,
                    error = %e,
                    value,
                    "forecast model unavailable, using constant last-known value"
                );
                Forecast {
                    target: self.target,
                    source: ForecastSource::ConstantFallback,
                    series: TimeSeries::constant(start, horizon, value),
                    training: None,
                }
            }
        }
    }

    fn last_known(&self, history: &TimeSeries) -> f64 {
        history
            .points()
            .iter()
            .rev()
            .map(|p| p.value)
            .find(|v| v.is_finite())
            .unwrap_or(self.default_value)
    }
}

/// Finite, non-restartable sequence of one-step-ahead predictions
pub struct RecursiveForecast<'a, R: Regressor> {
    regressor: &'a R,
    target: ForecastTarget,
    state: LagFeatureState,
    remaining: usize,
    last: f64,
}

impl<R: Regressor> Iterator for RecursiveForecast<'_, R> {
    type Item = SeriesPoint;

    fn next(&mut self) -> Option<SeriesPoint> {
        if self.remaining == 0 {
            return None;
        }
        let timestamp = self.state.next_timestamp();
        let value = match self.regressor.predict(&self.state.feature_row()) {
            Ok(v) if v.is_finite() => self.target.domain().clamp(v),
            Ok(v) => {
                warn!(series = %self.target, %timestamp, prediction = v, "non-finite prediction, holding last value");
                self.last
            }
            Err(e) => {
                warn!(series = %self.target, %timestamp, error = %e, "prediction failed, holding last value");
                self.last
            }
        };
        self.state.advance(value);
        self.last = value;
        self.remaining -= 1;
        Some(SeriesPoint { timestamp, value })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<R: Regressor> ExactSizeIterator for RecursiveForecast<'_, R> {}

impl<R: Regressor> FusedIterator for RecursiveForecast<'_, R> {}
