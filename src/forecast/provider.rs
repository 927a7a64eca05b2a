use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

use super::{Forecast, ForecastError, ForecastSource, RollingForecaster};
use crate::domain::TimeSeries;
use crate::ml::Regressor;

/// External quote for a series, e.g. day-ahead prices or a hydrological inflow
/// forecast. Returns one value per 15-minute step starting at `start`.
#[async_trait]
pub trait LiveSeriesSource: Send + Sync {
    async fn fetch(&self, start: DateTime<FixedOffset>, horizon: usize) -> Result<Vec<f64>>;

    fn name(&self) -> &str {
        "live"
    }
}

/// Prefers a live quote and falls back to the local rolling forecaster.
pub struct ForecastProvider<R: Regressor> {
    forecaster: RollingForecaster<R>,
    live: Option<Arc<dyn LiveSeriesSource>>,
    timeout: Duration,
}

impl<R: Regressor> ForecastProvider<R> {
    pub fn new(forecaster: RollingForecaster<R>, timeout: Duration) -> Self {
        Self {
            forecaster,
            live: None,
            timeout,
        }
    }

    pub fn with_live_source(mut self, source: Arc<dyn LiveSeriesSource>) -> Self {
        self.live = Some(source);
        self
    }

    /// Always `horizon` values. A live quote is used when it arrives within the
    /// timeout, covers the horizon and is entirely finite.
    pub async fn forecast(&mut self, history: &TimeSeries, start: DateTime<FixedOffset>, horizon: usize) -> Forecast {
        if let Some(source) = self.live.clone() {
            match self.fetch_live(source.as_ref(), start, horizon).await {
                Ok(series) => {
                    debug!(series = %self.forecaster.target(), source = source.name(), "using live quote");
                    return Forecast {
                        target: self.forecaster.target(),
                        source: ForecastSource::LiveQuote,
                        series,
                        training: None,
                    };
                }
                Err(e) => {
                    warn!(
                        series = %self.forecaster.target(),
                        source = source.name(),
                        error = %e,
                        "live quote unavailable, forecasting locally"
                    );
                }
            }
        }
        self.forecaster.forecast(history, start, horizon)
    }

    async fn fetch_live(
        &self,
        source: &dyn LiveSeriesSource,
        start: DateTime<FixedOffset>,
        horizon: usize,
    ) -> Result<TimeSeries, ForecastError> {
        let mut values = tokio::time::timeout(self.timeout, source.fetch(start, horizon))
            .await
            .map_err(|_| ForecastError::DataUnavailable(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| ForecastError::DataUnavailable(e.to_string()))?;

        if values.len() < horizon {
            return Err(ForecastError::DataUnavailable(format!(
                "{} values returned, {} needed",
                values.len(),
                horizon
            )));
        }
        values.truncate(horizon);
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ForecastError::DataUnavailable("non-finite value in quote".to_string()));
        }

        let domain = self.forecaster.target().domain();
        Ok(TimeSeries::from_values(start, values.into_iter().map(|v| domain.clamp(v))))
    }
}
