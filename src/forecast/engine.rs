use chrono::{DateTime, FixedOffset, Local};
use serde::Serialize;
use std::{sync::Arc, time::Duration};

use super::{Forecast, ForecastError, ForecastProvider, ForecastTarget, LagSet, LiveSeriesSource, RollingForecaster};
use crate::config::ForecastConfig;
use crate::domain::HistoryTable;
use crate::ml::{build_regressor, Regressor};

/// Price and inflow forecasts for one horizon
#[derive(Debug, Clone, Serialize)]
pub struct HorizonForecast {
    pub generated_at: DateTime<FixedOffset>,
    pub price: Forecast,
    /// m³ per 15-minute step
    pub inflow: Forecast,
}

pub struct ForecastEngine {
    pub price_provider: ForecastProvider<Box<dyn Regressor>>,
    pub inflow_provider: ForecastProvider<Box<dyn Regressor>>,
}

impl ForecastEngine {
    pub fn new(
        price: ForecastProvider<Box<dyn Regressor>>,
        inflow: ForecastProvider<Box<dyn Regressor>>,
    ) -> Self {
        Self {
            price_provider: price,
            inflow_provider: inflow,
        }
    }

    pub fn from_config(cfg: &ForecastConfig) -> Result<Self, ForecastError> {
        let lags = LagSet::new(cfg.lags.iter().copied())?;
        let timeout = Duration::from_secs(cfg.live_timeout_seconds);
        let price = RollingForecaster::new(
            ForecastTarget::Price,
            lags.clone(),
            build_regressor(cfg),
            cfg.default_price_per_kwh,
        );
        let inflow = RollingForecaster::new(
            ForecastTarget::Inflow,
            lags,
            build_regressor(cfg),
            cfg.default_inflow_m3,
        );
        Ok(Self::new(
            ForecastProvider::new(price, timeout),
            ForecastProvider::new(inflow, timeout),
        ))
    }

    pub fn with_price_source(mut self, source: Arc<dyn LiveSeriesSource>) -> Self {
        self.price_provider = self.price_provider.with_live_source(source);
        self
    }

    pub fn with_inflow_source(mut self, source: Arc<dyn LiveSeriesSource>) -> Self {
        self.inflow_provider = self.inflow_provider.with_live_source(source);
        self
    }

    pub async fn forecast_horizon(
        &mut self,
        history: &HistoryTable,
        start: DateTime<FixedOffset>,
        horizon: usize,
    ) -> HorizonForecast {
        let generated_at: DateTime<FixedOffset> = Local::now().fixed_offset();
        let price_history = history.price_series();
        let inflow_history = history.inflow_series();
        let (price, inflow) = tokio::join!(
            self.price_provider.forecast(&price_history, start, horizon),
            self.inflow_provider.forecast(&inflow_history, start, horizon),
        );
        HorizonForecast {
            generated_at,
            price,
            inflow,
        }
    }
}
