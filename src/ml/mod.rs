//! Machine Learning Module
//!
//! Point-prediction regressors used by the rolling forecasters:
//! - Ridge regression (closed form, always available)
//! - Random forest via SmartCore (`ml` feature)
//!
//! Every model is fitted once per cycle on the lag/calendar table built by
//! `forecast::features` and queried one row at a time.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::{ForecastConfig, RegressorKind};

pub mod ridge;
pub mod training;

#[cfg(feature = "ml")]
pub mod smartcore;

pub use ridge::RidgeRegressor;
pub use training::*;

/// ML Model Type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Ridge,
    RandomForest,
}

/// Anything that can be fitted on a feature table and then predict one scalar
/// per feature row.
#[cfg_attr(test, mockall::automock)]
pub trait Regressor: Send {
    fn fit(&mut self, features: &[Vec<f64>], targets: &[f64]) -> Result<()>;

    fn predict(&self, features: &[f64]) -> Result<f64>;

    fn model_type(&self) -> ModelType;
}

impl Regressor for Box<dyn Regressor> {
    fn fit(&mut self, features: &[Vec<f64>], targets: &[f64]) -> Result<()> {
        (**self).fit(features, targets)
    }

    fn predict(&self, features: &[f64]) -> Result<f64> {
        (**self).predict(features)
    }

    fn model_type(&self) -> ModelType {
        (**self).model_type()
    }
}

/// Build the configured regressor. A random forest requested without the `ml`
/// feature degrades to ridge regression.
pub fn build_regressor(cfg: &ForecastConfig) -> Box<dyn Regressor> {
    match cfg.regressor {
        RegressorKind::Ridge => Box::new(RidgeRegressor::new(cfg.ridge_alpha)),
        #[cfg(feature = "ml")]
        RegressorKind::RandomForest => Box::new(smartcore::SmartcoreRandomForest::with_defaults()),
        #[cfg(not(feature = "ml"))]
        RegressorKind::RandomForest => {
            tracing::warn!("random forest regressor requires the `ml` feature, using ridge regression");
            Box::new(RidgeRegressor::new(cfg.ridge_alpha))
        }
    }
}

/// Shape checks shared by all regressors.
pub(crate) fn check_training_table(features: &[Vec<f64>], targets: &[f64]) -> Result<usize> {
    if features.is_empty() || targets.is_empty() {
        anyhow::bail!("Cannot train on empty dataset");
    }
    if features.len() != targets.len() {
        anyhow::bail!(
            "Feature and target count mismatch: {} features, {} targets",
            features.len(),
            targets.len()
        );
    }
    let n_features = features[0].len();
    if features.iter().any(|row| row.len() != n_features) {
        anyhow::bail!("All feature vectors must have the same length");
    }
    Ok(n_features)
}
