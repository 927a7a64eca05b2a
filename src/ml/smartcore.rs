//! SmartCore RandomForest wrapper
//!
//! Conservative parameters keep training under a few seconds on the control
//! host even with several weeks of 15-minute history.

use anyhow::{anyhow, Result};
use smartcore::ensemble::random_forest_regressor::{RandomForestRegressor, RandomForestRegressorParameters};
use smartcore::linalg::basic::matrix::DenseMatrix;

use super::{check_training_table, ModelType, Regressor};

type Forest = RandomForestRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

pub struct SmartcoreRandomForest {
    params: RandomForestRegressorParameters,
    model: Option<Forest>,
    n_features: usize,
}

impl SmartcoreRandomForest {
    pub fn new(params: RandomForestRegressorParameters) -> Self {
        Self {
            params,
            model: None,
            n_features: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Self::default_parameters())
    }

    /// 50 trees, depth 10, fixed seed for reproducible forecasts.
    pub fn default_parameters() -> RandomForestRegressorParameters {
        RandomForestRegressorParameters {
            max_depth: Some(10),
            min_samples_leaf: 2,
            min_samples_split: 5,
            n_trees: 50,
            m: None,
            keep_samples: false,
            seed: 42,
        }
    }
}

impl Regressor for SmartcoreRandomForest {
    fn fit(&mut self, features: &[Vec<f64>], targets: &[f64]) -> Result<()> {
        let n_features = check_training_table(features, targets)?;
        let flat: Vec<f64> = features.iter().flatten().copied().collect();
        let x = DenseMatrix::new(features.len(), n_features, flat, false);
        let y = targets.to_vec();

        let model = RandomForestRegressor::fit(&x, &y, self.params.clone())
            .map_err(|e| anyhow!("RandomForest training failed: {:?}", e))?;
        self.model = Some(model);
        self.n_features = n_features;
        Ok(())
    }

    fn predict(&self, features: &[f64]) -> Result<f64> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| anyhow!("Model not fitted"))?;
        if features.len() != self.n_features {
            anyhow::bail!(
                "Feature count mismatch: expected {}, got {}",
                self.n_features,
                features.len()
            );
        }

        let x = DenseMatrix::new(1, features.len(), features.to_vec(), false);
        let predictions = model
            .predict(&x)
            .map_err(|e| anyhow!("Prediction failed: {:?}", e))?;
        predictions
            .first()
            .copied()
            .ok_or_else(|| anyhow!("Model returned empty predictions"))
    }

    fn model_type(&self) -> ModelType {
        ModelType::RandomForest
    }
}
