use anyhow::{anyhow, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::{check_training_table, ModelType, Regressor};

/// Below this a column is treated as constant and left unscaled.
const MIN_COLUMN_STD: f64 = 1e-12;

/// Ridge regression on standardised features, solved in closed form.
///
/// The penalty is `alpha · n · ‖β‖²` on the standardised coefficients; the
/// intercept is never penalised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidgeRegressor {
    pub alpha: f64,
    coefficients: Vec<f64>,
    intercept: f64,
    fitted: bool,
}

impl RidgeRegressor {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.max(0.0),
            coefficients: Vec::new(),
            intercept: 0.0,
            fitted: false,
        }
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }
}

impl Regressor for RidgeRegressor {
    fn fit(&mut self, features: &[Vec<f64>], targets: &[f64]) -> Result<()> {
        let n_features = check_training_table(features, targets)?;
        let n = features.len();
        let nf = n as f64;

        let means: Vec<f64> = (0..n_features)
            .map(|j| features.iter().map(|row| row[j]).sum::<f64>() / nf)
            .collect();
        let scales: Vec<f64> = (0..n_features)
            .map(|j| {
                let var = features.iter().map(|row| (row[j] - means[j]).powi(2)).sum::<f64>() / nf;
                let std = var.sqrt();
                if std < MIN_COLUMN_STD {
                    1.0
                } else {
                    std
                }
            })
            .collect();
        let y_mean = targets.iter().sum::<f64>() / nf;

        let z = DMatrix::from_fn(n, n_features, |i, j| (features[i][j] - means[j]) / scales[j]);
        let yc = DVector::from_iterator(n, targets.iter().map(|y| y - y_mean));

        let zt = z.transpose();
        let gram = &zt * &z + DMatrix::identity(n_features, n_features) * (self.alpha * nf);
        let rhs = &zt * &yc;

        let beta = match gram.clone().cholesky() {
            Some(chol) => chol.solve(&rhs),
            None => gram
                .svd(true, true)
                .solve(&rhs, 1e-12)
                .map_err(|e| anyhow!("ridge solve failed: {e}"))?,
        };

        self.coefficients = (0..n_features).map(|j| beta[j] / scales[j]).collect();
        self.intercept = y_mean
            - self
                .coefficients
                .iter()
                .zip(&means)
                .map(|(c, m)| c * m)
                .sum::<f64>();
        self.fitted = true;
        Ok(())
    }

    fn predict(&self, features: &[f64]) -> Result<f64> {
        if !self.fitted {
            anyhow::bail!("Model not fitted");
        }
        if features.len() != self.coefficients.len() {
            anyhow::bail!(
                "Feature count mismatch: expected {}, got {}",
                self.coefficients.len(),
                features.len()
            );
        }
        Ok(features
            .iter()
            .zip(&self.coefficients)
            .map(|(f, c)| f * c)
            .sum::<f64>()
            + self.intercept)
    }

    fn model_type(&self) -> ModelType {
        ModelType::Ridge
    }
}
