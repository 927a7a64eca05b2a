//! In-sample fit quality, logged after every training run.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::Regressor;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ValidationMetrics {
    pub mae: f64,  // Mean Absolute Error
    pub rmse: f64, // Root Mean Square Error
    pub r2: f64,   // R-squared
}

impl ValidationMetrics {
    pub fn new(mae: f64, rmse: f64, r2: f64) -> Self {
        Self { mae, rmse, r2 }
    }
}

pub fn calculate_metrics(predictions: &[f64], targets: &[f64]) -> Result<ValidationMetrics> {
    if predictions.len() != targets.len() {
        anyhow::bail!("Prediction and target count mismatch");
    }

    if predictions.is_empty() {
        anyhow::bail!("No predictions to evaluate");
    }

    let n = predictions.len() as f64;

    let mae: f64 = predictions
        .iter()
        .zip(targets.iter())
        .map(|(p, t)| (p - t).abs())
        .sum::<f64>()
        / n;

    let ss_res: f64 = predictions
        .iter()
        .zip(targets.iter())
        .map(|(p, t)| (t - p).powi(2))
        .sum();
    let rmse = (ss_res / n).sqrt();

    let mean_target: f64 = targets.iter().sum::<f64>() / n;
    let ss_tot: f64 = targets.iter().map(|t| (t - mean_target).powi(2)).sum();

    let r2 = if ss_tot.abs() < 1e-10 {
        0.0
    } else {
        1.0 - (ss_res / ss_tot)
    };

    Ok(ValidationMetrics::new(mae, rmse, r2))
}

/// Score a fitted model on the table it was trained on.
pub fn in_sample_metrics<R: Regressor + ?Sized>(
    model: &R,
    features: &[Vec<f64>],
    targets: &[f64],
) -> Result<ValidationMetrics> {
    let predictions = features
        .iter()
        .map(|row| model.predict(row))
        .collect::<Result<Vec<_>>>()?;
    calculate_metrics(&predictions, targets)
}
