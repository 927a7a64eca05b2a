pub mod engine;
pub mod features;
pub mod provider;
pub mod rolling;

pub use engine::*;
pub use features::*;
pub use provider::*;
pub use rolling::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("insufficient history: {available} points available, {needed} needed")]
    InsufficientHistory { available: usize, needed: usize },

    #[error("invalid lag configuration: {0}")]
    InvalidLags(String),

    #[error("live data unavailable: {0}")]
    DataUnavailable(String),

    #[error("forecast model error: {0}")]
    Model(#[from] anyhow::Error),
}
