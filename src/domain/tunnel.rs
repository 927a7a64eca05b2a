use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use super::TankGeometry;

/// Authoritative tunnel state, read once at the start of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TunnelState {
    pub level_m: f64,
    pub volume_m3: f64,
    pub observed_at: DateTime<FixedOffset>,
}

impl TunnelState {
    pub fn from_level(level_m: f64, geometry: &TankGeometry, observed_at: DateTime<FixedOffset>) -> Self {
        Self {
            level_m,
            volume_m3: geometry.volume_of(level_m),
            observed_at,
        }
    }
}
