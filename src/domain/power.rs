use serde::{Deserialize, Serialize};

use crate::config::{PumpConfig, TunnelConfig};

const SECONDS_PER_HOUR: f64 = 3600.0;
const WATTS_PER_KW: f64 = 1000.0;

/// Hydraulic pumping power `P = ρ·g·Q·H / η` with
/// `H = (downstream level − tunnel level) + friction head`.
///
/// The expression is bilinear in flow and level with no branches, so it stays
/// finite and smooth for any trial point an optimizer might evaluate, including
/// levels outside the operating band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerModel {
    pub water_density_kg_m3: f64,
    pub gravity_m_s2: f64,
    pub downstream_level_m: f64,
    pub friction_head_m: f64,
    pub efficiency: f64,
}

impl Default for PowerModel {
    fn default() -> Self {
        Self {
            water_density_kg_m3: 1000.0,
            gravity_m_s2: 9.81,
            downstream_level_m: 40.0,
            friction_head_m: 1.0,
            efficiency: 0.80,
        }
    }
}

impl PowerModel {
    pub fn from_config(tunnel: &TunnelConfig, pump: &PumpConfig) -> Self {
        Self {
            water_density_kg_m3: pump.water_density_kg_m3,
            gravity_m_s2: pump.gravity_m_s2,
            downstream_level_m: tunnel.downstream_level_m,
            friction_head_m: pump.friction_head_m,
            efficiency: pump.efficiency,
        }
    }

    pub fn total_head_m(&self, level_m: f64) -> f64 {
        self.downstream_level_m - level_m + self.friction_head_m
    }

    /// kW per (m³/h · m)
    fn coefficient(&self) -> f64 {
        self.water_density_kg_m3 * self.gravity_m_s2 / (SECONDS_PER_HOUR * self.efficiency * WATTS_PER_KW)
    }

    pub fn power_kw(&self, flow_m3h: f64, level_m: f64) -> f64 {
        self.coefficient() * flow_m3h * self.total_head_m(level_m)
    }

    /// ∂P/∂Q in kW per m³/h
    pub fn dpower_dflow(&self, level_m: f64) -> f64 {
        self.coefficient() * self.total_head_m(level_m)
    }

    /// ∂P/∂L in kW per m
    pub fn dpower_dlevel(&self, flow_m3h: f64) -> f64 {
        -self.coefficient() * flow_m3h
    }
}
