use anyhow::{ensure, Result};
use chrono::FixedOffset;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::STEP_MINUTES;
use crate::optimizer::TerminalMode;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub tunnel: TunnelConfig,
    pub pump: PumpConfig,
    pub mpc: MpcConfig,
    pub forecast: ForecastConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub l1_min_m: f64,
    pub l1_max_m: f64,
    /// Water level at the treatment plant the pumps lift into
    pub downstream_level_m: f64,
    /// Level the tunnel must be drawn down to by the end of the horizon
    pub drawdown_target_m: f64,
    pub calibration_path: Option<PathBuf>,
    pub affine_slope_m2: f64,
    pub affine_offset_m3: f64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            l1_min_m: 0.5,
            l1_max_m: 30.0,
            downstream_level_m: 40.0,
            drawdown_target_m: 0.5,
            calibration_path: None,
            affine_slope_m2: 10_000.0,
            affine_offset_m3: 350.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpConfig {
    pub min_flow_m3h: f64,
    pub max_flow_m3h: f64,
    pub efficiency: f64,
    pub friction_head_m: f64,
    pub water_density_kg_m3: f64,
    pub gravity_m_s2: f64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            min_flow_m3h: 100.0,
            max_flow_m3h: 10_000.0,
            efficiency: 0.80,
            friction_head_m: 1.0,
            water_density_kg_m3: 1000.0,
            gravity_m_s2: 9.81,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpcConfig {
    pub horizon_steps: usize,
    pub timestep_minutes: u32,
    /// Weight on (ΔF2)², currency per (m³/h)²
    pub smoothing_weight: f64,
    pub terminal: TerminalMode,
    pub max_outer_iterations: usize,
    pub max_inner_iterations: usize,
    pub time_limit_seconds: f64,
    pub feasibility_tolerance: f64,
    pub optimality_tolerance: f64,
}

impl Default for MpcConfig {
    fn default() -> Self {
        Self {
            horizon_steps: 96,
            timestep_minutes: 15,
            smoothing_weight: 1e-7,
            terminal: TerminalMode::Hard,
            max_outer_iterations: 50,
            max_inner_iterations: 100_000,
            time_limit_seconds: 20.0,
            feasibility_tolerance: 1e-6,
            optimality_tolerance: 1e-4,
        }
    }
}

impl MpcConfig {
    pub fn timestep_hours(&self) -> f64 {
        f64::from(self.timestep_minutes) / 60.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressorKind {
    Ridge,
    RandomForest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Lag offsets in steps (1 = 15 min, 4 = 1 h, 24 = 6 h)
    pub lags: Vec<usize>,
    pub regressor: RegressorKind,
    pub ridge_alpha: f64,
    pub live_timeout_seconds: u64,
    /// Used only when there is no history at all
    pub default_inflow_m3: f64,
    pub default_price_per_kwh: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            lags: vec![1, 4, 24],
            regressor: RegressorKind::Ridge,
            ridge_alpha: 1e-3,
            live_timeout_seconds: 10,
            default_inflow_m3: 0.0,
            default_price_per_kwh: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub path: PathBuf,
    /// Offset applied to timestamps that carry no zone, in minutes east of UTC
    pub utc_offset_minutes: i32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/hsy_data.csv"),
            utc_offset_minutes: 120,
        }
    }
}

impl HistoryConfig {
    pub fn offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .ok_or_else(|| anyhow::anyhow!("utc_offset_minutes out of range: {}", self.utc_offset_minutes))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("TUNNEL__").split("__"));
        let cfg: Config = figment.extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations no cycle could run with.
    pub fn validate(&self) -> Result<()> {
        let t = &self.tunnel;
        for (name, v) in [
            ("tunnel.l1_min_m", t.l1_min_m),
            ("tunnel.l1_max_m", t.l1_max_m),
            ("tunnel.downstream_level_m", t.downstream_level_m),
            ("tunnel.drawdown_target_m", t.drawdown_target_m),
            ("tunnel.affine_slope_m2", t.affine_slope_m2),
            ("tunnel.affine_offset_m3", t.affine_offset_m3),
            ("pump.min_flow_m3h", self.pump.min_flow_m3h),
            ("pump.max_flow_m3h", self.pump.max_flow_m3h),
            ("pump.efficiency", self.pump.efficiency),
            ("pump.friction_head_m", self.pump.friction_head_m),
            ("mpc.smoothing_weight", self.mpc.smoothing_weight),
            ("mpc.time_limit_seconds", self.mpc.time_limit_seconds),
            ("forecast.ridge_alpha", self.forecast.ridge_alpha),
        ] {
            ensure!(v.is_finite(), "{name} is not finite: {v}");
        }

        ensure!(t.l1_min_m < t.l1_max_m, "tunnel.l1_min_m must be below tunnel.l1_max_m");
        ensure!(
            (t.l1_min_m..=t.l1_max_m).contains(&t.drawdown_target_m),
            "tunnel.drawdown_target_m must lie within [l1_min_m, l1_max_m]"
        );
        ensure!(t.affine_slope_m2 > 0.0, "tunnel.affine_slope_m2 must be positive");

        ensure!(self.pump.min_flow_m3h >= 0.0, "pump.min_flow_m3h cannot be negative");
        ensure!(
            self.pump.min_flow_m3h <= self.pump.max_flow_m3h,
            "pump.min_flow_m3h must be <= pump.max_flow_m3h"
        );
        ensure!(
            self.pump.efficiency > 0.0 && self.pump.efficiency <= 1.0,
            "pump.efficiency must be in (0, 1]"
        );

        ensure!(self.mpc.horizon_steps >= 2, "mpc.horizon_steps must be at least 2");
        ensure!(
            i64::from(self.mpc.timestep_minutes) == STEP_MINUTES,
            "mpc.timestep_minutes must match the {STEP_MINUTES}-minute forecast cadence"
        );
        ensure!(self.mpc.smoothing_weight >= 0.0, "mpc.smoothing_weight cannot be negative");
        ensure!(self.mpc.time_limit_seconds > 0.0, "mpc.time_limit_seconds must be positive");
        if let TerminalMode::Penalty { weight } = self.mpc.terminal {
            ensure!(weight.is_finite() && weight > 0.0, "mpc.terminal.weight must be positive");
        }

        ensure!(!self.forecast.lags.is_empty(), "forecast.lags cannot be empty");
        ensure!(!self.forecast.lags.contains(&0), "forecast.lags must be positive offsets");
        ensure!(self.forecast.ridge_alpha >= 0.0, "forecast.ridge_alpha cannot be negative");

        self.history.offset()?;
        Ok(())
    }
}
