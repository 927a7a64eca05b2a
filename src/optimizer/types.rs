use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::SolverDiagnostics;
use crate::domain::GeometryFidelity;

/// How the end-of-horizon drawdown level is enforced
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TerminalMode {
    /// `level_of(V[H-1]) == target`
    Hard,
    /// `weight · (level_of(V[H-1]) − target)²` added to the cost
    Penalty { weight: f64 },
}

#[derive(Debug, Error)]
pub enum MpcError {
    #[error("invalid optimization input: {0}")]
    InvalidInput(String),

    #[error("infeasible problem: {0}")]
    InfeasibleProblem(String),

    #[error(
        "solver did not converge ({:?} after {} outer / {} inner iterations, violation {:.3e})",
        .diagnostics.status,
        .diagnostics.outer_iterations,
        .diagnostics.inner_iterations,
        .diagnostics.constraint_violation
    )]
    SolverNonConvergence { diagnostics: SolverDiagnostics },
}

/// One receding-horizon problem instance. Flows in m³/h, volumes in m³, Δt in hours.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationProblem {
    pub timestep_hours: f64,
    pub initial_volume_m3: f64,
    pub inflow_m3h: Vec<f64>,
    pub price_per_kwh: Vec<f64>,
    pub timestamps: Vec<DateTime<FixedOffset>>,
}

impl OptimizationProblem {
    pub fn new(
        timestep_hours: f64,
        initial_volume_m3: f64,
        inflow_m3h: Vec<f64>,
        price_per_kwh: Vec<f64>,
        timestamps: Vec<DateTime<FixedOffset>>,
    ) -> Result<Self, MpcError> {
        let horizon = inflow_m3h.len();
        if horizon == 0 {
            return Err(MpcError::InvalidInput("empty horizon".to_string()));
        }
        if price_per_kwh.len() != horizon || timestamps.len() != horizon {
            return Err(MpcError::InvalidInput(format!(
                "series lengths differ: inflow {}, price {}, timestamps {}",
                horizon,
                price_per_kwh.len(),
                timestamps.len()
            )));
        }
        if !(timestep_hours.is_finite() && timestep_hours > 0.0) {
            return Err(MpcError::InvalidInput(format!("timestep must be positive, got {timestep_hours}")));
        }
        if !initial_volume_m3.is_finite() {
            return Err(MpcError::InvalidInput("initial volume is not finite".to_string()));
        }
        if let Some(k) = inflow_m3h.iter().position(|f| !f.is_finite() || *f < 0.0) {
            return Err(MpcError::InvalidInput(format!(
                "inflow at step {k} must be finite and non-negative, got {}",
                inflow_m3h[k]
            )));
        }
        if let Some(k) = price_per_kwh.iter().position(|p| !p.is_finite()) {
            return Err(MpcError::InvalidInput(format!("price at step {k} is not finite")));
        }
        if timestamps.windows(2).any(|w| w[1] <= w[0]) {
            return Err(MpcError::InvalidInput("timestamps must be strictly increasing".to_string()));
        }
        Ok(Self {
            timestep_hours,
            initial_volume_m3,
            inflow_m3h,
            price_per_kwh,
            timestamps,
        })
    }

    pub fn horizon(&self) -> usize {
        self.inflow_m3h.len()
    }

    /// Volumes implied by a pumping plan: `V[0] = V0`, `V[k+1] = V[k] + Δt·(F1[k] − F2[k])`.
    pub fn simulate(&self, pump_flow_m3h: &[f64]) -> Vec<f64> {
        let mut volumes = Vec::with_capacity(self.horizon());
        let mut v = self.initial_volume_m3;
        volumes.push(v);
        for k in 0..self.horizon().saturating_sub(1) {
            v += self.timestep_hours * (self.inflow_m3h[k] - pump_flow_m3h[k]);
            volumes.push(v);
        }
        volumes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub timestamp: DateTime<FixedOffset>,
    pub pump_flow_m3h: f64,
    pub inflow_m3h: f64,
    pub volume_m3: f64,
    pub level_m: f64,
    pub power_kw: f64,
    pub price_per_kwh: f64,
    /// price · power · Δt
    pub energy_cost: f64,
}

/// Optimal pumping plan for one horizon. Only the first step is ever executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub id: Uuid,
    pub generated_at: DateTime<FixedOffset>,
    pub steps: Vec<TrajectoryStep>,
    pub total_energy_cost: f64,
    pub terminal_mode: TerminalMode,
    pub geometry_fidelity: GeometryFidelity,
    pub diagnostics: SolverDiagnostics,
}

impl Trajectory {
    pub fn first(&self) -> Option<&TrajectoryStep> {
        self.steps.first()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn pump_flows(&self) -> Vec<f64> {
        self.steps.iter().map(|s| s.pump_flow_m3h).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.steps.iter().map(|s| s.volume_m3).collect()
    }

    pub fn levels(&self) -> Vec<f64> {
        self.steps.iter().map(|s| s.level_m).collect()
    }
}
