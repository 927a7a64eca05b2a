//! Solver-agnostic description of a bound-constrained nonlinear program
//!
//! ```text
//! minimise    f(x)
//! subject to  c(x) = 0
//!             g(x) ≤ 0
//!             lb ≤ x ≤ ub
//! ```
//!
//! Programs expose constraint derivatives as vector–Jacobian products only, so
//! no backend ever needs a dense Jacobian.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::MpcConfig;

pub trait NonlinearProgram {
    fn dimension(&self) -> usize;

    fn lower_bounds(&self) -> &[f64];

    fn upper_bounds(&self) -> &[f64];

    fn objective(&self, x: &[f64]) -> f64;

    /// Overwrites `grad` with ∇f(x).
    fn objective_gradient(&self, x: &[f64], grad: &mut [f64]);

    fn num_equalities(&self) -> usize {
        0
    }

    fn num_inequalities(&self) -> usize {
        0
    }

    fn equalities(&self, _x: &[f64], _out: &mut [f64]) {}

    fn inequalities(&self, _x: &[f64], _out: &mut [f64]) {}

    /// Adds `J_c(x)ᵀ · weights` to `grad`.
    fn equality_vjp(&self, _x: &[f64], _weights: &[f64], _grad: &mut [f64]) {}

    /// Adds `J_g(x)ᵀ · weights` to `grad`.
    fn inequality_vjp(&self, _x: &[f64], _weights: &[f64], _grad: &mut [f64]) {}
}

/// Work limits for one solve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolveBudget {
    pub max_outer_iterations: usize,
    /// Total across all outer iterations
    pub max_inner_iterations: usize,
    pub time_limit: Duration,
    pub feasibility_tolerance: f64,
    pub optimality_tolerance: f64,
}

impl Default for SolveBudget {
    fn default() -> Self {
        Self::from_config(&MpcConfig::default())
    }
}

impl SolveBudget {
    pub fn from_config(cfg: &MpcConfig) -> Self {
        Self {
            max_outer_iterations: cfg.max_outer_iterations,
            max_inner_iterations: cfg.max_inner_iterations,
            // beyond what `Duration` holds the limit is effectively absent
            time_limit: Duration::try_from_secs_f64(cfg.time_limit_seconds.max(0.0)).unwrap_or(Duration::MAX),
            feasibility_tolerance: cfg.feasibility_tolerance,
            optimality_tolerance: cfg.optimality_tolerance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    /// Feasible and stationary within tolerance
    Converged,
    /// Feasible, but the line search found no further descent before the
    /// stationarity tolerance was met
    Stalled,
    IterationLimit,
    TimeLimit,
    NumericalFailure,
}

impl SolveStatus {
    pub fn is_converged(self) -> bool {
        matches!(self, Self::Converged)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverDiagnostics {
    pub solver: String,
    pub status: SolveStatus,
    pub outer_iterations: usize,
    pub inner_iterations: usize,
    /// Largest scaled violation of c(x) = 0 or g(x) ≤ 0
    pub constraint_violation: f64,
    /// Projected-gradient norm of the Lagrangian on the scaled box
    pub stationarity: f64,
    pub objective: f64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub x: Vec<f64>,
    pub diagnostics: SolverDiagnostics,
}

/// Numerical backend for [`NonlinearProgram`]s.
pub trait NlpSolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn solve(&self, program: &dyn NonlinearProgram, start: &[f64], budget: &SolveBudget) -> SolverOutcome;
}

/// Largest violation of `c = 0` and `g ≤ 0`.
pub fn max_violation(equalities: &[f64], inequalities: &[f64]) -> f64 {
    let eq = equalities.iter().fold(0.0_f64, |m, c| m.max(c.abs()));
    inequalities.iter().fold(eq, |m, g| m.max(g.max(0.0)))
}
