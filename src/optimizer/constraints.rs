use serde::{Deserialize, Serialize};

use super::{MpcError, OptimizationProblem, TerminalMode};
use crate::config::{PumpConfig, TunnelConfig};
use crate::domain::TankGeometry;

/// Physical operating limits of the tunnel and its pumps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpcConstraints {
    pub min_level_m: f64,
    pub max_level_m: f64,
    pub min_flow_m3h: f64,
    pub max_flow_m3h: f64,
    /// Level the tunnel must reach at the end of the horizon
    pub drawdown_target_m: f64,
}

impl Default for MpcConstraints {
    fn default() -> Self {
        Self::from_config(&TunnelConfig::default(), &PumpConfig::default())
    }
}

impl MpcConstraints {
    pub fn from_config(tunnel: &TunnelConfig, pump: &PumpConfig) -> Self {
        Self {
            min_level_m: tunnel.l1_min_m,
            max_level_m: tunnel.l1_max_m,
            min_flow_m3h: pump.min_flow_m3h,
            max_flow_m3h: pump.max_flow_m3h,
            drawdown_target_m: tunnel.drawdown_target_m,
        }
    }

    pub fn validate(&self) -> Result<(), MpcError> {
        let finite = [
            self.min_level_m,
            self.max_level_m,
            self.min_flow_m3h,
            self.max_flow_m3h,
            self.drawdown_target_m,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite {
            return Err(MpcError::InvalidInput("constraint values must be finite".to_string()));
        }
        if self.min_level_m >= self.max_level_m {
            return Err(MpcError::InvalidInput(format!(
                "level band is empty: [{}, {}] m",
                self.min_level_m, self.max_level_m
            )));
        }
        if self.min_flow_m3h < 0.0 || self.min_flow_m3h > self.max_flow_m3h {
            return Err(MpcError::InvalidInput(format!(
                "pump flow range is invalid: [{}, {}] m³/h",
                self.min_flow_m3h, self.max_flow_m3h
            )));
        }
        Ok(())
    }
}

/// Volume-space form of the constraints for one problem
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeLimits {
    pub min_volume_m3: f64,
    pub max_volume_m3: f64,
    pub min_flow_m3h: f64,
    pub max_flow_m3h: f64,
    /// Required final volume when the terminal level is a hard constraint
    pub terminal_volume_m3: Option<f64>,
}

impl VolumeLimits {
    pub fn new(constraints: &MpcConstraints, geometry: &TankGeometry, terminal: TerminalMode) -> Self {
        Self {
            min_volume_m3: geometry.volume_of(constraints.min_level_m),
            max_volume_m3: geometry.volume_of(constraints.max_level_m),
            min_flow_m3h: constraints.min_flow_m3h,
            max_flow_m3h: constraints.max_flow_m3h,
            terminal_volume_m3: match terminal {
                TerminalMode::Hard => Some(geometry.volume_of(constraints.drawdown_target_m)),
                TerminalMode::Penalty { .. } => None,
            },
        }
    }

    /// Absolute slack used when comparing volumes
    pub fn tolerance(&self) -> f64 {
        1e-9 * self.max_volume_m3.abs().max(self.min_volume_m3.abs()).max(1.0)
    }
}

/// Exact set of volumes at each step from which the rest of the horizon can
/// still be completed within every bound (backward reachability of the
/// single-state storage model).
///
/// `lower[k]..=upper[k]` is the admissible interval for `V[k]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReachableEnvelope {
    lower: Vec<f64>,
    upper: Vec<f64>,
    limits: VolumeLimits,
    timestep_hours: f64,
}

impl ReachableEnvelope {
    /// Fails with `InfeasibleProblem` when no pumping plan satisfies the bounds,
    /// including when the initial volume is itself out of bounds.
    pub fn build(problem: &OptimizationProblem, limits: VolumeLimits) -> Result<Self, MpcError> {
        let h = problem.horizon();
        let dt = problem.timestep_hours;
        let tol = limits.tolerance();
        let mut lower = vec![0.0; h];
        let mut upper = vec![0.0; h];

        (lower[h - 1], upper[h - 1]) = match limits.terminal_volume_m3 {
            Some(v) => (v, v),
            None => (limits.min_volume_m3, limits.max_volume_m3),
        };
        if lower[h - 1] < limits.min_volume_m3 - tol || upper[h - 1] > limits.max_volume_m3 + tol {
            return Err(MpcError::InfeasibleProblem(
                "drawdown target lies outside the level band".to_string(),
            ));
        }

        for k in (0..h - 1).rev() {
            let inflow = problem.inflow_m3h[k];
            lower[k] = (lower[k + 1] - dt * (inflow - limits.min_flow_m3h)).max(limits.min_volume_m3);
            upper[k] = (upper[k + 1] - dt * (inflow - limits.max_flow_m3h)).min(limits.max_volume_m3);
            if lower[k] > upper[k] + tol {
                return Err(MpcError::InfeasibleProblem(format!(
                    "no admissible volume at step {k}: inflow exceeds what the pumps can remove within the level band"
                )));
            }
        }

        let v0 = problem.initial_volume_m3;
        if v0 < lower[0] - tol || v0 > upper[0] + tol {
            return Err(MpcError::InfeasibleProblem(format!(
                "initial volume {v0:.1} m³ is outside the reachable range [{:.1}, {:.1}] m³",
                lower[0], upper[0]
            )));
        }

        Ok(Self {
            lower,
            upper,
            limits,
            timestep_hours: dt,
        })
    }

    /// Pump flows at step `k` that keep the next volume inside the envelope,
    /// given the volume `v` and inflow at step `k`.
    pub fn admissible_flow(&self, k: usize, v: f64, inflow: f64) -> (f64, f64) {
        let (lo, hi) = (self.limits.min_flow_m3h, self.limits.max_flow_m3h);
        if k + 1 >= self.lower.len() {
            return (lo, hi);
        }
        let dt = self.timestep_hours;
        let from = ((v + dt * inflow - self.upper[k + 1]) / dt).max(lo);
        let to = ((v + dt * inflow - self.lower[k + 1]) / dt).min(hi);
        (from, to)
    }

    /// Clip each flow into its admissible interval, walking forward from `V0`.
    /// The result satisfies every bound and the terminal volume up to rounding.
    pub fn restore(&self, problem: &OptimizationProblem, desired_m3h: &[f64]) -> Vec<f64> {
        let dt = problem.timestep_hours;
        let mut v = problem.initial_volume_m3;
        let mut flows = Vec::with_capacity(desired_m3h.len());
        for (k, desired) in desired_m3h.iter().enumerate() {
            let inflow = problem.inflow_m3h[k];
            let (from, to) = self.admissible_flow(k, v, inflow);
            let f = desired.max(from).min(to);
            flows.push(f);
            v += dt * (inflow - f);
        }
        flows
    }

    /// Feasible starting plan: pump away the inflow wherever the envelope allows.
    pub fn warm_start(&self, problem: &OptimizationProblem) -> Vec<f64> {
        let nominal: Vec<f64> = problem
            .inflow_m3h
            .iter()
            .map(|f| f.max(self.limits.min_flow_m3h).min(self.limits.max_flow_m3h))
            .collect();
        self.restore(problem, &nominal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::step_duration;
    use chrono::{DateTime, FixedOffset, TimeZone};
    use proptest::prelude::*;

    fn timestamps(n: usize) -> Vec<DateTime<FixedOffset>> {
        let t0 = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 11, 15, 0, 0, 0)
            .unwrap();
        (0..n).map(|i| t0 + step_duration() * i as i32).collect()
    }

    fn problem(v0: f64, inflow: Vec<f64>) -> OptimizationProblem {
        let n = inflow.len();
        OptimizationProblem::new(0.25, v0, inflow, vec![0.1; n], timestamps(n)).unwrap()
    }

    fn limits(terminal: Option<f64>) -> VolumeLimits {
        VolumeLimits {
            min_volume_m3: 5_000.0,
            max_volume_m3: 300_000.0,
            min_flow_m3h: 100.0,
            max_flow_m3h: 10_000.0,
            terminal_volume_m3: terminal,
        }
    }

    fn check_plan(p: &OptimizationProblem, l: &VolumeLimits, flows: &[f64]) {
        let tol = 1e-6;
        for f in flows {
            assert!(*f >= l.min_flow_m3h - tol && *f <= l.max_flow_m3h + tol, "flow {f}");
        }
        for v in p.simulate(flows) {
            assert!(v >= l.min_volume_m3 - tol && v <= l.max_volume_m3 + tol, "volume {v}");
        }
    }

    #[test]
    fn test_validate_rejects_bad_bands() {
        let mut c = MpcConstraints::default();
        assert!(c.validate().is_ok());
        c.min_flow_m3h = 20_000.0;
        assert!(c.validate().is_err());
        let mut c = MpcConstraints::default();
        c.max_level_m = c.min_level_m;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_volume_limits_follow_geometry() {
        let g = TankGeometry::affine(10_000.0, 0.0);
        let l = VolumeLimits::new(&MpcConstraints::default(), &g, TerminalMode::Hard);
        assert_eq!(l.min_volume_m3, 5_000.0);
        assert_eq!(l.max_volume_m3, 300_000.0);
        assert_eq!(l.terminal_volume_m3, Some(5_000.0));
        let soft = VolumeLimits::new(&MpcConstraints::default(), &g, TerminalMode::Penalty { weight: 1.0 });
        assert_eq!(soft.terminal_volume_m3, None);
    }

    #[test]
    fn test_warm_start_hits_terminal_volume() {
        let p = problem(50_000.0, vec![1000.0; 96]);
        let l = limits(Some(5_000.0));
        let env = ReachableEnvelope::build(&p, l).unwrap();
        let flows = env.warm_start(&p);

        check_plan(&p, &l, &flows);
        let last = *p.simulate(&flows).last().unwrap();
        assert!((last - 5_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_unreachable_terminal_is_infeasible() {
        // 3 steps at most remove 2 · 0.25 · 9900 m³ net
        let p = problem(100_000.0, vec![100.0; 3]);
        let err = ReachableEnvelope::build(&p, limits(Some(5_000.0))).unwrap_err();
        assert!(matches!(err, MpcError::InfeasibleProblem(_)));
    }

    #[test]
    fn test_overwhelming_inflow_is_infeasible() {
        let p = problem(295_000.0, vec![50_000.0; 8]);
        assert!(matches!(
            ReachableEnvelope::build(&p, limits(None)),
            Err(MpcError::InfeasibleProblem(_))
        ));
    }

    #[test]
    fn test_initial_volume_out_of_bounds_is_infeasible() {
        let p = problem(1_000.0, vec![1000.0; 8]);
        assert!(ReachableEnvelope::build(&p, limits(None)).is_err());
    }

    #[test]
    fn test_admissible_flow_at_last_step_is_pump_range() {
        let p = problem(50_000.0, vec![1000.0; 4]);
        let env = ReachableEnvelope::build(&p, limits(None)).unwrap();
        assert_eq!(env.admissible_flow(3, 50_000.0, 1000.0), (100.0, 10_000.0));
    }

    proptest! {
        #[test]
        fn prop_restored_plans_are_feasible(
            v0 in 5_000.0f64..300_000.0,
            inflow in proptest::collection::vec(100.0f64..6_000.0, 2..48),
            desired in proptest::collection::vec(-5_000.0f64..20_000.0, 48),
        ) {
            let p = problem(v0, inflow);
            let l = limits(None);
            let env = ReachableEnvelope::build(&p, l).unwrap();
            let flows = env.restore(&p, &desired[..p.horizon()]);
            check_plan(&p, &l, &flows);
        }
    }
}
