//! Receding-horizon pump scheduling
//!
//! Decision variables are the pump flows `F2[0..H-1]`; volumes are eliminated
//! through the storage balance, so every volume bound becomes an inequality on
//! a prefix sum of the flows. Volume bounds and the terminal volume are exact.
//! Inside the solve, levels come from the calibration interpolant with its
//! slope blended across each knot, so the objective stays continuously
//! differentiable; the reported trajectory uses the exact interpolant.

use chrono::Local;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AugmentedLagrangianSolver, MpcConstraints, MpcError, NlpSolver, NonlinearProgram, OptimizationProblem,
    ReachableEnvelope, SolveBudget, SolveStatus, TerminalMode, Trajectory, TrajectoryStep, VolumeLimits,
};
use crate::config::Config;
use crate::domain::{PowerModel, SmoothedLevel, TankGeometry};

/// Slope blend half-width around each calibration knot, as a fraction of the
/// shorter adjacent segment
const KNOT_BLEND_FRACTION: f64 = 0.25;

pub struct MpcEngine {
    geometry: TankGeometry,
    power: PowerModel,
    constraints: MpcConstraints,
    terminal: TerminalMode,
    smoothing_weight: f64,
    budget: SolveBudget,
    solver: Box<dyn NlpSolver>,
}

impl MpcEngine {
    pub fn new(
        geometry: TankGeometry,
        power: PowerModel,
        constraints: MpcConstraints,
        terminal: TerminalMode,
        smoothing_weight: f64,
        budget: SolveBudget,
    ) -> Self {
        Self {
            geometry,
            power,
            constraints,
            terminal,
            smoothing_weight,
            budget,
            solver: Box::new(AugmentedLagrangianSolver::default()),
        }
    }

    pub fn from_config(cfg: &Config, geometry: TankGeometry) -> Self {
        Self::new(
            geometry,
            PowerModel::from_config(&cfg.tunnel, &cfg.pump),
            MpcConstraints::from_config(&cfg.tunnel, &cfg.pump),
            cfg.mpc.terminal,
            cfg.mpc.smoothing_weight,
            SolveBudget::from_config(&cfg.mpc),
        )
    }

    pub fn with_solver(mut self, solver: Box<dyn NlpSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn geometry(&self) -> &TankGeometry {
        &self.geometry
    }

    pub fn solve(&self, problem: &OptimizationProblem) -> Result<Trajectory, MpcError> {
        self.constraints.validate()?;
        if let TerminalMode::Penalty { weight } = self.terminal {
            if !(weight.is_finite() && weight > 0.0) {
                return Err(MpcError::InvalidInput(format!("terminal penalty weight must be positive, got {weight}")));
            }
        }
        if !(self.smoothing_weight.is_finite() && self.smoothing_weight >= 0.0) {
            return Err(MpcError::InvalidInput("smoothing weight must be non-negative".to_string()));
        }

        let limits = VolumeLimits::new(&self.constraints, &self.geometry, self.terminal);
        let envelope = ReachableEnvelope::build(problem, limits)?;
        let start = envelope.warm_start(problem);
        let program = TunnelProgram::new(
            problem,
            &self.geometry,
            &self.power,
            limits,
            self.terminal,
            self.constraints.drawdown_target_m,
            self.smoothing_weight,
        );
        debug!(
            horizon = problem.horizon(),
            initial_volume_m3 = problem.initial_volume_m3,
            warm_start_cost = program.objective(&start),
            "solving pump schedule"
        );

        let outcome = self.solver.solve(&program, &start, &self.budget);
        let diagnostics = outcome.diagnostics;
        info!(
            solver = %diagnostics.solver,
            status = ?diagnostics.status,
            outer = diagnostics.outer_iterations,
            inner = diagnostics.inner_iterations,
            violation = diagnostics.constraint_violation,
            stationarity = diagnostics.stationarity,
            objective = diagnostics.objective,
            elapsed_ms = diagnostics.elapsed_ms,
            "mpc solve finished"
        );
        match diagnostics.status {
            SolveStatus::Converged => {}
            // No descent direction left at a feasible point: accepted as the
            // first-order point the line search can resolve, and reported as such.
            SolveStatus::Stalled if diagnostics.constraint_violation <= self.budget.feasibility_tolerance => {
                warn!(
                    stationarity = diagnostics.stationarity,
                    tolerance = self.budget.optimality_tolerance,
                    "mpc solver stalled at a feasible point above the optimality tolerance"
                );
            }
            status => {
                warn!(?status, violation = diagnostics.constraint_violation, "mpc solver did not converge");
                return Err(MpcError::SolverNonConvergence { diagnostics });
            }
        }

        let flows = envelope.restore(problem, &outcome.x);
        Ok(self.trajectory(problem, &flows, diagnostics))
    }

    fn trajectory(
        &self,
        problem: &OptimizationProblem,
        flows: &[f64],
        diagnostics: super::SolverDiagnostics,
    ) -> Trajectory {
        let dt = problem.timestep_hours;
        let volumes = problem.simulate(flows);
        let steps: Vec<TrajectoryStep> = (0..problem.horizon())
            .map(|k| {
                let level_m = self.geometry.level_of(volumes[k]);
                let power_kw = self.power.power_kw(flows[k], level_m);
                TrajectoryStep {
                    timestamp: problem.timestamps[k],
                    pump_flow_m3h: flows[k],
                    inflow_m3h: problem.inflow_m3h[k],
                    volume_m3: volumes[k],
                    level_m,
                    power_kw,
                    price_per_kwh: problem.price_per_kwh[k],
                    energy_cost: problem.price_per_kwh[k] * power_kw * dt,
                }
            })
            .collect();
        let total_energy_cost = steps.iter().map(|s| s.energy_cost).sum();

        Trajectory {
            id: Uuid::new_v4(),
            generated_at: Local::now().fixed_offset(),
            steps,
            total_energy_cost,
            terminal_mode: self.terminal,
            geometry_fidelity: self.geometry.fidelity(),
            diagnostics,
        }
    }
}

/// The pump-scheduling problem in `NonlinearProgram` form.
///
/// Volume constraints are divided by the largest single-step volume change the
/// pumps can cause so that their Jacobian entries are of order one.
pub struct TunnelProgram<'a> {
    problem: &'a OptimizationProblem,
    level: SmoothedLevel,
    power: &'a PowerModel,
    limits: VolumeLimits,
    terminal: TerminalMode,
    target_level_m: f64,
    smoothing_weight: f64,
    lower: Vec<f64>,
    upper: Vec<f64>,
    volume_scale: f64,
}

impl<'a> TunnelProgram<'a> {
    pub fn new(
        problem: &'a OptimizationProblem,
        geometry: &TankGeometry,
        power: &'a PowerModel,
        limits: VolumeLimits,
        terminal: TerminalMode,
        target_level_m: f64,
        smoothing_weight: f64,
    ) -> Self {
        let h = problem.horizon();
        let volume_scale = (problem.timestep_hours * (limits.max_flow_m3h - limits.min_flow_m3h)).max(1.0);
        Self {
            problem,
            level: geometry.smoothed_level(KNOT_BLEND_FRACTION),
            power,
            limits,
            terminal,
            target_level_m,
            smoothing_weight,
            lower: vec![limits.min_flow_m3h; h],
            upper: vec![limits.max_flow_m3h; h],
            volume_scale,
        }
    }

    fn horizon(&self) -> usize {
        self.problem.horizon()
    }

    /// Adds `−Δt · Σ_{k>j} dv[k]` to `grad[j]`: the chain rule through `V[k+1] = V[k] + Δt(F1[k] − F2[k])`.
    fn accumulate_through_dynamics(&self, dv: &[f64], grad: &mut [f64]) {
        let dt = self.problem.timestep_hours;
        let mut later = 0.0;
        for j in (0..dv.len()).rev() {
            grad[j] -= dt * later;
            later += dv[j];
        }
    }
}

impl NonlinearProgram for TunnelProgram<'_> {
    fn dimension(&self) -> usize {
        self.horizon()
    }

    fn lower_bounds(&self) -> &[f64] {
        &self.lower
    }

    fn upper_bounds(&self) -> &[f64] {
        &self.upper
    }

    fn objective(&self, x: &[f64]) -> f64 {
        let p = self.problem;
        let dt = p.timestep_hours;
        let volumes = p.simulate(x);

        let mut cost: f64 = (0..self.horizon())
            .map(|k| p.price_per_kwh[k] * self.power.power_kw(x[k], self.level.level_of(volumes[k])) * dt)
            .sum();
        cost += self.smoothing_weight * x.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum::<f64>();
        if let TerminalMode::Penalty { weight } = self.terminal {
            if let Some(v) = volumes.last() {
                cost += weight * (self.level.level_of(*v) - self.target_level_m).powi(2);
            }
        }
        cost
    }

    fn objective_gradient(&self, x: &[f64], grad: &mut [f64]) {
        let p = self.problem;
        let dt = p.timestep_hours;
        let h = self.horizon();
        let volumes = p.simulate(x);
        let mut dv = vec![0.0; h];

        for k in 0..h {
            let level = self.level.level_of(volumes[k]);
            let slope = self.level.dlevel_dvolume(volumes[k]);
            grad[k] = p.price_per_kwh[k] * dt * self.power.dpower_dflow(level);
            dv[k] = p.price_per_kwh[k] * dt * self.power.dpower_dlevel(x[k]) * slope;
        }
        for k in 1..h {
            let d = 2.0 * self.smoothing_weight * (x[k] - x[k - 1]);
            grad[k] += d;
            grad[k - 1] -= d;
        }
        if let TerminalMode::Penalty { weight } = self.terminal {
            let v = volumes[h - 1];
            let level = self.level.level_of(v);
            dv[h - 1] += 2.0 * weight * (level - self.target_level_m) * self.level.dlevel_dvolume(v);
        }
        self.accumulate_through_dynamics(&dv, grad);
    }

    fn num_equalities(&self) -> usize {
        usize::from(self.limits.terminal_volume_m3.is_some())
    }

    /// `V[k] ≥ V_min` and `V[k] ≤ V_max` for k = 1..H-1; `V[0]` is fixed.
    fn num_inequalities(&self) -> usize {
        2 * self.horizon().saturating_sub(1)
    }

    fn equalities(&self, x: &[f64], out: &mut [f64]) {
        if let Some(target) = self.limits.terminal_volume_m3 {
            if let Some(v) = self.problem.simulate(x).last() {
                out[0] = (v - target) / self.volume_scale;
            }
        }
    }

    fn inequalities(&self, x: &[f64], out: &mut [f64]) {
        let volumes = self.problem.simulate(x);
        let m = volumes.len().saturating_sub(1);
        for (i, v) in volumes.iter().skip(1).enumerate() {
            out[i] = (self.limits.min_volume_m3 - v) / self.volume_scale;
            out[m + i] = (v - self.limits.max_volume_m3) / self.volume_scale;
        }
    }

    fn equality_vjp(&self, _x: &[f64], weights: &[f64], grad: &mut [f64]) {
        if self.limits.terminal_volume_m3.is_none() {
            return;
        }
        let h = self.horizon();
        let mut dv = vec![0.0; h];
        dv[h - 1] = weights[0] / self.volume_scale;
        self.accumulate_through_dynamics(&dv, grad);
    }

    fn inequality_vjp(&self, _x: &[f64], weights: &[f64], grad: &mut [f64]) {
        let h = self.horizon();
        let m = h.saturating_sub(1);
        let mut dv = vec![0.0; h];
        for i in 0..m {
            dv[i + 1] = (weights[m + i] - weights[i]) / self.volume_scale;
        }
        self.accumulate_through_dynamics(&dv, grad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{step_duration, CalibrationPoint, CalibrationTable, GeometryFidelity};
    use crate::optimizer::{SolveStatus, SolverDiagnostics, SolverOutcome};
    use chrono::{DateTime, FixedOffset, TimeZone};

    fn timestamps(n: usize) -> Vec<DateTime<FixedOffset>> {
        let t0 = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 11, 15, 0, 0, 0)
            .unwrap();
        (0..n).map(|i| t0 + step_duration() * i as i32).collect()
    }

    fn linear_geometry() -> TankGeometry {
        TankGeometry::from_table(
            &CalibrationTable::new(vec![
                CalibrationPoint { level_m: 0.0, volume_m3: 0.0 },
                CalibrationPoint { level_m: 30.0, volume_m3: 300_000.0 },
            ])
            .unwrap(),
        )
    }

    fn engine(terminal: TerminalMode) -> MpcEngine {
        MpcEngine::new(
            linear_geometry(),
            PowerModel::default(),
            MpcConstraints::default(),
            terminal,
            1e-7,
            SolveBudget::default(),
        )
    }

    fn problem(v0: f64, inflow: Vec<f64>, price: Vec<f64>) -> OptimizationProblem {
        let n = inflow.len();
        OptimizationProblem::new(0.25, v0, inflow, price, timestamps(n)).unwrap()
    }

    fn finite_difference<F: Fn(&[f64]) -> f64>(f: F, x: &[f64], j: usize) -> f64 {
        let h = 1e-3;
        let mut xp = x.to_vec();
        let mut xm = x.to_vec();
        xp[j] += h;
        xm[j] -= h;
        (f(&xp) - f(&xm)) / (2.0 * h)
    }

    fn program_fixture(terminal: TerminalMode) -> (OptimizationProblem, TankGeometry, PowerModel, VolumeLimits) {
        let p = problem(
            60_000.0,
            vec![800.0, 1200.0, 900.0, 1500.0, 700.0, 1000.0],
            vec![0.05, -0.02, 0.12, 0.08, 0.03, 0.2],
        );
        let g = TankGeometry::affine(10_000.0, 350.0);
        let l = VolumeLimits::new(&MpcConstraints::default(), &g, terminal);
        (p, g, PowerModel::default(), l)
    }

    #[test]
    fn test_objective_gradient_matches_finite_differences() {
        for terminal in [TerminalMode::Hard, TerminalMode::Penalty { weight: 40.0 }] {
            let (p, g, pm, l) = program_fixture(terminal);
            let prog = TunnelProgram::new(&p, &g, &pm, l, terminal, 0.5, 1e-3);
            let x = [3000.0, 200.0, 5000.0, 4200.0, 100.0, 9000.0];
            let mut grad = vec![0.0; 6];
            prog.objective_gradient(&x, &mut grad);

            for j in 0..6 {
                let fd = finite_difference(|y| prog.objective(y), &x, j);
                assert!((grad[j] - fd).abs() <= 1e-6 * fd.abs().max(1.0), "j={j}: {} vs {fd}", grad[j]);
            }
        }
    }

    #[test]
    fn test_constraint_vjps_match_finite_differences() {
        let (p, g, pm, l) = program_fixture(TerminalMode::Hard);
        let prog = TunnelProgram::new(&p, &g, &pm, l, TerminalMode::Hard, 0.5, 0.0);
        let x = [3000.0, 200.0, 5000.0, 4200.0, 100.0, 9000.0];
        let m = prog.num_inequalities();
        assert_eq!(m, 10);
        assert_eq!(prog.num_equalities(), 1);

        let weights: Vec<f64> = (0..m).map(|i| 0.3 + i as f64 * 0.7).collect();
        let mut grad = vec![0.0; 6];
        prog.inequality_vjp(&x, &weights, &mut grad);
        let weighted = |y: &[f64]| {
            let mut out = vec![0.0; m];
            prog.inequalities(y, &mut out);
            out.iter().zip(&weights).map(|(o, w)| o * w).sum::<f64>()
        };
        for j in 0..6 {
            assert!((grad[j] - finite_difference(weighted, &x, j)).abs() < 1e-8);
        }

        let mut grad = vec![0.0; 6];
        prog.equality_vjp(&x, &[2.5], &mut grad);
        let eq = |y: &[f64]| {
            let mut out = [0.0];
            prog.equalities(y, &mut out);
            2.5 * out[0]
        };
        for j in 0..6 {
            assert!((grad[j] - finite_difference(eq, &x, j)).abs() < 1e-8);
        }
        // the last flow never reaches a constrained volume
        assert_eq!(grad[5], 0.0);
    }

    #[test]
    fn test_balanced_fixed_pumping_keeps_volume() {
        let mut e = engine(TerminalMode::Penalty { weight: 1.0 });
        e.constraints.min_flow_m3h = 1000.0;
        e.constraints.max_flow_m3h = 1000.0;
        let p = problem(100_000.0, vec![1000.0; 4], vec![0.1; 4]);

        let t = e.solve(&p).unwrap();
        assert_eq!(t.pump_flows(), vec![1000.0; 4]);
        assert_eq!(t.volumes(), vec![100_000.0; 4]);
    }

    #[test]
    fn test_hard_terminal_is_met() {
        let e = engine(TerminalMode::Hard);
        let p = problem(8_000.0, vec![1000.0; 8], vec![0.01, 0.01, 0.01, 0.01, 1.0, 1.0, 1.0, 1.0]);
        let t = e.solve(&p).unwrap();

        assert_eq!(t.len(), 8);
        assert!((t.levels()[7] - 0.5).abs() < 1e-6);
        for s in &t.steps {
            assert!(s.pump_flow_m3h >= 100.0 - 1e-9 && s.pump_flow_m3h <= 10_000.0 + 1e-9);
            assert!(s.level_m >= 0.5 - 1e-6 && s.level_m <= 30.0 + 1e-6);
        }
        let flows = t.pump_flows();
        let cheap: f64 = flows[..4].iter().sum();
        let expensive: f64 = flows[4..].iter().sum();
        assert!(cheap > 2.0 * expensive, "cheap {cheap}, expensive {expensive}");
        assert_eq!(t.geometry_fidelity, GeometryFidelity::Calibrated);
        assert_eq!(t.terminal_mode, TerminalMode::Hard);
    }

    #[test]
    fn test_unreachable_drawdown_is_infeasible_in_hard_mode() {
        let p = problem(100_000.0, vec![1000.0; 3], vec![0.1; 3]);
        assert!(matches!(
            engine(TerminalMode::Hard).solve(&p),
            Err(MpcError::InfeasibleProblem(_))
        ));
    }

    #[test]
    fn test_penalty_mode_never_infeasible_on_target() {
        let p = problem(100_000.0, vec![1000.0; 3], vec![0.1; 3]);
        let t = engine(TerminalMode::Penalty { weight: 1e3 }).solve(&p).unwrap();
        assert!(t.levels()[2] < 9.6);
        assert!((t.pump_flows()[2] - 100.0).abs() < 1e-6);
    }

    /// Returns the warm start with a fixed status and violation.
    struct Canned {
        status: SolveStatus,
        violation: f64,
    }

    impl NlpSolver for Canned {
        fn name(&self) -> &'static str {
            "canned"
        }

        fn solve(&self, program: &dyn NonlinearProgram, start: &[f64], _budget: &SolveBudget) -> SolverOutcome {
            SolverOutcome {
                x: start.to_vec(),
                diagnostics: SolverDiagnostics {
                    solver: self.name().to_string(),
                    status: self.status,
                    outer_iterations: 1,
                    inner_iterations: 0,
                    constraint_violation: self.violation,
                    stationarity: 1.0,
                    objective: program.objective(start),
                    elapsed_ms: 0,
                },
            }
        }
    }

    fn canned(status: SolveStatus, violation: f64) -> Box<dyn NlpSolver> {
        Box::new(Canned { status, violation })
    }

    #[test]
    fn test_non_convergence_carries_diagnostics() {
        let e = engine(TerminalMode::Hard).with_solver(canned(SolveStatus::IterationLimit, 0.0));
        let p = problem(8_000.0, vec![1000.0; 8], vec![0.1; 8]);
        match e.solve(&p) {
            Err(MpcError::SolverNonConvergence { diagnostics }) => {
                assert_eq!(diagnostics.status, SolveStatus::IterationLimit);
                assert_eq!(diagnostics.solver, "canned");
            }
            other => panic!("expected non-convergence, got {other:?}"),
        }
    }

    #[test]
    fn test_feasible_stall_is_accepted_and_reported() {
        let e = engine(TerminalMode::Hard).with_solver(canned(SolveStatus::Stalled, 1e-9));
        let p = problem(8_000.0, vec![1000.0; 8], vec![0.1; 8]);
        let t = e.solve(&p).unwrap();
        assert_eq!(t.diagnostics.status, SolveStatus::Stalled);
        assert!((t.levels()[7] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_infeasible_stall_is_non_convergence() {
        let e = engine(TerminalMode::Hard).with_solver(canned(SolveStatus::Stalled, 1e-2));
        let p = problem(8_000.0, vec![1000.0; 8], vec![0.1; 8]);
        assert!(matches!(e.solve(&p), Err(MpcError::SolverNonConvergence { .. })));
    }

    fn calibration_geometry() -> TankGeometry {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/data/tunnel_calibration.csv");
        TankGeometry::from_table(&CalibrationTable::from_csv_path(path).unwrap())
    }

    #[test]
    fn test_gradient_is_consistent_across_calibration_knots() {
        let g = calibration_geometry();
        let pm = PowerModel::default();
        // the early volumes fall inside the blend around the 5_200 m³ knot
        let p = problem(4_000.0, vec![6_000.0, 6_000.0, 9_000.0, 9_000.0, 500.0, 500.0], vec![0.05; 6]);
        for terminal in [TerminalMode::Hard, TerminalMode::Penalty { weight: 40.0 }] {
            let l = VolumeLimits::new(&MpcConstraints::default(), &g, terminal);
            let prog = TunnelProgram::new(&p, &g, &pm, l, terminal, 0.5, 1e-7);
            let x = [1_000.0, 2_000.0, 1_500.0, 300.0, 4_000.0, 700.0];
            let mut grad = vec![0.0; 6];
            prog.objective_gradient(&x, &mut grad);
            for j in 0..6 {
                let fd = finite_difference(|y| prog.objective(y), &x, j);
                assert!((grad[j] - fd).abs() <= 1e-6 * fd.abs().max(1.0), "j={j}: {} vs {fd}", grad[j]);
            }
        }
    }

    #[test]
    fn test_calibrated_hard_terminal_converges() {
        let g = calibration_geometry();
        let e = MpcEngine::new(
            g.clone(),
            PowerModel::default(),
            MpcConstraints::default(),
            TerminalMode::Hard,
            1e-7,
            SolveBudget::default(),
        );
        let price: Vec<f64> = (0..96)
            .map(|k| 0.06 + 0.04 * (2.0 * std::f64::consts::PI * k as f64 / 96.0).sin())
            .collect();
        let p = problem(g.volume_of(4.0), vec![900.0; 96], price);
        let t = e.solve(&p).unwrap();
        assert!((t.levels()[95] - 0.5).abs() < 1e-6);
        if t.diagnostics.status == SolveStatus::Converged {
            assert!(t.diagnostics.stationarity <= SolveBudget::default().optimality_tolerance);
        }
    }

    #[test]
    fn test_rejects_non_positive_penalty() {
        let p = problem(8_000.0, vec![1000.0; 8], vec![0.1; 8]);
        assert!(matches!(
            engine(TerminalMode::Penalty { weight: 0.0 }).solve(&p),
            Err(MpcError::InvalidInput(_))
        ));
    }
}
