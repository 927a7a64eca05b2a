//! Augmented-Lagrangian backend
//!
//! Outer loop: Powell–Hestenes–Rockafellar multiplier updates with a penalty
//! that grows whenever the constraint violation fails to shrink fast enough.
//! Inner loop: projected Barzilai–Borwein gradient descent on the box mapped
//! to the unit cube, so that every variable sees steps of comparable size
//! regardless of its physical unit. Steps are accepted by a non-monotone
//! Armijo test against the worst of the last few values, which keeps long BB
//! steps alive where the curvature changes abruptly.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::nlp::{max_violation, NlpSolver, NonlinearProgram, SolveBudget, SolveStatus, SolverDiagnostics, SolverOutcome};

const MIN_BB_STEP: f64 = 1e-10;
const MAX_BB_STEP: f64 = 1e10;
/// Step used when the last move showed non-positive curvature
const FALLBACK_BB_STEP: f64 = 1e3;
const FIRST_INNER_TOLERANCE: f64 = 1e-1;
/// Values remembered by the non-monotone acceptance test
const NONMONOTONE_MEMORY: usize = 10;
/// Consecutive stalls at a feasible point before giving up on stationarity
const MAX_FEASIBLE_STALLS: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct AugmentedLagrangianSolver {
    pub initial_penalty: f64,
    pub penalty_growth: f64,
    pub max_penalty: f64,
    /// Required violation ratio between outer iterations before the penalty grows
    pub required_decrease: f64,
    pub armijo: f64,
    pub max_backtracks: usize,
}

impl Default for AugmentedLagrangianSolver {
    fn default() -> Self {
        Self {
            initial_penalty: 10.0,
            penalty_growth: 10.0,
            max_penalty: 1e8,
            required_decrease: 0.25,
            armijo: 1e-4,
            max_backtracks: 40,
        }
    }
}

/// Affine map between the variable box and [0, 1]ⁿ. Fixed variables have zero width.
struct UnitBox {
    lower: Vec<f64>,
    width: Vec<f64>,
}

impl UnitBox {
    fn new(lower: &[f64], upper: &[f64]) -> Self {
        Self {
            lower: lower.to_vec(),
            width: lower.iter().zip(upper).map(|(l, u)| (u - l).max(0.0)).collect(),
        }
    }

    fn to_x(&self, u: &[f64], x: &mut [f64]) {
        for i in 0..x.len() {
            x[i] = self.lower[i] + self.width[i] * u[i];
        }
    }

    fn to_unit(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(self.lower.iter().zip(&self.width))
            .map(|(xi, (l, w))| if *w > 0.0 { ((xi - l) / w).clamp(0.0, 1.0) } else { 0.0 })
            .collect()
    }
}

/// PHR augmented Lagrangian of a program, evaluated in unit-box coordinates
struct Lagrangian<'a> {
    program: &'a dyn NonlinearProgram,
    unit_box: &'a UnitBox,
    objective_scale: f64,
    lambda: Vec<f64>,
    nu: Vec<f64>,
    penalty: f64,
    x: Vec<f64>,
    eq: Vec<f64>,
    ineq: Vec<f64>,
    eq_weights: Vec<f64>,
    ineq_weights: Vec<f64>,
    grad_x: Vec<f64>,
}

impl<'a> Lagrangian<'a> {
    fn new(program: &'a dyn NonlinearProgram, unit_box: &'a UnitBox, objective_scale: f64, penalty: f64) -> Self {
        let n = program.dimension();
        let m_eq = program.num_equalities();
        let m_in = program.num_inequalities();
        Self {
            program,
            unit_box,
            objective_scale,
            lambda: vec![0.0; m_eq],
            nu: vec![0.0; m_in],
            penalty,
            x: vec![0.0; n],
            eq: vec![0.0; m_eq],
            ineq: vec![0.0; m_in],
            eq_weights: vec![0.0; m_eq],
            ineq_weights: vec![0.0; m_in],
            grad_x: vec![0.0; n],
        }
    }

    fn value(&mut self, u: &[f64]) -> f64 {
        self.unit_box.to_x(u, &mut self.x);
        self.program.equalities(&self.x, &mut self.eq);
        self.program.inequalities(&self.x, &mut self.ineq);

        let mu = self.penalty;
        let mut value = self.program.objective(&self.x) / self.objective_scale;
        for (l, c) in self.lambda.iter().zip(&self.eq) {
            value += l * c + 0.5 * mu * c * c;
        }
        for (n, g) in self.nu.iter().zip(&self.ineq) {
            let shifted = (n + mu * g).max(0.0);
            value += (shifted * shifted - n * n) / (2.0 * mu);
        }
        value
    }

    fn value_and_gradient(&mut self, u: &[f64], grad_u: &mut [f64]) -> f64 {
        let value = self.value(u);
        let mu = self.penalty;

        self.program.objective_gradient(&self.x, &mut self.grad_x);
        for g in &mut self.grad_x {
            *g /= self.objective_scale;
        }
        for ((w, l), c) in self.eq_weights.iter_mut().zip(&self.lambda).zip(&self.eq) {
            *w = l + mu * c;
        }
        self.program.equality_vjp(&self.x, &self.eq_weights, &mut self.grad_x);
        for ((w, n), g) in self.ineq_weights.iter_mut().zip(&self.nu).zip(&self.ineq) {
            *w = (n + mu * g).max(0.0);
        }
        self.program.inequality_vjp(&self.x, &self.ineq_weights, &mut self.grad_x);

        for (gu, (gx, w)) in grad_u.iter_mut().zip(self.grad_x.iter().zip(&self.unit_box.width)) {
            *gu = gx * w;
        }
        value
    }

    /// Violation at the point most recently passed to `value`.
    fn violation(&self) -> f64 {
        max_violation(&self.eq, &self.ineq)
    }

    fn update_multipliers(&mut self) {
        let mu = self.penalty;
        for (l, c) in self.lambda.iter_mut().zip(&self.eq) {
            *l += mu * c;
        }
        for (n, g) in self.nu.iter_mut().zip(&self.ineq) {
            *n = (*n + mu * g).max(0.0);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InnerStop {
    Stationary,
    Stalled,
    Budget,
    Deadline,
    NonFinite,
}

struct InnerResult {
    stop: InnerStop,
    iterations: usize,
    stationarity: f64,
}

/// ‖P(u − ∇) − u‖∞ on the unit box
fn projected_gradient_norm(u: &[f64], grad: &[f64]) -> f64 {
    u.iter()
        .zip(grad)
        .fold(0.0_f64, |m, (ui, gi)| m.max(((ui - gi).clamp(0.0, 1.0) - ui).abs()))
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

impl AugmentedLagrangianSolver {
    fn minimise(
        &self,
        lagrangian: &mut Lagrangian<'_>,
        u: &mut Vec<f64>,
        tolerance: f64,
        max_iterations: usize,
        deadline: Option<Instant>,
    ) -> InnerResult {
        let n = u.len();
        let mut grad = vec![0.0; n];
        let mut value = lagrangian.value_and_gradient(u, &mut grad);
        let mut trial = vec![0.0; n];
        let mut trial_grad = vec![0.0; n];
        let mut direction = vec![0.0; n];
        let mut step = 1.0;
        let mut iterations = 0;
        let mut recent = VecDeque::with_capacity(NONMONOTONE_MEMORY);
        recent.push_back(value);

        let stop = loop {
            if !value.is_finite() || grad.iter().any(|g| !g.is_finite()) {
                break InnerStop::NonFinite;
            }
            if projected_gradient_norm(u, &grad) <= tolerance {
                break InnerStop::Stationary;
            }
            if iterations >= max_iterations {
                break InnerStop::Budget;
            }
            if past(deadline) {
                break InnerStop::Deadline;
            }
            iterations += 1;

            for i in 0..n {
                direction[i] = (u[i] - step * grad[i]).clamp(0.0, 1.0) - u[i];
            }
            let slope: f64 = direction.iter().zip(&grad).map(|(d, g)| d * g).sum();
            if slope >= 0.0 {
                break InnerStop::Stalled;
            }

            let reference = recent.iter().copied().fold(value, f64::max);
            let mut t = 1.0;
            let mut accepted = false;
            for _ in 0..=self.max_backtracks {
                for i in 0..n {
                    trial[i] = (u[i] + t * direction[i]).clamp(0.0, 1.0);
                }
                let v = lagrangian.value(&trial);
                if v.is_finite() && v <= reference + self.armijo * t * slope {
                    accepted = true;
                    break;
                }
                t *= 0.5;
            }
            if !accepted {
                break InnerStop::Stalled;
            }

            let new_value = lagrangian.value_and_gradient(&trial, &mut trial_grad);
            let (mut ss, mut sy) = (0.0, 0.0);
            for i in 0..n {
                let s = trial[i] - u[i];
                ss += s * s;
                sy += s * (trial_grad[i] - grad[i]);
            }
            step = if sy > 0.0 { ss / sy } else { FALLBACK_BB_STEP }.clamp(MIN_BB_STEP, MAX_BB_STEP);

            let change = (value - new_value).abs();
            std::mem::swap(u, &mut trial);
            std::mem::swap(&mut grad, &mut trial_grad);
            value = new_value;
            if recent.len() == NONMONOTONE_MEMORY {
                recent.pop_front();
            }
            recent.push_back(value);
            if change <= f64::EPSILON * value.abs().max(1.0) {
                break InnerStop::Stalled;
            }
        };

        // Leave the Lagrangian's constraint buffers describing `u`.
        lagrangian.value(u);
        InnerResult {
            stop,
            iterations,
            stationarity: projected_gradient_norm(u, &grad),
        }
    }
}

impl NlpSolver for AugmentedLagrangianSolver {
    fn name(&self) -> &'static str {
        "augmented-lagrangian/projected-bb"
    }

    fn solve(&self, program: &dyn NonlinearProgram, start: &[f64], budget: &SolveBudget) -> SolverOutcome {
        let started = Instant::now();
        let deadline = started.checked_add(budget.time_limit);
        let n = program.dimension();
        let unit_box = UnitBox::new(program.lower_bounds(), program.upper_bounds());
        let mut u = unit_box.to_unit(start);
        let mut x = vec![0.0; n];
        unit_box.to_x(&u, &mut x);

        let mut grad = vec![0.0; n];
        program.objective_gradient(&x, &mut grad);
        let scaled_grad = grad
            .iter()
            .zip(&unit_box.width)
            .fold(0.0_f64, |m, (g, w)| m.max((g * w).abs()));
        let objective_scale = if scaled_grad.is_finite() { scaled_grad.max(1.0) } else { 1.0 };

        let mut lagrangian = Lagrangian::new(program, &unit_box, objective_scale, self.initial_penalty);
        let mut inner_total = 0;
        let mut outer = 0;
        let mut tolerance = FIRST_INNER_TOLERANCE.max(budget.optimality_tolerance);
        let mut previous_violation = f64::INFINITY;
        let mut stationarity = f64::INFINITY;
        let mut feasible_stalls = 0;

        let status = loop {
            if outer >= budget.max_outer_iterations {
                break SolveStatus::IterationLimit;
            }
            outer += 1;

            let remaining = budget.max_inner_iterations.saturating_sub(inner_total);
            let inner = self.minimise(&mut lagrangian, &mut u, tolerance, remaining, deadline);
            inner_total += inner.iterations;
            stationarity = inner.stationarity;
            let violation = lagrangian.violation();

            trace!(
                outer,
                inner = inner.iterations,
                stop = ?inner.stop,
                violation,
                stationarity,
                penalty = lagrangian.penalty,
                "augmented lagrangian iteration"
            );

            match inner.stop {
                InnerStop::NonFinite => break SolveStatus::NumericalFailure,
                InnerStop::Deadline => break SolveStatus::TimeLimit,
                _ => {}
            }
            let feasible = violation <= budget.feasibility_tolerance;
            if feasible && stationarity <= budget.optimality_tolerance {
                break SolveStatus::Converged;
            }
            if inner.stop == InnerStop::Budget {
                break SolveStatus::IterationLimit;
            }
            if feasible && inner.stop == InnerStop::Stalled {
                feasible_stalls += 1;
                if feasible_stalls >= MAX_FEASIBLE_STALLS {
                    break SolveStatus::Stalled;
                }
            } else {
                feasible_stalls = 0;
            }

            lagrangian.update_multipliers();
            if violation > self.required_decrease * previous_violation {
                lagrangian.penalty = (lagrangian.penalty * self.penalty_growth).min(self.max_penalty);
            }
            previous_violation = violation;
            tolerance = (tolerance * 0.1).max(budget.optimality_tolerance);
        };

        unit_box.to_x(&u, &mut x);
        let mut eq = vec![0.0; program.num_equalities()];
        let mut ineq = vec![0.0; program.num_inequalities()];
        program.equalities(&x, &mut eq);
        program.inequalities(&x, &mut ineq);
        let elapsed: Duration = started.elapsed();

        let diagnostics = SolverDiagnostics {
            solver: self.name().to_string(),
            status,
            outer_iterations: outer,
            inner_iterations: inner_total,
            constraint_violation: max_violation(&eq, &ineq),
            stationarity,
            objective: program.objective(&x),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        };
        debug!(
            status = ?diagnostics.status,
            outer = diagnostics.outer_iterations,
            inner = diagnostics.inner_iterations,
            violation = diagnostics.constraint_violation,
            stationarity = diagnostics.stationarity,
            elapsed_ms = diagnostics.elapsed_ms,
            "nlp solve finished"
        );
        SolverOutcome { x, diagnostics }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// min (x0 − a)² + (x1 − b)² on [lo, hi]², with optional x0 + x1 = s or x0 + x1 ≤ s
    struct Quadratic {
        target: [f64; 2],
        lower: Vec<f64>,
        upper: Vec<f64>,
        sum_equals: Option<f64>,
        sum_at_most: Option<f64>,
    }

    impl Quadratic {
        fn new(target: [f64; 2], lo: f64, hi: f64) -> Self {
            Self {
                target,
                lower: vec![lo; 2],
                upper: vec![hi; 2],
                sum_equals: None,
                sum_at_most: None,
            }
        }
    }

    impl NonlinearProgram for Quadratic {
        fn dimension(&self) -> usize {
            2
        }

        fn lower_bounds(&self) -> &[f64] {
            &self.lower
        }

        fn upper_bounds(&self) -> &[f64] {
            &self.upper
        }

        fn objective(&self, x: &[f64]) -> f64 {
            (x[0] - self.target[0]).powi(2) + (x[1] - self.target[1]).powi(2)
        }

        fn objective_gradient(&self, x: &[f64], grad: &mut [f64]) {
            grad[0] = 2.0 * (x[0] - self.target[0]);
            grad[1] = 2.0 * (x[1] - self.target[1]);
        }

        fn num_equalities(&self) -> usize {
            usize::from(self.sum_equals.is_some())
        }

        fn num_inequalities(&self) -> usize {
            usize::from(self.sum_at_most.is_some())
        }

        fn equalities(&self, x: &[f64], out: &mut [f64]) {
            if let Some(s) = self.sum_equals {
                out[0] = x[0] + x[1] - s;
            }
        }

        fn inequalities(&self, x: &[f64], out: &mut [f64]) {
            if let Some(s) = self.sum_at_most {
                out[0] = x[0] + x[1] - s;
            }
        }

        fn equality_vjp(&self, _x: &[f64], weights: &[f64], grad: &mut [f64]) {
            if self.sum_equals.is_some() {
                grad[0] += weights[0];
                grad[1] += weights[0];
            }
        }

        fn inequality_vjp(&self, _x: &[f64], weights: &[f64], grad: &mut [f64]) {
            if self.sum_at_most.is_some() {
                grad[0] += weights[0];
                grad[1] += weights[0];
            }
        }
    }

    fn solve(p: &Quadratic, start: &[f64], budget: &SolveBudget) -> SolverOutcome {
        AugmentedLagrangianSolver::default().solve(p, start, budget)
    }

    #[test]
    fn test_bound_constrained_minimum() {
        let p = Quadratic::new([3.0, -1.0], 0.0, 2.0);
        let out = solve(&p, &[1.0, 1.0], &SolveBudget::default());

        assert_eq!(out.diagnostics.status, SolveStatus::Converged);
        assert!((out.x[0] - 2.0).abs() < 1e-9);
        assert!(out.x[1].abs() < 1e-9);
    }

    #[test]
    fn test_equality_constrained_minimum() {
        let mut p = Quadratic::new([0.0, 0.0], -10.0, 10.0);
        p.sum_equals = Some(1.0);
        let out = solve(&p, &[0.0, 0.0], &SolveBudget::default());

        assert_eq!(out.diagnostics.status, SolveStatus::Converged);
        assert!(out.diagnostics.constraint_violation <= 1e-6);
        assert!((out.x[0] - 0.5).abs() < 1e-4);
        assert!((out.x[1] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_inequality_constrained_minimum() {
        let mut p = Quadratic::new([2.0, 2.0], -10.0, 10.0);
        p.sum_at_most = Some(2.0);
        let out = solve(&p, &[-3.0, 0.0], &SolveBudget::default());

        assert!(out.diagnostics.status.is_converged());
        assert!(out.x[0] + out.x[1] <= 2.0 + 1e-6);
        assert!((out.x[0] - 1.0).abs() < 1e-3);
        assert!((out.x[1] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_inactive_inequality_is_ignored() {
        let mut p = Quadratic::new([0.5, 0.5], -10.0, 10.0);
        p.sum_at_most = Some(5.0);
        let out = solve(&p, &[4.0, -4.0], &SolveBudget::default());

        assert!(out.diagnostics.status.is_converged());
        assert!((out.x[0] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_outer_iteration_limit() {
        let mut p = Quadratic::new([0.0, 0.0], -10.0, 10.0);
        p.sum_equals = Some(1.0);
        let budget = SolveBudget {
            max_outer_iterations: 1,
            ..Default::default()
        };
        let out = solve(&p, &[0.0, 0.0], &budget);
        assert_eq!(out.diagnostics.status, SolveStatus::IterationLimit);
        assert_eq!(out.diagnostics.outer_iterations, 1);
    }

    #[test]
    fn test_time_limit() {
        let mut p = Quadratic::new([0.0, 0.0], -10.0, 10.0);
        p.sum_equals = Some(1.0);
        let budget = SolveBudget {
            time_limit: Duration::ZERO,
            ..Default::default()
        };
        let out = solve(&p, &[0.0, 0.0], &budget);
        assert_eq!(out.diagnostics.status, SolveStatus::TimeLimit);
    }

    #[test]
    fn test_start_outside_box_is_projected() {
        let p = Quadratic::new([1.0, 1.0], 0.0, 2.0);
        let out = solve(&p, &[50.0, -50.0], &SolveBudget::default());
        assert!(out.x.iter().all(|v| (0.0..=2.0).contains(v)));
        assert!((out.x[0] - 1.0).abs() < 1e-6);
    }

    /// Flat objective whose gradient always points out of the box interior.
    struct Misleading {
        lower: Vec<f64>,
        upper: Vec<f64>,
    }

    impl NonlinearProgram for Misleading {
        fn dimension(&self) -> usize {
            2
        }

        fn lower_bounds(&self) -> &[f64] {
            &self.lower
        }

        fn upper_bounds(&self) -> &[f64] {
            &self.upper
        }

        fn objective(&self, _x: &[f64]) -> f64 {
            1.0
        }

        fn objective_gradient(&self, _x: &[f64], grad: &mut [f64]) {
            grad[0] = 1.0;
            grad[1] = -1.0;
        }
    }

    #[test]
    fn test_stall_is_not_reported_as_converged() {
        let p = Misleading {
            lower: vec![0.0; 2],
            upper: vec![1.0; 2],
        };
        let out = AugmentedLagrangianSolver::default().solve(&p, &[0.5, 0.5], &SolveBudget::default());

        assert_eq!(out.diagnostics.status, SolveStatus::Stalled);
        assert!(out.diagnostics.stationarity > SolveBudget::default().optimality_tolerance);
        assert_eq!(out.diagnostics.outer_iterations, MAX_FEASIBLE_STALLS);
        assert_eq!(out.x, vec![0.5, 0.5]);
    }

    #[test]
    fn test_converged_implies_stationary() {
        let mut p = Quadratic::new([2.0, 2.0], -10.0, 10.0);
        p.sum_at_most = Some(2.0);
        let budget = SolveBudget::default();
        let out = solve(&p, &[-3.0, 0.0], &budget);
        assert_eq!(out.diagnostics.status, SolveStatus::Converged);
        assert!(out.diagnostics.stationarity <= budget.optimality_tolerance);
    }

    #[test]
    fn test_fixed_variables() {
        let p = Quadratic::new([3.0, 3.0], 1.0, 1.0);
        let out = solve(&p, &[0.0, 0.0], &SolveBudget::default());
        assert_eq!(out.diagnostics.status, SolveStatus::Converged);
        assert_eq!(out.x, vec![1.0, 1.0]);
    }
}
