//! Nonlinear-program contract consumed by the continuation driver, plus a
//! dense SQP solver implementing it.
//!
//! Problems are stated as
//!
//! ```text
//! minimise f(z)  subject to  cl <= g(z) <= cu,  zl <= z <= zu
//! ```
//!
//! Multipliers follow the stationarity convention
//! `grad f + J^T equality_duals + bound_duals = 0`.

use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Lower/upper arrays parallel to a variable or constraint vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl Bounds {
    pub fn unbounded(len: usize) -> Self {
        Self {
            lower: vec![f64::NEG_INFINITY; len],
            upper: vec![f64::INFINITY; len],
        }
    }

    /// `lower == upper == values`.
    pub fn equality(values: Vec<f64>) -> Self {
        Self {
            lower: values.clone(),
            upper: values,
        }
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    pub fn set(&mut self, index: usize, lower: f64, upper: f64) {
        self.lower[index] = lower;
        self.upper[index] = upper;
    }

    pub fn fix(&mut self, index: usize, value: f64) {
        self.set(index, value, value);
    }

    pub fn is_fixed(&self, index: usize) -> bool {
        self.lower[index] == self.upper[index]
    }

    /// Appends one entry (used for the homotopy slot).
    pub fn push(&mut self, lower: f64, upper: f64) {
        self.lower.push(lower);
        self.upper.push(upper);
    }

    pub fn clamp(&self, index: usize, value: f64) -> f64 {
        value.max(self.lower[index]).min(self.upper[index])
    }

    pub(crate) fn check(&self, expected: usize, what: &str) -> Result<()> {
        if self.lower.len() != expected || self.upper.len() != expected {
            bail!(
                "{} bounds have lengths {}/{} but {} entries are required",
                what,
                self.lower.len(),
                self.upper.len(),
                expected
            );
        }
        if let Some(i) = (0..expected).find(|&i| !(self.lower[i] <= self.upper[i])) {
            bail!(
                "{} bound {} is empty: [{}, {}]",
                what,
                i,
                self.lower[i],
                self.upper[i]
            );
        }
        Ok(())
    }
}

/// Primal point and multipliers used to start a solve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarmStart {
    pub primal: Vec<f64>,
    pub equality_duals: Vec<f64>,
    pub bound_duals: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverStatus {
    Optimal,
    Acceptable,
    Infeasible,
    IterationLimit,
    NumericalError,
}

impl SolverStatus {
    /// Optimal and acceptable solves may be continued from.
    pub fn is_success(self) -> bool {
        matches!(self, SolverStatus::Optimal | SolverStatus::Acceptable)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NlpSolution {
    pub primal: Vec<f64>,
    pub equality_duals: Vec<f64>,
    pub bound_duals: Vec<f64>,
    pub objective: f64,
    pub status: SolverStatus,
    pub iterations: usize,
}

impl NlpSolution {
    pub fn warm_start(&self) -> WarmStart {
        WarmStart {
            primal: self.primal.clone(),
            equality_duals: self.equality_duals.clone(),
            bound_duals: self.bound_duals.clone(),
        }
    }
}

/// Callbacks describing one nonlinear program.
pub trait NlpProblem {
    fn num_variables(&self) -> usize;

    fn num_constraints(&self) -> usize;

    fn objective(&mut self, z: &[f64]) -> Result<f64>;

    fn gradient(&mut self, z: &[f64]) -> Result<Vec<f64>>;

    /// Hessian of the objective (dense, symmetric).
    fn hessian(&mut self, z: &[f64]) -> Result<DMatrix<f64>>;

    fn constraints(&mut self, z: &[f64]) -> Result<Vec<f64>>;

    /// Constraint Jacobian, `num_constraints x num_variables`.
    fn jacobian(&mut self, z: &[f64]) -> Result<DMatrix<f64>>;
}

/// A black-box NLP solver.
///
/// `Err` is reserved for failures of the adapter itself (bad input,
/// library errors); an unsuccessful but well-formed solve is reported
/// through [`NlpSolution::status`].
pub trait NlpSolver {
    fn solve(
        &mut self,
        problem: &mut dyn NlpProblem,
        variable_bounds: &Bounds,
        constraint_bounds: &Bounds,
        warm_start: Option<&WarmStart>,
    ) -> Result<NlpSolution>;
}

/// Settings for [`SqpSolver`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SqpSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub acceptable_tolerance: f64,
    /// Diagonal shift added to the objective Hessian.
    pub regularization: f64,
    pub min_step: f64,
    /// Optional per-solve wall-clock limit in seconds.
    #[serde(default)]
    pub max_wall_time: Option<f64>,
}

impl Default for SqpSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-9,
            acceptable_tolerance: 1e-6,
            regularization: 1e-9,
            min_step: 1e-10,
            max_wall_time: None,
        }
    }
}

/// Dense equality-constrained SQP with a Newton-KKT step, bound projection
/// and an l1 merit line search.
///
/// Variables with equal bounds are eliminated from the step. Only equality
/// constraints are supported; the Hessian is that of the objective alone,
/// so constraint curvature is handled by the Newton iteration on `g`.
#[derive(Debug, Clone, Default)]
pub struct SqpSolver {
    pub settings: SqpSettings,
}

impl SqpSolver {
    pub fn new(settings: SqpSettings) -> Self {
        Self { settings }
    }
}

struct Iterate {
    f: f64,
    grad: Vec<f64>,
    residual: Vec<f64>,
    jac: DMatrix<f64>,
}

fn evaluate(problem: &mut dyn NlpProblem, z: &[f64], target: &[f64]) -> Result<Iterate> {
    let f = problem.objective(z)?;
    let grad = problem.gradient(z)?;
    let g = problem.constraints(z)?;
    let jac = problem.jacobian(z)?;
    if grad.len() != z.len() || g.len() != target.len() {
        bail!(
            "problem returned gradient/constraints of lengths {}/{}, expected {}/{}",
            grad.len(),
            g.len(),
            z.len(),
            target.len()
        );
    }
    if jac.nrows() != target.len() || jac.ncols() != z.len() {
        bail!(
            "constraint Jacobian is {}x{}, expected {}x{}",
            jac.nrows(),
            jac.ncols(),
            target.len(),
            z.len()
        );
    }
    let residual = g.iter().zip(target).map(|(gi, ti)| gi - ti).collect();
    Ok(Iterate {
        f,
        grad,
        residual,
        jac,
    })
}

fn norm_inf(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}

fn norm_1(v: &[f64]) -> f64 {
    v.iter().map(|x| x.abs()).sum()
}

fn all_finite(v: &[f64]) -> bool {
    v.iter().all(|x| x.is_finite())
}

/// `grad f + J^T nu`.
fn lagrangian_gradient(it: &Iterate, nu: &[f64]) -> Vec<f64> {
    let mut out = it.grad.clone();
    for (i, &mult) in nu.iter().enumerate() {
        if mult == 0.0 {
            continue;
        }
        for (j, o) in out.iter_mut().enumerate() {
            *o += it.jac[(i, j)] * mult;
        }
    }
    out
}

impl NlpSolver for SqpSolver {
    fn solve(
        &mut self,
        problem: &mut dyn NlpProblem,
        variable_bounds: &Bounds,
        constraint_bounds: &Bounds,
        warm_start: Option<&WarmStart>,
    ) -> Result<NlpSolution> {
        let settings = self.settings;
        let n = problem.num_variables();
        let m = problem.num_constraints();
        variable_bounds.check(n, "variable")?;
        constraint_bounds.check(m, "constraint")?;
        if let Some(i) = (0..m).find(|&i| !constraint_bounds.is_fixed(i)) {
            bail!(
                "constraint {} has bounds [{}, {}]; this solver handles equality constraints only",
                i,
                constraint_bounds.lower[i],
                constraint_bounds.upper[i]
            );
        }
        let target = &constraint_bounds.lower;
        let started = Instant::now();

        let mut z: Vec<f64> = match warm_start {
            Some(ws) if ws.primal.len() == n => ws.primal.clone(),
            Some(ws) if !ws.primal.is_empty() => {
                bail!("warm start has {} entries, expected {}", ws.primal.len(), n)
            }
            _ => vec![0.0; n],
        };
        for (i, zi) in z.iter_mut().enumerate() {
            *zi = variable_bounds.clamp(i, *zi);
        }
        let mut nu: Vec<f64> = match warm_start {
            Some(ws) if ws.equality_duals.len() == m => ws.equality_duals.clone(),
            _ => vec![0.0; m],
        };

        let fixed: Vec<bool> = (0..n).map(|i| variable_bounds.is_fixed(i)).collect();
        let mut penalty: f64 = 1.0;
        let mut it = evaluate(problem, &z, target)?;

        let finish = |z: Vec<f64>, nu: Vec<f64>, it: &Iterate, status, iterations| {
            let stationarity = lagrangian_gradient(it, &nu);
            let bound_duals = (0..n)
                .map(|i| {
                    let at_lower = z[i] <= variable_bounds.lower[i];
                    let at_upper = z[i] >= variable_bounds.upper[i];
                    if at_lower || at_upper {
                        -stationarity[i]
                    } else {
                        0.0
                    }
                })
                .collect();
            NlpSolution {
                primal: z,
                equality_duals: nu,
                bound_duals,
                objective: it.f,
                status,
                iterations,
            }
        };

        for iteration in 0..settings.max_iterations {
            if !it.f.is_finite() || !all_finite(&it.grad) || !all_finite(&it.residual) {
                debug!(iteration, "non-finite problem evaluation");
                return Ok(finish(z, nu, &it, SolverStatus::NumericalError, iteration));
            }
            if let Some(limit) = settings.max_wall_time {
                if started.elapsed().as_secs_f64() > limit {
                    debug!(iteration, limit, "wall-clock limit reached");
                    return Ok(finish(z, nu, &it, SolverStatus::IterationLimit, iteration));
                }
            }

            // Active set: fixed variables plus bounds the multiplier estimate pushes against.
            let lag_grad = lagrangian_gradient(&it, &nu);
            let active: Vec<usize> = (0..n)
                .filter(|&i| {
                    fixed[i]
                        || (z[i] <= variable_bounds.lower[i] && lag_grad[i] > 0.0)
                        || (z[i] >= variable_bounds.upper[i] && lag_grad[i] < 0.0)
                })
                .collect();
            let free: Vec<usize> = (0..n).filter(|i| active.binary_search(i).is_err()).collect();

            let primal_inf = norm_inf(&it.residual);
            let dual_inf = norm_inf(&free.iter().map(|&i| lag_grad[i]).collect::<Vec<_>>());
            debug!(iteration, objective = it.f, primal_inf, dual_inf, "sqp iterate");
            if primal_inf <= settings.tolerance && dual_inf <= settings.tolerance {
                return Ok(finish(z, nu, &it, SolverStatus::Optimal, iteration));
            }

            let hessian = problem.hessian(&z)?;
            let nf = free.len();
            let step = match kkt_step(&hessian, &it, &free, settings.regularization) {
                Some(step) => step,
                None => {
                    debug!(iteration, "singular KKT system");
                    return Ok(finish(z, nu, &it, SolverStatus::NumericalError, iteration));
                }
            };
            let d_free: Vec<f64> = step.rows(0, nf).iter().copied().collect();
            let nu_new: Vec<f64> = step.rows(nf, m).iter().copied().collect();

            penalty = penalty.max(norm_inf(&nu_new) + 1.0);
            let merit = it.f + penalty * norm_1(&it.residual);
            let slope: f64 = free
                .iter()
                .zip(&d_free)
                .map(|(&i, d)| it.grad[i] * d)
                .sum::<f64>()
                - penalty * norm_1(&it.residual);

            let mut alpha = 1.0;
            let accepted = loop {
                let mut trial = z.clone();
                for (&i, d) in free.iter().zip(&d_free) {
                    trial[i] = variable_bounds.clamp(i, z[i] + alpha * d);
                }
                let trial_it = evaluate(problem, &trial, target)?;
                let trial_merit = trial_it.f + penalty * norm_1(&trial_it.residual);
                trace!(alpha, trial_merit, merit, "line search");
                if trial_merit.is_finite() && trial_merit <= merit + 1e-4 * alpha * slope.min(0.0)
                {
                    break Some((trial, trial_it));
                }
                alpha *= 0.5;
                if alpha < settings.min_step {
                    break None;
                }
            };

            match accepted {
                Some((trial, trial_it)) => {
                    z = trial;
                    it = trial_it;
                    nu = nu_new;
                }
                None => {
                    let status = if primal_inf > settings.acceptable_tolerance {
                        SolverStatus::Infeasible
                    } else if dual_inf <= settings.acceptable_tolerance {
                        SolverStatus::Acceptable
                    } else {
                        SolverStatus::NumericalError
                    };
                    debug!(iteration, ?status, "line search stalled");
                    return Ok(finish(z, nu_new, &it, status, iteration + 1));
                }
            }
        }

        let lag_grad = lagrangian_gradient(&it, &nu);
        let dual_inf = (0..n)
            .filter(|&i| !fixed[i])
            .filter(|&i| variable_bounds.lower[i] < z[i] && z[i] < variable_bounds.upper[i])
            .fold(0.0_f64, |acc, i| acc.max(lag_grad[i].abs()));
        let primal_inf = norm_inf(&it.residual);
        let status = if primal_inf <= settings.tolerance && dual_inf <= settings.tolerance {
            SolverStatus::Optimal
        } else if primal_inf <= settings.acceptable_tolerance
            && dual_inf <= settings.acceptable_tolerance
        {
            SolverStatus::Acceptable
        } else {
            SolverStatus::IterationLimit
        };
        Ok(finish(z, nu, &it, status, settings.max_iterations))
    }
}

/// Solves
///
/// ```text
/// [ H_ff + dI   A_f^T ] [ d  ]   [ -grad_f ]
/// [ A_f        -eI    ] [ nu ] = [ -c      ]
/// ```
///
/// retrying with a larger shift when the factorisation fails.
fn kkt_step(
    hessian: &DMatrix<f64>,
    it: &Iterate,
    free: &[usize],
    regularization: f64,
) -> Option<DVector<f64>> {
    let nf = free.len();
    let m = it.residual.len();
    let dim = nf + m;
    let mut rhs = DVector::zeros(dim);
    for (a, &i) in free.iter().enumerate() {
        rhs[a] = -it.grad[i];
    }
    for r in 0..m {
        rhs[nf + r] = -it.residual[r];
    }

    let mut shift = regularization.max(f64::EPSILON);
    for _ in 0..4 {
        let mut kkt = DMatrix::zeros(dim, dim);
        for (a, &i) in free.iter().enumerate() {
            for (b, &j) in free.iter().enumerate() {
                kkt[(a, b)] = hessian[(i, j)];
            }
            kkt[(a, a)] += shift;
            for r in 0..m {
                let value = it.jac[(r, i)];
                kkt[(nf + r, a)] = value;
                kkt[(a, nf + r)] = value;
            }
        }
        for r in 0..m {
            kkt[(nf + r, nf + r)] = -shift * 1e-3;
        }
        if let Some(sol) = kkt.lu().solve(&rhs) {
            if sol.iter().all(|v| v.is_finite()) {
                return Some(sol);
            }
        }
        shift *= 1e3;
    }
    None
}

/// Convenience for tests and callers that only need a status check.
pub fn require_success(solution: &NlpSolution) -> Result<()> {
    if solution.status.is_success() {
        Ok(())
    } else {
        Err(anyhow!(
            "solve ended with status {:?} after {} iterations",
            solution.status,
            solution.iterations
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// min (z0 - 1)^2 + (z1 - 2)^2  s.t.  z0 + z1 = 1
    struct Projection;

    impl NlpProblem for Projection {
        fn num_variables(&self) -> usize {
            2
        }
        fn num_constraints(&self) -> usize {
            1
        }
        fn objective(&mut self, z: &[f64]) -> Result<f64> {
            Ok((z[0] - 1.0).powi(2) + (z[1] - 2.0).powi(2))
        }
        fn gradient(&mut self, z: &[f64]) -> Result<Vec<f64>> {
            Ok(vec![2.0 * (z[0] - 1.0), 2.0 * (z[1] - 2.0)])
        }
        fn hessian(&mut self, _z: &[f64]) -> Result<DMatrix<f64>> {
            Ok(DMatrix::identity(2, 2) * 2.0)
        }
        fn constraints(&mut self, z: &[f64]) -> Result<Vec<f64>> {
            Ok(vec![z[0] + z[1]])
        }
        fn jacobian(&mut self, _z: &[f64]) -> Result<DMatrix<f64>> {
            Ok(DMatrix::from_row_slice(1, 2, &[1.0, 1.0]))
        }
    }

    /// Feasibility problem z0^2 = c, z1 = z0 with no objective.
    struct Root {
        c: f64,
    }

    impl NlpProblem for Root {
        fn num_variables(&self) -> usize {
            2
        }
        fn num_constraints(&self) -> usize {
            2
        }
        fn objective(&mut self, _z: &[f64]) -> Result<f64> {
            Ok(0.0)
        }
        fn gradient(&mut self, _z: &[f64]) -> Result<Vec<f64>> {
            Ok(vec![0.0; 2])
        }
        fn hessian(&mut self, _z: &[f64]) -> Result<DMatrix<f64>> {
            Ok(DMatrix::zeros(2, 2))
        }
        fn constraints(&mut self, z: &[f64]) -> Result<Vec<f64>> {
            Ok(vec![z[0] * z[0] - self.c, z[1] - z[0]])
        }
        fn jacobian(&mut self, z: &[f64]) -> Result<DMatrix<f64>> {
            Ok(DMatrix::from_row_slice(2, 2, &[2.0 * z[0], 0.0, -1.0, 1.0]))
        }
    }

    #[test]
    fn solves_equality_constrained_quadratic() {
        let mut solver = SqpSolver::default();
        let sol = solver
            .solve(
                &mut Projection,
                &Bounds::unbounded(2),
                &Bounds::equality(vec![1.0]),
                None,
            )
            .unwrap();
        assert_eq!(sol.status, SolverStatus::Optimal);
        assert_abs_diff_eq!(sol.primal[0], 0.0, epsilon = 1e-8);
        assert_abs_diff_eq!(sol.primal[1], 1.0, epsilon = 1e-8);
        // grad f + nu * [1, 1] = 0 at (0, 1): grad f = (-2, -2)
        assert_abs_diff_eq!(sol.equality_duals[0], 2.0, epsilon = 1e-6);
    }

    #[test]
    fn fixed_variables_are_held_and_report_bound_duals() {
        let mut bounds = Bounds::unbounded(2);
        bounds.fix(0, 0.25);
        let sol = SqpSolver::default()
            .solve(&mut Projection, &bounds, &Bounds::equality(vec![1.0]), None)
            .unwrap();
        assert!(sol.status.is_success());
        assert_eq!(sol.primal[0], 0.25);
        assert_abs_diff_eq!(sol.primal[1], 0.75, epsilon = 1e-8);
        // stationarity with bound multipliers closes exactly
        let grad = [2.0 * (0.25 - 1.0), 2.0 * (0.75 - 2.0)];
        for i in 0..2 {
            assert_abs_diff_eq!(
                grad[i] + sol.equality_duals[0] + sol.bound_duals[i],
                0.0,
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn newton_converges_on_nonlinear_feasibility() {
        let warm = WarmStart {
            primal: vec![1.0, 0.0],
            ..WarmStart::default()
        };
        let sol = SqpSolver::default()
            .solve(
                &mut Root { c: 2.0 },
                &Bounds::unbounded(2),
                &Bounds::equality(vec![0.0, 0.0]),
                Some(&warm),
            )
            .unwrap();
        assert_eq!(sol.status, SolverStatus::Optimal);
        assert_abs_diff_eq!(sol.primal[0], 2.0_f64.sqrt(), epsilon = 1e-8);
        assert_abs_diff_eq!(sol.primal[1], 2.0_f64.sqrt(), epsilon = 1e-8);
    }

    #[test]
    fn converged_warm_start_returns_immediately() {
        let s = 3.0_f64.sqrt();
        let warm = WarmStart {
            primal: vec![s, s],
            ..WarmStart::default()
        };
        let sol = SqpSolver::default()
            .solve(
                &mut Root { c: 3.0 },
                &Bounds::unbounded(2),
                &Bounds::equality(vec![0.0, 0.0]),
                Some(&warm),
            )
            .unwrap();
        assert_eq!(sol.status, SolverStatus::Optimal);
        assert_eq!(sol.iterations, 0);
    }

    #[test]
    fn infeasible_problem_is_reported() {
        let warm = WarmStart {
            primal: vec![1.0, 1.0],
            ..WarmStart::default()
        };
        let sol = SqpSolver::default()
            .solve(
                &mut Root { c: -1.0 },
                &Bounds::unbounded(2),
                &Bounds::equality(vec![0.0, 0.0]),
                Some(&warm),
            )
            .unwrap();
        assert!(!sol.status.is_success());
        assert!(require_success(&sol).is_err());
    }

    #[test]
    fn rejects_inequality_constraints_and_bad_bounds() {
        let mut solver = SqpSolver::default();
        let ineq = Bounds {
            lower: vec![0.0],
            upper: vec![2.0],
        };
        assert!(solver
            .solve(&mut Projection, &Bounds::unbounded(2), &ineq, None)
            .is_err());
        assert!(solver
            .solve(
                &mut Projection,
                &Bounds::unbounded(3),
                &Bounds::equality(vec![1.0]),
                None
            )
            .is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&SolverStatus::IterationLimit).unwrap();
        assert_eq!(json, "\"iteration_limit\"");
        let settings: SqpSettings = serde_json::from_str(
            r#"{"max_iterations":5,"tolerance":1e-8,"acceptable_tolerance":1e-5,"regularization":0.0,"min_step":1e-12}"#,
        )
        .unwrap();
        assert_eq!(settings.max_wall_time, None);
        assert_eq!(settings.max_iterations, 5);
    }
}
