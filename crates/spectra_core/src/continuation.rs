//! Homotopy continuation from an easy surrogate model to the target model.
//!
//! The driver solves the blended problem at increasing λ, warm-starting
//! every solve from the previous one. A failed solve halves Δλ and retries
//! from the last converged λ; Δλ grows back after a successful reduced step.

pub mod problem;
pub mod types;

pub use problem::{HomotopyProblem, IdentificationObjective};
pub use types::{ContinuationOutcome, ContinuationSettings, DriverState, HomotopyStep};

use tracing::{info, warn};

use crate::error::{ensure_config, Error, Result, StalledSolution};
use crate::feasible::TrajectoryGuess;
use crate::nlp::{Bounds, NlpSolution, NlpSolver, SolverStatus, WarmStart};
use crate::traits::{check_model_inputs, DifferentiableModel};
use crate::transcription::CollocationTranscriber;

// Targets within this distance of 1 are treated as 1.
const LAMBDA_EPS: f64 = 1e-12;

/// Stepped continuation runner.
///
/// `initialize` solves at `lambda_start`; each `step` advances λ by one
/// converged solve (retrying internally); `run` does both until done.
pub struct ContinuationDriver<'a> {
    problem: HomotopyProblem<'a>,
    solver: &'a mut dyn NlpSolver,
    variable_bounds: Bounds,
    constraint_bounds: Bounds,
    settings: ContinuationSettings,
    state: DriverState,
    lambda: f64,
    step_size: f64,
    shortcut: bool,
    current: Option<WarmStart>,
    last_status: Option<SolverStatus>,
    lambda_path: Vec<f64>,
    steps: Vec<HomotopyStep>,
}

impl<'a> ContinuationDriver<'a> {
    pub fn new(
        transcriber: &'a CollocationTranscriber,
        easy: &'a dyn DifferentiableModel,
        hard: &'a dyn DifferentiableModel,
        t0: f64,
        tf: f64,
        solver: &'a mut dyn NlpSolver,
        settings: ContinuationSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let config = transcriber.config();
        for model in [easy, hard] {
            check_model_inputs(
                model,
                config.state_dim,
                config.control_dim,
                config.parameter_dim,
            )?;
        }
        transcriber.node_times(t0, tf)?;

        Ok(Self {
            problem: HomotopyProblem {
                transcriber,
                easy,
                hard,
                t0,
                tf,
                objective: None,
            },
            solver,
            variable_bounds: transcriber.default_bounds(),
            constraint_bounds: transcriber.defect_bounds(),
            settings,
            state: DriverState::Init,
            lambda: settings.lambda_start,
            step_size: settings.step_size,
            shortcut: false,
            current: None,
            last_status: None,
            lambda_path: Vec::new(),
            steps: Vec::new(),
        })
    }

    pub fn with_objective(mut self, objective: IdentificationObjective<'a>) -> Result<Self> {
        let transcriber = self.problem.transcriber;
        transcriber.check_measurements(objective.cost, objective.measured)?;
        if let Some(prior) = objective.prior {
            ensure_config!(
                prior.reference.len() == transcriber.var_p().len(),
                "prior reference has length {}, expected {}",
                prior.reference.len(),
                transcriber.var_p().len()
            );
        }
        self.problem.objective = Some(objective);
        Ok(self)
    }

    /// Replaces the decision-variable bounds (λ slot excluded).
    pub fn with_variable_bounds(mut self, bounds: Bounds) -> Result<Self> {
        ensure_config!(
            bounds.len() == self.problem.transcriber.num_variables(),
            "variable bounds have length {}, expected {}",
            bounds.len(),
            self.problem.transcriber.num_variables()
        );
        self.variable_bounds = bounds;
        Ok(self)
    }

    /// Pins node 0 to `x0`.
    pub fn fix_initial_state(&mut self, x0: &[f64]) -> Result<()> {
        self.problem
            .transcriber
            .fix_initial_state(&mut self.variable_bounds, x0)
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn lambda_path(&self) -> &[f64] {
        &self.lambda_path
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, DriverState::Converged | DriverState::Failed)
    }

    /// INIT -> STEPPING: solve at `lambda_start` from the generator guess.
    pub fn initialize(&mut self, guess: &TrajectoryGuess) -> Result<()> {
        ensure_config!(
            self.state == DriverState::Init,
            "continuation already initialized"
        );
        let n = self.problem.transcriber.num_variables();
        ensure_config!(
            guess.primal.len() == n,
            "initial guess has length {}, expected {}",
            guess.primal.len(),
            n
        );

        let mut warm = guess.warm_start();
        warm.primal.push(self.settings.lambda_start);
        if warm.bound_duals.len() == n {
            warm.bound_duals.push(0.0);
        }

        let lambda = self.settings.lambda_start;
        match self.attempt(lambda, &warm) {
            Ok(solution) => {
                self.state = DriverState::Stepping;
                self.record(lambda, solution)
            }
            Err((status, iterations)) => {
                self.state = DriverState::Failed;
                self.last_status = Some(status);
                warn!(lambda, ?status, iterations, "initial continuation solve failed");
                Err(Error::SolverFailure {
                    lambda: Some(lambda),
                    status,
                    iterations,
                })
            }
        }
    }

    /// STEPPING -> STEPPING/CONVERGED/FAILED. Returns the new λ.
    pub fn step(&mut self) -> Result<f64> {
        match self.state {
            DriverState::Stepping => {}
            DriverState::Converged => return Ok(self.lambda),
            DriverState::Init => {
                return Err(Error::configuration(
                    "continuation must be initialized before stepping",
                ))
            }
            DriverState::Failed => {
                return Err(Error::configuration("continuation has already failed"))
            }
        }
        let warm = match &self.current {
            Some(warm) => warm.clone(),
            None => return Err(Error::configuration("no converged solution to continue from")),
        };

        let remaining = 1.0 - self.lambda;
        let used_shortcut = self.shortcut;
        let mut delta = if used_shortcut {
            remaining
        } else {
            self.step_size.min(remaining)
        };
        let mut last_failure = (SolverStatus::NumericalError, 0);
        let mut target = self.lambda;

        for halvings in 0..=self.settings.max_halvings {
            target = if delta >= remaining - LAMBDA_EPS {
                1.0
            } else {
                self.lambda + delta
            };
            match self.attempt(target, &warm) {
                Ok(solution) => {
                    if halvings > 0 || !used_shortcut {
                        let nominal = self.settings.step_size;
                        self.step_size = if delta < nominal {
                            (delta * self.settings.step_growth).min(nominal)
                        } else {
                            nominal
                        };
                    }
                    self.record(target, solution)?;
                    return Ok(self.lambda);
                }
                Err((status, iterations)) => {
                    warn!(
                        lambda = target,
                        last_converged = self.lambda,
                        ?status,
                        iterations,
                        halvings,
                        "continuation step failed, halving"
                    );
                    last_failure = (status, iterations);
                    self.shortcut = false;
                    delta *= 0.5;
                }
            }
        }

        let (status, iterations) = last_failure;
        self.fail(target, status, iterations)
    }

    /// Runs to completion from `guess` (ignored when already initialized).
    pub fn run(&mut self, guess: &TrajectoryGuess) -> Result<ContinuationOutcome> {
        if self.state == DriverState::Init {
            self.initialize(guess)?;
        }
        let mut taken = 0;
        while !self.is_done() {
            if taken >= self.settings.max_steps {
                let attempted = (self.lambda + self.step_size).min(1.0);
                return self.fail(attempted, SolverStatus::IterationLimit, taken);
            }
            self.step()?;
            taken += 1;
        }
        Ok(self.outcome())
    }

    /// Snapshot of the current path and solution.
    pub fn outcome(&self) -> ContinuationOutcome {
        let primal = self.current_primal();
        ContinuationOutcome {
            state: self.state,
            lambda_path: self.lambda_path.clone(),
            parameters: if primal.is_empty() {
                Vec::new()
            } else {
                self.problem.transcriber.parameters(&primal).to_vec()
            },
            primal,
            solver_status: self.last_status,
            steps: self.steps.clone(),
        }
    }

    pub fn take_result(self) -> ContinuationOutcome {
        let mut outcome = self.outcome();
        outcome.steps = self.steps;
        outcome
    }

    fn current_primal(&self) -> Vec<f64> {
        let n = self.problem.transcriber.num_variables();
        self.current
            .as_ref()
            .map(|w| w.primal[..n].to_vec())
            .unwrap_or_default()
    }

    fn attempt(
        &mut self,
        lambda: f64,
        warm: &WarmStart,
    ) -> std::result::Result<NlpSolution, (SolverStatus, usize)> {
        let mut bounds = self.variable_bounds.clone();
        bounds.push(lambda, lambda);
        let mut start = warm.clone();
        if let Some(slot) = start.primal.last_mut() {
            *slot = lambda;
        }

        match self
            .solver
            .solve(&mut self.problem, &bounds, &self.constraint_bounds, Some(&start))
        {
            Ok(solution) if solution.status.is_success() => Ok(solution),
            Ok(solution) => Err((solution.status, solution.iterations)),
            Err(err) => {
                warn!(lambda, error = %err, "solver adapter error");
                Err((SolverStatus::NumericalError, 0))
            }
        }
    }

    fn record(&mut self, lambda: f64, solution: NlpSolution) -> Result<()> {
        let n = self.problem.transcriber.num_variables();
        let hard_norm = self.problem.hard_defect_norm(&solution.primal[..n])?;
        self.shortcut = lambda < 1.0 && hard_norm <= self.settings.shortcut_tolerance;
        info!(
            lambda,
            iterations = solution.iterations,
            objective = solution.objective,
            hard_defect = hard_norm,
            "continuation step converged"
        );

        self.lambda = lambda;
        self.lambda_path.push(lambda);
        self.last_status = Some(solution.status);
        let warm = solution.warm_start();
        self.steps.push(HomotopyStep {
            lambda,
            status: solution.status,
            iterations: solution.iterations,
            objective: solution.objective,
            warm_start: warm.clone(),
        });
        self.current = Some(warm);

        if lambda >= 1.0 {
            self.state = DriverState::Converged;
            info!(steps = self.lambda_path.len(), "continuation converged");
        }
        Ok(())
    }

    fn fail<T>(&mut self, attempted_lambda: f64, status: SolverStatus, iterations: usize) -> Result<T> {
        self.state = DriverState::Failed;
        self.last_status = Some(status);
        warn!(
            last_converged = self.lambda,
            attempted_lambda,
            ?status,
            "continuation stalled"
        );
        Err(Error::ContinuationStall {
            last_good: Box::new(StalledSolution {
                lambda: self.lambda,
                primal: self.current_primal(),
            }),
            attempted_lambda,
            status,
            iterations,
        })
    }
}
