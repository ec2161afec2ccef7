//! Initial guesses by forward propagation of the dynamics.
//!
//! The state is integrated node to node with a fixed number of sub-steps,
//! controls interpolated linearly between their node samples. Optionally the
//! propagated trajectory is projected onto the collocation manifold by a
//! small smoothing NLP weighted with the inverse state covariance.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ensure_config, Error, Result};
use crate::nlp::{NlpProblem, NlpSolver, SqpSettings, SqpSolver, WarmStart};
use crate::solvers::{Integrator, Stepper};
use crate::traits::{
    check_model_inputs, DifferentiableModel, DynamicalSystem, DynamicsModel, Steppable,
};
use crate::transcription::{CollocationTranscriber, ControlMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorSettings {
    pub integrator: Integrator,
    /// Integration steps between consecutive nodes.
    pub substeps: usize,
    /// Diagonal of the state covariance used by the weighted projection;
    /// empty means unit variance.
    #[serde(default)]
    pub state_covariance: Vec<f64>,
    #[serde(default)]
    pub smoothing: SqpSettings,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            integrator: Integrator::Rk4,
            substeps: 10,
            state_covariance: Vec::new(),
            smoothing: SqpSettings::default(),
        }
    }
}

/// Primal guess plus zero-valued (or smoothing-solve) multipliers, sized to
/// the transcription's decision and defect vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryGuess {
    /// Full decision vector; its leading block is the node states in time order.
    pub primal: Vec<f64>,
    pub equality_duals: Vec<f64>,
    pub bound_duals: Vec<f64>,
    pub state_len: usize,
}

impl TrajectoryGuess {
    /// The `VarX` block.
    pub fn states(&self) -> &[f64] {
        &self.primal[..self.state_len]
    }

    pub fn warm_start(&self) -> WarmStart {
        WarmStart {
            primal: self.primal.clone(),
            equality_duals: self.equality_duals.clone(),
            bound_duals: self.bound_duals.clone(),
        }
    }
}

/// Non-autonomous flow `f(x, u(t), p)` over one node interval.
struct ControlledFlow<'a, M: ?Sized> {
    model: &'a M,
    parameters: &'a [f64],
    t_start: f64,
    t_end: f64,
    u_start: &'a [f64],
    u_end: &'a [f64],
}

impl<M: DynamicsModel<f64> + ?Sized> DynamicalSystem<f64> for ControlledFlow<'_, M> {
    fn dimension(&self) -> usize {
        self.model.state_dim()
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let span = self.t_end - self.t_start;
        let theta = if span > 0.0 {
            ((t - self.t_start) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let u: Vec<f64> = self
            .u_start
            .iter()
            .zip(self.u_end)
            .map(|(a, b)| a + theta * (b - a))
            .collect();
        self.model.apply(x, &u, self.parameters, out);
    }
}

pub struct FeasibleTrajectoryGenerator<'a, M: ?Sized> {
    transcriber: &'a CollocationTranscriber,
    model: &'a M,
    t0: f64,
    tf: f64,
    parameters: Vec<f64>,
    settings: GeneratorSettings,
}

impl<'a, M: DifferentiableModel + ?Sized> FeasibleTrajectoryGenerator<'a, M> {
    /// `parameters` are the values the propagation runs with; they also fill
    /// the `VarP` block of the returned guess.
    pub fn new(
        transcriber: &'a CollocationTranscriber,
        model: &'a M,
        t0: f64,
        tf: f64,
        parameters: Vec<f64>,
        settings: GeneratorSettings,
    ) -> Result<Self> {
        let config = transcriber.config();
        check_model_inputs(model, config.state_dim, config.control_dim, parameters.len())?;
        ensure_config!(settings.substeps >= 1, "at least one sub-step per node interval is required");
        ensure_config!(
            settings.state_covariance.is_empty()
                || settings.state_covariance.len() == config.state_dim,
            "state covariance has length {}, expected {}",
            settings.state_covariance.len(),
            config.state_dim
        );
        ensure_config!(
            settings.state_covariance.iter().all(|v| v.is_finite() && *v > 0.0),
            "state covariance entries must be positive"
        );
        // validates the horizon
        transcriber.node_times(t0, tf)?;
        Ok(Self {
            transcriber,
            model,
            t0,
            tf,
            parameters,
            settings,
        })
    }

    pub fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    /// Propagates `initial_state` through `control_sequence` (one sample per
    /// node). The sequence may be empty for a model without controls or when
    /// the transcriber holds fixed controls, which are then used directly.
    pub fn solve_trajectory(
        &self,
        initial_state: &[f64],
        control_sequence: &[Vec<f64>],
        use_covariance_weighting: bool,
    ) -> Result<TrajectoryGuess> {
        let config = self.transcriber.config();
        let num_nodes = self.transcriber.num_nodes();
        ensure_config!(
            initial_state.len() == config.state_dim,
            "initial state has length {}, expected {}",
            initial_state.len(),
            config.state_dim
        );
        let zero_controls;
        let controls: &[Vec<f64>] = match &config.control {
            ControlMode::Fixed(samples) => {
                ensure_config!(
                    control_sequence.is_empty() || control_sequence == samples.as_slice(),
                    "control sequence differs from the transcriber's fixed control samples"
                );
                samples
            }
            ControlMode::Free if control_sequence.is_empty() && config.control_dim == 0 => {
                zero_controls = vec![Vec::new(); num_nodes];
                &zero_controls
            }
            ControlMode::Free => control_sequence,
        };
        ensure_config!(
            controls.len() == num_nodes,
            "control sequence has {} samples, expected {}",
            controls.len(),
            num_nodes
        );
        ensure_config!(
            controls.iter().all(|u| u.len() == config.control_dim),
            "every control sample must have length {}",
            config.control_dim
        );

        let states = self.propagate(initial_state, controls)?;
        let free_controls = (!self.transcriber.var_u().is_empty()).then_some(controls);
        let primal = self
            .transcriber
            .assemble(&states, free_controls, &self.parameters)?;
        debug!(
            nodes = num_nodes,
            integrator = ?self.settings.integrator,
            "forward propagation complete"
        );

        if use_covariance_weighting {
            return self.project(primal, initial_state);
        }

        Ok(TrajectoryGuess {
            equality_duals: vec![0.0; self.transcriber.num_defects()],
            bound_duals: vec![0.0; primal.len()],
            state_len: self.transcriber.var_x().len(),
            primal,
        })
    }

    fn propagate(&self, initial_state: &[f64], controls: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        let times = self.transcriber.node_times(self.t0, self.tf)?;
        let mut stepper = Stepper::new(self.settings.integrator, initial_state.len());
        let mut x = initial_state.to_vec();
        let mut states = Vec::with_capacity(times.len());
        states.push(x.clone());

        for node in 1..times.len() {
            let flow = ControlledFlow {
                model: self.model,
                parameters: &self.parameters,
                t_start: times[node - 1],
                t_end: times[node],
                u_start: &controls[node - 1],
                u_end: &controls[node],
            };
            let dt = (times[node] - times[node - 1]) / self.settings.substeps as f64;
            let mut t = times[node - 1];
            for _ in 0..self.settings.substeps {
                stepper.step(&flow, &mut t, &mut x, dt);
                if !x.iter().all(|v| v.is_finite()) {
                    warn!(node, time = t, "forward propagation diverged");
                    return Err(Error::IntegrationDivergence {
                        node,
                        time: t,
                        partial: states.concat(),
                    });
                }
            }
            states.push(x.clone());
        }
        Ok(states)
    }

    /// Weighted projection of the propagated guess onto the defect manifold.
    fn project(&self, propagated: Vec<f64>, initial_state: &[f64]) -> Result<TrajectoryGuess> {
        let dimx = self.transcriber.config().state_dim;
        let inverse_variance: Vec<f64> = if self.settings.state_covariance.is_empty() {
            vec![1.0; dimx]
        } else {
            self.settings.state_covariance.iter().map(|v| 1.0 / v).collect()
        };

        let mut bounds = self.transcriber.default_bounds();
        self.transcriber.fix_initial_state(&mut bounds, initial_state)?;
        for idx in self.transcriber.var_u().chain(self.transcriber.var_p()) {
            bounds.fix(idx, propagated[idx]);
        }

        let mut problem = SmoothingProblem {
            transcriber: self.transcriber,
            model: self.model,
            t0: self.t0,
            tf: self.tf,
            target: &propagated,
            inverse_variance: &inverse_variance,
        };
        let warm = WarmStart {
            primal: propagated.clone(),
            ..WarmStart::default()
        };
        let mut solver = SqpSolver::new(self.settings.smoothing);
        let solution = solver
            .solve(
                &mut problem,
                &bounds,
                &self.transcriber.defect_bounds(),
                Some(&warm),
            )
            .map_err(|err| {
                warn!(error = %err, "weighted projection solver error");
                Error::solver_error(None)
            })?;
        if !solution.status.is_success() {
            warn!(status = ?solution.status, "weighted projection did not converge");
            return Err(Error::SolverFailure {
                lambda: None,
                status: solution.status,
                iterations: solution.iterations,
            });
        }
        debug!(iterations = solution.iterations, "weighted projection converged");
        Ok(TrajectoryGuess {
            state_len: self.transcriber.var_x().len(),
            primal: solution.primal,
            equality_duals: solution.equality_duals,
            bound_duals: solution.bound_duals,
        })
    }
}

/// `min sum_g sum_k w_k (x_gk - xhat_gk)^2` subject to the collocation defects.
struct SmoothingProblem<'a, M: ?Sized> {
    transcriber: &'a CollocationTranscriber,
    model: &'a M,
    t0: f64,
    tf: f64,
    target: &'a [f64],
    inverse_variance: &'a [f64],
}

impl<M: DifferentiableModel + ?Sized> NlpProblem for SmoothingProblem<'_, M> {
    fn num_variables(&self) -> usize {
        self.transcriber.num_variables()
    }

    fn num_constraints(&self) -> usize {
        self.transcriber.num_defects()
    }

    fn objective(&mut self, z: &[f64]) -> anyhow::Result<f64> {
        let dimx = self.inverse_variance.len();
        Ok(self
            .transcriber
            .var_x()
            .map(|i| {
                let e = z[i] - self.target[i];
                self.inverse_variance[i % dimx] * e * e
            })
            .sum())
    }

    fn gradient(&mut self, z: &[f64]) -> anyhow::Result<Vec<f64>> {
        let dimx = self.inverse_variance.len();
        let mut grad = vec![0.0; z.len()];
        for i in self.transcriber.var_x() {
            grad[i] = 2.0 * self.inverse_variance[i % dimx] * (z[i] - self.target[i]);
        }
        Ok(grad)
    }

    fn hessian(&mut self, z: &[f64]) -> anyhow::Result<DMatrix<f64>> {
        let dimx = self.inverse_variance.len();
        let mut hess = DMatrix::zeros(z.len(), z.len());
        for i in self.transcriber.var_x() {
            hess[(i, i)] = 2.0 * self.inverse_variance[i % dimx];
        }
        Ok(hess)
    }

    fn constraints(&mut self, z: &[f64]) -> anyhow::Result<Vec<f64>> {
        Ok(self
            .transcriber
            .collocate_dynamics::<M>(self.model, self.t0, self.tf, z)?)
    }

    fn jacobian(&mut self, z: &[f64]) -> anyhow::Result<DMatrix<f64>> {
        Ok(self
            .transcriber
            .dynamics_jacobian::<M>(self.model, self.t0, self.tf, z)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::ModelSpec;
    use crate::traits::{ModelDimensions, Scalar};
    use crate::transcription::TranscriptionConfig;
    use approx::assert_abs_diff_eq;

    struct Still;

    impl ModelDimensions for Still {
        fn state_dim(&self) -> usize {
            3
        }
        fn control_dim(&self) -> usize {
            2
        }
        fn parameter_dim(&self) -> usize {
            0
        }
    }

    impl<T: Scalar> DynamicsModel<T> for Still {
        fn apply(&self, _x: &[T], _u: &[T], _p: &[T], out: &mut [T]) {
            out.iter_mut().for_each(|o| *o = T::zero());
        }
    }

    #[test]
    fn zero_dynamics_repeat_the_initial_state() {
        let model = Still;
        let t = CollocationTranscriber::new(TranscriptionConfig::for_model(&model, 3, 4), &model)
            .unwrap();
        let generator =
            FeasibleTrajectoryGenerator::new(&t, &model, 0.0, 2.0, Vec::new(), GeneratorSettings::default())
                .unwrap();
        let x0 = [0.5, -1.0, 3.0];
        let controls = vec![vec![0.0, 0.0]; t.num_nodes()];
        let guess = generator.solve_trajectory(&x0, &controls, false).unwrap();
        assert_eq!(guess.states().len(), 3 * t.num_nodes());
        for node in 0..t.num_nodes() {
            assert_eq!(t.state_at(&guess.primal, node), &x0);
        }
        assert_eq!(guess.equality_duals, vec![0.0; t.num_defects()]);
        assert_eq!(guess.bound_duals.len(), t.num_variables());
    }

    #[test]
    fn propagation_follows_controls_and_decay() {
        // dx/dt = -a x + u with a ramp control u(t) = t
        let model = ModelSpec::new(&["x"], &["-a * x + u"])
            .with_controls(&["u"])
            .with_parameters(&["a"])
            .compile()
            .unwrap();
        let config = TranscriptionConfig::for_model(&model, 2, 4);
        let t = CollocationTranscriber::new(config, &model).unwrap();
        let times = t.node_times(0.0, 1.0).unwrap();
        let controls: Vec<Vec<f64>> = times.iter().map(|&tt| vec![tt]).collect();
        let settings = GeneratorSettings {
            integrator: Integrator::Tsit5,
            substeps: 20,
            ..GeneratorSettings::default()
        };
        let generator = FeasibleTrajectoryGenerator::new(&t, &model, 0.0, 1.0, vec![1.0], settings).unwrap();
        let guess = generator.solve_trajectory(&[1.0], &controls, false).unwrap();
        // x(t) = t - 1 + 2 e^{-t}
        for (node, &tt) in times.iter().enumerate() {
            assert_abs_diff_eq!(guess.primal[node], tt - 1.0 + 2.0 * (-tt).exp(), epsilon = 1e-9);
        }
        assert_eq!(&guess.primal[t.var_u()], &times[..]);
        assert_eq!(guess.primal[t.var_p()], [1.0]);
    }

    #[test]
    fn fixed_controls_drive_propagation() {
        let model = ModelSpec::new(&["x"], &["-a * x + u"])
            .with_controls(&["u"])
            .with_parameters(&["a"])
            .compile()
            .unwrap();
        let free = CollocationTranscriber::new(TranscriptionConfig::for_model(&model, 2, 4), &model).unwrap();
        let times = free.node_times(0.0, 1.0).unwrap();
        let ramp: Vec<Vec<f64>> = times.iter().map(|&tt| vec![tt]).collect();
        let config = TranscriptionConfig::for_model(&model, 2, 4).with_fixed_controls(ramp.clone());
        let t = CollocationTranscriber::new(config, &model).unwrap();
        let settings = GeneratorSettings {
            substeps: 20,
            ..GeneratorSettings::default()
        };
        let generator = FeasibleTrajectoryGenerator::new(&t, &model, 0.0, 1.0, vec![1.0], settings).unwrap();

        let implicit = generator.solve_trajectory(&[1.0], &[], false).unwrap();
        let explicit = generator.solve_trajectory(&[1.0], &ramp, false).unwrap();
        assert_eq!(implicit.primal, explicit.primal);
        assert_eq!(implicit.primal.len(), t.num_nodes() + 1);
        let last = t.num_nodes() - 1;
        assert_abs_diff_eq!(implicit.primal[last], 2.0 * (-1.0f64).exp(), epsilon = 1e-7);

        let zeros = vec![vec![0.0]; t.num_nodes()];
        assert!(matches!(
            generator.solve_trajectory(&[1.0], &zeros, false),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn divergence_reports_node_and_partial_trajectory() {
        let model = ModelSpec::new(&["x"], &["x * x"]).compile().unwrap();
        let t = CollocationTranscriber::new(TranscriptionConfig::for_model(&model, 2, 3), &model)
            .unwrap();
        let generator =
            FeasibleTrajectoryGenerator::new(&t, &model, 0.0, 10.0, Vec::new(), GeneratorSettings::default())
                .unwrap();
        match generator.solve_trajectory(&[1.0], &[], false) {
            Err(Error::IntegrationDivergence { node, partial, .. }) => {
                assert!(node >= 1);
                assert_eq!(partial.len(), node);
                assert_eq!(partial[0], 1.0);
            }
            other => panic!("expected divergence, got {:?}", other.map(|g| g.primal)),
        }
    }

    #[test]
    fn weighted_projection_satisfies_defects() {
        let model = ModelSpec::new(&["x", "v"], &["v", "-x"]).compile().unwrap();
        let t = CollocationTranscriber::new(TranscriptionConfig::for_model(&model, 2, 6), &model)
            .unwrap();
        let settings = GeneratorSettings {
            substeps: 2,
            state_covariance: vec![0.1, 1.0],
            ..GeneratorSettings::default()
        };
        let generator = FeasibleTrajectoryGenerator::new(&t, &model, 0.0, 1.0, Vec::new(), settings).unwrap();
        let guess = generator.solve_trajectory(&[1.0, 0.0], &[], true).unwrap();
        let residual = t.collocate_dynamics(&model, 0.0, 1.0, &guess.primal).unwrap();
        assert!(residual.iter().all(|r| r.abs() < 1e-8));
        assert_eq!(t.state_at(&guess.primal, 0), &[1.0, 0.0]);
        assert_abs_diff_eq!(guess.primal[2 * (t.num_nodes() - 1)], 1.0f64.cos(), epsilon = 1e-6);
        assert_eq!(guess.equality_duals.len(), t.num_defects());
    }

    #[test]
    fn rejects_bad_inputs() {
        let model = Still;
        let t = CollocationTranscriber::new(TranscriptionConfig::for_model(&model, 1, 2), &model)
            .unwrap();
        let bad_cov = GeneratorSettings {
            state_covariance: vec![1.0],
            ..GeneratorSettings::default()
        };
        assert!(FeasibleTrajectoryGenerator::new(&t, &model, 0.0, 1.0, Vec::new(), bad_cov).is_err());
        assert!(FeasibleTrajectoryGenerator::new(&t, &model, 0.0, 1.0, vec![1.0], GeneratorSettings::default()).is_err());
        let generator =
            FeasibleTrajectoryGenerator::new(&t, &model, 0.0, 1.0, Vec::new(), GeneratorSettings::default())
                .unwrap();
        assert!(generator.solve_trajectory(&[0.0; 3], &[], false).is_err());
        assert!(generator.solve_trajectory(&[0.0; 2], &vec![vec![0.0; 2]; 3], false).is_err());
    }
}
