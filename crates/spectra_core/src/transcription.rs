//! Multi-segment pseudospectral collocation.
//!
//! The horizon `[t0, tf]` is split into `S` equal segments, each carrying
//! `N + 1` Chebyshev–Gauss–Lobatto nodes. Adjacent segments share their
//! boundary node, so the state block holds `S * N + 1` distinct nodes and
//! continuity holds by construction. Global node `g` of segment `s` at local
//! index `j` is `g = s * N + j`, in ascending time.
//!
//! Each segment enforces `scale * D * X_seg - f(x, u, p) = 0` at its local
//! nodes `1..=N`; the global initial node carries no defect and is pinned by
//! bounds instead. The defect of node `g >= 1` occupies rows
//! `(g - 1) * dimx .. g * dimx`.

use std::ops::Range;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::autodiff::{self, Dual};
use crate::chebyshev::{segment_time_map, ChebyshevBasis};
use crate::error::{ensure_config, Error, Result};
use crate::nlp::Bounds;
use crate::traits::{
    check_model_inputs, CostDimensions, CostFunction, DynamicsModel, ModelDimensions,
};

/// How the control input enters the decision vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum ControlMode {
    /// One control vector per distinct node, chosen by the solver.
    Free,
    /// Known control samples, one per distinct node (identification runs).
    Fixed(Vec<Vec<f64>>),
}

impl Default for ControlMode {
    fn default() -> Self {
        ControlMode::Free
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub num_segments: usize,
    pub poly_order: usize,
    pub state_dim: usize,
    #[serde(default)]
    pub control_dim: usize,
    #[serde(default)]
    pub parameter_dim: usize,
    #[serde(default)]
    pub control: ControlMode,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            num_segments: 4,
            poly_order: 6,
            state_dim: 1,
            control_dim: 0,
            parameter_dim: 0,
            control: ControlMode::Free,
        }
    }
}

impl TranscriptionConfig {
    /// Configuration with sizes taken from `model`.
    pub fn for_model(model: &(impl ModelDimensions + ?Sized), num_segments: usize, poly_order: usize) -> Self {
        Self {
            num_segments,
            poly_order,
            state_dim: model.state_dim(),
            control_dim: model.control_dim(),
            parameter_dim: model.parameter_dim(),
            control: ControlMode::Free,
        }
    }

    pub fn with_fixed_controls(mut self, samples: Vec<Vec<f64>>) -> Self {
        self.control = ControlMode::Fixed(samples);
        self
    }
}

/// Index layout of the flattened decision vector `[X | U | P]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionVariableLayout {
    pub state_dim: usize,
    pub control_dim: usize,
    pub parameter_dim: usize,
    pub num_nodes: usize,
    pub free_controls: bool,
}

impl DecisionVariableLayout {
    pub fn var_x(&self) -> Range<usize> {
        0..self.state_dim * self.num_nodes
    }

    /// Empty when the controls are fixed data.
    pub fn var_u(&self) -> Range<usize> {
        let start = self.var_x().end;
        if self.free_controls {
            start..start + self.control_dim * self.num_nodes
        } else {
            start..start
        }
    }

    pub fn var_p(&self) -> Range<usize> {
        let start = self.var_u().end;
        start..start + self.parameter_dim
    }

    pub fn len(&self) -> usize {
        self.var_p().end
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state_index(&self, node: usize, component: usize) -> usize {
        node * self.state_dim + component
    }

    pub fn control_index(&self, node: usize, component: usize) -> Option<usize> {
        self.free_controls
            .then(|| self.var_x().end + node * self.control_dim + component)
    }
}

/// Builds defects, Jacobians and the identification cost for one
/// configuration. The layout never changes after construction.
#[derive(Debug, Clone)]
pub struct CollocationTranscriber {
    config: TranscriptionConfig,
    basis: ChebyshevBasis,
    layout: DecisionVariableLayout,
}

impl CollocationTranscriber {
    /// Validates `config` against the dimensions `model` reports.
    pub fn new(config: TranscriptionConfig, model: &(impl ModelDimensions + ?Sized)) -> Result<Self> {
        ensure_config!(
            config.num_segments >= 1,
            "at least one segment is required (got {})",
            config.num_segments
        );
        ensure_config!(config.state_dim >= 1, "state dimension must be positive");
        ensure_config!(
            model.state_dim() == config.state_dim,
            "model state dimension {} does not match configured {}",
            model.state_dim(),
            config.state_dim
        );
        ensure_config!(
            model.control_dim() == config.control_dim,
            "model control dimension {} does not match configured {}",
            model.control_dim(),
            config.control_dim
        );
        ensure_config!(
            model.parameter_dim() == config.parameter_dim,
            "model parameter dimension {} does not match configured {}",
            model.parameter_dim(),
            config.parameter_dim
        );

        let basis = ChebyshevBasis::new(config.poly_order)?;
        let num_nodes = config.num_segments * config.poly_order + 1;

        if let ControlMode::Fixed(samples) = &config.control {
            ensure_config!(
                samples.len() == num_nodes,
                "fixed control has {} samples but the grid has {} nodes",
                samples.len(),
                num_nodes
            );
            if let Some((node, bad)) = samples
                .iter()
                .enumerate()
                .find(|(_, u)| u.len() != config.control_dim)
            {
                return Err(Error::configuration(format!(
                    "control sample {} has length {}, expected {}",
                    node,
                    bad.len(),
                    config.control_dim
                )));
            }
        }

        let layout = DecisionVariableLayout {
            state_dim: config.state_dim,
            control_dim: config.control_dim,
            parameter_dim: config.parameter_dim,
            num_nodes,
            free_controls: matches!(config.control, ControlMode::Free) && config.control_dim > 0,
        };

        Ok(Self {
            config,
            basis,
            layout,
        })
    }

    pub fn config(&self) -> &TranscriptionConfig {
        &self.config
    }

    pub fn basis(&self) -> &ChebyshevBasis {
        &self.basis
    }

    pub fn layout(&self) -> &DecisionVariableLayout {
        &self.layout
    }

    pub fn var_x(&self) -> Range<usize> {
        self.layout.var_x()
    }

    pub fn var_u(&self) -> Range<usize> {
        self.layout.var_u()
    }

    pub fn var_p(&self) -> Range<usize> {
        self.layout.var_p()
    }

    pub fn num_nodes(&self) -> usize {
        self.layout.num_nodes
    }

    pub fn num_variables(&self) -> usize {
        self.layout.len()
    }

    pub fn num_defects(&self) -> usize {
        self.config.num_segments * self.config.poly_order * self.config.state_dim
    }

    /// Physical time of every distinct node, ascending.
    pub fn node_times(&self, t0: f64, tf: f64) -> Result<Vec<f64>> {
        let n = self.config.poly_order;
        let mut times = Vec::with_capacity(self.num_nodes());
        for s in 0..self.config.num_segments {
            let (offset, scale) = segment_time_map(s, t0, tf, self.config.num_segments)?;
            let first = if s == 0 { 0 } else { 1 };
            for &x in &self.basis.nodes()[first..] {
                times.push(offset + x / scale);
            }
        }
        // pin the endpoints exactly
        times[0] = t0;
        if let Some(last) = times.last_mut() {
            *last = tf;
        }
        debug_assert_eq!(times.len(), self.config.num_segments * n + 1);
        Ok(times)
    }

    pub fn state_at<'z>(&self, z: &'z [f64], node: usize) -> &'z [f64] {
        let d = self.config.state_dim;
        &z[node * d..(node + 1) * d]
    }

    /// Node states in time order.
    pub fn states(&self, z: &[f64]) -> Vec<Vec<f64>> {
        (0..self.num_nodes())
            .map(|node| self.state_at(z, node).to_vec())
            .collect()
    }

    pub fn control_at<'a>(&'a self, z: &'a [f64], node: usize) -> &'a [f64] {
        match &self.config.control {
            ControlMode::Fixed(samples) => &samples[node],
            ControlMode::Free => {
                let d = self.config.control_dim;
                let start = self.var_u().start + node * d;
                &z[start..start + d]
            }
        }
    }

    pub fn parameters<'z>(&self, z: &'z [f64]) -> &'z [f64] {
        &z[self.var_p()]
    }

    /// Flattens node states, free controls and parameters into a decision vector.
    pub fn assemble(
        &self,
        states: &[Vec<f64>],
        controls: Option<&[Vec<f64>]>,
        parameters: &[f64],
    ) -> Result<Vec<f64>> {
        ensure_config!(
            states.len() == self.num_nodes(),
            "expected {} node states, got {}",
            self.num_nodes(),
            states.len()
        );
        ensure_config!(
            parameters.len() == self.config.parameter_dim,
            "expected {} parameters, got {}",
            self.config.parameter_dim,
            parameters.len()
        );
        let mut z = Vec::with_capacity(self.num_variables());
        for x in states {
            ensure_config!(
                x.len() == self.config.state_dim,
                "node state has length {}, expected {}",
                x.len(),
                self.config.state_dim
            );
            z.extend_from_slice(x);
        }
        if self.layout.free_controls {
            let controls = controls.ok_or_else(|| {
                Error::configuration("free controls need an initial control sequence")
            })?;
            ensure_config!(
                controls.len() == self.num_nodes(),
                "expected {} control samples, got {}",
                self.num_nodes(),
                controls.len()
            );
            for u in controls {
                ensure_config!(
                    u.len() == self.config.control_dim,
                    "control sample has length {}, expected {}",
                    u.len(),
                    self.config.control_dim
                );
                z.extend_from_slice(u);
            }
        }
        z.extend_from_slice(parameters);
        Ok(z)
    }

    fn check_model(&self, model: &(impl ModelDimensions + ?Sized)) -> Result<()> {
        check_model_inputs(
            model,
            self.config.state_dim,
            self.config.control_dim,
            self.config.parameter_dim,
        )
    }

    fn check_decision_vector(&self, z: &[f64]) -> Result<()> {
        ensure_config!(
            z.len() == self.num_variables(),
            "decision vector has length {}, expected {}",
            z.len(),
            self.num_variables()
        );
        Ok(())
    }

    /// Defect residual `scale * D * X_seg - f(x_j, u_j, p)`, length `S * N * dimx`.
    pub fn collocate_dynamics<M>(&self, model: &M, t0: f64, tf: f64, z: &[f64]) -> Result<Vec<f64>>
    where
        M: DynamicsModel<f64> + ?Sized,
    {
        self.check_model(model)?;
        self.check_decision_vector(z)?;
        let n = self.config.poly_order;
        let dimx = self.config.state_dim;
        let diff = self.basis.differentiation_matrix();
        let p = self.parameters(z);

        let mut residual = vec![0.0; self.num_defects()];
        let mut f = vec![0.0; dimx];
        for s in 0..self.config.num_segments {
            let (_, scale) = segment_time_map(s, t0, tf, self.config.num_segments)?;
            for j in 1..=n {
                let node = s * n + j;
                model.apply(self.state_at(z, node), self.control_at(z, node), p, &mut f);
                let row = (node - 1) * dimx;
                for k in 0..dimx {
                    let mut derivative = 0.0;
                    for m in 0..=n {
                        derivative += diff[(j, m)] * z[(s * n + m) * dimx + k];
                    }
                    residual[row + k] = scale * derivative - f[k];
                }
            }
        }
        Ok(residual)
    }

    /// Dense Jacobian of [`Self::collocate_dynamics`] with respect to `z`.
    pub fn dynamics_jacobian<M>(&self, model: &M, t0: f64, tf: f64, z: &[f64]) -> Result<DMatrix<f64>>
    where
        M: DynamicsModel<Dual> + ?Sized,
    {
        self.check_model(model)?;
        self.check_decision_vector(z)?;
        let n = self.config.poly_order;
        let dimx = self.config.state_dim;
        let dimu = self.config.control_dim;
        let dimp = self.config.parameter_dim;
        let diff = self.basis.differentiation_matrix();
        let p = self.parameters(z);
        let p_start = self.var_p().start;

        let mut jac = DMatrix::zeros(self.num_defects(), self.num_variables());
        for s in 0..self.config.num_segments {
            let (_, scale) = segment_time_map(s, t0, tf, self.config.num_segments)?;
            for j in 1..=n {
                let node = s * n + j;
                let row = (node - 1) * dimx;
                for m in 0..=n {
                    let weight = scale * diff[(j, m)];
                    let col = (s * n + m) * dimx;
                    for k in 0..dimx {
                        jac[(row + k, col + k)] += weight;
                    }
                }

                let local =
                    autodiff::model_jacobian(model, self.state_at(z, node), self.control_at(z, node), p);
                for k in 0..dimx {
                    for c in 0..dimx {
                        jac[(row + k, node * dimx + c)] -= local.d_state[k * dimx + c];
                    }
                    if self.layout.free_controls {
                        let u_start = self.var_u().start + node * dimu;
                        for c in 0..dimu {
                            jac[(row + k, u_start + c)] -= local.d_control[k * dimu + c];
                        }
                    }
                    for c in 0..dimp {
                        jac[(row + k, p_start + c)] -= local.d_param[k * dimp + c];
                    }
                }
            }
        }
        Ok(jac)
    }

    /// Composite quadrature weight of every distinct node; boundary nodes
    /// collect a contribution from each adjacent segment.
    pub fn node_weights(&self, t0: f64, tf: f64) -> Result<Vec<f64>> {
        let n = self.config.poly_order;
        let mut weights = vec![0.0; self.num_nodes()];
        for s in 0..self.config.num_segments {
            let (_, scale) = segment_time_map(s, t0, tf, self.config.num_segments)?;
            for (j, w) in self.basis.quadrature_weights().iter().enumerate() {
                weights[s * n + j] += w / scale;
            }
        }
        Ok(weights)
    }

    /// Checks a tracking cost and its node-aligned samples against the state size.
    pub fn check_measurements(
        &self,
        cost: &(impl CostDimensions + ?Sized),
        measured: &[Vec<f64>],
    ) -> Result<()> {
        let dimx = self.config.state_dim;
        ensure_config!(
            cost.sample_dim() == dimx,
            "cost compares {} components, expected {}",
            cost.sample_dim(),
            dimx
        );
        ensure_config!(
            measured.len() == self.num_nodes(),
            "expected one measurement per node ({}), got {}",
            self.num_nodes(),
            measured.len()
        );
        if let Some((node, y)) = measured.iter().enumerate().find(|(_, y)| y.len() != dimx) {
            return Err(Error::configuration(format!(
                "measurement at node {} has length {}, expected {}",
                node,
                y.len(),
                dimx
            )));
        }
        Ok(())
    }

    /// `sum_s (h_s / 2) sum_j w_j cost(x_{s,j}, y_{s,j})`.
    pub fn collocate_id_cost<C>(
        &self,
        cost: &C,
        measured: &[Vec<f64>],
        t0: f64,
        tf: f64,
        z: &[f64],
    ) -> Result<f64>
    where
        C: CostFunction<f64> + ?Sized,
    {
        self.check_decision_vector(z)?;
        self.check_measurements(cost, measured)?;
        let weights = self.node_weights(t0, tf)?;
        Ok(weights
            .iter()
            .zip(measured)
            .enumerate()
            .map(|(node, (w, y))| w * cost.evaluate(self.state_at(z, node), y))
            .sum())
    }

    /// Gradient of [`Self::collocate_id_cost`] over the full decision vector.
    pub fn id_cost_gradient<C>(
        &self,
        cost: &C,
        measured: &[Vec<f64>],
        t0: f64,
        tf: f64,
        z: &[f64],
    ) -> Result<Vec<f64>>
    where
        C: CostFunction<Dual> + ?Sized,
    {
        self.check_decision_vector(z)?;
        self.check_measurements(cost, measured)?;
        let weights = self.node_weights(t0, tf)?;
        let dimx = self.config.state_dim;
        let mut grad = vec![0.0; self.num_variables()];
        for (node, (w, y)) in weights.iter().zip(measured).enumerate() {
            let (_, g) = autodiff::cost_gradient(cost, self.state_at(z, node), y);
            for k in 0..dimx {
                grad[node * dimx + k] = w * g[k];
            }
        }
        Ok(grad)
    }

    /// Block-diagonal Hessian of [`Self::collocate_id_cost`].
    pub fn id_cost_hessian<C>(
        &self,
        cost: &C,
        measured: &[Vec<f64>],
        t0: f64,
        tf: f64,
        z: &[f64],
    ) -> Result<DMatrix<f64>>
    where
        C: CostFunction<Dual> + ?Sized,
    {
        self.check_decision_vector(z)?;
        self.check_measurements(cost, measured)?;
        let weights = self.node_weights(t0, tf)?;
        let dimx = self.config.state_dim;
        let mut hess = DMatrix::zeros(self.num_variables(), self.num_variables());
        for (node, (w, y)) in weights.iter().zip(measured).enumerate() {
            let block = autodiff::cost_hessian(cost, self.state_at(z, node), y);
            let base = node * dimx;
            for a in 0..dimx {
                for b in 0..dimx {
                    hess[(base + a, base + b)] = w * block[a * dimx + b];
                }
            }
        }
        Ok(hess)
    }

    /// Unbounded decision variables.
    pub fn default_bounds(&self) -> Bounds {
        Bounds::unbounded(self.num_variables())
    }

    /// Zero right-hand side for every defect.
    pub fn defect_bounds(&self) -> Bounds {
        Bounds::equality(vec![0.0; self.num_defects()])
    }

    /// Pins the state of node 0 with equal lower and upper bounds.
    pub fn fix_initial_state(&self, bounds: &mut Bounds, x0: &[f64]) -> Result<()> {
        ensure_config!(
            x0.len() == self.config.state_dim,
            "initial state has length {}, expected {}",
            x0.len(),
            self.config.state_dim
        );
        ensure_config!(
            bounds.len() >= self.num_variables(),
            "bounds are shorter than the decision vector"
        );
        for (k, &value) in x0.iter().enumerate() {
            bounds.fix(k, value);
        }
        Ok(())
    }

    /// Applies the same box to every free control sample.
    pub fn bound_controls(&self, bounds: &mut Bounds, lower: &[f64], upper: &[f64]) -> Result<()> {
        ensure_config!(
            self.layout.free_controls,
            "controls are fixed data and cannot be bounded"
        );
        let d = self.config.control_dim;
        ensure_config!(
            lower.len() == d && upper.len() == d,
            "control bounds must have length {}",
            d
        );
        for node in 0..self.num_nodes() {
            for c in 0..d {
                if let Some(idx) = self.layout.control_index(node, c) {
                    bounds.set(idx, lower[c], upper[c]);
                }
            }
        }
        Ok(())
    }

    pub fn bound_parameters(&self, bounds: &mut Bounds, lower: &[f64], upper: &[f64]) -> Result<()> {
        let range = self.var_p();
        ensure_config!(
            lower.len() == range.len() && upper.len() == range.len(),
            "parameter bounds must have length {}",
            range.len()
        );
        for (offset, idx) in range.enumerate() {
            bounds.set(idx, lower[offset], upper[offset]);
        }
        Ok(())
    }
}

/// Resamples a measured series onto the node times by linear interpolation,
/// holding the end values outside the sampled range.
pub fn align_to_nodes(sample_times: &[f64], samples: &[Vec<f64>], node_times: &[f64]) -> Result<Vec<Vec<f64>>> {
    ensure_config!(
        !sample_times.is_empty() && sample_times.len() == samples.len(),
        "need one sample per time stamp (got {} times, {} samples)",
        sample_times.len(),
        samples.len()
    );
    ensure_config!(
        sample_times.windows(2).all(|w| w[0] < w[1]),
        "sample times must be strictly increasing"
    );
    let mut out = Vec::with_capacity(node_times.len());
    let mut seg = 0;
    for &t in node_times {
        while seg + 2 < sample_times.len() && sample_times[seg + 1] < t {
            seg += 1;
        }
        if sample_times.len() == 1 || t <= sample_times[0] {
            out.push(samples[0].clone());
            continue;
        }
        let last = sample_times.len() - 1;
        if t >= sample_times[last] {
            out.push(samples[last].clone());
            continue;
        }
        let (ta, tb) = (sample_times[seg], sample_times[seg + 1]);
        let theta = (t - ta) / (tb - ta);
        out.push(
            samples[seg]
                .iter()
                .zip(&samples[seg + 1])
                .map(|(a, b)| a + theta * (b - a))
                .collect(),
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::WeightedLeastSquares;
    use crate::equation_engine::ModelSpec;
    use approx::assert_abs_diff_eq;

    struct Zero {
        dim: usize,
    }

    impl ModelDimensions for Zero {
        fn state_dim(&self) -> usize {
            self.dim
        }
        fn control_dim(&self) -> usize {
            0
        }
        fn parameter_dim(&self) -> usize {
            0
        }
    }

    impl<T: crate::traits::Scalar> DynamicsModel<T> for Zero {
        fn apply(&self, _x: &[T], _u: &[T], _p: &[T], out: &mut [T]) {
            out.iter_mut().for_each(|o| *o = T::zero());
        }
    }

    fn forced() -> crate::equation_engine::EquationModel {
        ModelSpec::new(&["x", "v"], &["v", "-k * sin(x) + u - c * v * v"])
            .with_controls(&["u"])
            .with_parameters(&["k", "c"])
            .compile()
            .unwrap()
    }

    #[test]
    fn layout_sizes() {
        let model = forced();
        let t = CollocationTranscriber::new(TranscriptionConfig::for_model(&model, 3, 4), &model).unwrap();
        assert_eq!(t.num_nodes(), 13);
        assert_eq!(t.var_x(), 0..26);
        assert_eq!(t.var_u(), 26..39);
        assert_eq!(t.var_p(), 39..41);
        assert_eq!(t.num_defects(), 3 * 4 * 2);

        let fixed = TranscriptionConfig::for_model(&model, 3, 4).with_fixed_controls(vec![vec![0.0]; 13]);
        let t = CollocationTranscriber::new(fixed, &model).unwrap();
        assert!(t.var_u().is_empty());
        assert_eq!(t.var_p(), 26..28);
    }

    #[test]
    fn construction_rejects_mismatches() {
        let model = forced();
        let mut config = TranscriptionConfig::for_model(&model, 2, 3);
        config.state_dim = 3;
        assert!(CollocationTranscriber::new(config, &model).is_err());

        let config = TranscriptionConfig::for_model(&model, 2, 0);
        assert!(CollocationTranscriber::new(config, &model).is_err());

        let config = TranscriptionConfig::for_model(&model, 2, 3).with_fixed_controls(vec![vec![0.0]; 3]);
        assert!(CollocationTranscriber::new(config, &model).is_err());
    }

    #[test]
    fn node_times_are_ascending_and_shared_at_boundaries() {
        let model = Zero { dim: 1 };
        let t = CollocationTranscriber::new(TranscriptionConfig::for_model(&model, 2, 3), &model).unwrap();
        let times = t.node_times(0.0, 1.0).unwrap();
        assert_eq!(times.len(), 7);
        assert_eq!(times[0], 0.0);
        assert_abs_diff_eq!(times[3], 0.5, epsilon = 1e-15);
        assert_eq!(times[6], 1.0);
        for w in times.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn zero_dynamics_constant_trajectory_has_zero_defect() {
        let model = Zero { dim: 3 };
        let t = CollocationTranscriber::new(TranscriptionConfig::for_model(&model, 4, 5), &model).unwrap();
        let z = t
            .assemble(&vec![vec![1.5, -2.0, 0.25]; t.num_nodes()], None, &[])
            .unwrap();
        let residual = t.collocate_dynamics(&model, 0.0, 3.0, &z).unwrap();
        assert_eq!(residual.len(), 4 * 5 * 3);
        for r in residual {
            assert_abs_diff_eq!(r, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn polynomial_solution_of_linear_ode_has_zero_defect() {
        // dx/dt = 2t, x = t^2 is exactly representable per segment
        let model = ModelSpec::new(&["x", "t"], &["2 * t", "1"]).compile().unwrap();
        let t = CollocationTranscriber::new(TranscriptionConfig::for_model(&model, 3, 2), &model).unwrap();
        let times = t.node_times(-1.0, 2.0).unwrap();
        let states: Vec<Vec<f64>> = times.iter().map(|&tt| vec![tt * tt, tt]).collect();
        let z = t.assemble(&states, None, &[]).unwrap();
        for r in t.collocate_dynamics(&model, -1.0, 2.0, &z).unwrap() {
            assert_abs_diff_eq!(r, 0.0, epsilon = 1e-11);
        }
    }

    #[test]
    fn jacobian_matches_finite_differences() {
        let model = forced();
        let t = CollocationTranscriber::new(TranscriptionConfig::for_model(&model, 2, 3), &model).unwrap();
        let z: Vec<f64> = (0..t.num_variables())
            .map(|i| 0.3 * (i as f64 * 0.7).sin() + 0.1)
            .collect();
        let jac = t.dynamics_jacobian(&model, 0.0, 2.0, &z).unwrap();
        let h = 1e-6;
        for col in 0..t.num_variables() {
            let mut plus = z.clone();
            let mut minus = z.clone();
            plus[col] += h;
            minus[col] -= h;
            let rp = t.collocate_dynamics(&model, 0.0, 2.0, &plus).unwrap();
            let rm = t.collocate_dynamics(&model, 0.0, 2.0, &minus).unwrap();
            for row in 0..t.num_defects() {
                let fd = (rp[row] - rm[row]) / (2.0 * h);
                assert_abs_diff_eq!(jac[(row, col)], fd, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn id_cost_integrates_over_horizon() {
        let model = Zero { dim: 1 };
        let t = CollocationTranscriber::new(TranscriptionConfig::for_model(&model, 3, 4), &model).unwrap();
        let times = t.node_times(0.0, 2.0).unwrap();
        // x(t) = t against y = 0 with unit weight: integral of t^2 over [0, 2]
        let z: Vec<f64> = times.clone();
        let measured = vec![vec![0.0]; t.num_nodes()];
        let cost = WeightedLeastSquares::new(vec![1.0]).unwrap();
        let value = t.collocate_id_cost(&cost, &measured, 0.0, 2.0, &z).unwrap();
        assert_abs_diff_eq!(value, 8.0 / 3.0, epsilon = 1e-12);

        let grad = t.id_cost_gradient(&cost, &measured, 0.0, 2.0, &z).unwrap();
        let weights = t.node_weights(0.0, 2.0).unwrap();
        for node in 0..t.num_nodes() {
            assert_abs_diff_eq!(grad[node], 2.0 * weights[node] * z[node], epsilon = 1e-12);
        }
        let hess = t.id_cost_hessian(&cost, &measured, 0.0, 2.0, &z).unwrap();
        assert_abs_diff_eq!(hess[(4, 4)], 2.0 * weights[4], epsilon = 1e-6);
        assert_eq!(hess[(4, 5)], 0.0);

        assert!(t
            .collocate_id_cost(&cost, &measured[1..], 0.0, 2.0, &z)
            .is_err());
    }

    #[test]
    fn id_cost_rejects_short_samples_and_weights() {
        let model = Zero { dim: 2 };
        let t = CollocationTranscriber::new(TranscriptionConfig::for_model(&model, 2, 3), &model).unwrap();
        let z: Vec<f64> = (0..t.num_nodes()).flat_map(|_| [1.0, 5.0]).collect();

        let scalar_cost = WeightedLeastSquares::new(vec![1.0]).unwrap();
        let scalar_samples = vec![vec![1.0]; t.num_nodes()];
        assert!(matches!(
            t.collocate_id_cost(&scalar_cost, &scalar_samples, 0.0, 1.0, &z),
            Err(Error::Configuration(_))
        ));

        let cost = WeightedLeastSquares::uniform(2, 1.0).unwrap();
        let mut measured = vec![vec![1.0, 0.0]; t.num_nodes()];
        measured[4] = vec![1.0];
        assert!(matches!(
            t.collocate_id_cost(&cost, &measured, 0.0, 1.0, &z),
            Err(Error::Configuration(_))
        ));
        assert!(t.id_cost_gradient(&cost, &measured, 0.0, 1.0, &z).is_err());
        assert!(t.id_cost_hessian(&cost, &measured, 0.0, 1.0, &z).is_err());

        measured[4] = vec![1.0, 0.0];
        let value = t.collocate_id_cost(&cost, &measured, 0.0, 1.0, &z).unwrap();
        assert_abs_diff_eq!(value, 25.0, epsilon = 1e-12);
    }

    #[test]
    fn defects_reject_model_of_other_dimensions() {
        let model = Zero { dim: 1 };
        let t = CollocationTranscriber::new(TranscriptionConfig::for_model(&model, 2, 3), &model).unwrap();
        let z = vec![0.0; t.num_variables()];
        let wider = Zero { dim: 2 };
        assert!(matches!(
            t.collocate_dynamics(&wider, 0.0, 1.0, &z),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            t.dynamics_jacobian(&wider, 0.0, 1.0, &z),
            Err(Error::Configuration(_))
        ));
        let forced = forced();
        assert!(t.collocate_dynamics(&forced, 0.0, 1.0, &z).is_err());
    }

    #[test]
    fn initial_state_and_box_bounds() {
        let model = forced();
        let t = CollocationTranscriber::new(TranscriptionConfig::for_model(&model, 2, 2), &model).unwrap();
        let mut bounds = t.default_bounds();
        t.fix_initial_state(&mut bounds, &[0.1, -0.2]).unwrap();
        assert!(bounds.is_fixed(0) && bounds.is_fixed(1));
        assert!(!bounds.is_fixed(2));
        t.bound_controls(&mut bounds, &[-1.0], &[1.0]).unwrap();
        assert_eq!(bounds.lower[t.var_u().start], -1.0);
        t.bound_parameters(&mut bounds, &[0.0, 0.0], &[10.0, 1.0]).unwrap();
        assert_eq!(bounds.upper[t.var_p().end - 1], 1.0);
        assert!(t.fix_initial_state(&mut bounds, &[0.0]).is_err());
        assert_eq!(t.defect_bounds().len(), t.num_defects());
    }

    #[test]
    fn measurements_align_to_nodes() {
        let times = [0.0, 1.0, 2.0];
        let samples = vec![vec![0.0], vec![10.0], vec![30.0]];
        let aligned = align_to_nodes(&times, &samples, &[-1.0, 0.5, 1.5, 2.0, 3.0]).unwrap();
        assert_eq!(aligned, vec![vec![0.0], vec![5.0], vec![20.0], vec![30.0], vec![30.0]]);
        assert!(align_to_nodes(&[1.0, 0.0], &samples[..2], &[0.5]).is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = TranscriptionConfig::default().with_fixed_controls(vec![vec![1.0]]);
        let json = serde_json::to_string(&config).unwrap();
        let back: TranscriptionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        let minimal: TranscriptionConfig =
            serde_json::from_str(r#"{"num_segments":2,"poly_order":3,"state_dim":2}"#).unwrap();
        assert_eq!(minimal.control, ControlMode::Free);
    }
}
