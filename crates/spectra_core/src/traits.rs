use crate::autodiff::Dual;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars in models, costs and integrators.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {
    /// Lifts a plain constant into the scalar type (zero derivative part for duals).
    fn constant(value: f64) -> Self {
        Self::from_f64(value).unwrap_or_else(Self::nan)
    }
}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Sizes of the vectors a dynamics model consumes.
///
/// Kept apart from [`DynamicsModel`] so that a model implementing the
/// evaluator for several scalar types reports its dimensions only once.
pub trait ModelDimensions {
    fn state_dim(&self) -> usize;
    fn control_dim(&self) -> usize;
    fn parameter_dim(&self) -> usize;
}

/// State-derivative evaluator `dx/dt = f(x, u, p)`.
///
/// Implemented for `f64` this is the numeric evaluator used by forward
/// integration; implemented for [`Dual`] it is the differentiable form the
/// solver's Jacobians are built from.
pub trait DynamicsModel<T: Scalar>: ModelDimensions {
    /// x: state (len = state_dim)
    /// u: control (len = control_dim)
    /// p: parameters (len = parameter_dim, may be empty)
    /// out: buffer receiving dx/dt (len = state_dim)
    fn apply(&self, x: &[T], u: &[T], p: &[T], out: &mut [T]);
}

/// A model usable in both numeric and differentiable mode.
pub trait DifferentiableModel: DynamicsModel<f64> + DynamicsModel<Dual> {}

impl<M> DifferentiableModel for M where M: DynamicsModel<f64> + DynamicsModel<Dual> + ?Sized {}

/// Length of the state and measurement vectors a tracking cost compares.
pub trait CostDimensions {
    fn sample_dim(&self) -> usize;
}

/// Pointwise tracking cost `c(x_node, y_sample) >= 0`.
pub trait CostFunction<T: Scalar>: CostDimensions {
    fn evaluate(&self, state: &[T], sample: &[f64]) -> T;
}

/// A cost usable in both numeric and differentiable mode.
pub trait DifferentiableCost: CostFunction<f64> + CostFunction<Dual> {}

impl<C> DifferentiableCost for C where C: CostFunction<f64> + CostFunction<Dual> + ?Sized {}

/// Represents a non-autonomous flow integrated by the steppers in [`crate::solvers`].
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// x: current state
    /// t: current time
    /// out: buffer to write dx/dt
    fn apply(&self, t: T, x: &[T], out: &mut [T]);
}

/// A trait for solvers that can step a system forward.
pub trait Steppable<T: Scalar> {
    /// Performs one step of size dt.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    /// dt: step size
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T);
}

/// Checks the lengths of the vectors handed to a model against its declared sizes.
pub fn check_model_inputs(
    model: &(impl ModelDimensions + ?Sized),
    x_len: usize,
    u_len: usize,
    p_len: usize,
) -> crate::error::Result<()> {
    if x_len != model.state_dim() {
        return Err(crate::error::Error::configuration(format!(
            "state length {} does not match model state dimension {}",
            x_len,
            model.state_dim()
        )));
    }
    if u_len != model.control_dim() {
        return Err(crate::error::Error::configuration(format!(
            "control length {} does not match model control dimension {}",
            u_len,
            model.control_dim()
        )));
    }
    if p_len != model.parameter_dim() {
        return Err(crate::error::Error::configuration(format!(
            "parameter length {} does not match model parameter dimension {}",
            p_len,
            model.parameter_dim()
        )));
    }
    Ok(())
}
