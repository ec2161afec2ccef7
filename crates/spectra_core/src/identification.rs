//! Selection of free vs. fixed model parameters for identification runs.

use serde::{Deserialize, Serialize};

use crate::equation_engine::EquationModel;
use crate::error::{ensure_config, Error, Result};
use crate::traits::{DynamicsModel, ModelDimensions, Scalar};

/// Which model parameters the solver is allowed to move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "indices", rename_all = "snake_case")]
pub enum IdentificationMode {
    /// Every parameter held at its nominal value (plain trajectory optimisation).
    Fixed,
    /// Every parameter free.
    Full,
    /// Only the listed parameter indices are free.
    Selected(Vec<usize>),
}

impl IdentificationMode {
    /// Selects parameters of a compiled model by name.
    pub fn by_name(model: &EquationModel, names: &[&str]) -> Result<Self> {
        let indices = names
            .iter()
            .map(|name| {
                model
                    .parameter_index(name)
                    .ok_or_else(|| Error::configuration(format!("unknown parameter '{}'", name)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(IdentificationMode::Selected(indices))
    }

    fn free_indices(&self, parameter_dim: usize) -> Result<Vec<usize>> {
        match self {
            IdentificationMode::Fixed => Ok(Vec::new()),
            IdentificationMode::Full => Ok((0..parameter_dim).collect()),
            IdentificationMode::Selected(indices) => {
                let mut sorted = indices.clone();
                sorted.sort_unstable();
                sorted.dedup();
                ensure_config!(
                    sorted.len() == indices.len(),
                    "identification selects a parameter more than once"
                );
                if let Some(&bad) = sorted.iter().find(|&&i| i >= parameter_dim) {
                    return Err(Error::configuration(format!(
                        "parameter index {} out of range for {} parameters",
                        bad, parameter_dim
                    )));
                }
                Ok(indices.clone())
            }
        }
    }
}

/// Wraps a model so that only the parameters chosen by an
/// [`IdentificationMode`] appear in its parameter vector; the others are
/// substituted with their nominal values.
#[derive(Debug, Clone)]
pub struct IdentifiedModel<M> {
    inner: M,
    nominal: Vec<f64>,
    free: Vec<usize>,
}

impl<M: ModelDimensions> IdentifiedModel<M> {
    pub fn new(inner: M, nominal: Vec<f64>, mode: &IdentificationMode) -> Result<Self> {
        ensure_config!(
            nominal.len() == inner.parameter_dim(),
            "nominal parameter vector has length {} but the model expects {}",
            nominal.len(),
            inner.parameter_dim()
        );
        let free = mode.free_indices(inner.parameter_dim())?;
        Ok(Self {
            inner,
            nominal,
            free,
        })
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    pub fn free_indices(&self) -> &[usize] {
        &self.free
    }

    /// Nominal values of the free parameters, in free-vector order.
    pub fn nominal_free(&self) -> Vec<f64> {
        self.free.iter().map(|&i| self.nominal[i]).collect()
    }

    /// Full parameter vector with the free entries replaced by `free_values`.
    pub fn expand(&self, free_values: &[f64]) -> Vec<f64> {
        let mut full = self.nominal.clone();
        for (&idx, &value) in self.free.iter().zip(free_values) {
            full[idx] = value;
        }
        full
    }
}

impl<M: ModelDimensions> ModelDimensions for IdentifiedModel<M> {
    fn state_dim(&self) -> usize {
        self.inner.state_dim()
    }

    fn control_dim(&self) -> usize {
        self.inner.control_dim()
    }

    fn parameter_dim(&self) -> usize {
        self.free.len()
    }
}

impl<T: Scalar, M: DynamicsModel<T>> DynamicsModel<T> for IdentifiedModel<M> {
    fn apply(&self, x: &[T], u: &[T], p: &[T], out: &mut [T]) {
        let mut full: Vec<T> = self.nominal.iter().map(|&v| T::constant(v)).collect();
        for (&idx, &value) in self.free.iter().zip(p) {
            full[idx] = value;
        }
        self.inner.apply(x, u, &full, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::model_jacobian;
    use crate::equation_engine::ModelSpec;
    use approx::assert_relative_eq;

    fn damped() -> EquationModel {
        ModelSpec::new(&["x", "v"], &["v", "-k * x - c * v"])
            .with_parameters(&["k", "c"])
            .compile()
            .unwrap()
    }

    #[test]
    fn modes_select_free_parameters() {
        let model = damped();
        let fixed = IdentifiedModel::new(model.clone(), vec![4.0, 0.5], &IdentificationMode::Fixed)
            .unwrap();
        assert_eq!(fixed.parameter_dim(), 0);

        let full = IdentifiedModel::new(model.clone(), vec![4.0, 0.5], &IdentificationMode::Full)
            .unwrap();
        assert_eq!(full.parameter_dim(), 2);

        let mode = IdentificationMode::by_name(&model, &["c"]).unwrap();
        let damping = IdentifiedModel::new(model, vec![4.0, 0.5], &mode).unwrap();
        assert_eq!(damping.free_indices(), &[1]);
        assert_eq!(damping.nominal_free(), vec![0.5]);
        assert_eq!(damping.expand(&[0.9]), vec![4.0, 0.9]);

        let mut out = [0.0; 2];
        damping.apply(&[1.0, 2.0], &[], &[0.9], &mut out);
        assert_relative_eq!(out[1], -4.0 - 1.8);
    }

    #[test]
    fn jacobian_only_covers_free_parameters() {
        let mode = IdentificationMode::Selected(vec![0]);
        let model = IdentifiedModel::new(damped(), vec![4.0, 0.5], &mode).unwrap();
        let jac = model_jacobian(&model, &[1.0, 2.0], &[], &[4.0]);
        assert_eq!(jac.d_param.len(), 2);
        assert_relative_eq!(jac.d_param[1], -1.0);
    }

    #[test]
    fn invalid_selections_are_configuration_errors() {
        let model = damped();
        assert!(IdentificationMode::by_name(&model, &["mass"]).is_err());
        assert!(IdentifiedModel::new(
            model.clone(),
            vec![1.0, 1.0],
            &IdentificationMode::Selected(vec![2])
        )
        .is_err());
        assert!(IdentifiedModel::new(
            model.clone(),
            vec![1.0, 1.0],
            &IdentificationMode::Selected(vec![0, 0])
        )
        .is_err());
        assert!(IdentifiedModel::new(model, vec![1.0], &IdentificationMode::Full).is_err());
    }

    #[test]
    fn mode_serializes_with_tag() {
        let json = serde_json::to_string(&IdentificationMode::Selected(vec![1, 3])).unwrap();
        assert_eq!(json, r#"{"mode":"selected","indices":[1,3]}"#);
        let back: IdentificationMode = serde_json::from_str(r#"{"mode":"full"}"#).unwrap();
        assert_eq!(back, IdentificationMode::Full);
    }
}
