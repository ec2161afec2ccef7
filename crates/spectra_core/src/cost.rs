//! Tracking costs and parameter priors used by identification problems.

use serde::{Deserialize, Serialize};

use crate::error::{ensure_config, Result};
use crate::traits::{CostDimensions, CostFunction, Scalar};

/// `sum_i q_i (x_i - y_i)^2` with a diagonal weight matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedLeastSquares {
    pub weights: Vec<f64>,
}

impl WeightedLeastSquares {
    pub fn new(weights: Vec<f64>) -> Result<Self> {
        ensure_config!(!weights.is_empty(), "least-squares weights must not be empty");
        ensure_config!(
            weights.iter().all(|w| w.is_finite() && *w >= 0.0),
            "least-squares weights must be finite and nonnegative"
        );
        Ok(Self { weights })
    }

    pub fn uniform(dim: usize, weight: f64) -> Result<Self> {
        Self::new(vec![weight; dim])
    }
}

impl CostDimensions for WeightedLeastSquares {
    fn sample_dim(&self) -> usize {
        self.weights.len()
    }
}

impl<T: Scalar> CostFunction<T> for WeightedLeastSquares {
    fn evaluate(&self, state: &[T], sample: &[f64]) -> T {
        let mut sum = T::zero();
        for ((x, y), q) in state.iter().zip(sample).zip(&self.weights) {
            let e = *x - T::constant(*y);
            sum = sum + T::constant(*q) * e * e;
        }
        sum
    }
}

/// Quadratic regularisation `weight * |p - reference|^2` on the free parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterPrior {
    pub reference: Vec<f64>,
    pub weight: f64,
}

impl ParameterPrior {
    pub fn new(reference: Vec<f64>, weight: f64) -> Result<Self> {
        ensure_config!(
            weight.is_finite() && weight >= 0.0,
            "prior weight must be finite and nonnegative (got {})",
            weight
        );
        Ok(Self { reference, weight })
    }

    pub fn value(&self, p: &[f64]) -> f64 {
        self.weight
            * p.iter()
                .zip(&self.reference)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f64>()
    }

    pub fn gradient(&self, p: &[f64], out: &mut [f64]) {
        for ((g, a), b) in out.iter_mut().zip(p).zip(&self.reference) {
            *g += 2.0 * self.weight * (a - b);
        }
    }
}
