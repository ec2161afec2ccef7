//! Chebyshev–Gauss–Lobatto nodes, differentiation matrix and quadrature weights.
//!
//! Everything here is a pure function of the polynomial order, so one
//! [`ChebyshevBasis`] is built per problem and shared by every segment and
//! every continuation step.

use std::f64::consts::PI;

use nalgebra::DMatrix;

use crate::error::{ensure_config, Result};

/// Nodes, differentiation matrix and Clenshaw–Curtis weights for one order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChebyshevBasis {
    order: usize,
    nodes: Vec<f64>,
    diff: DMatrix<f64>,
    weights: Vec<f64>,
}

impl ChebyshevBasis {
    pub fn new(poly_order: usize) -> Result<Self> {
        let (nodes, diff) = generate(poly_order)?;
        let weights = clenshaw_curtis_weights(poly_order);
        Ok(Self {
            order: poly_order,
            nodes,
            diff,
            weights,
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn num_nodes(&self) -> usize {
        self.order + 1
    }

    /// Local node coordinates on [-1, 1], ascending.
    pub fn nodes(&self) -> &[f64] {
        &self.nodes
    }

    /// Differentiation matrix with respect to the local coordinate.
    pub fn differentiation_matrix(&self) -> &DMatrix<f64> {
        &self.diff
    }

    /// Quadrature weights on [-1, 1] matching [`Self::nodes`].
    pub fn quadrature_weights(&self) -> &[f64] {
        &self.weights
    }

    /// Evaluates the interpolating polynomial through `values` (one per node) at `x`.
    pub fn interpolate(&self, values: &[f64], x: f64) -> f64 {
        let bary = barycentric_weights(self.order);
        let mut num = 0.0;
        let mut den = 0.0;
        for (j, (&xj, &fj)) in self.nodes.iter().zip(values).enumerate() {
            let dx = x - xj;
            if dx == 0.0 {
                return fj;
            }
            let w = bary[j] / dx;
            num += w * fj;
            den += w;
        }
        num / den
    }
}

/// Chebyshev–Gauss–Lobatto nodes `x_j = -cos(pi j / N)` (ascending) and the
/// matching differentiation matrix, exact for polynomials of degree <= N.
pub fn generate(poly_order: usize) -> Result<(Vec<f64>, DMatrix<f64>)> {
    ensure_config!(
        poly_order >= 1,
        "polynomial order must be at least 1 (got {})",
        poly_order
    );
    let n = poly_order;
    let nodes: Vec<f64> = (0..=n)
        .map(|j| {
            // sin form keeps the node set exactly antisymmetric around zero
            let arg = PI * (2.0 * j as f64 - n as f64) / (2.0 * n as f64);
            arg.sin()
        })
        .collect();

    let bary = barycentric_weights(n);
    let mut diff = DMatrix::zeros(n + 1, n + 1);
    for i in 0..=n {
        let mut row_sum = 0.0;
        for j in 0..=n {
            if i == j {
                continue;
            }
            let value = (bary[j] / bary[i]) / (nodes[i] - nodes[j]);
            diff[(i, j)] = value;
            row_sum += value;
        }
        // negative-sum trick: rows of D annihilate constants exactly
        diff[(i, i)] = -row_sum;
    }

    Ok((nodes, diff))
}

/// Affine map of segment `segment_index` of `[t0, tf]` split into
/// `num_segments` equal pieces.
///
/// Returns `(time_offset, scale)` with `t = time_offset + x / scale` for a
/// local coordinate `x` in [-1, 1]; `scale = 2 / segment_duration` converts a
/// local derivative into a physical-time derivative.
pub fn segment_time_map(
    segment_index: usize,
    t0: f64,
    tf: f64,
    num_segments: usize,
) -> Result<(f64, f64)> {
    ensure_config!(num_segments >= 1, "at least one segment is required");
    ensure_config!(
        segment_index < num_segments,
        "segment index {} out of range for {} segments",
        segment_index,
        num_segments
    );
    ensure_config!(
        tf.is_finite() && t0.is_finite() && tf > t0,
        "time horizon must satisfy t0 < tf (got t0 = {}, tf = {})",
        t0,
        tf
    );
    let duration = (tf - t0) / num_segments as f64;
    let offset = t0 + (segment_index as f64 + 0.5) * duration;
    Ok((offset, 2.0 / duration))
}

fn barycentric_weights(n: usize) -> Vec<f64> {
    (0..=n)
        .map(|j| {
            let sign = if j % 2 == 0 { 1.0 } else { -1.0 };
            if j == 0 || j == n {
                0.5 * sign
            } else {
                sign
            }
        })
        .collect()
}

fn clenshaw_curtis_weights(n: usize) -> Vec<f64> {
    let nf = n as f64;
    let mut w = vec![0.0; n + 1];
    let theta: Vec<f64> = (0..=n).map(|j| PI * j as f64 / nf).collect();
    let mut v = vec![1.0; n.saturating_sub(1)];

    if n % 2 == 0 {
        w[0] = 1.0 / (nf * nf - 1.0);
        w[n] = w[0];
        for k in 1..n / 2 {
            let kf = k as f64;
            for (i, vi) in v.iter_mut().enumerate() {
                *vi -= 2.0 * (2.0 * kf * theta[i + 1]).cos() / (4.0 * kf * kf - 1.0);
            }
        }
        for (i, vi) in v.iter_mut().enumerate() {
            *vi -= (nf * theta[i + 1]).cos() / (nf * nf - 1.0);
        }
    } else {
        w[0] = 1.0 / (nf * nf);
        w[n] = w[0];
        for k in 1..=(n - 1) / 2 {
            let kf = k as f64;
            for (i, vi) in v.iter_mut().enumerate() {
                *vi -= 2.0 * (2.0 * kf * theta[i + 1]).cos() / (4.0 * kf * kf - 1.0);
            }
        }
    }

    for (i, vi) in v.iter().enumerate() {
        w[i + 1] = 2.0 * vi / nf;
    }
    w
}
