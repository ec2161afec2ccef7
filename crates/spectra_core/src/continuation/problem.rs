use anyhow::Result;
use nalgebra::DMatrix;

use crate::cost::ParameterPrior;
use crate::nlp::NlpProblem;
use crate::traits::{DifferentiableCost, DifferentiableModel};
use crate::transcription::CollocationTranscriber;

/// Identification objective: quadrature tracking cost plus an optional prior
/// on the free parameters.
#[derive(Clone, Copy)]
pub struct IdentificationObjective<'a> {
    pub cost: &'a dyn DifferentiableCost,
    /// One sample per node, already aligned to the node times.
    pub measured: &'a [Vec<f64>],
    pub prior: Option<&'a ParameterPrior>,
}

/// Blended problem over `[X | U | P | λ]`:
/// `g(z, λ) = λ * defects_hard(z) + (1 - λ) * defects_easy(z)`.
pub struct HomotopyProblem<'a> {
    pub(crate) transcriber: &'a CollocationTranscriber,
    pub(crate) easy: &'a dyn DifferentiableModel,
    pub(crate) hard: &'a dyn DifferentiableModel,
    pub(crate) t0: f64,
    pub(crate) tf: f64,
    pub(crate) objective: Option<IdentificationObjective<'a>>,
}

impl<'a> HomotopyProblem<'a> {
    fn split<'z>(&self, z: &'z [f64]) -> (&'z [f64], f64) {
        let n = self.transcriber.num_variables();
        (&z[..n], z[n])
    }

    /// Infinity norm of the hard-model defects at a layout vector.
    pub fn hard_defect_norm(&self, primal: &[f64]) -> crate::error::Result<f64> {
        let residual = self
            .transcriber
            .collocate_dynamics(self.hard, self.t0, self.tf, primal)?;
        Ok(residual.iter().fold(0.0, |acc, r| acc.max(r.abs())))
    }
}

impl NlpProblem for HomotopyProblem<'_> {
    fn num_variables(&self) -> usize {
        self.transcriber.num_variables() + 1
    }

    fn num_constraints(&self) -> usize {
        self.transcriber.num_defects()
    }

    fn objective(&mut self, z: &[f64]) -> Result<f64> {
        let (primal, _) = self.split(z);
        let Some(obj) = self.objective else {
            return Ok(0.0);
        };
        let mut value =
            self.transcriber
                .collocate_id_cost(obj.cost, obj.measured, self.t0, self.tf, primal)?;
        if let Some(prior) = obj.prior {
            value += prior.value(self.transcriber.parameters(primal));
        }
        Ok(value)
    }

    fn gradient(&mut self, z: &[f64]) -> Result<Vec<f64>> {
        let (primal, _) = self.split(z);
        let mut grad = match self.objective {
            Some(obj) => {
                let mut grad = self.transcriber.id_cost_gradient(
                    obj.cost,
                    obj.measured,
                    self.t0,
                    self.tf,
                    primal,
                )?;
                if let Some(prior) = obj.prior {
                    let range = self.transcriber.var_p();
                    prior.gradient(self.transcriber.parameters(primal), &mut grad[range]);
                }
                grad
            }
            None => vec![0.0; primal.len()],
        };
        grad.push(0.0);
        Ok(grad)
    }

    fn hessian(&mut self, z: &[f64]) -> Result<DMatrix<f64>> {
        let (primal, _) = self.split(z);
        let n = z.len();
        let mut hess = DMatrix::zeros(n, n);
        if let Some(obj) = self.objective {
            let block =
                self.transcriber
                    .id_cost_hessian(obj.cost, obj.measured, self.t0, self.tf, primal)?;
            hess.view_mut((0, 0), (n - 1, n - 1)).copy_from(&block);
            if let Some(prior) = obj.prior {
                for i in self.transcriber.var_p() {
                    hess[(i, i)] += 2.0 * prior.weight;
                }
            }
        }
        Ok(hess)
    }

    fn constraints(&mut self, z: &[f64]) -> Result<Vec<f64>> {
        let (primal, lambda) = self.split(z);
        let hard = self
            .transcriber
            .collocate_dynamics(self.hard, self.t0, self.tf, primal)?;
        let easy = self
            .transcriber
            .collocate_dynamics(self.easy, self.t0, self.tf, primal)?;
        Ok(hard
            .iter()
            .zip(&easy)
            .map(|(h, e)| lambda * h + (1.0 - lambda) * e)
            .collect())
    }

    fn jacobian(&mut self, z: &[f64]) -> Result<DMatrix<f64>> {
        let (primal, lambda) = self.split(z);
        let n = primal.len();
        let m = self.transcriber.num_defects();
        let hard_jac = self
            .transcriber
            .dynamics_jacobian(self.hard, self.t0, self.tf, primal)?;
        let easy_jac = self
            .transcriber
            .dynamics_jacobian(self.easy, self.t0, self.tf, primal)?;
        let hard = self
            .transcriber
            .collocate_dynamics(self.hard, self.t0, self.tf, primal)?;
        let easy = self
            .transcriber
            .collocate_dynamics(self.easy, self.t0, self.tf, primal)?;

        let mut jac = DMatrix::zeros(m, n + 1);
        jac.view_mut((0, 0), (m, n))
            .copy_from(&(hard_jac * lambda + easy_jac * (1.0 - lambda)));
        for r in 0..m {
            jac[(r, n)] = hard[r] - easy[r];
        }
        Ok(jac)
    }
}
