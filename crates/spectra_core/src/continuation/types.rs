//! Settings and result types for homotopy continuation.

use serde::{Deserialize, Serialize};

use crate::error::{ensure_config, Result};
use crate::nlp::{SolverStatus, WarmStart};

/// Settings controlling the λ schedule and the retry policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContinuationSettings {
    pub lambda_start: f64,
    /// Nominal Δλ.
    pub step_size: f64,
    /// Consecutive step halvings allowed before giving up.
    pub max_halvings: usize,
    /// Factor Δλ grows by after a successful reduced step, capped at `step_size`.
    pub step_growth: f64,
    /// Hard-model defect norm below which the next target jumps to λ = 1.
    pub shortcut_tolerance: f64,
    pub max_steps: usize,
}

impl Default for ContinuationSettings {
    fn default() -> Self {
        Self {
            lambda_start: 0.0,
            step_size: 0.1,
            max_halvings: 5,
            step_growth: 2.0,
            shortcut_tolerance: 1e-8,
            max_steps: 1000,
        }
    }
}

impl ContinuationSettings {
    pub fn validate(&self) -> Result<()> {
        ensure_config!(
            (0.0..=1.0).contains(&self.lambda_start),
            "lambda_start must lie in [0, 1] (got {})",
            self.lambda_start
        );
        ensure_config!(
            self.step_size > 0.0 && self.step_size <= 1.0,
            "step_size must lie in (0, 1] (got {})",
            self.step_size
        );
        ensure_config!(
            self.step_growth >= 1.0 && self.step_growth.is_finite(),
            "step_growth must be at least 1 (got {})",
            self.step_growth
        );
        ensure_config!(
            self.shortcut_tolerance >= 0.0,
            "shortcut_tolerance must be nonnegative"
        );
        ensure_config!(self.max_steps >= 1, "max_steps must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Init,
    Stepping,
    Converged,
    Failed,
}

/// One converged solve on the homotopy path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomotopyStep {
    pub lambda: f64,
    pub status: SolverStatus,
    pub iterations: usize,
    pub objective: f64,
    /// Primal and multipliers of this solve, λ slot included.
    pub warm_start: WarmStart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationOutcome {
    pub state: DriverState,
    pub lambda_path: Vec<f64>,
    /// Decision vector `[X | U | P]` of the last converged solve.
    pub primal: Vec<f64>,
    pub parameters: Vec<f64>,
    pub solver_status: Option<SolverStatus>,
    pub steps: Vec<HomotopyStep>,
}

impl ContinuationOutcome {
    pub fn final_lambda(&self) -> Option<f64> {
        self.lambda_path.last().copied()
    }
}
