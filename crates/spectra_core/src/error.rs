//! Error taxonomy shared by the transcription, guess generation and continuation layers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::nlp::SolverStatus;

pub type Result<T> = std::result::Result<T, Error>;

/// Trajectory retained when continuation gives up, so the caller can decide
/// whether a partially continued solution is still useful.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalledSolution {
    pub lambda: f64,
    pub primal: Vec<f64>,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or mismatched dimensions/orders. Always raised before any solve.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Non-finite value while propagating the initial guess.
    #[error("integration diverged at node {node} (t = {time}): non-finite state")]
    IntegrationDivergence {
        node: usize,
        time: f64,
        /// Node states produced before the divergence, flattened in node order.
        partial: Vec<f64>,
    },

    /// A single NLP solve ended with a non-successful status.
    #[error("solver failure at lambda = {lambda:?}: status {status:?} after {iterations} iterations")]
    SolverFailure {
        lambda: Option<f64>,
        status: SolverStatus,
        iterations: usize,
    },

    /// Step halving exhausted without a successful continuation step.
    #[error(
        "continuation stalled: last converged lambda = {}, attempted lambda = {attempted_lambda}, \
         status {status:?} after {iterations} iterations",
        .last_good.lambda
    )]
    ContinuationStall {
        last_good: Box<StalledSolution>,
        attempted_lambda: f64,
        status: SolverStatus,
        iterations: usize,
    },
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    /// A solve that ended in an adapter error rather than a status.
    pub fn solver_error(lambda: Option<f64>) -> Self {
        Error::SolverFailure {
            lambda,
            status: SolverStatus::NumericalError,
            iterations: 0,
        }
    }

    /// True for the failures the continuation driver may recover from.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Configuration(_))
    }
}

macro_rules! ensure_config {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::Error::configuration(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_config;

#[cfg(test)]
mod tests {
    use super::*;

    fn check(n: usize) -> Result<usize> {
        ensure_config!(n > 0, "order must be positive (got {})", n);
        Ok(n)
    }

    #[test]
    fn ensure_config_reports_message() {
        let err = check(0).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(
            err.to_string(),
            "configuration error: order must be positive (got 0)"
        );
        assert!(!err.is_recoverable());
        assert_eq!(check(3).unwrap(), 3);
    }

    #[test]
    fn adapter_errors_are_recoverable_numerical_failures() {
        let err = Error::solver_error(None);
        assert!(matches!(
            err,
            Error::SolverFailure {
                lambda: None,
                status: SolverStatus::NumericalError,
                iterations: 0,
            }
        ));
        assert!(err.is_recoverable());
    }

    #[test]
    fn stall_message_carries_lambda() {
        let err = Error::ContinuationStall {
            last_good: Box::new(StalledSolution {
                lambda: 0.25,
                primal: vec![1.0],
            }),
            attempted_lambda: 0.26,
            status: SolverStatus::Infeasible,
            iterations: 12,
        };
        let text = err.to_string();
        assert!(text.contains("0.25"));
        assert!(text.contains("0.26"));
        assert!(err.is_recoverable());
    }
}
