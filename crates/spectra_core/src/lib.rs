//! The `spectra_core` crate transcribes continuous-time dynamics into algebraic
//! constraints with multi-segment Chebyshev pseudospectral collocation and solves
//! the resulting programs, optionally through homotopy continuation from an easy
//! surrogate model to the target model.
//!
//! Key components:
//! - **Traits**: `Scalar` (numeric type abstraction), `DynamicsModel` (numeric and dual evaluation), `CostFunction`.
//! - **Chebyshev**: Lobatto nodes, differentiation matrix and quadrature weights.
//! - **Transcription**: decision-variable layout, defects, Jacobians and the identification cost.
//! - **Feasible**: forward-propagated initial guesses (RK4, Tsit5) with optional weighted projection.
//! - **NLP**: the solver contract and a dense SQP implementation.
//! - **Continuation**: the stepped homotopy driver with step halving.
//! - **Equation Engine**: a bytecode VM evaluating string-defined models for `f64` and `Dual`.
pub mod autodiff;
pub mod chebyshev;
pub mod continuation;
pub mod cost;
pub mod equation_engine;
pub mod error;
pub mod feasible;
pub mod identification;
pub mod nlp;
pub mod solvers;
pub mod traits;
pub mod transcription;

pub use continuation::{ContinuationDriver, ContinuationOutcome, ContinuationSettings, DriverState};
pub use error::{Error, Result};
pub use nlp::{Bounds, NlpProblem, NlpSolution, NlpSolver, SolverStatus, SqpSolver, WarmStart};
pub use transcription::{CollocationTranscriber, TranscriptionConfig};
