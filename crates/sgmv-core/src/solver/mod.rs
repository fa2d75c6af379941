//! Linear solvers driven through [`SystemMatrix`].
//!
//! The solvers only see the operator through `mult`, so the same code runs
//! on a single rank or in lockstep on every rank of a distributed operator.

pub mod cg;

pub use cg::ConjugateGradients;

use serde::Serialize;
use thiserror::Error;

use crate::error::OperatorError;
use crate::operator::SystemMatrix;

/// Errors that can occur during a linear solve.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("Operator failed: {0}")]
    Operator(#[from] OperatorError),

    #[error("Invalid solver settings: {0}")]
    InvalidSettings(String),

    #[error("Vector length {actual} does not match the operator dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Search direction lost positive curvature at iteration {0}")]
    Breakdown(usize),
}

/// Outcome of a solve.
#[derive(Debug, Clone, Serialize)]
pub struct SolveReport {
    pub solution: Vec<f64>,
    pub iterations: usize,
    /// `‖b − A·x‖ / ‖b‖` at exit.
    pub residual_norm: f64,
    pub converged: bool,
}

/// A solver for `A·x = b` with symmetric positive definite `A`.
pub trait LinearSolver {
    fn solve(
        &self,
        matrix: &mut dyn SystemMatrix,
        rhs: &[f64],
        initial: Option<&[f64]>,
    ) -> Result<SolveReport, SolverError>;

    /// Human-readable name of the method.
    fn method_name(&self) -> &str;
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
