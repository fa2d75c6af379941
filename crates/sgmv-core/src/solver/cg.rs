//! Conjugate gradients.
//!
//! The residual is updated recursively and recomputed from scratch every
//! [`ConjugateGradients::recompute_every`] iterations to limit drift.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{dot, LinearSolver, SolveReport, SolverError};
use crate::operator::SystemMatrix;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConjugateGradients {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Target relative residual `‖r‖ / ‖b‖`.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_recompute_every")]
    pub recompute_every: usize,
}

fn default_max_iterations() -> usize {
    250
}

fn default_tolerance() -> f64 {
    1e-8
}

fn default_recompute_every() -> usize {
    50
}

impl Default for ConjugateGradients {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            recompute_every: default_recompute_every(),
        }
    }
}

impl ConjugateGradients {
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), SolverError> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(SolverError::InvalidSettings(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.recompute_every == 0 {
            return Err(SolverError::InvalidSettings(
                "recompute_every must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// `b − A·x`.
fn residual(matrix: &mut dyn SystemMatrix, rhs: &[f64], x: &[f64]) -> Result<Vec<f64>, SolverError> {
    let ax = matrix.mult(x)?;
    Ok(rhs.iter().zip(&ax).map(|(b, a)| b - a).collect())
}

impl LinearSolver for ConjugateGradients {
    fn solve(
        &self,
        matrix: &mut dyn SystemMatrix,
        rhs: &[f64],
        initial: Option<&[f64]>,
    ) -> Result<SolveReport, SolverError> {
        self.validate()?;
        let n = matrix.dim();
        if rhs.len() != n {
            return Err(SolverError::DimensionMismatch {
                expected: n,
                actual: rhs.len(),
            });
        }
        if let Some(x0) = initial {
            if x0.len() != n {
                return Err(SolverError::DimensionMismatch {
                    expected: n,
                    actual: x0.len(),
                });
            }
        }

        let rhs_norm = dot(rhs, rhs).sqrt();
        if rhs_norm == 0.0 {
            return Ok(SolveReport {
                solution: vec![0.0; n],
                iterations: 0,
                residual_norm: 0.0,
                converged: true,
            });
        }

        let mut x = initial.map_or_else(|| vec![0.0; n], <[f64]>::to_vec);
        let mut r = match initial {
            Some(_) => residual(matrix, rhs, &x)?,
            None => rhs.to_vec(),
        };
        let mut p = r.clone();
        let mut rr = dot(&r, &r);
        let threshold = (self.tolerance * rhs_norm).powi(2);

        let mut iterations = 0;
        while iterations < self.max_iterations && rr > threshold {
            let q = matrix.mult(&p)?;
            let curvature = dot(&p, &q);
            if curvature <= 0.0 {
                return Err(SolverError::Breakdown(iterations));
            }
            let step = rr / curvature;
            for (xi, pi) in x.iter_mut().zip(&p) {
                *xi += step * pi;
            }
            iterations += 1;

            if iterations % self.recompute_every == 0 {
                r = residual(matrix, rhs, &x)?;
            } else {
                for (ri, qi) in r.iter_mut().zip(&q) {
                    *ri -= step * qi;
                }
            }

            let rr_next = dot(&r, &r);
            let beta = rr_next / rr;
            for (pi, ri) in p.iter_mut().zip(&r) {
                *pi = ri + beta * *pi;
            }
            rr = rr_next;
            debug!(
                "cg iteration {iterations}: relative residual {:.3e}",
                rr.sqrt() / rhs_norm
            );
        }

        let residual_norm = rr.sqrt() / rhs_norm;
        let converged = rr <= threshold;
        if converged {
            info!("cg converged in {iterations} iterations (residual {residual_norm:.3e})");
        } else {
            warn!(
                "cg stopped after {iterations} iterations with residual {residual_norm:.3e} (target {:.1e})",
                self.tolerance
            );
        }
        Ok(SolveReport {
            solution: x,
            iterations,
            residual_norm,
            converged,
        })
    }

    fn method_name(&self) -> &str {
        "conjugate gradients"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperatorError;
    use approx::assert_relative_eq;

    /// Dense row-major SPD matrix.
    struct Dense {
        n: usize,
        a: Vec<f64>,
        calls: usize,
    }

    impl SystemMatrix for Dense {
        fn mult(&mut self, x: &[f64]) -> Result<Vec<f64>, OperatorError> {
            self.calls += 1;
            Ok((0..self.n)
                .map(|i| dot(&self.a[i * self.n..(i + 1) * self.n], x))
                .collect())
        }

        fn generate_rhs(&mut self, labels: &[f64]) -> Result<Vec<f64>, OperatorError> {
            Ok(labels.to_vec())
        }

        fn dim(&self) -> usize {
            self.n
        }
    }

    /// Tridiagonal `[-1, 4, -1]`.
    fn tridiagonal(n: usize) -> Dense {
        let mut a = vec![0.0; n * n];
        for i in 0..n {
            a[i * n + i] = 4.0;
            if i > 0 {
                a[i * n + i - 1] = -1.0;
            }
            if i + 1 < n {
                a[i * n + i + 1] = -1.0;
            }
        }
        Dense { n, a, calls: 0 }
    }

    #[test]
    fn solves_spd_system() {
        let mut m = tridiagonal(12);
        let expected: Vec<f64> = (0..12).map(|i| (i as f64 * 0.7).sin()).collect();
        let rhs = m.mult(&expected).unwrap();

        let report = ConjugateGradients::new(100, 1e-12).solve(&mut m, &rhs, None).unwrap();
        assert!(report.converged);
        assert!(report.iterations < 30);
        for (x, e) in report.solution.iter().zip(&expected) {
            assert_relative_eq!(*x, *e, epsilon = 1e-9);
        }
    }

    #[test]
    fn zero_rhs_returns_immediately() {
        let mut m = tridiagonal(5);
        let report = ConjugateGradients::default()
            .solve(&mut m, &[0.0; 5], None)
            .unwrap();
        assert_eq!(report.iterations, 0);
        assert_eq!(report.solution, vec![0.0; 5]);
        assert_eq!(m.calls, 0);
    }

    #[test]
    fn exact_initial_guess_needs_no_iterations() {
        let mut m = tridiagonal(6);
        let x0 = vec![1.0; 6];
        let rhs = m.mult(&x0).unwrap();
        let report = ConjugateGradients::default()
            .solve(&mut m, &rhs, Some(&x0))
            .unwrap();
        assert_eq!(report.iterations, 0);
        assert!(report.converged);
    }

    #[test]
    fn iteration_cap_is_reported() {
        let mut m = tridiagonal(30);
        let rhs: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let report = ConjugateGradients::new(2, 1e-14).solve(&mut m, &rhs, None).unwrap();
        assert_eq!(report.iterations, 2);
        assert!(!report.converged);
    }

    #[test]
    fn mismatched_rhs_is_rejected() {
        let mut m = tridiagonal(4);
        assert!(matches!(
            ConjugateGradients::default().solve(&mut m, &[1.0; 3], None),
            Err(SolverError::DimensionMismatch { expected: 4, actual: 3 })
        ));
    }
}
