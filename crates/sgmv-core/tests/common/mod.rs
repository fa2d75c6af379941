//! Shared fixtures: deterministic datasets and a dense reference operator.

#![allow(dead_code)]

use std::sync::Arc;

use approx::assert_relative_eq;
use ndarray::Array2;
use sgmv_compute::{Communicator, GridData, LocalComm};

/// Low-discrepancy points in `(0, 1)^dims`.
pub fn sample_points(n: usize, dims: usize) -> Array2<f64> {
    const ROOTS: [f64; 4] = [2.0, 3.0, 5.0, 7.0];
    Array2::from_shape_fn((n, dims), |(i, d)| {
        let v = (i as f64 + 1.0) * ROOTS[d % ROOTS.len()].sqrt();
        v - v.floor()
    })
}

pub fn sample_labels(points: &Array2<f64>) -> Vec<f64> {
    points
        .rows()
        .into_iter()
        .map(|row| row.iter().map(|x| (std::f64::consts::PI * x).sin()).product())
        .collect()
}

pub fn sample_alpha(len: usize) -> Vec<f64> {
    (0..len).map(|i| ((i * 7 % 11) as f64 - 5.0) / 3.0).collect()
}

/// `B[i][j] = φ_j(x_i)`, one row per instance.
pub fn dense_b(grid: &GridData, points: &Array2<f64>) -> Vec<Vec<f64>> {
    points
        .rows()
        .into_iter()
        .map(|row| (0..grid.len()).map(|j| grid.basis(j, row)).collect())
        .collect()
}

/// `Bᵗ·v`.
pub fn reference_rhs(grid: &GridData, points: &Array2<f64>, v: &[f64]) -> Vec<f64> {
    let b = dense_b(grid, points);
    (0..grid.len())
        .map(|j| b.iter().zip(v).map(|(row, vi)| row[j] * vi).sum())
        .collect()
}

/// `(BᵗB + λN·I)·alpha`.
pub fn reference_mult(grid: &GridData, points: &Array2<f64>, lambda: f64, alpha: &[f64]) -> Vec<f64> {
    let b = dense_b(grid, points);
    let forward: Vec<f64> = b
        .iter()
        .map(|row| row.iter().zip(alpha).map(|(bij, a)| bij * a).sum())
        .collect();
    let n = points.nrows() as f64;
    reference_rhs(grid, points, &forward)
        .into_iter()
        .zip(alpha)
        .map(|(y, a)| y + lambda * n * a)
        .collect()
}

pub fn assert_vec_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert_relative_eq!(*a, *e, epsilon = 1e-9, max_relative = 1e-9);
    }
}

pub fn shared(comm: LocalComm) -> Arc<dyn Communicator> {
    Arc::new(comm)
}
