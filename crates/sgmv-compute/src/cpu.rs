//! Scalar CPU kernel using Rayon for shared-memory parallelism.

use std::ops::Range;

use rayon::prelude::*;

use crate::backend::{check_backward, check_forward, BackendType, ComputeError, DeviceInfo, EvalKernel};
use crate::data::{Dataset, GridData};
use crate::pool::ThreadTeam;

/// CPU kernel that evaluates one instance (or one grid point) per task.
#[derive(Clone)]
pub struct CpuKernel {
    team: ThreadTeam,
}

impl CpuKernel {
    /// Create a new CPU kernel on the global Rayon pool.
    pub fn new() -> Self {
        Self {
            team: ThreadTeam::global(),
        }
    }

    /// Create a CPU kernel with a private pool of `num_threads` workers.
    pub fn with_threads(num_threads: usize) -> Result<Self, ComputeError> {
        Ok(Self {
            team: ThreadTeam::with_threads(num_threads)?,
        })
    }
}

impl Default for CpuKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl EvalKernel for CpuKernel {
    fn device_info(&self) -> DeviceInfo {
        let threads = self.team.num_threads();
        DeviceInfo {
            name: format!("CPU ({threads} threads)"),
            backend_type: BackendType::Cpu,
            vector_width: 1,
            compute_units: Some(threads),
        }
    }

    fn vector_width(&self) -> usize {
        1
    }

    fn forward(
        &self,
        grid: &GridData,
        data: &Dataset,
        alpha: &[f64],
        grid_range: Range<usize>,
        data_range: Range<usize>,
        out: &mut [f64],
    ) -> Result<(), ComputeError> {
        check_forward(grid, data, alpha, &grid_range, &data_range, out)?;

        let start = data_range.start;
        self.team.install(|| {
            out.par_iter_mut().enumerate().for_each(|(k, y)| {
                let x = data.row(start + k);
                *y = grid_range
                    .clone()
                    .map(|j| alpha[j] * grid.basis(j, x))
                    .sum();
            });
        });
        Ok(())
    }

    fn backward(
        &self,
        grid: &GridData,
        data: &Dataset,
        source: &[f64],
        data_range: Range<usize>,
        grid_range: Range<usize>,
        out: &mut [f64],
    ) -> Result<(), ComputeError> {
        check_backward(grid, data, source, &data_range, &grid_range, out)?;

        let start = grid_range.start;
        self.team.install(|| {
            out.par_iter_mut().enumerate().for_each(|(k, y)| {
                let j = start + k;
                *y = data_range
                    .clone()
                    .map(|i| source[i] * grid.basis(j, data.row(i)))
                    .sum();
            });
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn setup() -> (GridData, Dataset) {
        let grid = GridData::regular(2, 2).unwrap();
        let points = array![[0.5, 0.5], [0.25, 0.75], [0.1, 0.9], [0.6, 0.3], [0.8, 0.8]];
        (grid, Dataset::padded(points, 1).unwrap())
    }

    #[test]
    fn forward_matches_direct_sum() {
        let (grid, data) = setup();
        let alpha: Vec<f64> = (0..grid.len()).map(|j| 1.0 + j as f64).collect();
        let mut out = vec![0.0; data.padded_len()];
        CpuKernel::new()
            .forward(&grid, &data, &alpha, 0..grid.len(), 0..data.padded_len(), &mut out)
            .unwrap();

        for (i, y) in out.iter().enumerate() {
            let expected: f64 = (0..grid.len())
                .map(|j| alpha[j] * grid.basis(j, data.row(i)))
                .sum();
            assert_abs_diff_eq!(*y, expected, epsilon = 1e-14);
        }
        // Centre point (0.5, 0.5): only the level-(1,1) hat is non-zero there.
        assert_abs_diff_eq!(out[0], alpha[0], epsilon = 1e-14);
    }

    #[test]
    fn backward_over_subranges_overwrites() {
        let (grid, data) = setup();
        let source = vec![1.0, -1.0, 0.5, 2.0, 0.0];
        let kernel = CpuKernel::with_threads(2).unwrap();

        let mut full = vec![0.0; grid.len()];
        kernel
            .backward(&grid, &data, &source, 0..5, 0..grid.len(), &mut full)
            .unwrap();

        let mut part = vec![123.0; 2];
        kernel
            .backward(&grid, &data, &source, 0..5, 1..3, &mut part)
            .unwrap();
        assert_abs_diff_eq!(part[0], full[1], epsilon = 1e-14);
        assert_abs_diff_eq!(part[1], full[2], epsilon = 1e-14);
    }

    #[test]
    fn rejects_out_of_bounds_range() {
        let (grid, data) = setup();
        let alpha = vec![0.0; grid.len()];
        let mut out = vec![0.0; 6];
        let err = CpuKernel::new()
            .forward(&grid, &data, &alpha, 0..grid.len(), 0..6, &mut out)
            .unwrap_err();
        assert!(matches!(err, ComputeError::OutOfBounds { .. }));
    }
}
