//! Lane-blocked CPU kernel using `wide::f64x4`.
//!
//! Instances are processed in blocks of four lanes. The kernel's vector
//! width is a configurable multiple of the lane count; ranges handed to it
//! must be aligned to that width, which is also the padding unit of the
//! dataset.

use std::ops::Range;

use rayon::prelude::*;
use wide::f64x4;

use crate::backend::{
    check_aligned, check_backward, check_forward, BackendType, ComputeError, DeviceInfo,
    EvalKernel,
};
use crate::data::{Dataset, GridData};
use crate::pool::ThreadTeam;

const LANES: usize = 4;

/// Vectorised evaluation kernel.
#[derive(Clone)]
pub struct SimdKernel {
    width: usize,
    team: ThreadTeam,
}

impl SimdKernel {
    pub fn new(width: usize) -> Result<Self, ComputeError> {
        Self::build(width, ThreadTeam::global())
    }

    pub fn with_threads(width: usize, num_threads: usize) -> Result<Self, ComputeError> {
        Self::build(width, ThreadTeam::with_threads(num_threads)?)
    }

    fn build(width: usize, team: ThreadTeam) -> Result<Self, ComputeError> {
        if width == 0 || width % LANES != 0 {
            return Err(ComputeError::InvalidArgument(format!(
                "SIMD width {width} is not a positive multiple of {LANES}"
            )));
        }
        Ok(Self { width, team })
    }
}

/// Transpose `data_range` into lane blocks laid out `[block][dim]`.
fn lane_blocks(data: &Dataset, data_range: &Range<usize>) -> Vec<f64x4> {
    let dims = data.dims();
    let blocks = data_range.len() / LANES;
    let mut lanes = Vec::with_capacity(blocks * dims);
    for b in 0..blocks {
        let base = data_range.start + b * LANES;
        for d in 0..dims {
            lanes.push(f64x4::new([
                data.points()[[base, d]],
                data.points()[[base + 1, d]],
                data.points()[[base + 2, d]],
                data.points()[[base + 3, d]],
            ]));
        }
    }
    lanes
}

/// Hat function `point` evaluated on four instances at once.
#[inline]
fn basis4(grid: &GridData, point: usize, x: &[f64x4]) -> f64x4 {
    let one = f64x4::splat(1.0);
    let zero = f64x4::splat(0.0);
    let mut value = one;
    for (d, xd) in x.iter().enumerate() {
        let level = f64x4::splat(grid.level()[[point, d]]);
        let index = f64x4::splat(grid.index()[[point, d]]);
        let hat = (one - (level * *xd - index).abs()).max(zero);
        value *= hat;
    }
    value
}

impl EvalKernel for SimdKernel {
    fn device_info(&self) -> DeviceInfo {
        let threads = self.team.num_threads();
        DeviceInfo {
            name: format!("SIMD f64x{LANES} (width {}, {threads} threads)", self.width),
            backend_type: BackendType::Simd,
            vector_width: self.width,
            compute_units: Some(threads),
        }
    }

    fn vector_width(&self) -> usize {
        self.width
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
        check_aligned(&data_range, self.width)?;

        let dims = data.dims();
        let lanes = lane_blocks(data, &data_range);
        self.team.install(|| {
            out.par_chunks_mut(LANES)
                .zip(lanes.par_chunks(dims.max(1)))
                .for_each(|(y, x)| {
                    let mut acc = f64x4::splat(0.0);
                    for j in grid_range.clone() {
                        acc += basis4(grid, j, x) * f64x4::splat(alpha[j]);
                    }
                    y.copy_from_slice(&acc.to_array());
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
        check_aligned(&data_range, self.width)?;

        let dims = data.dims().max(1);
        let lanes = lane_blocks(data, &data_range);
        let weights: Vec<f64x4> = source[data_range.clone()]
            .chunks_exact(LANES)
            .map(|s| f64x4::new([s[0], s[1], s[2], s[3]]))
            .collect();

        let start = grid_range.start;
        self.team.install(|| {
            out.par_iter_mut().enumerate().for_each(|(k, y)| {
                let j = start + k;
                let mut acc = f64x4::splat(0.0);
                for (x, w) in lanes.chunks_exact(dims).zip(&weights) {
                    acc += basis4(grid, j, x) * *w;
                }
                *y = acc.to_array().iter().sum();
            });
        });
        Ok(())
    }
}

#[cfg(all(test, feature = "cpu"))]
mod tests {
    use super::*;
    use crate::cpu::CpuKernel;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn dataset(n: usize, width: usize) -> Dataset {
        let points = Array2::from_shape_fn((n, 3), |(i, d)| {
            ((i * 7 + d * 13) % 29) as f64 / 29.0 + 0.01
        });
        Dataset::padded(points, width).unwrap()
    }

    #[test]
    fn agrees_with_scalar_kernel() {
        let grid = GridData::regular(3, 3).unwrap();
        let data = dataset(21, 8);
        let alpha: Vec<f64> = (0..grid.len()).map(|j| (j as f64 * 0.37).sin()).collect();
        let n = data.padded_len();

        let simd = SimdKernel::new(8).unwrap();
        let scalar = CpuKernel::new();

        let mut a = vec![0.0; n];
        let mut b = vec![0.0; n];
        simd.forward(&grid, &data, &alpha, 0..grid.len(), 0..n, &mut a)
            .unwrap();
        scalar
            .forward(&grid, &data, &alpha, 0..grid.len(), 0..n, &mut b)
            .unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }

        let mut ga = vec![0.0; grid.len()];
        let mut gb = vec![0.0; grid.len()];
        simd.backward(&grid, &data, &a, 8..n, 0..grid.len(), &mut ga)
            .unwrap();
        scalar
            .backward(&grid, &data, &a, 8..n, 0..grid.len(), &mut gb)
            .unwrap();
        for (x, y) in ga.iter().zip(&gb) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
    }

    #[test]
    fn misaligned_range_is_rejected() {
        let grid = GridData::regular(3, 2).unwrap();
        let data = dataset(16, 8);
        let alpha = vec![1.0; grid.len()];
        let mut out = vec![0.0; 4];
        let err = SimdKernel::new(8)
            .unwrap()
            .forward(&grid, &data, &alpha, 0..grid.len(), 4..8, &mut out)
            .unwrap_err();
        assert!(matches!(err, ComputeError::Misaligned { width: 8, .. }));
    }
}
