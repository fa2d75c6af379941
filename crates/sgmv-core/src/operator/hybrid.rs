//! CPU/accelerator split of one kernel call.
//!
//! Each forward call over an instance range and each backward call over a
//! grid range is cut in two by a [`LoadBalancer`]: the accelerator takes the
//! leading segment (a multiple of its vector width), the CPU kernel the
//! rest. Both halves run concurrently under `rayon::join`, are timed, and
//! the timings are fed back to the balancer.

use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use sgmv_compute::{Dataset, EvalKernel, GridData};

use crate::config::{BalancerConfig, ConfigError};
use crate::error::OperatorError;
use crate::partition::LoadBalancer;
use crate::types::Partition;

fn timed<T>(f: impl FnOnce() -> T) -> (T, f64) {
    let start = Instant::now();
    let value = f();
    (value, start.elapsed().as_secs_f64())
}

pub struct HybridExecutor {
    cpu: Arc<dyn EvalKernel>,
    accelerator: Option<Arc<dyn EvalKernel>>,
    forward_tuning: LoadBalancer,
    backward_tuning: LoadBalancer,
}

impl HybridExecutor {
    pub fn new(
        cpu: Arc<dyn EvalKernel>,
        accelerator: Option<Arc<dyn EvalKernel>>,
        balancer: &BalancerConfig,
    ) -> Result<Self, OperatorError> {
        let cpu_width = cpu.vector_width();
        let accel_width = accelerator
            .as_ref()
            .map_or(cpu_width, |a| a.vector_width());
        if cpu_width == 0 || accel_width % cpu_width != 0 {
            return Err(ConfigError::WidthMismatch {
                cpu: cpu_width,
                accel: accel_width,
            }
            .into());
        }

        let params = balancer.params();
        let forward_tuning = LoadBalancer::new(0, accel_width, balancer.mode, params)?;
        let backward_tuning = LoadBalancer::new(0, 1, balancer.mode, params)?;

        debug!(
            "hybrid executor: cpu '{}' (width {}), accelerator {}",
            cpu.device_info().name,
            cpu_width,
            accelerator
                .as_ref()
                .map_or_else(|| "none".to_string(), |a| format!("'{}' (width {})", a.device_info().name, accel_width)),
        );

        Ok(Self {
            cpu,
            accelerator,
            forward_tuning,
            backward_tuning,
        })
    }

    /// Instance padding both kernels can work with.
    pub fn padding_width(&self) -> usize {
        let cpu_width = self.cpu.vector_width();
        self.accelerator
            .as_ref()
            .map_or(cpu_width, |a| a.vector_width().max(cpu_width))
    }

    pub fn cpu_kernel(&self) -> &Arc<dyn EvalKernel> {
        &self.cpu
    }

    pub fn accelerator(&self) -> Option<&Arc<dyn EvalKernel>> {
        self.accelerator.as_ref()
    }

    /// Split the next forward call would use.
    pub fn forward_partition(&self) -> Partition {
        self.forward_tuning.partition()
    }

    /// Split the next backward call would use.
    pub fn backward_partition(&self) -> Partition {
        self.backward_tuning.partition()
    }

    pub fn reset_tuning(&mut self) {
        self.forward_tuning.reset_auto_tuning();
        self.backward_tuning.reset_auto_tuning();
    }

    /// `out = B[data_range, :] · alpha`.
    pub fn forward(
        &mut self,
        grid: &GridData,
        data: &Dataset,
        alpha: &[f64],
        data_range: Range<usize>,
        out: &mut [f64],
    ) -> Result<(), OperatorError> {
        let all_grid = 0..grid.len();
        let Some(accel) = &self.accelerator else {
            self.cpu.forward(grid, data, alpha, all_grid, data_range, out)?;
            return Ok(());
        };

        self.forward_tuning.set_problem_size(data_range.len());
        let size_accel = data_range.len() - self.forward_tuning.partition1_size();
        let split = data_range.start + size_accel;
        let (accel_out, cpu_out) = out.split_at_mut(size_accel);
        let cpu = &self.cpu;

        let ((accel_result, t_accel), (cpu_result, t_local)) = rayon::join(
            || {
                timed(|| {
                    if size_accel == 0 {
                        return Ok(());
                    }
                    accel.forward(grid, data, alpha, all_grid.clone(), data_range.start..split, accel_out)
                })
            },
            || {
                timed(|| {
                    if split == data_range.end {
                        return Ok(());
                    }
                    cpu.forward(grid, data, alpha, all_grid.clone(), split..data_range.end, cpu_out)
                })
            },
        );
        accel_result?;
        cpu_result?;
        self.forward_tuning.set_execution_times(t_local, t_accel);
        Ok(())
    }

    /// `out = Bᵗ[grid_range, data_range] · source[data_range]`.
    pub fn backward(
        &mut self,
        grid: &GridData,
        data: &Dataset,
        source: &[f64],
        data_range: Range<usize>,
        grid_range: Range<usize>,
        out: &mut [f64],
    ) -> Result<(), OperatorError> {
        let Some(accel) = &self.accelerator else {
            self.cpu.backward(grid, data, source, data_range, grid_range, out)?;
            return Ok(());
        };

        self.backward_tuning.set_problem_size(grid_range.len());
        let size_accel = grid_range.len() - self.backward_tuning.partition1_size();
        let split = grid_range.start + size_accel;
        let (accel_out, cpu_out) = out.split_at_mut(size_accel);
        let cpu = &self.cpu;

        let ((accel_result, t_accel), (cpu_result, t_local)) = rayon::join(
            || {
                timed(|| {
                    if size_accel == 0 {
                        return Ok(());
                    }
                    accel.backward(grid, data, source, data_range.clone(), grid_range.start..split, accel_out)
                })
            },
            || {
                timed(|| {
                    if split == grid_range.end {
                        return Ok(());
                    }
                    cpu.backward(grid, data, source, data_range.clone(), split..grid_range.end, cpu_out)
                })
            },
        );
        accel_result?;
        cpu_result?;
        self.backward_tuning.set_execution_times(t_local, t_accel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::BalancerMode;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use sgmv_compute::{CpuKernel, SimdKernel};

    fn problem(width: usize) -> (GridData, Dataset) {
        let grid = GridData::regular(2, 4).unwrap();
        let points = Array2::from_shape_fn((61, 2), |(i, d)| ((i * 5 + d * 11) % 53) as f64 / 53.0 + 0.004);
        (grid, Dataset::padded(points, width).unwrap())
    }

    #[test]
    fn split_forward_matches_single_kernel() {
        let (grid, data) = problem(8);
        let alpha: Vec<f64> = (0..grid.len()).map(|j| 0.1 * j as f64 - 1.0).collect();
        let n = data.padded_len();

        let balancer = BalancerConfig {
            mode: BalancerMode::Static { fraction: 0.5 },
            ..BalancerConfig::default()
        };
        let mut hybrid = HybridExecutor::new(
            Arc::new(CpuKernel::new()),
            Some(Arc::new(SimdKernel::new(8).unwrap())),
            &balancer,
        )
        .unwrap();
        assert_eq!(hybrid.padding_width(), 8);

        let mut split = vec![0.0; n];
        hybrid.forward(&grid, &data, &alpha, 0..n, &mut split).unwrap();
        let partition = hybrid.forward_partition();
        assert_eq!(partition.total(), n);
        assert_eq!(partition.size_accel % 8, 0);
        assert!(partition.size_accel > 0 && partition.size_local > 0);

        let mut reference = vec![0.0; n];
        CpuKernel::new()
            .forward(&grid, &data, &alpha, 0..grid.len(), 0..n, &mut reference)
            .unwrap();
        for (a, b) in split.iter().zip(&reference) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }

        let mut gsplit = vec![0.0; grid.len()];
        let mut gref = vec![0.0; grid.len()];
        hybrid
            .backward(&grid, &data, &reference, 8..n, 0..grid.len(), &mut gsplit)
            .unwrap();
        CpuKernel::new()
            .backward(&grid, &data, &reference, 8..n, 0..grid.len(), &mut gref)
            .unwrap();
        for (a, b) in gsplit.iter().zip(&gref) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn adaptive_calibration_runs_through_both_partitions() {
        let (grid, data) = problem(4);
        let alpha = vec![1.0; grid.len()];
        let n = data.padded_len();
        let mut hybrid = HybridExecutor::new(
            Arc::new(CpuKernel::new()),
            Some(Arc::new(SimdKernel::new(4).unwrap())),
            &BalancerConfig::default(),
        )
        .unwrap();

        let mut first = vec![0.0; n];
        hybrid.forward(&grid, &data, &alpha, 0..n, &mut first).unwrap();
        // Second call is the accelerator calibration: everything aligned goes there.
        assert_eq!(hybrid.forward_partition().size_local, 0);
        let mut second = vec![0.0; n];
        hybrid.forward(&grid, &data, &alpha, 0..n, &mut second).unwrap();
        for (a, b) in first.iter().zip(&second) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        let p = hybrid.forward_partition();
        assert_eq!(p.total(), n);
        assert_eq!(p.size_accel % 4, 0);
    }

    #[test]
    fn accelerator_width_must_be_multiple_of_cpu_width() {
        let err = HybridExecutor::new(
            Arc::new(SimdKernel::new(8).unwrap()),
            Some(Arc::new(SimdKernel::new(12).unwrap())),
            &BalancerConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            OperatorError::Config(ConfigError::WidthMismatch { cpu: 8, accel: 12 })
        ));
    }
}
