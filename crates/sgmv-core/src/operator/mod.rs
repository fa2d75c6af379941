//! The distributed system matrix `BᵗB + λN·I`.
//!
//! [`DistributedSystemMatrix`] owns one rank's view of the problem: the
//! grid, the padded dataset, the chunk plans, the work buffers and the
//! exchange strategy. A `mult` runs
//!
//! 1. forward over the owned instance chunks, each split between the
//!    accelerator and the CPU ([`HybridExecutor`]), with the padded tail of
//!    every chunk zeroed before it is exposed,
//! 2. the forward exchange, the backward pass and the backward exchange, as
//!    scheduled by the [`CommunicationStrategy`],
//! 3. the regularisation `y += λ·N·alpha` with the true instance count `N`.
//!
//! Every rank must call `mult`, `generate_rhs`, `rebuild` and `set_grid`
//! in the same order. A rank whose exchange fails aborts the world, so its
//! peers return [`CommError::Aborted`](sgmv_compute::CommError::Aborted)
//! instead of waiting on it.

mod hybrid;
mod stats;

pub use hybrid::HybridExecutor;
pub use stats::OperatorStats;

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use ndarray::Array2;
use sgmv_compute::{create_kernel, CommError, Communicator, Dataset, EvalKernel, GridData};

use crate::config::{ConfigError, OperatorConfig};
use crate::error::OperatorError;
use crate::exchange::{CommunicationStrategy, ExchangePlan, LocalWork, StrategyKind};
use crate::types::{ChunkDescriptor, Topology};

/// A symmetric operator a linear solver can drive.
pub trait SystemMatrix {
    /// `y = (BᵗB + λN·I)·alpha`.
    fn mult(&mut self, alpha: &[f64]) -> Result<Vec<f64>, OperatorError>;

    /// `b = Bᵗ·labels`.
    fn generate_rhs(&mut self, labels: &[f64]) -> Result<Vec<f64>, OperatorError>;

    /// Number of unknowns (grid points).
    fn dim(&self) -> usize;
}

/// Abort the world when a collective step failed on this rank.
///
/// An unsupported primitive is reported identically by every rank before
/// anything is exchanged, and an aborted world needs no second abort.
fn abort_on_error<T>(comm: &dyn Communicator, result: Result<T, OperatorError>) -> Result<T, OperatorError> {
    match &result {
        Ok(_) | Err(OperatorError::Communication(CommError::Aborted | CommError::Unsupported(_))) => {}
        Err(e) => {
            warn!("rank {}: {}; aborting the world", comm.rank(), e);
            comm.abort();
        }
    }
    result
}

/// Kernel work of one call, handed to the exchange strategy.
struct OperatorWork<'a> {
    executor: &'a mut HybridExecutor,
    grid: &'a GridData,
    dataset: &'a Dataset,
    alpha: &'a [f64],
}

impl LocalWork for OperatorWork<'_> {
    fn forward(&mut self, chunk: ChunkDescriptor, out: &mut [f64]) -> Result<(), OperatorError> {
        self.executor
            .forward(self.grid, self.dataset, self.alpha, chunk.range(), out)?;
        let n = self.dataset.num_instances();
        if chunk.end() > n {
            out[n.saturating_sub(chunk.offset)..].fill(0.0);
        }
        Ok(())
    }

    fn backward(
        &mut self,
        grid: ChunkDescriptor,
        data: ChunkDescriptor,
        source: &[f64],
        out: &mut [f64],
    ) -> Result<(), OperatorError> {
        self.executor
            .backward(self.grid, self.dataset, source, data.range(), grid.range(), out)
    }
}

pub struct DistributedSystemMatrix {
    comm: Arc<dyn Communicator>,
    grid: GridData,
    dataset: Dataset,
    config: OperatorConfig,
    executor: HybridExecutor,
    strategy: Box<dyn CommunicationStrategy>,
    plan: ExchangePlan,
    temp: Vec<f64>,
    stats: OperatorStats,
}

impl DistributedSystemMatrix {
    /// Build the operator with the kernels named in `config`.
    pub fn new(
        comm: Arc<dyn Communicator>,
        grid: GridData,
        points: Array2<f64>,
        config: &OperatorConfig,
    ) -> Result<Self, OperatorError> {
        config.validate()?;
        let cpu = create_kernel(&config.cpu_kernel, config.threads)?;
        let accelerator = config
            .accelerator
            .as_ref()
            .map(|kind| create_kernel(kind, config.threads))
            .transpose()?;
        Self::with_kernels(comm, grid, points, cpu, accelerator, config)
    }

    /// Build the operator around caller-supplied kernels; the kernel fields
    /// of `config` are ignored.
    pub fn with_kernels(
        comm: Arc<dyn Communicator>,
        grid: GridData,
        points: Array2<f64>,
        cpu: Arc<dyn EvalKernel>,
        accelerator: Option<Arc<dyn EvalKernel>>,
        config: &OperatorConfig,
    ) -> Result<Self, OperatorError> {
        config.validate()?;
        if grid.dims() != points.ncols() {
            return Err(ConfigError::DimensionMismatch {
                grid: grid.dims(),
                data: points.ncols(),
            }
            .into());
        }

        let executor = HybridExecutor::new(cpu, accelerator, &config.balancer)?;
        let dataset = Dataset::padded(points, executor.padding_width())?;
        let plan = Self::build_plan(comm.as_ref(), &grid, &dataset, &executor, config)?;
        let mut strategy = config.strategy.create();
        abort_on_error(comm.as_ref(), strategy.prepare(comm.as_ref(), &plan))?;

        info!(
            "rank {}/{}: {} instances (padded to {}), {} grid points, strategy {}",
            comm.rank(),
            comm.size(),
            dataset.num_instances(),
            dataset.padded_len(),
            grid.len(),
            strategy.kind()
        );

        Ok(Self {
            temp: vec![0.0; dataset.padded_len()],
            comm,
            grid,
            dataset,
            config: config.clone(),
            executor,
            strategy,
            plan,
            stats: OperatorStats::default(),
        })
    }

    fn build_plan(
        comm: &dyn Communicator,
        grid: &GridData,
        dataset: &Dataset,
        executor: &HybridExecutor,
        config: &OperatorConfig,
    ) -> Result<ExchangePlan, OperatorError> {
        Ok(ExchangePlan::build(
            dataset.padded_len(),
            executor.padding_width(),
            grid.len(),
            comm.size(),
            config.chunks_per_rank_data,
            config.chunks_per_rank_grid,
        )?)
    }

    /// Recompute chunk plans, resize buffers, re-prepare the strategy and
    /// restart load-balancer calibration.
    pub fn rebuild(&mut self) -> Result<(), OperatorError> {
        abort_on_error(self.comm.as_ref(), self.strategy.release(self.comm.as_ref()))?;
        self.plan = Self::build_plan(
            self.comm.as_ref(),
            &self.grid,
            &self.dataset,
            &self.executor,
            &self.config,
        )?;
        self.temp.clear();
        self.temp.resize(self.dataset.padded_len(), 0.0);
        abort_on_error(
            self.comm.as_ref(),
            self.strategy.prepare(self.comm.as_ref(), &self.plan),
        )?;
        self.executor.reset_tuning();
        info!(
            "rank {}: rebuilt for {} grid points",
            self.comm.rank(),
            self.grid.len()
        );
        Ok(())
    }

    /// Replace the grid (e.g. after refinement) and rebuild.
    pub fn set_grid(&mut self, grid: GridData) -> Result<(), OperatorError> {
        if grid.dims() != self.dataset.dims() {
            return Err(ConfigError::DimensionMismatch {
                grid: grid.dims(),
                data: self.dataset.dims(),
            }
            .into());
        }
        self.grid = grid;
        self.rebuild()
    }

    /// `B·alpha` over the true instances, computed locally without
    /// communication.
    pub fn evaluate(&self, alpha: &[f64]) -> Result<Vec<f64>, OperatorError> {
        self.check_grid_vector(alpha)?;
        let mut out = vec![0.0; self.dataset.padded_len()];
        self.executor.cpu_kernel().forward(
            &self.grid,
            &self.dataset,
            alpha,
            0..self.grid.len(),
            0..self.dataset.padded_len(),
            &mut out,
        )?;
        out.truncate(self.dataset.num_instances());
        Ok(out)
    }

    /// Release strategy resources collectively.
    pub fn close(mut self) -> Result<(), OperatorError> {
        let released = self.strategy.release(self.comm.as_ref());
        abort_on_error(self.comm.as_ref(), released)
    }

    fn check_grid_vector(&self, v: &[f64]) -> Result<(), OperatorError> {
        if v.len() != self.grid.len() {
            return Err(OperatorError::DimensionMismatch {
                expected: self.grid.len(),
                actual: v.len(),
            });
        }
        Ok(())
    }

    pub fn plan(&self) -> &ExchangePlan {
        &self.plan
    }

    pub fn topology(&self) -> Topology {
        Topology::of(self.comm.as_ref())
    }

    pub fn stats(&self) -> &OperatorStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = OperatorStats::default();
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn executor(&self) -> &HybridExecutor {
        &self.executor
    }

    pub fn grid(&self) -> &GridData {
        &self.grid
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// True instance count `N`.
    pub fn num_instances(&self) -> usize {
        self.dataset.num_instances()
    }

    pub fn padded_instances(&self) -> usize {
        self.dataset.padded_len()
    }

    pub fn grid_size(&self) -> usize {
        self.grid.len()
    }

    pub fn lambda(&self) -> f64 {
        self.config.lambda
    }

    pub fn set_lambda(&mut self, lambda: f64) -> Result<(), OperatorError> {
        if !(lambda.is_finite() && lambda >= 0.0) {
            return Err(ConfigError::InvalidLambda(lambda).into());
        }
        self.config.lambda = lambda;
        Ok(())
    }

    /// Instance-space buffer of the last call.
    pub fn forward_buffer(&self) -> &[f64] {
        &self.temp
    }
}

impl SystemMatrix for DistributedSystemMatrix {
    fn mult(&mut self, alpha: &[f64]) -> Result<Vec<f64>, OperatorError> {
        self.check_grid_vector(alpha)?;
        let start = Instant::now();

        let mut result = vec![0.0; self.grid.len()];
        let mut work = OperatorWork {
            executor: &mut self.executor,
            grid: &self.grid,
            dataset: &self.dataset,
            alpha,
        };
        let exchanged = self.strategy.forward_backward(
            self.comm.as_ref(),
            &self.plan,
            &mut work,
            &mut self.temp,
            &mut result,
        );
        let times = abort_on_error(self.comm.as_ref(), exchanged)?;

        let factor = self.config.lambda * self.dataset.num_instances() as f64;
        for (y, a) in result.iter_mut().zip(alpha) {
            *y += factor * a;
        }

        let total = start.elapsed().as_secs_f64();
        self.stats.record_mult(&times, total);
        debug!(
            "rank {}: mult in {:.3e}s (forward {:.3e}/{:.3e}s, backward {:.3e}/{:.3e}s)",
            self.comm.rank(),
            total,
            times.forward_compute,
            times.forward_complete,
            times.backward_compute,
            times.backward_complete
        );
        Ok(result)
    }

    fn generate_rhs(&mut self, labels: &[f64]) -> Result<Vec<f64>, OperatorError> {
        let n = self.dataset.num_instances();
        if labels.len() != n {
            return Err(OperatorError::DimensionMismatch {
                expected: n,
                actual: labels.len(),
            });
        }
        let start = Instant::now();

        self.temp.fill(0.0);
        self.temp[..n].copy_from_slice(labels);
        let mut result = vec![0.0; self.grid.len()];
        let mut work = OperatorWork {
            executor: &mut self.executor,
            grid: &self.grid,
            dataset: &self.dataset,
            alpha: &[],
        };
        let exchanged = self.strategy.backward(
            self.comm.as_ref(),
            &self.plan,
            &mut work,
            &self.temp,
            &mut result,
        );
        let times = abort_on_error(self.comm.as_ref(), exchanged)?;

        let total = start.elapsed().as_secs_f64();
        self.stats.record_rhs(&times, total);
        debug!("rank {}: generate_rhs in {:.3e}s", self.comm.rank(), total);
        Ok(result)
    }

    fn dim(&self) -> usize {
        self.grid.len()
    }
}
