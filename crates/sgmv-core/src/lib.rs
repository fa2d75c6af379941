//! # sgmv-core
//!
//! The distributed system matrix `BᵗB + λN·I` of sparse-grid regression.
//! `B` evaluates every grid basis function at every training instance; the
//! operator never materialises it, but applies it chunk by chunk through
//! the evaluation kernels of `sgmv-compute`.
//!
//! ## Architecture
//!
//! Work is split twice. Across ranks, [`partition::ChunkPlanner`] deals the
//! padded instance space and the grid into contiguous chunks. Within a rank,
//! [`operator::HybridExecutor`] splits each chunk between an accelerator and
//! the CPU, sized by a self-tuning [`partition::LoadBalancer`]. Partial
//! results are combined by one of the [`exchange::CommunicationStrategy`]
//! implementations.
//!
//! ## Modules
//!
//! - [`types`]: Chunk descriptors, partitions, timing samples.
//! - [`partition`]: Chunk planner and load balancer.
//! - [`exchange`]: Inter-rank communication strategies.
//! - [`operator`]: [`DistributedSystemMatrix`] and its hybrid executor.
//! - [`solver`]: Conjugate gradients over any [`SystemMatrix`].
//! - [`config`]: Serde-backed operator settings.

pub mod config;
pub mod error;
pub mod exchange;
pub mod operator;
pub mod partition;
pub mod solver;
pub mod types;

pub use config::{BalancerConfig, ConfigError, OperatorConfig};
pub use error::OperatorError;
pub use exchange::{CommunicationStrategy, ExchangePlan, ExchangeTimes, StrategyKind};
pub use operator::{DistributedSystemMatrix, HybridExecutor, OperatorStats, SystemMatrix};
pub use partition::{ChunkPlanner, LoadBalancer, PartitionError};
pub use solver::{ConjugateGradients, LinearSolver, SolveReport, SolverError};
pub use types::{ChunkDescriptor, Partition, TimingSample, Topology};
