//! Error type of the distributed operator.

use sgmv_compute::{CommError, ComputeError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::exchange::StrategyKind;
use crate::partition::PartitionError;

/// Errors that can occur while building or applying the operator.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Partitioning error: {0}")]
    Partition(#[from] PartitionError),

    #[error("Compute backend error: {0}")]
    Compute(#[from] ComputeError),

    #[error("Communication failure: {0}")]
    Communication(#[from] CommError),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Exchange strategy {0} used before prepare()")]
    NotPrepared(StrategyKind),
}
