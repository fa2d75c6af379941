//! Work partitioning.
//!
//! [`ChunkPlanner`] cuts index ranges into divisor-aligned chunks, across
//! ranks and within a rank. [`LoadBalancer`] decides, per call, how much of
//! a range goes to the accelerator.

pub mod balancer;
pub mod planner;

pub use balancer::{BalancerMode, LoadBalancer, TuningParams, TuningState};
pub use planner::{plan, ChunkPlanner, NestedPlan};

use thiserror::Error;

/// Invalid planner or balancer configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PartitionError {
    #[error("Divisor must be positive")]
    ZeroDivisor,

    #[error("Chunk count must be positive")]
    ZeroChunks,

    #[error("Segment {index} requested from a split into {parts} parts")]
    SegmentIndex { index: usize, parts: usize },

    #[error("Invalid range {start}..{end}")]
    InvalidRange { start: usize, end: usize },

    #[error("Invalid tuning parameter {name}: {value}")]
    InvalidTuning { name: &'static str, value: f64 },
}
