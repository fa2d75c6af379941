//! Inter-rank exchange of partial results.
//!
//! Every rank computes a share of the forward vector `B·alpha` (instance
//! space) and of the backward vector `Bᵗ·temp` (grid space). A
//! [`CommunicationStrategy`] decides how those shares are computed and
//! combined so that, on return, every rank holds the complete vectors.
//!
//! The strategies never touch kernels directly; they call back into a
//! [`LocalWork`] for each chunk they own.

mod allreduce;
mod alltoallv;
mod blocking;
mod onesided;
mod overlapped;

pub use allreduce::AllreduceExchange;
pub use alltoallv::AllToAllExchange;
pub use blocking::BlockingExchange;
pub use onesided::OneSidedExchange;
pub use overlapped::OverlappedExchange;

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sgmv_compute::{Communicator, RecvRequest};

use crate::error::OperatorError;
use crate::partition::{ChunkPlanner, NestedPlan, PartitionError};
use crate::types::ChunkDescriptor;

/// Local computation a strategy drives, chunk by chunk.
pub trait LocalWork {
    /// Forward pass over the instances of `chunk`; `out` has `chunk.size`
    /// entries and its padded tail is zero on return.
    fn forward(&mut self, chunk: ChunkDescriptor, out: &mut [f64]) -> Result<(), OperatorError>;

    /// Backward pass for the grid points of `grid` over the instances of
    /// `data`, reading `source` (full instance-space vector).
    fn backward(
        &mut self,
        grid: ChunkDescriptor,
        data: ChunkDescriptor,
        source: &[f64],
        out: &mut [f64],
    ) -> Result<(), OperatorError>;
}

/// Chunk plans of the instance space and the grid space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangePlan {
    pub data: NestedPlan,
    pub grid: NestedPlan,
}

impl ExchangePlan {
    /// `padded_len` instances aligned to `width`, `grid_len` grid points
    /// (no alignment), both split over `ranks`.
    pub fn build(
        padded_len: usize,
        width: usize,
        grid_len: usize,
        ranks: usize,
        chunks_per_rank_data: usize,
        chunks_per_rank_grid: usize,
    ) -> Result<Self, PartitionError> {
        Ok(Self {
            data: ChunkPlanner::new(width)?.plan_nested(padded_len, ranks, chunks_per_rank_data)?,
            grid: ChunkPlanner::new(1)?.plan_nested(grid_len, ranks, chunks_per_rank_grid)?,
        })
    }

    pub fn data_len(&self) -> usize {
        self.data.total()
    }

    pub fn grid_len(&self) -> usize {
        self.grid.total()
    }

    /// The whole instance space as one chunk.
    pub fn all_data(&self) -> ChunkDescriptor {
        ChunkDescriptor::new(0, self.data.total())
    }

    /// The whole grid as one chunk.
    pub fn all_grid(&self) -> ChunkDescriptor {
        ChunkDescriptor::new(0, self.grid.total())
    }
}

/// Seconds spent in each phase of one call.
///
/// `compute` covers the local kernel work up to the point where the
/// exchange is started; `complete` runs until the combined vector is
/// available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ExchangeTimes {
    pub forward_compute: f64,
    pub forward_complete: f64,
    pub backward_compute: f64,
    pub backward_complete: f64,
}

/// How ranks combine their partial vectors.
pub trait CommunicationStrategy: Send {
    fn kind(&self) -> StrategyKind;

    /// Acquire resources tied to `plan`; called on construction and rebuild.
    fn prepare(&mut self, _comm: &dyn Communicator, _plan: &ExchangePlan) -> Result<(), OperatorError> {
        Ok(())
    }

    /// Release what [`prepare`](Self::prepare) acquired.
    fn release(&mut self, _comm: &dyn Communicator) -> Result<(), OperatorError> {
        Ok(())
    }

    /// Forward into `temp` (instance space), then backward into `result`
    /// (grid space). Both vectors are complete on every rank on return.
    fn forward_backward(
        &mut self,
        comm: &dyn Communicator,
        plan: &ExchangePlan,
        work: &mut dyn LocalWork,
        temp: &mut [f64],
        result: &mut [f64],
    ) -> Result<ExchangeTimes, OperatorError>;

    /// Backward only: `result = Bᵗ·source` on every rank.
    fn backward(
        &mut self,
        comm: &dyn Communicator,
        plan: &ExchangePlan,
        work: &mut dyn LocalWork,
        source: &[f64],
        result: &mut [f64],
    ) -> Result<ExchangeTimes, OperatorError>;
}

/// The available strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Allreduce,
    BlockingAsync,
    OverlappedAsync,
    OneSidedRma,
    AllToAllV,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::Allreduce,
        StrategyKind::BlockingAsync,
        StrategyKind::OverlappedAsync,
        StrategyKind::OneSidedRma,
        StrategyKind::AllToAllV,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Allreduce => "allreduce",
            StrategyKind::BlockingAsync => "blocking_async",
            StrategyKind::OverlappedAsync => "overlapped_async",
            StrategyKind::OneSidedRma => "one_sided_rma",
            StrategyKind::AllToAllV => "all_to_all_v",
        }
    }

    /// Instantiate an unprepared strategy of this kind.
    pub fn create(&self) -> Box<dyn CommunicationStrategy> {
        match self {
            StrategyKind::Allreduce => Box::new(AllreduceExchange),
            StrategyKind::BlockingAsync => Box::new(BlockingExchange),
            StrategyKind::OverlappedAsync => Box::new(OverlappedExchange::default()),
            StrategyKind::OneSidedRma => Box::new(OneSidedExchange::default()),
            StrategyKind::AllToAllV => Box::new(AllToAllExchange::default()),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StrategyKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| {
                let names: Vec<_> = StrategyKind::ALL.iter().map(|k| k.name()).collect();
                format!("unknown strategy '{s}' (expected one of {})", names.join(", "))
            })
    }
}

// ─── Shared point-to-point helpers ─────────────────────────────────────

/// Message tag of instance-space chunk `idx`.
pub(crate) fn data_tag(idx: usize) -> u32 {
    (2 * idx + 2) as u32
}

/// Message tag of grid-space chunk `idx`.
pub(crate) fn grid_tag(idx: usize) -> u32 {
    (2 * idx + 3) as u32
}

pub(crate) fn seconds_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

/// Post a receive for every non-empty chunk another rank owns.
pub(crate) fn post_foreign(
    comm: &dyn Communicator,
    plan: &NestedPlan,
    tag: fn(usize) -> u32,
) -> Result<Vec<(ChunkDescriptor, RecvRequest)>, OperatorError> {
    plan.foreign(comm.rank())
        .map(|(idx, chunk)| {
            let request = comm.irecv(plan.owner(idx), tag(idx), chunk.size)?;
            Ok((chunk, request))
        })
        .collect()
}

/// Send `data` to every other rank.
pub(crate) fn send_to_peers(comm: &dyn Communicator, tag: u32, data: &[f64]) -> Result<(), OperatorError> {
    let me = comm.rank();
    for peer in (0..comm.size()).filter(|&p| p != me) {
        comm.send(peer, tag, data)?;
    }
    Ok(())
}

/// Wait for every posted receive and copy each payload into its chunk.
pub(crate) fn receive_into(
    comm: &dyn Communicator,
    pending: &[(ChunkDescriptor, RecvRequest)],
    target: &mut [f64],
) -> Result<(), OperatorError> {
    for (chunk, request) in pending {
        let payload = comm.wait(request)?;
        target[chunk.range()].copy_from_slice(&payload);
    }
    Ok(())
}

/// Chunked backward exchange: compute the owned grid chunks over all
/// instances, send each to every peer, collect the foreign ones.
///
/// Returns `(compute, complete)` seconds.
pub(crate) fn chunked_backward(
    comm: &dyn Communicator,
    plan: &ExchangePlan,
    work: &mut dyn LocalWork,
    source: &[f64],
    result: &mut [f64],
) -> Result<(f64, f64), OperatorError> {
    let start = Instant::now();
    let pending = post_foreign(comm, &plan.grid, grid_tag)?;
    let all_data = plan.all_data();
    for (idx, chunk) in plan.grid.owned(comm.rank()) {
        let out = &mut result[chunk.range()];
        work.backward(chunk, all_data, source, out)?;
        send_to_peers(comm, grid_tag(idx), out)?;
    }
    let compute = seconds_since(start);
    receive_into(comm, &pending, result)?;
    Ok((compute, seconds_since(start)))
}
