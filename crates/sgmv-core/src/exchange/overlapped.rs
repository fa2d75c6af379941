//! Pipelined exchange.
//!
//! The forward pass is chunked like [`BlockingExchange`](super::BlockingExchange),
//! but the backward pass over the own grid shard starts right away on the
//! owned instance chunks and then folds in each foreign chunk as it
//! arrives. Only the final grid exchange waits for everything.

use std::time::Instant;

use sgmv_compute::Communicator;

use super::{
    chunked_backward, data_tag, grid_tag, post_foreign, receive_into, seconds_since,
    send_to_peers, CommunicationStrategy, ExchangePlan, ExchangeTimes, LocalWork, StrategyKind,
};
use crate::error::OperatorError;
use crate::types::ChunkDescriptor;

#[derive(Debug, Default, Clone)]
pub struct OverlappedExchange {
    scratch: Vec<f64>,
}

impl OverlappedExchange {
    /// `result[shard] += Bᵗ[shard, chunk] · temp[chunk]`.
    fn accumulate(
        &mut self,
        work: &mut dyn LocalWork,
        shard: ChunkDescriptor,
        chunk: ChunkDescriptor,
        temp: &[f64],
        result: &mut [f64],
    ) -> Result<(), OperatorError> {
        work.backward(shard, chunk, temp, &mut self.scratch)?;
        for (r, s) in result[shard.range()].iter_mut().zip(&self.scratch) {
            *r += s;
        }
        Ok(())
    }
}

impl CommunicationStrategy for OverlappedExchange {
    fn kind(&self) -> StrategyKind {
        StrategyKind::OverlappedAsync
    }

    fn prepare(&mut self, comm: &dyn Communicator, plan: &ExchangePlan) -> Result<(), OperatorError> {
        self.scratch = vec![0.0; plan.grid.rank_range(comm.rank()).size];
        Ok(())
    }

    fn release(&mut self, _comm: &dyn Communicator) -> Result<(), OperatorError> {
        self.scratch = Vec::new();
        Ok(())
    }

    fn forward_backward(
        &mut self,
        comm: &dyn Communicator,
        plan: &ExchangePlan,
        work: &mut dyn LocalWork,
        temp: &mut [f64],
        result: &mut [f64],
    ) -> Result<ExchangeTimes, OperatorError> {
        let me = comm.rank();
        let shard = plan.grid.rank_range(me);
        if self.scratch.len() != shard.size {
            return Err(OperatorError::NotPrepared(self.kind()));
        }

        let start = Instant::now();
        let mut pending = post_foreign(comm, &plan.data, data_tag)?;
        let grid_pending = post_foreign(comm, &plan.grid, grid_tag)?;

        for (idx, chunk) in plan.data.owned(me) {
            let out = &mut temp[chunk.range()];
            work.forward(chunk, out)?;
            send_to_peers(comm, data_tag(idx), out)?;
        }
        let forward_compute = seconds_since(start);

        let backward_start = Instant::now();
        result[shard.range()].fill(0.0);
        if !shard.is_empty() {
            for (_, chunk) in plan.data.owned(me) {
                self.accumulate(work, shard, chunk, temp, result)?;
            }
        }

        while !pending.is_empty() {
            let requests: Vec<_> = pending.iter().map(|(_, r)| *r).collect();
            let (pos, payload) = comm.wait_any(&requests)?;
            let (chunk, _) = pending.swap_remove(pos);
            temp[chunk.range()].copy_from_slice(&payload);
            if !shard.is_empty() {
                self.accumulate(work, shard, chunk, temp, result)?;
            }
        }
        let forward_complete = seconds_since(start);

        for (idx, chunk) in plan.grid.owned(me) {
            send_to_peers(comm, grid_tag(idx), &result[chunk.range()])?;
        }
        let backward_compute = seconds_since(backward_start);
        receive_into(comm, &grid_pending, result)?;
        let backward_complete = seconds_since(backward_start);

        Ok(ExchangeTimes {
            forward_compute,
            forward_complete,
            backward_compute,
            backward_complete,
        })
    }

    fn backward(
        &mut self,
        comm: &dyn Communicator,
        plan: &ExchangePlan,
        work: &mut dyn LocalWork,
        source: &[f64],
        result: &mut [f64],
    ) -> Result<ExchangeTimes, OperatorError> {
        let (backward_compute, backward_complete) = chunked_backward(comm, plan, work, source, result)?;
        Ok(ExchangeTimes {
            backward_compute,
            backward_complete,
            ..ExchangeTimes::default()
        })
    }
}
