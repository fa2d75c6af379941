//! Chunked point-to-point exchange.
//!
//! Receives for every foreign chunk are posted up front; each owned chunk is
//! sent to all peers as soon as it is computed, then the rank waits for the
//! rest.

use std::time::Instant;

use sgmv_compute::Communicator;

use super::{
    chunked_backward, data_tag, post_foreign, receive_into, seconds_since, send_to_peers,
    CommunicationStrategy, ExchangePlan, ExchangeTimes, LocalWork, StrategyKind,
};
use crate::error::OperatorError;

#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingExchange;

impl CommunicationStrategy for BlockingExchange {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BlockingAsync
    }

    fn forward_backward(
        &mut self,
        comm: &dyn Communicator,
        plan: &ExchangePlan,
        work: &mut dyn LocalWork,
        temp: &mut [f64],
        result: &mut [f64],
    ) -> Result<ExchangeTimes, OperatorError> {
        let start = Instant::now();
        let pending = post_foreign(comm, &plan.data, data_tag)?;
        for (idx, chunk) in plan.data.owned(comm.rank()) {
            let out = &mut temp[chunk.range()];
            work.forward(chunk, out)?;
            send_to_peers(comm, data_tag(idx), out)?;
        }
        let forward_compute = seconds_since(start);
        receive_into(comm, &pending, temp)?;
        let forward_complete = seconds_since(start);

        let (backward_compute, backward_complete) = chunked_backward(comm, plan, work, temp, result)?;
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
