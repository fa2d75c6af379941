//! Collective-sum exchange.
//!
//! Each rank evaluates its own instance shard into a zeroed vector and the
//! ranks sum their vectors. The backward pass runs over the whole grid but
//! only the own instance shard, followed by a second sum.

use std::time::Instant;

use sgmv_compute::Communicator;

use super::{seconds_since, CommunicationStrategy, ExchangePlan, ExchangeTimes, LocalWork, StrategyKind};
use crate::error::OperatorError;

#[derive(Debug, Default, Clone, Copy)]
pub struct AllreduceExchange;

impl AllreduceExchange {
    fn reduce_backward(
        comm: &dyn Communicator,
        plan: &ExchangePlan,
        work: &mut dyn LocalWork,
        source: &[f64],
        result: &mut [f64],
    ) -> Result<(f64, f64), OperatorError> {
        let start = Instant::now();
        let shard = plan.data.rank_range(comm.rank());
        work.backward(plan.all_grid(), shard, source, result)?;
        let compute = seconds_since(start);
        comm.all_reduce_sum(result)?;
        Ok((compute, seconds_since(start)))
    }
}

impl CommunicationStrategy for AllreduceExchange {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Allreduce
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
        temp.fill(0.0);
        let shard = plan.data.rank_range(comm.rank());
        if !shard.is_empty() {
            work.forward(shard, &mut temp[shard.range()])?;
        }
        let forward_compute = seconds_since(start);
        comm.all_reduce_sum(temp)?;
        let forward_complete = seconds_since(start);

        let (backward_compute, backward_complete) =
            Self::reduce_backward(comm, plan, work, temp, result)?;
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
        let (backward_compute, backward_complete) =
            Self::reduce_backward(comm, plan, work, source, result)?;
        Ok(ExchangeTimes {
            backward_compute,
            backward_complete,
            ..ExchangeTimes::default()
        })
    }
}
