//! Exchange through one personalised all-to-all per phase.

use std::time::Instant;

use sgmv_compute::Communicator;

use super::{seconds_since, CommunicationStrategy, ExchangePlan, ExchangeTimes, LocalWork, StrategyKind};
use crate::error::OperatorError;
use crate::partition::NestedPlan;

/// Send buffer reused across calls.
#[derive(Debug, Default, Clone)]
pub struct AllToAllExchange {
    outgoing: Vec<f64>,
}

impl AllToAllExchange {
    /// Broadcast the own range of `vector` to every rank and gather theirs.
    fn exchange(&mut self, comm: &dyn Communicator, plan: &NestedPlan, vector: &mut [f64]) -> Result<(), OperatorError> {
        let size = comm.size();
        let own = plan.rank_range(comm.rank());
        self.outgoing.clear();
        self.outgoing.extend_from_slice(&vector[own.range()]);

        let recv_counts: Vec<usize> = (0..size).map(|r| plan.rank_range(r).size).collect();
        let recv_displs: Vec<usize> = (0..size).map(|r| plan.rank_range(r).offset).collect();
        comm.all_to_all_v(
            &self.outgoing,
            &vec![own.size; size],
            &vec![0; size],
            vector,
            &recv_counts,
            &recv_displs,
        )?;
        Ok(())
    }

    fn backward_phase(
        &mut self,
        comm: &dyn Communicator,
        plan: &ExchangePlan,
        work: &mut dyn LocalWork,
        source: &[f64],
        result: &mut [f64],
    ) -> Result<(f64, f64), OperatorError> {
        let start = Instant::now();
        let all_data = plan.all_data();
        for (_, chunk) in plan.grid.owned(comm.rank()) {
            work.backward(chunk, all_data, source, &mut result[chunk.range()])?;
        }
        let compute = seconds_since(start);
        self.exchange(comm, &plan.grid, result)?;
        Ok((compute, seconds_since(start)))
    }
}

impl CommunicationStrategy for AllToAllExchange {
    fn kind(&self) -> StrategyKind {
        StrategyKind::AllToAllV
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
        for (_, chunk) in plan.data.owned(comm.rank()) {
            work.forward(chunk, &mut temp[chunk.range()])?;
        }
        let forward_compute = seconds_since(start);
        self.exchange(comm, &plan.data, temp)?;
        let forward_complete = seconds_since(start);

        let (backward_compute, backward_complete) =
            self.backward_phase(comm, plan, work, temp, result)?;
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
            self.backward_phase(comm, plan, work, source, result)?;
        Ok(ExchangeTimes {
            backward_compute,
            backward_complete,
            ..ExchangeTimes::default()
        })
    }
}
