//! One-sided exchange through communication windows.
//!
//! Each rank exposes one window over the padded instance space and one over
//! the grid. Every epoch is `fence → compute and put to every rank → fence`,
//! after which the local window holds the combined vector.

use std::time::Instant;

use log::debug;
use sgmv_compute::{Communicator, WindowId};

use super::{seconds_since, CommunicationStrategy, ExchangePlan, ExchangeTimes, LocalWork, StrategyKind};
use crate::error::OperatorError;

#[derive(Debug, Clone, Copy)]
struct Windows {
    data: WindowId,
    grid: WindowId,
}

#[derive(Debug, Default)]
pub struct OneSidedExchange {
    windows: Option<Windows>,
}

impl OneSidedExchange {
    fn windows(&self) -> Result<Windows, OperatorError> {
        self.windows
            .ok_or(OperatorError::NotPrepared(StrategyKind::OneSidedRma))
    }

    fn put_to_all(
        comm: &dyn Communicator,
        window: WindowId,
        offset: usize,
        data: &[f64],
    ) -> Result<(), OperatorError> {
        for target in 0..comm.size() {
            comm.put(window, target, offset, data)?;
        }
        Ok(())
    }

    fn grid_epoch(
        comm: &dyn Communicator,
        plan: &ExchangePlan,
        window: WindowId,
        work: &mut dyn LocalWork,
        source: &[f64],
        result: &mut [f64],
    ) -> Result<(f64, f64), OperatorError> {
        let start = Instant::now();
        comm.fence(window)?;
        let all_data = plan.all_data();
        for (_, chunk) in plan.grid.owned(comm.rank()) {
            let out = &mut result[chunk.range()];
            work.backward(chunk, all_data, source, out)?;
            Self::put_to_all(comm, window, chunk.offset, out)?;
        }
        let compute = seconds_since(start);
        comm.fence(window)?;
        comm.read_window(window, result)?;
        Ok((compute, seconds_since(start)))
    }
}

impl CommunicationStrategy for OneSidedExchange {
    fn kind(&self) -> StrategyKind {
        StrategyKind::OneSidedRma
    }

    fn prepare(&mut self, comm: &dyn Communicator, plan: &ExchangePlan) -> Result<(), OperatorError> {
        self.release(comm)?;
        let data = comm.create_window(plan.data_len())?;
        let grid = comm.create_window(plan.grid_len())?;
        debug!(
            "rank {}: windows of {} and {} values",
            comm.rank(),
            plan.data_len(),
            plan.grid_len()
        );
        self.windows = Some(Windows { data, grid });
        Ok(())
    }

    fn release(&mut self, comm: &dyn Communicator) -> Result<(), OperatorError> {
        if let Some(windows) = self.windows.take() {
            comm.free_window(windows.data)?;
            comm.free_window(windows.grid)?;
        }
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
        let windows = self.windows()?;

        let start = Instant::now();
        comm.fence(windows.data)?;
        for (_, chunk) in plan.data.owned(comm.rank()) {
            let out = &mut temp[chunk.range()];
            work.forward(chunk, out)?;
            Self::put_to_all(comm, windows.data, chunk.offset, out)?;
        }
        let forward_compute = seconds_since(start);
        comm.fence(windows.data)?;
        comm.read_window(windows.data, temp)?;
        let forward_complete = seconds_since(start);

        let (backward_compute, backward_complete) =
            Self::grid_epoch(comm, plan, windows.grid, work, temp, result)?;
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
        let windows = self.windows()?;
        let (backward_compute, backward_complete) =
            Self::grid_epoch(comm, plan, windows.grid, work, source, result)?;
        Ok(ExchangeTimes {
            backward_compute,
            backward_complete,
            ..ExchangeTimes::default()
        })
    }
}
