//! Accumulated phase timings of an operator.

use serde::Serialize;

use crate::exchange::ExchangeTimes;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OperatorStats {
    pub mult_calls: usize,
    pub rhs_calls: usize,
    pub forward_compute: f64,
    pub forward_complete: f64,
    pub backward_compute: f64,
    pub backward_complete: f64,
    /// Wall-clock seconds inside `mult` and `generate_rhs`.
    pub total: f64,
}

impl OperatorStats {
    pub(crate) fn record_mult(&mut self, times: &ExchangeTimes, total: f64) {
        self.mult_calls += 1;
        self.add(times, total);
    }

    pub(crate) fn record_rhs(&mut self, times: &ExchangeTimes, total: f64) {
        self.rhs_calls += 1;
        self.add(times, total);
    }

    fn add(&mut self, times: &ExchangeTimes, total: f64) {
        self.forward_compute += times.forward_compute;
        self.forward_complete += times.forward_complete;
        self.backward_compute += times.backward_compute;
        self.backward_complete += times.backward_complete;
        self.total += total;
    }

    /// Seconds spent waiting on peers rather than computing.
    pub fn communication_overhead(&self) -> f64 {
        (self.forward_complete - self.forward_compute).max(0.0)
            + (self.backward_complete - self.backward_compute).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn accumulates_per_call_kind() {
        let mut stats = OperatorStats::default();
        let times = ExchangeTimes {
            forward_compute: 1.0,
            forward_complete: 1.5,
            backward_compute: 2.0,
            backward_complete: 2.25,
        };
        stats.record_mult(&times, 4.0);
        stats.record_rhs(&ExchangeTimes::default(), 0.5);
        assert_eq!(stats.mult_calls, 1);
        assert_eq!(stats.rhs_calls, 1);
        assert_abs_diff_eq!(stats.total, 4.5);
        assert_abs_diff_eq!(stats.communication_overhead(), 0.75);
    }
}
