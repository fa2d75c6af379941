//! Two-partition auto-tuning.
//!
//! A [`LoadBalancer`] splits a problem of size `N` into partition 1 (the
//! CPU team) and partition 2 (the accelerator), where partition 2 is always
//! a multiple of the accelerator's divisor. In adaptive mode it first times
//! each partition alone, then keeps nudging the split from measured timings.
//!
//! The steady split is kept as a share of the problem, so one balancer can
//! serve chunks of different sizes: the aligned size is derived per call and
//! switching sizes back and forth never moves the split.

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::types::{Partition, TimingSample};

use super::PartitionError;

/// How the split is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerMode {
    /// Calibrate, then retune from timing feedback.
    #[default]
    Adaptive,
    /// Fixed share of the problem on partition 1; feedback is ignored.
    Static { fraction: f64 },
}

/// Knobs of the adaptive mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuningParams {
    /// Feedback samples accumulated between two retunes.
    #[serde(default = "default_retune_cycles")]
    pub retune_cycles: usize,
    /// Multiplier applied to the measured `t2 / t1` ratio.
    #[serde(default = "default_damping")]
    pub damping: f64,
    /// Largest relative change of partition 1 per retune.
    #[serde(default = "default_max_percent_change")]
    pub max_percent_change: f64,
}

fn default_retune_cycles() -> usize {
    10
}

fn default_damping() -> f64 {
    1.0
}

fn default_max_percent_change() -> f64 {
    0.5
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            retune_cycles: default_retune_cycles(),
            damping: default_damping(),
            max_percent_change: default_max_percent_change(),
        }
    }
}

impl TuningParams {
    pub fn validate(&self) -> Result<(), PartitionError> {
        if self.retune_cycles == 0 {
            return Err(PartitionError::InvalidTuning {
                name: "retune_cycles",
                value: 0.0,
            });
        }
        if !(self.damping.is_finite() && self.damping > 0.0) {
            return Err(PartitionError::InvalidTuning {
                name: "damping",
                value: self.damping,
            });
        }
        if !(self.max_percent_change > 0.0 && self.max_percent_change <= 1.0) {
            return Err(PartitionError::InvalidTuning {
                name: "max_percent_change",
                value: self.max_percent_change,
            });
        }
        Ok(())
    }
}

/// Calibration progress of an adaptive balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningState {
    /// Everything on partition 1.
    CalibrateLocal,
    /// As much as the divisor allows on partition 2.
    CalibrateAccel,
    /// Split derived from measurements.
    Steady,
}

#[derive(Debug, Clone)]
pub struct LoadBalancer {
    problem_size: usize,
    divisor: usize,
    mode: BalancerMode,
    params: TuningParams,
    state: TuningState,
    /// Steady share of partition 1, in `[0, 1]`.
    share1: f64,
    calibration: TimingSample,
    accumulated: TimingSample,
    samples: usize,
}

impl LoadBalancer {
    pub fn new(
        problem_size: usize,
        divisor: usize,
        mode: BalancerMode,
        params: TuningParams,
    ) -> Result<Self, PartitionError> {
        if divisor == 0 {
            return Err(PartitionError::ZeroDivisor);
        }
        params.validate()?;
        if let BalancerMode::Static { fraction } = mode {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(PartitionError::InvalidTuning {
                    name: "fraction",
                    value: fraction,
                });
            }
        }
        Ok(Self {
            problem_size,
            divisor,
            mode,
            params,
            state: TuningState::CalibrateLocal,
            share1: 1.0,
            calibration: TimingSample::default(),
            accumulated: TimingSample::default(),
            samples: 0,
        })
    }

    /// Adaptive balancer with the given tuning knobs.
    pub fn adaptive(problem_size: usize, divisor: usize, params: TuningParams) -> Result<Self, PartitionError> {
        Self::new(problem_size, divisor, BalancerMode::Adaptive, params)
    }

    /// Balancer that always keeps `fraction` of the problem on partition 1.
    pub fn fixed(problem_size: usize, fraction: f64, divisor: usize) -> Result<Self, PartitionError> {
        Self::new(
            problem_size,
            divisor,
            BalancerMode::Static { fraction },
            TuningParams::default(),
        )
    }

    pub fn problem_size(&self) -> usize {
        self.problem_size
    }

    pub fn divisor(&self) -> usize {
        self.divisor
    }

    pub fn mode(&self) -> BalancerMode {
        self.mode
    }

    pub fn state(&self) -> TuningState {
        self.state
    }

    /// Elements assigned to partition 1 (the CPU) for the next call.
    pub fn partition1_size(&self) -> usize {
        let n = self.problem_size;
        if n < self.divisor.saturating_mul(2) {
            return n;
        }
        match self.mode {
            BalancerMode::Static { fraction } => self.align((n as f64 * fraction).round() as usize),
            BalancerMode::Adaptive => match self.state {
                TuningState::CalibrateLocal => n,
                TuningState::CalibrateAccel => n - (n / self.divisor) * self.divisor,
                TuningState::Steady => self.steady_size(),
            },
        }
    }

    pub fn partition(&self) -> Partition {
        let size_local = self.partition1_size();
        Partition {
            size_local,
            size_accel: self.problem_size - size_local,
        }
    }

    /// Feed back the wall-clock seconds of the last call.
    pub fn set_execution_times(&mut self, t_local: f64, t_accel: f64) {
        if matches!(self.mode, BalancerMode::Static { .. }) {
            return;
        }
        if self.problem_size < self.divisor.saturating_mul(2) {
            return;
        }
        match self.state {
            TuningState::CalibrateLocal => {
                self.calibration.t_local = t_local;
                self.state = TuningState::CalibrateAccel;
                trace!("balancer N={}: partition 1 alone took {:.3e}s", self.problem_size, t_local);
            }
            TuningState::CalibrateAccel => {
                self.calibration.t_accel = t_accel;
                self.state = TuningState::Steady;
                self.share1 = 1.0;
                trace!("balancer N={}: partition 2 alone took {:.3e}s", self.problem_size, t_accel);
                let calibration = self.calibration;
                self.retune(calibration);
            }
            TuningState::Steady => {
                self.accumulated.accumulate(TimingSample::new(t_local, t_accel));
                self.samples += 1;
                if self.samples >= self.params.retune_cycles {
                    self.samples = 0;
                    let sample = self.accumulated.take();
                    self.retune(sample);
                }
            }
        }
    }

    /// Start over from calibration.
    pub fn reset_auto_tuning(&mut self) {
        self.state = TuningState::CalibrateLocal;
        self.share1 = 1.0;
        self.calibration = TimingSample::default();
        self.accumulated = TimingSample::default();
        self.samples = 0;
        trace!("balancer N={}: reset", self.problem_size);
    }

    /// Forget accumulated timings but keep the current split.
    pub fn soft_reset_auto_tuning(&mut self) {
        self.accumulated = TimingSample::default();
        self.samples = 0;
    }

    pub fn set_problem_size(&mut self, problem_size: usize) {
        if problem_size == self.problem_size {
            return;
        }
        let old = self.problem_size;
        self.problem_size = problem_size;
        trace!("balancer problem size {} -> {}", old, problem_size);
    }

    fn steady_size(&self) -> usize {
        let scaled = (self.problem_size as f64 * self.share1).round() as usize;
        self.align(scaled.min(self.problem_size))
    }

    /// Round so that partition 2 is a multiple of the divisor.
    fn align(&self, size1: usize) -> usize {
        let n = self.problem_size;
        let size2 = (n - size1.min(n)) / self.divisor * self.divisor;
        n - size2
    }

    fn retune(&mut self, sample: TimingSample) {
        let max = self.params.max_percent_change;
        let (t1, t2) = (sample.t_local, sample.t_accel);
        let factor = if t1 > 0.0 {
            self.params.damping * t2 / t1
        } else if t2 > 0.0 {
            1.0 + max
        } else {
            1.0
        };
        let factor = if factor.is_finite() { factor } else { 1.0 };
        let factor = factor.clamp(1.0 - max, 1.0 + max);

        let previous = self.steady_size();
        // An empty partition 1 could never grow again.
        let old1 = previous.max(1);
        let candidate = ((old1 as f64 * factor).round() as usize).min(self.problem_size);
        let partition1 = self.align(candidate);
        self.share1 = partition1 as f64 / self.problem_size.max(1) as f64;

        debug!(
            "balancer N={}: t1={:.3e}s t2={:.3e}s factor={:.3} partition 1 {} -> {}",
            self.problem_size, t1, t2, factor, previous, partition1
        );
        if partition1 == self.problem_size {
            warn!(
                "balancer N={}: accelerator partition is empty after retune",
                self.problem_size
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adaptive(n: usize, d: usize) -> LoadBalancer {
        LoadBalancer::adaptive(n, d, TuningParams::default()).unwrap()
    }

    #[test]
    fn calibration_sequence() {
        let mut lb = adaptive(1000, 128);
        assert_eq!(lb.state(), TuningState::CalibrateLocal);
        assert_eq!(lb.partition1_size(), 1000);

        lb.set_execution_times(2.0, 0.0);
        assert_eq!(lb.state(), TuningState::CalibrateAccel);
        // 7 · 128 = 896 elements on the accelerator.
        assert_eq!(lb.partition1_size(), 104);

        lb.set_execution_times(0.0, 1.0);
        assert_eq!(lb.state(), TuningState::Steady);
        let p = lb.partition();
        assert!(p.size_local < 1000, "partition 1 should shrink, got {}", p.size_local);
        assert_eq!(p.size_accel % 128, 0);
        assert_eq!(p.total(), 1000);
        // factor 0.5 → 500 → accelerator floor(500/128)·128 = 384.
        assert_eq!(p.size_accel, 384);
    }

    #[test]
    fn steady_retune_every_cycle_window() {
        let params = TuningParams {
            retune_cycles: 3,
            ..TuningParams::default()
        };
        let mut lb = LoadBalancer::adaptive(1000, 10, params).unwrap();
        lb.set_execution_times(1.0, 0.0);
        lb.set_execution_times(0.0, 1.0);
        let after_calibration = lb.partition1_size();
        assert_eq!(after_calibration, 1000);

        // CPU slower than accelerator → shrink partition 1 on the third sample.
        lb.set_execution_times(3.0, 1.0);
        lb.set_execution_times(3.0, 1.0);
        assert_eq!(lb.partition1_size(), after_calibration);
        lb.set_execution_times(3.0, 1.0);
        assert_eq!(lb.partition1_size(), 500);
    }

    #[test]
    fn sizes_sum_for_any_timing_sequence() {
        let mut lb = adaptive(777, 16);
        let timings = [
            (1.0, 5.0),
            (0.0, 2.0),
            (0.0, 0.0),
            (f64::NAN, 1.0),
            (3.0, 0.1),
            (1e-9, 10.0),
            (10.0, 1e-9),
        ];
        for _ in 0..20 {
            for &(t1, t2) in &timings {
                lb.set_execution_times(t1, t2);
                let p = lb.partition();
                assert_eq!(p.total(), 777);
                assert_eq!(p.size_accel % 16, 0);
            }
        }
    }

    #[test]
    fn empty_partition_one_recovers() {
        let params = TuningParams {
            retune_cycles: 1,
            max_percent_change: 1.0,
            ..TuningParams::default()
        };
        let mut lb = LoadBalancer::adaptive(256, 1, params).unwrap();
        lb.set_execution_times(1.0, 0.0);
        lb.set_execution_times(0.0, 1.0);
        // Drive partition 1 down to nothing.
        for _ in 0..40 {
            lb.set_execution_times(10.0, 1.0);
        }
        assert_eq!(lb.partition1_size(), 0);
        // t1 == 0 with t2 > 0 grows it again.
        lb.set_execution_times(0.0, 1.0);
        assert!(lb.partition1_size() > 0);
    }

    #[test]
    fn small_problems_stay_local() {
        let mut lb = adaptive(100, 64);
        assert_eq!(lb.partition1_size(), 100);
        lb.set_execution_times(1.0, 0.0);
        assert_eq!(lb.state(), TuningState::CalibrateLocal);

        let lb = LoadBalancer::fixed(100, 0.0, 64).unwrap();
        assert_eq!(lb.partition1_size(), 100);
    }

    #[test]
    fn static_split_ignores_feedback() {
        let mut lb = LoadBalancer::fixed(1000, 0.085, 128).unwrap();
        // round(85) → accelerator floor(915 / 128) · 128 = 896.
        assert_eq!(lb.partition(), Partition { size_local: 104, size_accel: 896 });
        lb.set_execution_times(100.0, 0.001);
        assert_eq!(lb.partition1_size(), 104);
    }

    #[test]
    fn problem_size_rescales_in_steady_state() {
        let mut lb = adaptive(1000, 8);
        lb.set_execution_times(1.0, 0.0);
        lb.set_execution_times(0.0, 0.5);
        assert_eq!(lb.partition1_size(), 504);

        lb.set_problem_size(2000);
        // 504 · 2 = 1008 → accelerator floor(992 / 8) · 8 = 992.
        assert_eq!(lb.partition1_size(), 1008);
        assert_eq!(lb.partition().total(), 2000);

        lb.reset_auto_tuning();
        assert_eq!(lb.state(), TuningState::CalibrateLocal);
        lb.set_problem_size(3000);
        assert_eq!(lb.partition1_size(), 3000);
    }

    #[test]
    fn alternating_sizes_keep_the_split() {
        let mut lb = adaptive(1000, 8);
        lb.set_execution_times(1.0, 0.0);
        lb.set_execution_times(0.0, 0.5);
        assert_eq!(lb.partition1_size(), 504);

        for _ in 0..20 {
            lb.set_problem_size(1013);
            let p = lb.partition();
            assert_eq!(p.total(), 1013);
            assert_eq!(p.size_accel % 8, 0);
            lb.set_problem_size(1000);
            assert_eq!(lb.partition1_size(), 504);
        }
        lb.set_problem_size(1013);
        // round(510.55) = 511 → accelerator floor(502 / 8) · 8 = 496.
        assert_eq!(lb.partition1_size(), 517);
    }

    #[test]
    fn soft_reset_keeps_split() {
        let params = TuningParams {
            retune_cycles: 2,
            ..TuningParams::default()
        };
        let mut lb = LoadBalancer::adaptive(1000, 8, params).unwrap();
        lb.set_execution_times(1.0, 0.0);
        lb.set_execution_times(0.0, 0.5);
        let split = lb.partition1_size();
        lb.set_execution_times(100.0, 1.0);
        lb.soft_reset_auto_tuning();
        lb.set_execution_times(1.0, 1.0);
        // Only one sample since the soft reset: no retune yet.
        assert_eq!(lb.partition1_size(), split);
        assert_eq!(lb.state(), TuningState::Steady);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert_eq!(
            LoadBalancer::adaptive(10, 0, TuningParams::default()).unwrap_err(),
            PartitionError::ZeroDivisor
        );
        let bad = TuningParams {
            damping: 0.0,
            ..TuningParams::default()
        };
        assert!(LoadBalancer::adaptive(10, 1, bad).is_err());
        assert!(LoadBalancer::fixed(10, 1.5, 1).is_err());
    }

    #[test]
    fn mode_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: BalancerMode,
        }
        let w: Wrapper = toml::from_str("mode = \"adaptive\"").unwrap();
        assert_eq!(w.mode, BalancerMode::Adaptive);
        let w: Wrapper = toml::from_str("mode = { static = { fraction = 0.25 } }").unwrap();
        assert_eq!(w.mode, BalancerMode::Static { fraction: 0.25 });
    }
}
