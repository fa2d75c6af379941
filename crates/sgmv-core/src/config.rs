//! Operator configuration.
//!
//! Deserialised from the `[operator]` table of a job file. Every field has a
//! default, so an empty table yields a single-kernel allreduce operator.

use serde::{Deserialize, Serialize};
use sgmv_compute::KernelKind;
use thiserror::Error;

use crate::exchange::StrategyKind;
use crate::partition::{BalancerMode, PartitionError, TuningParams};

/// Rejected configuration values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Regularisation parameter must be finite and non-negative, got {0}")]
    InvalidLambda(f64),

    #[error("{0} must be positive")]
    ZeroCount(&'static str),

    #[error("Accelerator width {accel} is not a multiple of the CPU kernel width {cpu}")]
    WidthMismatch { cpu: usize, accel: usize },

    #[error("Grid is {grid}-dimensional but the dataset is {data}-dimensional")]
    DimensionMismatch { grid: usize, data: usize },

    #[error("Invalid balancer settings: {0}")]
    Balancer(#[from] PartitionError),
}

/// Load-balancer settings shared by the forward and backward balancers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default)]
    pub mode: BalancerMode,
    #[serde(default = "default_retune_cycles")]
    pub retune_cycles: usize,
    #[serde(default = "default_damping")]
    pub damping: f64,
    #[serde(default = "default_max_percent_change")]
    pub max_percent_change: f64,
}

fn default_retune_cycles() -> usize {
    TuningParams::default().retune_cycles
}

fn default_damping() -> f64 {
    TuningParams::default().damping
}

fn default_max_percent_change() -> f64 {
    TuningParams::default().max_percent_change
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            mode: BalancerMode::default(),
            retune_cycles: default_retune_cycles(),
            damping: default_damping(),
            max_percent_change: default_max_percent_change(),
        }
    }
}

impl BalancerConfig {
    pub fn params(&self) -> TuningParams {
        TuningParams {
            retune_cycles: self.retune_cycles,
            damping: self.damping,
            max_percent_change: self.max_percent_change,
        }
    }
}

/// Settings of a [`DistributedSystemMatrix`](crate::operator::DistributedSystemMatrix).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default)]
    pub balancer: BalancerConfig,
    /// Kernel for partition 1.
    #[serde(default)]
    pub cpu_kernel: KernelKind,
    /// Kernel for partition 2; `None` runs everything on `cpu_kernel`.
    #[serde(default)]
    pub accelerator: Option<KernelKind>,
    #[serde(default = "default_lambda")]
    pub lambda: f64,
    #[serde(default = "default_chunks_per_rank_data")]
    pub chunks_per_rank_data: usize,
    #[serde(default = "default_chunks_per_rank_grid")]
    pub chunks_per_rank_grid: usize,
    /// Worker threads per kernel; `None` uses the global Rayon pool.
    #[serde(default)]
    pub threads: Option<usize>,
}

fn default_lambda() -> f64 {
    1e-4
}

fn default_chunks_per_rank_data() -> usize {
    2
}

fn default_chunks_per_rank_grid() -> usize {
    1
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            balancer: BalancerConfig::default(),
            cpu_kernel: KernelKind::default(),
            accelerator: None,
            lambda: default_lambda(),
            chunks_per_rank_data: default_chunks_per_rank_data(),
            chunks_per_rank_grid: default_chunks_per_rank_grid(),
            threads: None,
        }
    }
}

impl OperatorConfig {
    /// Check every value that can be checked without building kernels.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.lambda.is_finite() && self.lambda >= 0.0) {
            return Err(ConfigError::InvalidLambda(self.lambda));
        }
        if self.chunks_per_rank_data == 0 {
            return Err(ConfigError::ZeroCount("chunks_per_rank_data"));
        }
        if self.chunks_per_rank_grid == 0 {
            return Err(ConfigError::ZeroCount("chunks_per_rank_grid"));
        }
        if self.threads == Some(0) {
            return Err(ConfigError::ZeroCount("threads"));
        }
        self.balancer.params().validate()?;
        if let BalancerMode::Static { fraction } = self.balancer.mode {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(PartitionError::InvalidTuning {
                    name: "fraction",
                    value: fraction,
                }
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_uses_defaults() {
        let config: OperatorConfig = toml::from_str("").unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_table() {
        let config: OperatorConfig = toml::from_str(
            r#"
            strategy = "overlapped_async"
            cpu_kernel = { kind = "simd", width = 4 }
            accelerator = { kind = "simd", width = 16 }
            lambda = 0.01
            chunks_per_rank_data = 4
            threads = 2

            [balancer]
            mode = { static = { fraction = 0.3 } }
            retune_cycles = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.strategy, StrategyKind::OverlappedAsync);
        assert_eq!(config.accelerator, Some(KernelKind::Simd { width: 16 }));
        assert_eq!(config.balancer.mode, BalancerMode::Static { fraction: 0.3 });
        assert_eq!(config.balancer.retune_cycles, 5);
        assert_eq!(config.balancer.damping, 1.0);
        assert_eq!(config.chunks_per_rank_grid, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = OperatorConfig {
            lambda: -1.0,
            ..OperatorConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidLambda(-1.0)));

        config.lambda = 0.0;
        config.chunks_per_rank_grid = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroCount("chunks_per_rank_grid"))
        );

        config.chunks_per_rank_grid = 1;
        config.balancer.max_percent_change = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Balancer(_))));
    }
}
