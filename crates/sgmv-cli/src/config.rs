//! TOML configuration deserialisation for regression jobs.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use sgmv_core::{ConjugateGradients, OperatorConfig};

/// Top-level job configuration.
#[derive(Debug, Deserialize)]
pub struct JobConfig {
    pub problem: ProblemConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
    #[serde(default)]
    pub operator: OperatorConfig,
    #[serde(default)]
    pub solver: ConjugateGradients,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Grid and training data.
#[derive(Debug, Deserialize)]
pub struct ProblemConfig {
    pub dims: usize,
    /// Level of the regular sparse grid.
    pub level: usize,
    /// Number of synthetic instances; ignored when `data_file` is set.
    #[serde(default = "default_instances")]
    pub instances: usize,
    /// CSV file, one instance per line: `dims` coordinates then the label.
    #[serde(default)]
    pub data_file: Option<PathBuf>,
}

fn default_instances() -> usize {
    1000
}

/// How ranks are connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Threads of this process.
    #[default]
    Local,
    /// One MPI process per rank; the world size comes from the launcher.
    Mpi,
}

#[derive(Debug, Deserialize)]
pub struct DistributedConfig {
    /// Number of in-process ranks; ignored by the MPI transport.
    #[serde(default = "default_ranks")]
    pub ranks: usize,
    #[serde(default)]
    pub transport: Transport,
}

fn default_ranks() -> usize {
    1
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            ranks: default_ranks(),
            transport: Transport::default(),
        }
    }
}

/// Output configuration.
#[derive(Debug, Default, Deserialize)]
pub struct OutputConfig {
    /// JSON report path; no report is written when absent.
    #[serde(default)]
    pub report: Option<PathBuf>,
    /// Include the coefficient vector in the report.
    #[serde(default)]
    pub save_solution: bool,
}

impl JobConfig {
    /// Reject values the engine would refuse later, before spawning ranks.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.problem.dims == 0 {
            bail!("problem.dims must be positive");
        }
        if self.problem.level == 0 {
            bail!("problem.level must be positive");
        }
        if self.problem.data_file.is_none() && self.problem.instances == 0 {
            bail!("problem.instances must be positive");
        }
        if self.distributed.ranks == 0 {
            bail!("distributed.ranks must be positive");
        }
        if self.distributed.transport == Transport::Mpi && !cfg!(feature = "mpi") {
            bail!("distributed.transport = \"mpi\" needs a build with the `mpi` feature");
        }
        self.operator
            .validate()
            .context("invalid [operator] section")?;
        Ok(())
    }
}

/// Load and parse a TOML job configuration file.
pub fn load_config(path: &Path) -> anyhow::Result<JobConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let config: JobConfig = toml::from_str(&content)
        .with_context(|| format!("cannot parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgmv_core::StrategyKind;

    #[test]
    fn minimal_job_uses_defaults() {
        let job: JobConfig = toml::from_str("[problem]\ndims = 2\nlevel = 3\n").unwrap();
        assert_eq!(job.problem.instances, 1000);
        assert_eq!(job.distributed.ranks, 1);
        assert_eq!(job.distributed.transport, Transport::Local);
        assert_eq!(job.operator, OperatorConfig::default());
        assert_eq!(job.solver, ConjugateGradients::default());
        assert!(job.output.report.is_none());
        assert!(job.validate().is_ok());
    }

    #[test]
    fn full_job() {
        let job: JobConfig = toml::from_str(
            r#"
            [problem]
            dims = 3
            level = 4
            instances = 5000

            [distributed]
            ranks = 4

            [operator]
            strategy = "one_sided_rma"
            accelerator = { kind = "simd", width = 8 }

            [solver]
            max_iterations = 40
            tolerance = 1e-6

            [output]
            report = "out/report.json"
            "#,
        )
        .unwrap();
        assert_eq!(job.distributed.ranks, 4);
        assert_eq!(job.operator.strategy, StrategyKind::OneSidedRma);
        assert_eq!(job.solver.max_iterations, 40);
        assert_eq!(job.solver.recompute_every, 50);
        assert_eq!(job.output.report, Some(PathBuf::from("out/report.json")));
        assert!(job.validate().is_ok());
    }

    #[test]
    fn mpi_transport_needs_the_feature() {
        let job: JobConfig = toml::from_str(
            "[problem]\ndims = 2\nlevel = 3\n[distributed]\ntransport = \"mpi\"\n",
        )
        .unwrap();
        assert_eq!(job.distributed.transport, Transport::Mpi);
        assert_eq!(job.validate().is_ok(), cfg!(feature = "mpi"));
    }

    #[test]
    fn zero_ranks_is_rejected() {
        let job: JobConfig =
            toml::from_str("[problem]\ndims = 2\nlevel = 3\n[distributed]\nranks = 0\n").unwrap();
        assert!(job.validate().is_err());
    }
}
