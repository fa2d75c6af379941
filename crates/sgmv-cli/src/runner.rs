//! Job runner: builds the problem, spins up the ranks and drives the solver.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use log::info;
use ndarray::Array2;
use serde::Serialize;
use sgmv_compute::{create_kernel, Communicator, DeviceInfo, GridData, KernelKind, LocalWorld};
use sgmv_core::{
    DistributedSystemMatrix, LinearSolver, OperatorStats, Partition, StrategyKind, SystemMatrix,
};

use crate::config::{JobConfig, Transport};

/// Grid, instances and labels of one job.
pub struct Problem {
    pub grid: GridData,
    pub points: Array2<f64>,
    pub labels: Vec<f64>,
}

/// Build the regular grid and load or synthesise the training data.
pub fn build_problem(job: &JobConfig) -> Result<Problem> {
    let dims = job.problem.dims;
    let grid = GridData::regular(dims, job.problem.level)
        .with_context(|| format!("cannot build a level-{} grid", job.problem.level))?;
    let (points, labels) = match &job.problem.data_file {
        Some(path) => read_csv(path, dims)?,
        None => synthetic(job.problem.instances, dims),
    };
    Ok(Problem {
        grid,
        points,
        labels,
    })
}

/// Deterministic points in `(0, 1)^dims` with a smooth target.
fn synthetic(n: usize, dims: usize) -> (Array2<f64>, Vec<f64>) {
    const PRIMES: [f64; 8] = [2.0, 3.0, 5.0, 7.0, 11.0, 13.0, 17.0, 19.0];
    let points = Array2::from_shape_fn((n, dims), |(i, d)| {
        let v = (i as f64 + 1.0) * PRIMES[d % PRIMES.len()].sqrt();
        v - v.floor()
    });
    let labels = points
        .rows()
        .into_iter()
        .map(|row| row.iter().map(|x| (std::f64::consts::PI * x).sin()).product())
        .collect();
    (points, labels)
}

fn read_csv(path: &Path, dims: usize) -> Result<(Array2<f64>, Vec<f64>)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read data file {}", path.display()))?;
    let mut coords = Vec::new();
    let mut labels = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let values = line
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("{}:{}: not a number", path.display(), lineno + 1))?;
        if values.len() != dims + 1 {
            bail!(
                "{}:{}: expected {} columns, found {}",
                path.display(),
                lineno + 1,
                dims + 1,
                values.len()
            );
        }
        coords.extend_from_slice(&values[..dims]);
        labels.push(values[dims]);
    }
    if labels.is_empty() {
        bail!("data file {} contains no instances", path.display());
    }
    let points = Array2::from_shape_vec((labels.len(), dims), coords)?;
    Ok((points, labels))
}

/// Per-rank view of a finished run.
#[derive(Debug, Serialize)]
pub struct RankSummary {
    pub rank: usize,
    pub forward_partition: Partition,
    pub backward_partition: Partition,
    pub stats: OperatorStats,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub strategy: StrategyKind,
    pub transport: Transport,
    pub ranks: usize,
    pub grid_points: usize,
    pub instances: usize,
    pub padded_instances: usize,
    pub iterations: usize,
    pub residual_norm: f64,
    pub converged: bool,
    pub training_mse: f64,
    pub seconds: f64,
    pub rank_summaries: Vec<RankSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solution: Option<Vec<f64>>,
}

struct RankOutcome {
    summary: RankSummary,
    iterations: usize,
    residual_norm: f64,
    converged: bool,
    training_mse: f64,
    padded: usize,
    solution: Vec<f64>,
}

impl RunReport {
    /// Whether this process speaks for rank 0 and should print and write.
    pub fn is_root(&self) -> bool {
        self.rank_summaries.first().map_or(true, |s| s.rank == 0)
    }
}

/// One rank's part of a fit: `generate_rhs`, then CG.
fn fit_rank(comm: Arc<dyn Communicator>, job: &JobConfig, problem: &Problem) -> Result<RankOutcome> {
    let rank = comm.rank();
    let mut op = DistributedSystemMatrix::new(
        comm,
        problem.grid.clone(),
        problem.points.clone(),
        &job.operator,
    )?;
    let rhs = op.generate_rhs(&problem.labels)?;
    let report = job.solver.solve(&mut op, &rhs, None)?;

    let predicted = op.evaluate(&report.solution)?;
    let training_mse = predicted
        .iter()
        .zip(&problem.labels)
        .map(|(p, y)| (p - y).powi(2))
        .sum::<f64>()
        / problem.labels.len() as f64;

    let outcome = RankOutcome {
        summary: RankSummary {
            rank,
            forward_partition: op.executor().forward_partition(),
            backward_partition: op.executor().backward_partition(),
            stats: *op.stats(),
        },
        iterations: report.iterations,
        residual_norm: report.residual_norm,
        converged: report.converged,
        training_mse,
        padded: op.padded_instances(),
        solution: report.solution,
    };
    op.close()?;
    Ok(outcome)
}

/// Fit the sparse-grid coefficients over the configured transport.
pub fn run_job(job: &JobConfig, problem: &Problem) -> Result<RunReport> {
    match job.distributed.transport {
        Transport::Local => run_local(job, problem),
        #[cfg(feature = "mpi")]
        Transport::Mpi => run_mpi(job, problem),
        #[cfg(not(feature = "mpi"))]
        Transport::Mpi => bail!("this build has no MPI support; rebuild with `--features mpi`"),
    }
}

fn run_local(job: &JobConfig, problem: &Problem) -> Result<RunReport> {
    let ranks = job.distributed.ranks;
    info!(
        "fitting {} instances on {} grid points over {} local rank(s), strategy {}",
        problem.labels.len(),
        problem.grid.len(),
        ranks,
        job.operator.strategy
    );

    let start = Instant::now();
    let outcomes = LocalWorld::run(ranks, |comm| fit_rank(Arc::new(comm), job, problem))?;
    let seconds = start.elapsed().as_secs_f64();
    assemble(job, problem, ranks, outcomes, seconds)
}

/// Run this process as one rank of the MPI world started by the launcher.
#[cfg(feature = "mpi")]
fn run_mpi(job: &JobConfig, problem: &Problem) -> Result<RunReport> {
    use mpi::traits::Communicator as _;
    use sgmv_compute::MpiComm;

    let mut universe =
        mpi::initialize().ok_or_else(|| anyhow::anyhow!("MPI has already been initialised"))?;
    let ranks = universe.world().size() as usize;
    // Every rank may post its share of both exchanges before receiving.
    let chunks = job.operator.chunks_per_rank_data + job.operator.chunks_per_rank_grid;
    let values = 2 * ranks * (problem.labels.len() + problem.grid.len() + 64 * ranks * chunks);
    let messages = 2 * ranks * ranks * chunks;
    let comm = MpiComm::new(&mut universe, MpiComm::send_buffer_bytes(values, messages));
    if comm.rank() == 0 {
        info!(
            "fitting {} instances on {} grid points over {} MPI rank(s), strategy {}",
            problem.labels.len(),
            problem.grid.len(),
            ranks,
            job.operator.strategy
        );
    }

    let start = Instant::now();
    let outcome = fit_rank(Arc::new(comm), job, problem)?;
    let seconds = start.elapsed().as_secs_f64();
    assemble(job, problem, ranks, vec![outcome], seconds)
}

/// Build the report from the outcomes this process knows about, first one
/// reporting the solve.
fn assemble(
    job: &JobConfig,
    problem: &Problem,
    ranks: usize,
    outcomes: Vec<RankOutcome>,
    seconds: f64,
) -> Result<RunReport> {
    let mut outcomes = outcomes.into_iter();
    let Some(root) = outcomes.next() else {
        bail!("no ranks were run");
    };
    let solution = job.output.save_solution.then_some(root.solution);
    let mut rank_summaries = vec![root.summary];
    rank_summaries.extend(outcomes.map(|o| o.summary));

    Ok(RunReport {
        strategy: job.operator.strategy,
        transport: job.distributed.transport,
        ranks,
        grid_points: problem.grid.len(),
        instances: problem.labels.len(),
        padded_instances: root.padded,
        iterations: root.iterations,
        residual_norm: root.residual_norm,
        converged: root.converged,
        training_mse: root.training_mse,
        seconds,
        rank_summaries,
        solution,
    })
}

/// Write a run report as pretty-printed JSON.
pub fn write_report(report: &RunReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| anyhow::anyhow!("JSON serialisation error: {}", e))?;
    std::fs::write(path, json)?;
    println!("Report written to: {}", path.display());
    Ok(())
}

/// Timing and agreement of one strategy in [`compare_strategies`].
#[derive(Debug, Serialize)]
pub struct StrategyComparison {
    pub strategy: StrategyKind,
    pub seconds_per_mult: f64,
    pub communication_overhead: f64,
    /// Largest absolute deviation from the allreduce result.
    pub max_deviation: f64,
}

/// Apply the operator `repeats` times under every strategy.
pub fn compare_strategies(job: &JobConfig, problem: &Problem, repeats: usize) -> Result<Vec<StrategyComparison>> {
    let repeats = repeats.max(1);
    let alpha: Vec<f64> = (0..problem.grid.len())
        .map(|i| ((i * 7 % 11) as f64 - 5.0) / 5.0)
        .collect();

    let mut reference: Option<Vec<f64>> = None;
    let mut rows = Vec::with_capacity(StrategyKind::ALL.len());
    for kind in StrategyKind::ALL {
        let mut config = job.operator.clone();
        config.strategy = kind;

        let outcomes = LocalWorld::run(job.distributed.ranks, |comm| -> Result<(Vec<f64>, OperatorStats)> {
            let mut op = DistributedSystemMatrix::new(
                Arc::new(comm),
                problem.grid.clone(),
                problem.points.clone(),
                &config,
            )?;
            let mut y = op.mult(&alpha)?;
            for _ in 1..repeats {
                y = op.mult(&alpha)?;
            }
            let stats = *op.stats();
            op.close()?;
            Ok((y, stats))
        })?;

        let Some((y, stats)) = outcomes.into_iter().next() else {
            bail!("no ranks were run");
        };
        let max_deviation = match &reference {
            Some(r) => r
                .iter()
                .zip(&y)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max),
            None => 0.0,
        };
        if reference.is_none() {
            reference = Some(y);
        }
        rows.push(StrategyComparison {
            strategy: kind,
            seconds_per_mult: stats.total / stats.mult_calls.max(1) as f64,
            communication_overhead: stats.communication_overhead() / stats.mult_calls.max(1) as f64,
            max_deviation,
        });
    }
    Ok(rows)
}

/// Probe every kernel kind this binary was built with.
pub fn probe_backends() -> Vec<(KernelKind, Result<DeviceInfo, String>)> {
    KernelKind::ALL
        .iter()
        .map(|kind| {
            let probe = create_kernel(kind, None)
                .map(|k| k.device_info())
                .map_err(|e| e.to_string());
            (*kind, probe)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(ranks: usize, strategy: &str) -> JobConfig {
        toml::from_str(&format!(
            "[problem]\ndims = 2\nlevel = 3\ninstances = 150\n\
             [distributed]\nranks = {ranks}\n\
             [operator]\nstrategy = \"{strategy}\"\nlambda = 1e-3\n\
             [solver]\nmax_iterations = 200\ntolerance = 1e-8\n"
        ))
        .unwrap()
    }

    #[test]
    fn synthetic_data_is_deterministic() {
        let (a, la) = synthetic(20, 3);
        let (b, lb) = synthetic(20, 3);
        assert_eq!(a, b);
        assert_eq!(la, lb);
        assert!(a.iter().all(|&x| x > 0.0 && x < 1.0));
    }

    #[test]
    fn run_converges_and_fits() {
        let job = job(2, "overlapped_async");
        let problem = build_problem(&job).unwrap();
        let report = run_job(&job, &problem).unwrap();
        assert!(report.converged);
        assert_eq!(report.rank_summaries.len(), 2);
        assert!(report.is_root());
        assert_eq!(report.instances, 150);
        assert!(report.training_mse < 0.05, "mse {}", report.training_mse);
        assert!(report.solution.is_none());
    }

    #[test]
    fn strategies_agree() {
        let job = job(3, "allreduce");
        let problem = build_problem(&job).unwrap();
        let rows = compare_strategies(&job, &problem, 2).unwrap();
        assert_eq!(rows.len(), StrategyKind::ALL.len());
        for row in &rows {
            assert!(row.max_deviation < 1e-9, "{}: {}", row.strategy, row.max_deviation);
        }
    }

    #[test]
    fn csv_data_is_parsed() {
        let dir = std::env::temp_dir().join(format!("sgmv-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("data.csv");
        std::fs::write(&path, "# x, y, label\n0.1, 0.2, 1.0\n0.5,0.5,2.0\n\n").unwrap();
        let (points, labels) = read_csv(&path, 2).unwrap();
        assert_eq!(points.nrows(), 2);
        assert_eq!(labels, vec![1.0, 2.0]);

        std::fs::write(&path, "0.1, 0.2\n").unwrap();
        assert!(read_csv(&path, 2).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn scalar_backend_is_always_listed() {
        let backends = probe_backends();
        let (kind, probe) = &backends[0];
        assert_eq!(*kind, KernelKind::Scalar);
        assert!(probe.is_ok());
    }
}
