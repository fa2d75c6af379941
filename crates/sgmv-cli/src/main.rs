//! sgmv command-line interface.
//!
//! Fit sparse-grid regression jobs from TOML configuration files:
//! ```sh
//! sgmv-cli run job.toml
//! sgmv-cli validate job.toml
//! sgmv-cli compare job.toml --repeats 5
//! sgmv-cli backends
//! ```
//!
//! Built with `--features mpi`, a job with `distributed.transport = "mpi"`
//! runs one rank per process under `mpirun`.

mod config;
mod runner;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sgmv_core::StrategyKind;

#[derive(Parser)]
#[command(name = "sgmv-cli")]
#[command(about = "Distributed sparse-grid system matrix: regression driver")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the coefficients of a job.
    Run {
        /// Path to the job configuration file.
        config: PathBuf,
        /// Report path (overrides the config file setting).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Number of ranks (overrides `distributed.ranks`).
        #[arg(short, long)]
        ranks: Option<usize>,
        /// Exchange strategy (overrides `operator.strategy`).
        #[arg(short, long)]
        strategy: Option<StrategyKind>,
    },
    /// Validate a configuration file and build the grid without running.
    Validate {
        /// Path to the job configuration file.
        config: PathBuf,
    },
    /// Time every exchange strategy on the job's operator.
    Compare {
        /// Path to the job configuration file.
        config: PathBuf,
        /// Operator applications per strategy.
        #[arg(long, default_value_t = 5)]
        repeats: usize,
    },
    /// List evaluation kernels and whether they are usable here.
    Backends,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            output,
            ranks,
            strategy,
        } => {
            println!("sgmv regression");
            println!("===============");
            let mut job = config::load_config(&config)?;
            println!("Configuration: {}", config.display());
            if let Some(ranks) = ranks {
                job.distributed.ranks = ranks;
            }
            if let Some(strategy) = strategy {
                job.operator.strategy = strategy;
            }
            job.validate()?;

            let problem = runner::build_problem(&job)?;
            let report = runner::run_job(&job, &problem)?;
            if !report.is_root() {
                return Ok(());
            }
            println!(
                "Grid points: {}, instances: {} (padded {}), ranks: {}",
                report.grid_points, report.instances, report.padded_instances, report.ranks
            );
            println!(
                "CG: {} iterations, residual {:.3e}{}",
                report.iterations,
                report.residual_norm,
                if report.converged { "" } else { " (not converged)" }
            );
            println!("Training MSE: {:.6e}", report.training_mse);
            println!("Wall time: {:.3} s", report.seconds);

            if let Some(path) = output.or_else(|| job.output.report.clone()) {
                runner::write_report(&report, &path)?;
            }
            Ok(())
        }
        Commands::Validate { config } => {
            let job = config::load_config(&config)?;
            let problem = runner::build_problem(&job)?;
            println!("Configuration is valid: {}", config.display());
            println!(
                "  {} grid points, {} instances, {} rank(s), strategy {}",
                problem.grid.len(),
                problem.labels.len(),
                job.distributed.ranks,
                job.operator.strategy
            );
            Ok(())
        }
        Commands::Compare { config, repeats } => {
            let job = config::load_config(&config)?;
            let problem = runner::build_problem(&job)?;
            let rows = runner::compare_strategies(&job, &problem, repeats)?;
            println!(
                "{:<18} {:>14} {:>14} {:>12}",
                "strategy", "s/mult", "comm s/mult", "max dev"
            );
            for row in rows {
                println!(
                    "{:<18} {:>14.4e} {:>14.4e} {:>12.2e}",
                    row.strategy.name(),
                    row.seconds_per_mult,
                    row.communication_overhead,
                    row.max_deviation
                );
            }
            Ok(())
        }
        Commands::Backends => {
            println!("Evaluation kernels:");
            for (kind, probe) in runner::probe_backends() {
                match probe {
                    Ok(info) => println!(
                        "  {:<8} available: {} (width {})",
                        kind.name(),
                        info.name,
                        info.vector_width
                    ),
                    Err(e) => println!("  {:<8} unavailable: {}", kind.name(), e),
                }
            }
            Ok(())
        }
    }
}
