use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;
use wattbench_benchmark::{BenchmarkRunner, SyntheticWorkload};
use wattbench_core::{Backend, BenchmarkConfig, BenchmarkReport, Device, ScenarioKind};
use wattbench_launcher::{self as launcher, WorkerCommand};

#[derive(Parser)]
#[command(name = "wattbench")]
#[command(about = "Latency and energy benchmarking harness for ML workloads", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a benchmark, optionally fanned out over distributed ranks
    Run {
        /// Scenario to run (inference, training)
        #[arg(short, long, default_value = "inference")]
        scenario: String,

        /// Device to benchmark on (cpu, cuda)
        #[arg(short, long, default_value = "cpu")]
        device: String,

        /// Backend driving the model (candle, ort, llama-cpp, mistral-rs, vllm)
        #[arg(short, long, default_value = "candle")]
        backend: String,

        /// Accelerator ids sampled by the energy tracker (e.g. 0,1)
        #[arg(long, value_delimiter = ',')]
        device_ids: Vec<u32>,

        /// Number of measured iterations
        #[arg(short, long, default_value = "10")]
        iterations: u32,

        /// Number of warmup runs
        #[arg(short, long, default_value = "2")]
        warmup: u32,

        #[arg(long, default_value = "1")]
        batch_size: u32,

        #[arg(long, default_value = "128")]
        sequence_length: u32,

        /// Tokens generated per decode iteration
        #[arg(long, default_value = "32")]
        generate_tokens: u32,

        /// Optimizer steps for the training scenario
        #[arg(long, default_value = "20")]
        training_steps: u32,

        /// Track energy consumption alongside latency
        #[arg(long)]
        energy: bool,

        /// Number of rank processes
        #[arg(short, long, default_value = "1")]
        nproc: usize,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        output: String,

        /// Write the aggregated report to this file
        #[arg(long)]
        report_file: Option<PathBuf>,
    },

    /// Aggregate existing per-rank report files from a directory
    Aggregate {
        /// Directory containing benchmark_report_rank_{rank}.json files
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Number of rank reports expected
        #[arg(short, long)]
        nproc: usize,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        output: String,
    },

    /// Isolated-process stage of a distributed run (internal)
    #[command(hide = true)]
    Isolated {
        #[arg(long)]
        config: PathBuf,
    },

    /// Rank stage of a distributed run (internal)
    #[command(hide = true)]
    Rank {
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            scenario,
            device,
            backend,
            device_ids,
            iterations,
            warmup,
            batch_size,
            sequence_length,
            generate_tokens,
            training_steps,
            energy,
            nproc,
            output,
            report_file,
        } => {
            init_logging();
            let scenario = match scenario.as_str() {
                "inference" => ScenarioKind::Inference,
                "training" => ScenarioKind::Training,
                other => anyhow::bail!("Unknown scenario: {other}"),
            };
            let mut config = BenchmarkConfig {
                scenario,
                device: device.parse::<Device>()?,
                backend: backend.parse::<Backend>()?,
                device_ids,
                warmup_runs: warmup,
                iterations,
                batch_size,
                sequence_length,
                generate_tokens,
                training_steps,
                energy,
                ..Default::default()
            };
            config.launcher.nproc_per_node = nproc;
            cmd_run(config, &output, report_file.as_deref())
        }
        Commands::Aggregate { dir, nproc, output } => {
            init_logging();
            cmd_aggregate(&dir, nproc, &output)
        }
        Commands::Isolated { config } => {
            init_logging();
            cmd_isolated(&config)
        }
        Commands::Rank { config } => {
            init_rank_logging();
            cmd_rank(&config)
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

/// Rank 0 keeps the inherited level; other ranks only surface errors
/// unless LOG_ALL_RANKS=1. Observability only, aggregation is unaffected.
fn init_rank_logging() {
    let rank: usize = std::env::var("RANK")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0);
    let log_all_ranks = std::env::var(launcher::LOG_ALL_RANKS_ENV)
        .map(|raw| raw == "1")
        .unwrap_or(false);

    let filter = if rank == 0 || log_all_ranks {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("error")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: &Path) -> Result<BenchmarkConfig> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn cmd_run(config: BenchmarkConfig, output: &str, report_file: Option<&Path>) -> Result<()> {
    println!();
    println!("Running benchmark...");
    println!("  Scenario:   {:?}", config.scenario);
    println!("  Device:     {}", config.device);
    println!("  Backend:    {}", config.backend);
    println!("  Iterations: {}", config.iterations);
    println!("  Ranks:      {}", config.launcher.nproc_per_node);
    println!();

    // the re-exec stages read the full config back from this file; it
    // must outlive the isolated child and all ranks
    let config_file = tempfile::NamedTempFile::new()?;
    serde_json::to_writer_pretty(config_file.as_file(), &config)?;
    let config_path = config_file.path().to_string_lossy().into_owned();

    let isolated = WorkerCommand::current_exe(vec![
        "isolated".to_string(),
        "--config".to_string(),
        config_path,
    ])?;

    let runtime = Runtime::new()?;
    let report = runtime.block_on(launcher::launch(&config.launcher, isolated))?;

    print_report(&report, output)?;
    if let Some(path) = report_file {
        report.save_json(path)?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}

fn cmd_aggregate(dir: &Path, nproc: usize, output: &str) -> Result<()> {
    // gathering an already-finished run: treat it as a clean exit
    let report = launcher::gather_reports(dir, nproc, Some(0))?;
    print_report(&report, output)
}

fn cmd_isolated(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let rank_command = WorkerCommand::current_exe(vec![
        "rank".to_string(),
        "--config".to_string(),
        config_path.to_string_lossy().into_owned(),
    ])?;

    let runtime = Runtime::new()?;
    runtime.block_on(launcher::fan_out(&config.launcher, rank_command))?;
    Ok(())
}

fn cmd_rank(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    launcher::run_rank(&config.launcher, |group| {
        let mut workload = SyntheticWorkload::new(&config);
        BenchmarkRunner::new(config.clone())
            .with_collective(group)
            .run(&mut workload)
    })?;
    Ok(())
}

fn print_report(report: &BenchmarkReport, format: &str) -> Result<()> {
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        _ => {
            println!();
            println!("Results:");
            println!("{:-<76}", "");
            println!(
                "  {:<10} {:>12} {:>12} {:>20} {:>14}",
                "section", "mean (s)", "stdev (s)", "throughput", "energy (kWh)"
            );
            println!("{:-<76}", "");
            for (name, measurements) in &report.sections {
                let (mean, stdev) = measurements
                    .latency
                    .as_ref()
                    .map(|l| (l.mean, l.stdev))
                    .unwrap_or((0.0, 0.0));
                let throughput = measurements
                    .throughput
                    .map(|t| format!("{:.2} {}", t.value, t.unit))
                    .unwrap_or_else(|| "-".to_string());
                let energy = measurements
                    .energy
                    .as_ref()
                    .map(|e| format!("{:.9}", e.total))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {:<10} {:>12.6} {:>12.6} {:>20} {:>14}",
                    name, mean, stdev, throughput, energy
                );
            }
            println!();
        }
    }
    Ok(())
}
