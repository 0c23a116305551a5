use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info};
use uuid::Uuid;
use wattbench_core::{BenchmarkReport, Collective, LauncherConfig, WattBenchError};

use crate::process_group::ProcessGroup;

pub const RUN_ID_ENV: &str = "WATTBENCH_RUN_ID";
pub const OUTPUT_DIR_ENV: &str = "WATTBENCH_OUTPUT_DIR";
pub const LOG_ALL_RANKS_ENV: &str = "LOG_ALL_RANKS";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to spawn worker process: {0}")]
    Spawn(std::io::Error),

    #[error("Worker process exited with non-zero code {0}")]
    NonZeroExit(i32),

    #[error("Rank {0} did not write its report")]
    MissingReport(usize),

    #[error("Worker reported failure: {0}")]
    WorkerFailure(String),

    #[error("Process group rendezvous failed: {0}")]
    Rendezvous(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] WattBenchError),
}

pub type Result<T> = std::result::Result<T, LaunchError>;

/// How to invoke a worker stage in a fresh process. Defaults to
/// re-executing the current binary with stage-selecting arguments.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn current_exe(args: Vec<String>) -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args,
        })
    }
}

/// Per-rank report file convention shared by ranks and the gather step.
pub fn rank_report_path(output_dir: &Path, rank: usize) -> PathBuf {
    output_dir.join(format!("benchmark_report_rank_{rank}.json"))
}

/// Parent side of the protocol: spawns one isolated child process (which
/// fans out into the ranks), waits for it, then gathers the per-rank
/// reports into one consolidated report.
pub async fn launch(config: &LauncherConfig, isolated: WorkerCommand) -> Result<BenchmarkReport> {
    let run_id = Uuid::new_v4();
    info!("\t+ Launching isolated worker process [run {run_id}]");

    let mut child = Command::new(&isolated.program)
        .args(&isolated.args)
        .env(RUN_ID_ENV, run_id.to_string())
        .env(OUTPUT_DIR_ENV, &config.output_dir)
        .kill_on_drop(true)
        .spawn()
        .map_err(LaunchError::Spawn)?;

    let status = child.wait().await?;
    gather_reports(&config.output_dir, config.nproc_per_node, status.code())
}

/// Isolated-child side: spawns one process per rank with the distributed
/// environment set, and waits for all of them. Any rank failure makes
/// the whole fan-out fail.
pub async fn fan_out(config: &LauncherConfig, rank_command: WorkerCommand) -> Result<()> {
    info!(
        "Spawning {} rank process(es) [pid {}]",
        config.nproc_per_node,
        std::process::id()
    );

    let mut children = Vec::with_capacity(config.nproc_per_node);
    for rank in 0..config.nproc_per_node {
        let child = Command::new(&rank_command.program)
            .args(&rank_command.args)
            .env("RANK", rank.to_string())
            .env("WORLD_SIZE", config.nproc_per_node.to_string())
            .env("MASTER_ADDR", &config.master_addr)
            .env("MASTER_PORT", config.master_port.to_string())
            .env(OUTPUT_DIR_ENV, &config.output_dir)
            .kill_on_drop(true)
            .spawn()
            .map_err(LaunchError::Spawn)?;
        children.push(child);
    }

    let statuses = join_all(children.iter_mut().map(|child| child.wait())).await;
    for (rank, status) in statuses.into_iter().enumerate() {
        let status = status?;
        if !status.success() {
            error!("Rank {rank} exited with {status}");
            return Err(LaunchError::NonZeroExit(status.code().unwrap_or(-1)));
        }
    }

    info!("All ranks finished");
    Ok(())
}

/// Rank side: initializes the process group from the environment, runs
/// the worker, persists its report to the rank-indexed file, and tears
/// the group down. A worker failure writes nothing; the parent will
/// observe the missing report together with this rank's non-zero exit.
pub fn run_rank<W>(config: &LauncherConfig, worker: W) -> Result<()>
where
    W: FnOnce(Arc<ProcessGroup>) -> wattbench_core::Result<BenchmarkReport>,
{
    let group = Arc::new(
        ProcessGroup::init_from_env(Duration::from_secs(config.rendezvous_timeout_secs))
            .map_err(|e| LaunchError::Rendezvous(e.to_string()))?,
    );
    let rank = group.rank();

    let report = worker(Arc::clone(&group))?;

    let output_dir = std::env::var(OUTPUT_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| config.output_dir.clone());
    let path = rank_report_path(&output_dir, rank);
    info!("Saving report from rank {rank} to {}", path.display());
    report.save_json(&path)?;

    drop(group);
    info!("Exiting rank {rank}");
    Ok(())
}

/// Gather step. Only when every rank report exists does aggregation
/// proceed; a missing report is fatal whether or not the child exited
/// cleanly, since a clean exit with a missing report means a rank
/// silently failed to persist its measurements.
pub fn gather_reports(
    output_dir: &Path,
    world_size: usize,
    exit_code: Option<i32>,
) -> Result<BenchmarkReport> {
    let paths: Vec<PathBuf> = (0..world_size)
        .map(|rank| rank_report_path(output_dir, rank))
        .collect();

    if paths.iter().all(|path| path.is_file()) {
        info!("\t+ Gathering reports from all ranks");
        let mut reports = Vec::with_capacity(world_size);
        for path in &paths {
            reports.push(BenchmarkReport::from_json(path)?);
        }

        let mut failures = Vec::new();
        for (rank, report) in reports.iter().enumerate() {
            for (section, message) in report.errors() {
                failures.push(format!("rank {rank} [{section}]: {message}"));
            }
        }
        if !failures.is_empty() {
            return Err(LaunchError::WorkerFailure(failures.join(" | ")));
        }

        info!("\t+ Aggregating reports from all ranks");
        let report = BenchmarkReport::aggregate(&reports)?;
        report.log();
        return Ok(report);
    }

    match exit_code {
        Some(0) => {
            let missing = paths
                .iter()
                .position(|path| !path.is_file())
                .unwrap_or_default();
            Err(LaunchError::MissingReport(missing))
        }
        Some(code) => Err(LaunchError::NonZeroExit(code)),
        // terminated by a signal
        None => Err(LaunchError::NonZeroExit(-1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wattbench_core::{Latency, Measurements, Throughput, ThroughputUnit};

    fn rank_report(latency_values: Vec<f64>, throughput: f64) -> BenchmarkReport {
        let mut report = BenchmarkReport::new();
        report.insert(
            "prefill",
            Measurements {
                latency: Some(Latency::from_values(latency_values)),
                throughput: Some(Throughput {
                    unit: ThroughputUnit::TokensPerSec,
                    value: throughput,
                }),
                energy: None,
                efficiency: None,
                error: None,
            },
        );
        report
    }

    fn write_rank_reports(dir: &Path, count: usize) {
        for rank in 0..count {
            rank_report(vec![rank as f64 + 1.0], 10.0)
                .save_json(&rank_report_path(dir, rank))
                .unwrap();
        }
    }

    #[test]
    fn gather_aggregates_when_all_reports_exist() {
        let dir = tempfile::tempdir().unwrap();
        write_rank_reports(dir.path(), 3);

        let report = gather_reports(dir.path(), 3, Some(0)).unwrap();
        let prefill = report.section("prefill").unwrap();
        assert_eq!(prefill.latency.as_ref().unwrap().values, vec![1.0, 2.0, 3.0]);
        assert_eq!(prefill.throughput.unwrap().value, 30.0);
    }

    #[test]
    fn gather_aggregates_even_when_exit_code_is_nonzero() {
        // file existence is checked first; the exit code only matters
        // when a report is missing
        let dir = tempfile::tempdir().unwrap();
        write_rank_reports(dir.path(), 2);
        assert!(gather_reports(dir.path(), 2, Some(1)).is_ok());
    }

    #[test]
    fn missing_report_with_clean_exit_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_rank_reports(dir.path(), 2);
        // expecting 3 ranks, only 2 wrote
        let err = gather_reports(dir.path(), 3, Some(0)).unwrap_err();
        assert!(matches!(err, LaunchError::MissingReport(2)));
    }

    #[test]
    fn missing_report_with_nonzero_exit_reports_the_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let err = gather_reports(dir.path(), 2, Some(3)).unwrap_err();
        assert!(matches!(err, LaunchError::NonZeroExit(3)));
    }

    #[test]
    fn gather_refuses_reports_carrying_section_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut failed = BenchmarkReport::new();
        failed.insert("prefill", Measurements::from_error("sampler died"));
        failed.save_json(&rank_report_path(dir.path(), 0)).unwrap();
        rank_report(vec![1.0], 10.0)
            .save_json(&rank_report_path(dir.path(), 1))
            .unwrap();

        let err = gather_reports(dir.path(), 2, Some(0)).unwrap_err();
        match err {
            LaunchError::WorkerFailure(message) => {
                assert!(message.contains("rank 0"));
                assert!(message.contains("sampler died"));
            }
            other => panic!("expected WorkerFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn launch_gathers_after_the_isolated_child_exits() {
        let dir = tempfile::tempdir().unwrap();
        write_rank_reports(dir.path(), 2);

        let mut config = LauncherConfig::default();
        config.nproc_per_node = 2;
        config.output_dir = dir.path().to_path_buf();

        // stand-in for the isolated child: the reports already exist
        let report = launch(&config, WorkerCommand::new("true", vec![]))
            .await
            .unwrap();
        assert_eq!(
            report
                .section("prefill")
                .unwrap()
                .latency
                .as_ref()
                .unwrap()
                .values
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn launch_fails_when_the_child_fails_and_reports_are_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LauncherConfig::default();
        config.nproc_per_node = 2;
        config.output_dir = dir.path().to_path_buf();

        let err = launch(&config, WorkerCommand::new("false", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::NonZeroExit(1)));
    }

    #[tokio::test]
    async fn fan_out_surfaces_rank_failures() {
        let mut config = LauncherConfig::default();
        config.nproc_per_node = 2;

        assert!(fan_out(&config, WorkerCommand::new("true", vec![]))
            .await
            .is_ok());
        assert!(fan_out(&config, WorkerCommand::new("false", vec![]))
            .await
            .is_err());
    }

    #[test]
    fn run_rank_writes_the_rank_report() {
        // no RANK/WORLD_SIZE in the environment: solo group, rank 0
        let dir = tempfile::tempdir().unwrap();
        let mut config = LauncherConfig::default();
        config.output_dir = dir.path().to_path_buf();

        run_rank(&config, |group| {
            assert_eq!(group.world_size(), 1);
            group.barrier()?;
            Ok(rank_report(vec![0.5], 5.0))
        })
        .unwrap();

        let report = BenchmarkReport::from_json(&rank_report_path(dir.path(), 0)).unwrap();
        assert_eq!(report.section("prefill").unwrap().latency.as_ref().unwrap().values, vec![0.5]);
    }

    #[test]
    fn failed_worker_writes_no_report() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LauncherConfig::default();
        config.output_dir = dir.path().to_path_buf();

        let result = run_rank(&config, |_group| {
            Err(WattBenchError::Workload("rank blew up".to_string()))
        });
        assert!(result.is_err());
        assert!(!rank_report_path(dir.path(), 0).is_file());
    }
}
