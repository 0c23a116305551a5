pub mod launcher;
pub mod process_group;

pub use launcher::{
    fan_out, gather_reports, launch, rank_report_path, run_rank, LaunchError, Result,
    WorkerCommand, LOG_ALL_RANKS_ENV, OUTPUT_DIR_ENV, RUN_ID_ENV,
};
pub use process_group::ProcessGroup;
