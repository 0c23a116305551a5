use thiserror::Error;

#[derive(Error, Debug)]
pub enum WattBenchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unit mismatch: {0}")]
    UnitMismatch(String),

    #[error("Some {0} measurements are missing")]
    MissingMeasurements(&'static str),

    #[error("No {0} measurements to aggregate")]
    EmptyAggregation(&'static str),

    #[error("Collective error: {0}")]
    Collective(String),

    #[error("Sampler error: {0}")]
    Sampler(String),

    #[error("Workload error: {0}")]
    Workload(String),

    #[error("Report error: {0}")]
    Report(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WattBenchError>;
