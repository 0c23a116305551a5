// Domain modules
pub mod collective;
pub mod config;
pub mod device;
pub mod energy;
pub mod error;
pub mod latency;
pub mod report;

pub use collective::Collective;
pub use config::{BenchmarkConfig, LauncherConfig, ScenarioKind};
pub use device::{Backend, Device};
pub use energy::{Efficiency, EfficiencyUnit, Energy, ENERGY_UNIT};
pub use error::{Result, WattBenchError};
pub use latency::{Latency, Throughput, ThroughputUnit, LATENCY_UNIT};
pub use report::{BenchmarkReport, Measurements};
