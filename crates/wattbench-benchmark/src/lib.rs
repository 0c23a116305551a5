pub mod scenario;
pub mod workload;

pub use scenario::BenchmarkRunner;
pub use workload::{SyntheticWorkload, Workload};
