pub mod emissions;
pub mod energy;
pub mod latency;
pub mod timing;

pub use emissions::{EmissionsRecord, EmissionsSampler, POWER_SAMPLING_PERIOD};
pub use energy::EnergyTracker;
pub use latency::{LatencyTracker, StepLatencyRecorder, TokenLatencyRecorder};
pub use timing::{DeviceTimer, Marker, MarkerId, TimingStrategy};
