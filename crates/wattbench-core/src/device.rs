use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WattBenchError;

/// Hardware target a benchmark runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
        }
    }
}

impl FromStr for Device {
    type Err = WattBenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda),
            other => Err(WattBenchError::Config(format!("Unknown device: {other}"))),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inference/training backend driving the model.
///
/// The backend determines the timing regime: serving engines own their own
/// synchronization, and device-resident backends execute asynchronously
/// relative to the host. Both predicates are computed here once instead of
/// re-comparing identifier strings on every measurement call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Candle,
    Ort,
    LlamaCpp,
    MistralRs,
    Vllm,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Candle => "candle",
            Backend::Ort => "ort",
            Backend::LlamaCpp => "llama-cpp",
            Backend::MistralRs => "mistral-rs",
            Backend::Vllm => "vllm",
        }
    }

    /// Serving engines schedule and synchronize their own work, so the
    /// measurement layer must not inject barriers around them.
    pub fn is_engine(&self) -> bool {
        matches!(self, Backend::MistralRs | Backend::Vllm)
    }

    /// Whether execution is queued asynchronously relative to the host,
    /// requiring device events for timing and explicit synchronization
    /// before wall-clock measurements.
    pub fn is_asynchronous_on(&self, device: Device) -> bool {
        matches!(self, Backend::Candle) && device == Device::Cuda
    }
}

impl FromStr for Backend {
    type Err = WattBenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "candle" => Ok(Backend::Candle),
            "ort" => Ok(Backend::Ort),
            "llama-cpp" => Ok(Backend::LlamaCpp),
            "mistral-rs" => Ok(Backend::MistralRs),
            "vllm" => Ok(Backend::Vllm),
            other => Err(WattBenchError::Config(format!("Unknown backend: {other}"))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
