use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::{Backend, Device};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioKind {
    #[default]
    Inference,
    Training,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(default)]
    pub scenario: ScenarioKind,
    pub device: Device,
    pub backend: Backend,
    /// Accelerator ids sampled by the energy tracker. Required and
    /// non-empty when `device` is an accelerator.
    #[serde(default)]
    pub device_ids: Vec<u32>,
    #[serde(default = "default_warmup_runs")]
    pub warmup_runs: u32,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_sequence_length")]
    pub sequence_length: u32,
    #[serde(default = "default_generate_tokens")]
    pub generate_tokens: u32,
    #[serde(default = "default_training_steps")]
    pub training_steps: u32,
    /// Track energy consumption alongside latency.
    #[serde(default)]
    pub energy: bool,
    #[serde(default)]
    pub launcher: LauncherConfig,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            scenario: ScenarioKind::Inference,
            device: Device::Cpu,
            backend: Backend::Candle,
            device_ids: Vec::new(),
            warmup_runs: default_warmup_runs(),
            iterations: default_iterations(),
            batch_size: default_batch_size(),
            sequence_length: default_sequence_length(),
            generate_tokens: default_generate_tokens(),
            training_steps: default_training_steps(),
            energy: false,
            launcher: LauncherConfig::default(),
        }
    }
}

fn default_warmup_runs() -> u32 {
    2
}

fn default_iterations() -> u32 {
    10
}

fn default_batch_size() -> u32 {
    1
}

fn default_sequence_length() -> u32 {
    128
}

fn default_generate_tokens() -> u32 {
    32
}

fn default_training_steps() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Number of rank processes launched by the isolated child.
    #[serde(default = "default_nproc_per_node")]
    pub nproc_per_node: usize,
    #[serde(default = "default_master_addr")]
    pub master_addr: String,
    #[serde(default = "default_master_port")]
    pub master_port: u16,
    /// Bound on process-group initialization, not on measurement.
    #[serde(default = "default_rendezvous_timeout_secs")]
    pub rendezvous_timeout_secs: u64,
    /// Directory holding the per-rank report files.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            nproc_per_node: default_nproc_per_node(),
            master_addr: default_master_addr(),
            master_port: default_master_port(),
            rendezvous_timeout_secs: default_rendezvous_timeout_secs(),
            output_dir: default_output_dir(),
        }
    }
}

fn default_nproc_per_node() -> usize {
    1
}

fn default_master_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_master_port() -> u16 {
    29500
}

fn default_rendezvous_timeout_secs() -> u64 {
    300
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_deserializes_with_defaults() {
        let config: BenchmarkConfig =
            serde_json::from_str(r#"{"device": "cpu", "backend": "candle"}"#).unwrap();
        assert_eq!(config.scenario, ScenarioKind::Inference);
        assert_eq!(config.warmup_runs, 2);
        assert_eq!(config.iterations, 10);
        assert!(!config.energy);
        assert_eq!(config.launcher.nproc_per_node, 1);
        assert_eq!(config.launcher.master_port, 29500);
    }

    #[test]
    fn config_round_trips() {
        let mut config = BenchmarkConfig::default();
        config.scenario = ScenarioKind::Training;
        config.device_ids = vec![0, 1];
        config.launcher.nproc_per_node = 2;

        let json = serde_json::to_string(&config).unwrap();
        let back: BenchmarkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.scenario, ScenarioKind::Training);
        assert_eq!(back.device_ids, vec![0, 1]);
        assert_eq!(back.launcher.nproc_per_node, 2);
    }
}
