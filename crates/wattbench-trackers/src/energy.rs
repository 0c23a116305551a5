use std::fs;
use std::sync::Arc;

use tracing::info;
use wattbench_core::{Backend, Collective, Device, Energy, Result, WattBenchError};

use crate::emissions::{EmissionsRecord, EmissionsSampler};
use crate::timing::DeviceTimer;

/// Measures machine-level energy consumption over scoped tasks through
/// the emissions sampler and exposes it as an [`Energy`] statistic.
pub struct EnergyTracker {
    is_engine: bool,
    is_asynchronous: bool,
    timer: Option<Arc<dyn DeviceTimer>>,
    collective: Option<Arc<dyn Collective>>,
    sampler: EmissionsSampler,
    cpu_energy: Option<f64>,
    gpu_energy: Option<f64>,
    ram_energy: Option<f64>,
    total_energy: Option<f64>,
}

impl EnergyTracker {
    /// Starts an online sampler (network geolocation for carbon
    /// intensity), falling back to the offline sampler configured from
    /// `COUNTRY_ISO_CODE` when the lookup fails.
    pub fn new(
        backend: Backend,
        device: Device,
        device_ids: &[u32],
        timer: Option<Arc<dyn DeviceTimer>>,
        collective: Option<Arc<dyn Collective>>,
    ) -> Result<Self> {
        let device_ids = Self::validate_device_ids(device, device_ids)?;
        let sampler = match EmissionsSampler::online(&device_ids) {
            Ok(sampler) => sampler,
            Err(err) => {
                tracing::warn!("\t+ Falling back to offline emissions sampling: {err}");
                EmissionsSampler::offline_from_env(&device_ids)?
            }
        };
        Self::from_sampler(backend, device, sampler, timer, collective)
    }

    /// Skips the network lookup entirely and uses the given country code.
    pub fn offline(
        backend: Backend,
        device: Device,
        device_ids: &[u32],
        country_iso_code: impl Into<String>,
        timer: Option<Arc<dyn DeviceTimer>>,
        collective: Option<Arc<dyn Collective>>,
    ) -> Result<Self> {
        let device_ids = Self::validate_device_ids(device, device_ids)?;
        let sampler = EmissionsSampler::offline(&device_ids, country_iso_code)?;
        Self::from_sampler(backend, device, sampler, timer, collective)
    }

    fn validate_device_ids(device: Device, device_ids: &[u32]) -> Result<Vec<u32>> {
        match device {
            Device::Cuda if device_ids.is_empty() => Err(WattBenchError::Config(
                "GPU device ids must be provided for energy tracking on accelerators".to_string(),
            )),
            Device::Cuda => {
                info!("\t+ Tracking GPU energy on devices {:?}", device_ids);
                Ok(device_ids.to_vec())
            }
            Device::Cpu => {
                info!("\t+ Tracking CPU and RAM energy");
                Ok(Vec::new())
            }
        }
    }

    fn from_sampler(
        backend: Backend,
        device: Device,
        sampler: EmissionsSampler,
        timer: Option<Arc<dyn DeviceTimer>>,
        collective: Option<Arc<dyn Collective>>,
    ) -> Result<Self> {
        let is_asynchronous = backend.is_asynchronous_on(device);
        if is_asynchronous && timer.is_none() {
            // the sampler polls wall-clock power, so asynchronous work
            // must be drained with a device-wide synchronize, not an
            // async marker
            return Err(WattBenchError::Config(format!(
                "backend {backend} on {device} executes asynchronously and requires a device timer \
                 for energy tracking"
            )));
        }

        Ok(Self {
            is_engine: backend.is_engine(),
            is_asynchronous,
            timer,
            collective,
            sampler,
            cpu_energy: None,
            gpu_energy: None,
            ram_energy: None,
            total_energy: None,
        })
    }

    /// Runs `f` as one energy-accounted task and persists the raw
    /// emissions record to `{file_prefix}_codecarbon.json`. One artifact
    /// is written per call; callers must supply a unique prefix per task.
    /// If `f` fails, the task accounting is discarded, no artifact is
    /// written, and the error propagates unchanged.
    pub fn track<T>(&mut self, file_prefix: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        // serving engines own their synchronization; injecting barriers
        // around them would serialize work they overlap internally
        if !self.is_engine {
            if let Some(collective) = &self.collective {
                collective.barrier()?;
            }
        }
        if self.is_asynchronous {
            if let Some(timer) = &self.timer {
                timer.synchronize();
            }
        }

        self.sampler.start_task()?;

        let value = match f() {
            Ok(value) => value,
            Err(err) => {
                self.sampler.discard_task();
                return Err(err);
            }
        };

        if !self.is_engine {
            if let Some(collective) = &self.collective {
                collective.barrier()?;
            }
        }
        if self.is_asynchronous {
            if let Some(timer) = &self.timer {
                timer.synchronize();
            }
        }

        let record = self.sampler.stop_task()?;
        self.save_record(file_prefix, &record)?;

        self.cpu_energy = Some(record.cpu_energy_kwh);
        self.gpu_energy = Some(record.gpu_energy_kwh);
        self.ram_energy = Some(record.ram_energy_kwh);
        self.total_energy = Some(record.energy_consumed_kwh);

        Ok(value)
    }

    fn save_record(&self, file_prefix: &str, record: &EmissionsRecord) -> Result<()> {
        let path = format!("{file_prefix}_codecarbon.json");
        info!("\t+ Saving emissions record to {path}");
        fs::write(&path, serde_json::to_vec_pretty(record)?)?;
        Ok(())
    }

    /// Absent until a [`EnergyTracker::track`] call has completed.
    pub fn get_energy(&self) -> Option<Energy> {
        match (
            self.cpu_energy,
            self.ram_energy,
            self.gpu_energy,
            self.total_energy,
        ) {
            (Some(cpu), Some(ram), Some(gpu), Some(total)) => {
                Some(Energy::new(cpu, ram, gpu, total))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cpu_tracker(dir: &std::path::Path) -> (EnergyTracker, String) {
        let tracker = EnergyTracker::offline(
            Backend::Candle,
            Device::Cpu,
            &[],
            "FRA",
            None,
            None,
        )
        .unwrap();
        let prefix = dir.join("task").to_string_lossy().into_owned();
        (tracker, prefix)
    }

    #[test]
    fn accelerator_without_device_ids_is_a_config_error() {
        let result = EnergyTracker::offline(Backend::Ort, Device::Cuda, &[], "USA", None, None);
        assert!(matches!(result, Err(WattBenchError::Config(_))));
    }

    #[test]
    fn energy_is_absent_before_any_completed_task() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _) = cpu_tracker(dir.path());
        assert!(tracker.get_energy().is_none());
    }

    #[test]
    fn track_writes_one_artifact_and_exposes_energy() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tracker, prefix) = cpu_tracker(dir.path());

        tracker
            .track(&prefix, || {
                std::thread::sleep(Duration::from_millis(20));
                Ok(())
            })
            .unwrap();

        let artifact = dir.path().join("task_codecarbon.json");
        assert!(artifact.exists());
        let record: crate::emissions::EmissionsRecord =
            serde_json::from_str(&std::fs::read_to_string(artifact).unwrap()).unwrap();
        assert_eq!(record.country_iso_code, "FRA");

        let energy = tracker.get_energy().unwrap();
        assert_eq!(energy.unit, wattbench_core::ENERGY_UNIT);
        assert!(energy.total >= 0.0);
        assert!((energy.total - (energy.cpu + energy.gpu + energy.ram)).abs() < 1e-15);
    }

    #[test]
    fn failed_task_is_discarded_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tracker, prefix) = cpu_tracker(dir.path());

        let result: Result<()> = tracker.track(&prefix, || {
            Err(WattBenchError::Workload("oom".to_string()))
        });
        assert!(result.is_err());
        assert!(!dir.path().join("task_codecarbon.json").exists());
        assert!(tracker.get_energy().is_none());
    }
}
