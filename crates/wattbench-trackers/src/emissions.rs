use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;
use wattbench_core::{Result, WattBenchError};

/// Machine-level power is polled once per period and integrated into kWh.
pub const POWER_SAMPLING_PERIOD: Duration = Duration::from_secs(1);

/// Geolocation endpoint used to resolve the machine's country for carbon
/// intensity lookup.
const GEOLOCATION_URL: &str = "https://get.geojs.io/v1/ip/geo.json";

const FALLBACK_COUNTRY_ISO_CODE: &str = "USA";

/// Estimated CPU package power when RAPL counters are not readable.
const CPU_TDP_WATTS: f64 = 85.0;

/// Memory power model: 3 W per 8 GiB in use.
const RAM_WATTS_PER_8_GIB: f64 = 3.0;

/// World-average grid carbon intensity, used for countries not in the
/// table below.
const WORLD_CARBON_INTENSITY: f64 = 0.475;

fn carbon_intensity_kg_per_kwh(country_iso_code: &str) -> f64 {
    match country_iso_code {
        "USA" => 0.38,
        "CAN" => 0.13,
        "GBR" => 0.23,
        "FRA" => 0.06,
        "DEU" => 0.34,
        "JPN" => 0.46,
        "CHN" => 0.55,
        "IND" => 0.71,
        _ => WORLD_CARBON_INTENSITY,
    }
}

fn watts_to_kwh(watts: f64, dt_secs: f64) -> f64 {
    watts * dt_secs / 3_600_000.0
}

/// One task-scoped emissions measurement, persisted as the
/// `{file_prefix}_codecarbon.json` artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmissionsRecord {
    pub run_id: Uuid,
    pub timestamp_secs: f64,
    pub duration_secs: f64,
    pub cpu_energy_kwh: f64,
    pub gpu_energy_kwh: f64,
    pub ram_energy_kwh: f64,
    pub energy_consumed_kwh: f64,
    pub emissions_kg: f64,
    pub country_iso_code: String,
    pub tracking_mode: String,
    pub sampling_period_secs: f64,
}

// ============================================================================
// Power probes
// ============================================================================

trait PowerProbe: Send {
    fn power_watts(&mut self) -> f64;
}

struct RaplDomain {
    energy_path: PathBuf,
    max_range_uj: u64,
    last_uj: u64,
}

/// CPU package power from the kernel's powercap energy counters.
struct RaplProbe {
    domains: Vec<RaplDomain>,
    last_read: Instant,
}

impl RaplProbe {
    fn discover() -> Option<Self> {
        Self::discover_in(Path::new("/sys/class/powercap"))
    }

    fn discover_in(root: &Path) -> Option<Self> {
        let entries = fs::read_dir(root).ok()?;
        let mut domains = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            // package-level domains only ("intel-rapl:0"), not
            // sub-domains like "intel-rapl:0:1"
            if !name.starts_with("intel-rapl:") || name.matches(':').count() != 1 {
                continue;
            }
            let energy_path = entry.path().join("energy_uj");
            let Ok(last_uj) = read_counter(&energy_path) else {
                continue;
            };
            let max_range_uj = read_counter(&entry.path().join("max_energy_range_uj"))
                .unwrap_or(u64::MAX);
            domains.push(RaplDomain {
                energy_path,
                max_range_uj,
                last_uj,
            });
        }

        if domains.is_empty() {
            None
        } else {
            debug!("Reading CPU power from {} RAPL domain(s)", domains.len());
            Some(Self {
                domains,
                last_read: Instant::now(),
            })
        }
    }
}

fn read_counter(path: &Path) -> std::io::Result<u64> {
    let raw = fs::read_to_string(path)?;
    raw.trim()
        .parse::<u64>()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl PowerProbe for RaplProbe {
    fn power_watts(&mut self) -> f64 {
        let dt = self.last_read.elapsed().as_secs_f64();
        self.last_read = Instant::now();
        if dt <= 0.0 {
            return 0.0;
        }

        let mut joules = 0.0;
        for domain in &mut self.domains {
            let Ok(current_uj) = read_counter(&domain.energy_path) else {
                continue;
            };
            let delta_uj = if current_uj >= domain.last_uj {
                current_uj - domain.last_uj
            } else {
                // counter wrapped at max_energy_range_uj
                current_uj + (domain.max_range_uj - domain.last_uj)
            };
            domain.last_uj = current_uj;
            joules += delta_uj as f64 / 1e6;
        }
        joules / dt
    }
}

/// Load-share estimate used when RAPL counters are not readable.
struct TdpProbe {
    system: sysinfo::System,
}

impl TdpProbe {
    fn new() -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl PowerProbe for TdpProbe {
    fn power_watts(&mut self) -> f64 {
        self.system.refresh_cpu_usage();
        let load = self.system.global_cpu_info().cpu_usage() as f64 / 100.0;
        CPU_TDP_WATTS * load.clamp(0.0, 1.0)
    }
}

struct RamProbe {
    system: sysinfo::System,
}

impl RamProbe {
    fn new() -> Self {
        Self {
            system: sysinfo::System::new(),
        }
    }
}

impl PowerProbe for RamProbe {
    fn power_watts(&mut self) -> f64 {
        self.system.refresh_memory();
        let used_gib = self.system.used_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        RAM_WATTS_PER_8_GIB * used_gib / 8.0
    }
}

/// GPU board power summed over the tracked device ids, via NVML.
struct NvmlProbe {
    nvml: nvml_wrapper::Nvml,
    device_ids: Vec<u32>,
}

impl NvmlProbe {
    fn init(device_ids: &[u32]) -> Result<Self> {
        let nvml = nvml_wrapper::Nvml::init()
            .map_err(|e| WattBenchError::Sampler(format!("NVML initialization failed: {e}")))?;
        Ok(Self {
            nvml,
            device_ids: device_ids.to_vec(),
        })
    }
}

impl PowerProbe for NvmlProbe {
    fn power_watts(&mut self) -> f64 {
        self.device_ids
            .iter()
            .filter_map(|id| {
                self.nvml
                    .device_by_index(*id)
                    .and_then(|device| device.power_usage())
                    .ok()
            })
            .map(|milliwatts| milliwatts as f64 / 1000.0)
            .sum()
    }
}

// ============================================================================
// Sampler
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct EnergyAccum {
    cpu_kwh: f64,
    gpu_kwh: f64,
    ram_kwh: f64,
}

enum SamplerCommand {
    /// Take a sample now and acknowledge, so task boundaries see current
    /// accumulator values instead of up-to-one-period-stale ones.
    Flush(SyncSender<()>),
}

/// Continuously samples machine-level power on a background thread and
/// integrates it into per-component energy accumulators. Task-scoped
/// accounting snapshots the accumulators at the boundaries.
///
/// Multiple samplers may run concurrently on one machine: distributed
/// ranks and parallel benchmark runs share the machine-level meter, and
/// the overlap is accepted imprecision rather than serialized access.
pub struct EmissionsSampler {
    run_id: Uuid,
    country_iso_code: String,
    carbon_intensity: f64,
    accum: Arc<Mutex<EnergyAccum>>,
    commands: Sender<SamplerCommand>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    task_baseline: Option<(EnergyAccum, Instant)>,
}

impl EmissionsSampler {
    /// Resolves the machine's country over the network, then starts
    /// sampling. Fails when the geolocation lookup does, so callers can
    /// fall back to [`EmissionsSampler::offline`].
    pub fn online(device_ids: &[u32]) -> Result<Self> {
        let country = resolve_country()?;
        debug!("Geolocation resolved country {country}");
        Self::start(device_ids, country)
    }

    /// Starts sampling with an explicit country code, no network access.
    pub fn offline(device_ids: &[u32], country_iso_code: impl Into<String>) -> Result<Self> {
        Self::start(device_ids, country_iso_code.into())
    }

    /// Reads `COUNTRY_ISO_CODE`, warning and assuming USA when unset.
    pub fn offline_from_env(device_ids: &[u32]) -> Result<Self> {
        let country = match std::env::var("COUNTRY_ISO_CODE") {
            Ok(code) if !code.is_empty() => code,
            _ => {
                warn!(
                    "\t+ Offline emissions sampling requires COUNTRY_ISO_CODE to be set. \
                     Assuming {FALLBACK_COUNTRY_ISO_CODE}; the carbon estimate may be inaccurate."
                );
                FALLBACK_COUNTRY_ISO_CODE.to_string()
            }
        };
        Self::start(device_ids, country)
    }

    fn start(device_ids: &[u32], country_iso_code: String) -> Result<Self> {
        let mut cpu: Box<dyn PowerProbe> = match RaplProbe::discover() {
            Some(probe) => Box::new(probe),
            None => {
                debug!("RAPL counters unavailable, estimating CPU power from load share");
                Box::new(TdpProbe::new())
            }
        };
        let mut ram = RamProbe::new();
        let mut gpu = if device_ids.is_empty() {
            None
        } else {
            match NvmlProbe::init(device_ids) {
                Ok(probe) => Some(probe),
                Err(err) => {
                    warn!("\t+ GPU power sampling unavailable: {err}");
                    None
                }
            }
        };

        let accum = Arc::new(Mutex::new(EnergyAccum::default()));
        let stop = Arc::new(AtomicBool::new(false));
        let (commands, command_rx): (Sender<SamplerCommand>, Receiver<SamplerCommand>) =
            mpsc::channel();

        let thread_accum = Arc::clone(&accum);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let mut last = Instant::now();
            let mut sample = |accum: &Mutex<EnergyAccum>, last: &mut Instant| {
                let now = Instant::now();
                let dt = now.duration_since(*last).as_secs_f64();
                *last = now;

                let cpu_w = cpu.power_watts();
                let ram_w = ram.power_watts();
                let gpu_w = gpu.as_mut().map(|g| g.power_watts()).unwrap_or(0.0);

                let mut accum = accum.lock().unwrap();
                accum.cpu_kwh += watts_to_kwh(cpu_w, dt);
                accum.ram_kwh += watts_to_kwh(ram_w, dt);
                accum.gpu_kwh += watts_to_kwh(gpu_w, dt);
            };

            loop {
                match command_rx.recv_timeout(POWER_SAMPLING_PERIOD) {
                    Ok(SamplerCommand::Flush(ack)) => {
                        sample(&thread_accum, &mut last);
                        let _ = ack.send(());
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        sample(&thread_accum, &mut last);
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                if thread_stop.load(Ordering::Relaxed) {
                    break;
                }
            }
        });

        let carbon_intensity = carbon_intensity_kg_per_kwh(&country_iso_code);
        Ok(Self {
            run_id: Uuid::new_v4(),
            country_iso_code,
            carbon_intensity,
            accum,
            commands,
            stop,
            handle: Some(handle),
            task_baseline: None,
        })
    }

    pub fn country_iso_code(&self) -> &str {
        &self.country_iso_code
    }

    fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = sync_channel(1);
        self.commands
            .send(SamplerCommand::Flush(ack_tx))
            .map_err(|_| WattBenchError::Sampler("sampling thread is gone".to_string()))?;
        ack_rx
            .recv()
            .map_err(|_| WattBenchError::Sampler("sampling thread is gone".to_string()))
    }

    /// Begins task-scoped accounting from the current accumulator state.
    pub fn start_task(&mut self) -> Result<()> {
        self.flush()?;
        let snapshot = *self.accum.lock().unwrap();
        self.task_baseline = Some((snapshot, Instant::now()));
        Ok(())
    }

    /// Ends task-scoped accounting and returns the structured record of
    /// what was consumed since [`EmissionsSampler::start_task`].
    pub fn stop_task(&mut self) -> Result<EmissionsRecord> {
        let (baseline, started) = self.task_baseline.take().ok_or_else(|| {
            WattBenchError::Sampler("stop_task called without a running task".to_string())
        })?;
        self.flush()?;
        let current = *self.accum.lock().unwrap();

        let cpu_energy_kwh = current.cpu_kwh - baseline.cpu_kwh;
        let gpu_energy_kwh = current.gpu_kwh - baseline.gpu_kwh;
        let ram_energy_kwh = current.ram_kwh - baseline.ram_kwh;
        let energy_consumed_kwh = cpu_energy_kwh + gpu_energy_kwh + ram_energy_kwh;

        let timestamp_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Ok(EmissionsRecord {
            run_id: self.run_id,
            timestamp_secs,
            duration_secs: started.elapsed().as_secs_f64(),
            cpu_energy_kwh,
            gpu_energy_kwh,
            ram_energy_kwh,
            energy_consumed_kwh,
            emissions_kg: energy_consumed_kwh * self.carbon_intensity,
            country_iso_code: self.country_iso_code.clone(),
            tracking_mode: "machine".to_string(),
            sampling_period_secs: POWER_SAMPLING_PERIOD.as_secs_f64(),
        })
    }

    /// Abandons the current task without producing a record.
    pub fn discard_task(&mut self) {
        self.task_baseline = None;
    }
}

impl Drop for EmissionsSampler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // wake the thread out of its recv_timeout
        let (ack_tx, _ack_rx) = sync_channel(1);
        let _ = self.commands.send(SamplerCommand::Flush(ack_tx));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn resolve_country() -> Result<String> {
    #[derive(Deserialize)]
    struct GeoResponse {
        country_code3: String,
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| WattBenchError::Sampler(format!("geolocation client: {e}")))?;
    let geo: GeoResponse = client
        .get(GEOLOCATION_URL)
        .send()
        .map_err(|e| WattBenchError::Sampler(format!("geolocation lookup failed: {e}")))?
        .json()
        .map_err(|e| WattBenchError::Sampler(format!("geolocation response: {e}")))?;

    Ok(geo.country_code3)
}
