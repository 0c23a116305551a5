use std::sync::Arc;

use tracing::{debug, info};
use wattbench_core::{
    BenchmarkConfig, BenchmarkReport, Collective, Efficiency, EfficiencyUnit, Latency,
    Measurements, Result, ScenarioKind, ThroughputUnit,
};
use wattbench_trackers::{
    DeviceTimer, EnergyTracker, LatencyTracker, StepLatencyRecorder, TokenLatencyRecorder,
};

use crate::workload::Workload;

/// Drives a [`Workload`] through the trackers and assembles one
/// [`BenchmarkReport`] per invocation (one per rank in distributed runs).
pub struct BenchmarkRunner {
    config: BenchmarkConfig,
    timer: Option<Arc<dyn DeviceTimer>>,
    collective: Option<Arc<dyn Collective>>,
}

impl BenchmarkRunner {
    pub fn new(config: BenchmarkConfig) -> Self {
        Self {
            config,
            timer: None,
            collective: None,
        }
    }

    /// Attach the accelerator driver's timing seam, required for
    /// asynchronous device/backend pairs.
    pub fn with_device_timer(mut self, timer: Arc<dyn DeviceTimer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Attach the process group of a distributed run.
    pub fn with_collective(mut self, collective: Arc<dyn Collective>) -> Self {
        self.collective = Some(collective);
        self
    }

    pub fn run(&self, workload: &mut dyn Workload) -> Result<BenchmarkReport> {
        info!(
            "Starting {} benchmark on {} / {}",
            match self.config.scenario {
                ScenarioKind::Inference => "inference",
                ScenarioKind::Training => "training",
            },
            self.config.backend,
            self.config.device,
        );

        match self.config.scenario {
            ScenarioKind::Inference => self.run_inference(workload),
            ScenarioKind::Training => self.run_training(workload),
        }
    }

    fn latency_tracker(&self) -> Result<LatencyTracker> {
        LatencyTracker::new(
            self.config.device,
            self.config.backend,
            self.timer.clone(),
            self.collective.clone(),
        )
    }

    fn energy_tracker(&self) -> Result<Option<EnergyTracker>> {
        if !self.config.energy {
            return Ok(None);
        }
        EnergyTracker::new(
            self.config.backend,
            self.config.device,
            &self.config.device_ids,
            self.timer.clone(),
            self.collective.clone(),
        )
        .map(Some)
    }

    fn measure_load(&self, workload: &mut dyn Workload, report: &mut BenchmarkReport) -> Result<()> {
        // coarse overall duration, host-side, no synchronization needed
        let mut tracker = self.latency_tracker()?;
        tracker.reset();
        workload.load()?;
        let latency = Latency::from_values(vec![tracker.get_elapsed_time()]);
        latency.log("load");
        report.insert(
            "load",
            Measurements {
                latency: Some(latency),
                ..Default::default()
            },
        );
        Ok(())
    }

    fn run_inference(&self, workload: &mut dyn Workload) -> Result<BenchmarkReport> {
        let mut report = BenchmarkReport::new();
        self.measure_load(workload, &mut report)?;

        for i in 0..self.config.warmup_runs {
            debug!("Warmup run {}/{}", i + 1, self.config.warmup_runs);
            workload.prefill()?;
        }

        // prefill phase
        let mut prefill_tracker = self.latency_tracker()?;
        let mut energy = self.energy_tracker()?;
        let iterations = self.config.iterations;

        let mut prefill_loop =
            |tracker: &mut LatencyTracker, workload: &mut dyn Workload| -> Result<()> {
                for i in 0..iterations {
                    debug!("Prefill iteration {}/{}", i + 1, iterations);
                    tracker.track(|| workload.prefill())?;
                }
                Ok(())
            };
        match energy.as_mut() {
            Some(energy_tracker) => energy_tracker
                .track("prefill", || prefill_loop(&mut prefill_tracker, &mut *workload))?,
            None => prefill_loop(&mut prefill_tracker, workload)?,
        }

        let prefill_volume =
            (self.config.batch_size * self.config.sequence_length * iterations) as u64;
        let prefill_energy = energy.as_ref().and_then(|t| t.get_energy());
        report.insert(
            "prefill",
            Measurements {
                latency: Some(prefill_tracker.get_latency()?),
                throughput: Some(
                    prefill_tracker.get_throughput(prefill_volume, ThroughputUnit::TokensPerSec)?,
                ),
                efficiency: prefill_energy.as_ref().map(|e| {
                    Efficiency::from_energy(e, prefill_volume, EfficiencyUnit::TokensPerKwh)
                }),
                energy: prefill_energy,
                error: None,
            },
        );

        // decode phase
        let mut decode_tracker = self.latency_tracker()?;
        let mut token_recorder = TokenLatencyRecorder::new(
            self.config.device,
            self.config.backend,
            self.timer.clone(),
        )?;
        let generate_tokens = self.config.generate_tokens;

        token_recorder.reset();
        let mut decode_loop = |tracker: &mut LatencyTracker,
                               recorder: &mut TokenLatencyRecorder,
                               workload: &mut dyn Workload|
         -> Result<()> {
            for i in 0..iterations {
                debug!("Decode iteration {}/{}", i + 1, iterations);
                tracker.track(|| {
                    for _ in 0..generate_tokens {
                        workload.decode_token()?;
                        recorder.on_token();
                    }
                    Ok(())
                })?;
            }
            Ok(())
        };
        match energy.as_mut() {
            Some(energy_tracker) => energy_tracker.track("decode", || {
                decode_loop(&mut decode_tracker, &mut token_recorder, &mut *workload)
            })?,
            None => decode_loop(&mut decode_tracker, &mut token_recorder, workload)?,
        }

        let decode_volume = (generate_tokens * iterations) as u64 * self.config.batch_size as u64;
        let decode_energy = energy.as_ref().and_then(|t| t.get_energy());
        report.insert(
            "decode",
            Measurements {
                latency: Some(decode_tracker.get_latency()?),
                throughput: Some(
                    decode_tracker.get_throughput(decode_volume, ThroughputUnit::TokensPerSec)?,
                ),
                efficiency: decode_energy.as_ref().map(|e| {
                    Efficiency::from_energy(e, decode_volume, EfficiencyUnit::TokensPerKwh)
                }),
                energy: decode_energy,
                error: None,
            },
        );
        report.insert(
            "per_token",
            Measurements {
                latency: Some(token_recorder.get_latency()?),
                throughput: Some(
                    token_recorder.get_throughput(decode_volume, ThroughputUnit::TokensPerSec)?,
                ),
                ..Default::default()
            },
        );

        report.log();
        Ok(report)
    }

    fn run_training(&self, workload: &mut dyn Workload) -> Result<BenchmarkReport> {
        let mut report = BenchmarkReport::new();
        self.measure_load(workload, &mut report)?;

        for i in 0..self.config.warmup_runs {
            debug!("Warmup step {}/{}", i + 1, self.config.warmup_runs);
            workload.train_step()?;
        }

        let mut recorder = StepLatencyRecorder::new(
            self.config.device,
            self.config.backend,
            self.timer.clone(),
        )?;
        let mut energy = self.energy_tracker()?;
        let training_steps = self.config.training_steps;

        recorder.reset();
        let mut train_loop =
            |recorder: &mut StepLatencyRecorder, workload: &mut dyn Workload| -> Result<()> {
                for step in 0..training_steps {
                    debug!("Training step {}/{}", step + 1, training_steps);
                    recorder.step_begin();
                    workload.train_step()?;
                }
                recorder.finish();
                Ok(())
            };
        match energy.as_mut() {
            Some(energy_tracker) => {
                energy_tracker.track("train", || train_loop(&mut recorder, &mut *workload))?
            }
            None => train_loop(&mut recorder, workload)?,
        }

        let sample_volume = (training_steps * self.config.batch_size) as u64;
        let train_energy = energy.as_ref().and_then(|t| t.get_energy());
        report.insert(
            "train",
            Measurements {
                latency: Some(recorder.get_latency()?),
                throughput: Some(
                    recorder.get_throughput(training_steps as u64, ThroughputUnit::StepsPerSec)?,
                ),
                efficiency: train_energy.as_ref().map(|e| {
                    Efficiency::from_energy(e, sample_volume, EfficiencyUnit::SamplesPerKwh)
                }),
                energy: train_energy,
                error: None,
            },
        );

        report.log();
        Ok(report)
    }
}
