use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use wattbench_core::{
    Backend, Collective, Device, Latency, Result, Throughput, ThroughputUnit,
};

use crate::timing::{DeviceTimer, Marker, TimingStrategy};

/// Measures the wall-clock duration of repeated scoped regions and turns
/// the accumulated samples into a [`Latency`] statistic.
///
/// Samples accumulate across [`LatencyTracker::track`] calls until
/// [`LatencyTracker::reset`]; callers that need disjoint measurement
/// phases must reset explicitly between them.
pub struct LatencyTracker {
    strategy: TimingStrategy,
    collective: Option<Arc<dyn Collective>>,
    start_markers: Vec<Marker>,
    end_markers: Vec<Marker>,
    start_time: Instant,
}

impl LatencyTracker {
    pub fn new(
        device: Device,
        backend: Backend,
        timer: Option<Arc<dyn DeviceTimer>>,
        collective: Option<Arc<dyn Collective>>,
    ) -> Result<Self> {
        let strategy = TimingStrategy::select(device, backend, timer)?;
        match strategy {
            TimingStrategy::DeviceEvent(_) => info!("\t+ Tracking latency with device events"),
            TimingStrategy::HostClock => info!("\t+ Tracking latency with the host clock"),
        }

        Ok(Self {
            strategy,
            collective,
            start_markers: Vec::new(),
            end_markers: Vec::new(),
            start_time: Instant::now(),
        })
    }

    /// Clears accumulated markers and re-captures the phase start time.
    pub fn reset(&mut self) {
        self.start_markers.clear();
        self.end_markers.clear();
        self.start_time = Instant::now();
    }

    /// Runs `f` as one scoped region. All ranks enter and leave the region
    /// together when a collective is attached. On the device-event
    /// strategy the start marker is recorded asynchronously, without
    /// stalling the host. If `f` fails, the in-flight sample is discarded
    /// (the start marker is popped, no end marker is recorded) and the
    /// error propagates unchanged.
    pub fn track<T>(&mut self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if let Some(collective) = &self.collective {
            collective.barrier()?;
        }

        self.start_markers.push(self.strategy.marker());
        match f() {
            Ok(value) => {
                self.end_markers.push(self.strategy.marker());
                if let Some(collective) = &self.collective {
                    collective.barrier()?;
                }
                Ok(value)
            }
            Err(err) => {
                self.start_markers.pop();
                Err(err)
            }
        }
    }

    /// Wall-clock seconds since construction or the last reset. Measured
    /// host-side so overall duration never forces a device synchronize.
    pub fn get_elapsed_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Converts accumulated marker pairs into per-region elapsed seconds.
    /// On the device-event strategy only the last pair is synchronized:
    /// all prior markers are transitively ordered before it on the same
    /// execution stream.
    pub fn get_latency(&self) -> Result<Latency> {
        let pairs = self.start_markers.len().min(self.end_markers.len());
        if pairs > 0 {
            self.strategy.synchronize_marker(&self.start_markers[pairs - 1]);
            self.strategy.synchronize_marker(&self.end_markers[pairs - 1]);
        }

        let mut values = Vec::with_capacity(pairs);
        for i in 0..pairs {
            values.push(
                self.strategy
                    .elapsed_secs(&self.start_markers[i], &self.end_markers[i])?,
            );
        }

        Ok(Latency::from_values(values))
    }

    pub fn get_throughput(&self, volume: u64, unit: ThroughputUnit) -> Result<Throughput> {
        Ok(Throughput::from_latency(&self.get_latency()?, volume, unit))
    }
}

fn consecutive_deltas(strategy: &TimingStrategy, markers: &[Marker]) -> Result<Vec<f64>> {
    let mut values = Vec::with_capacity(markers.len().saturating_sub(1));
    for i in 1..markers.len() {
        values.push(strategy.elapsed_secs(&markers[i - 1], &markers[i])?);
    }
    Ok(values)
}

/// Records one marker per training step; per-step latencies come from
/// consecutive marker differences.
pub struct StepLatencyRecorder {
    strategy: TimingStrategy,
    markers: Vec<Marker>,
}

impl StepLatencyRecorder {
    pub fn new(
        device: Device,
        backend: Backend,
        timer: Option<Arc<dyn DeviceTimer>>,
    ) -> Result<Self> {
        Ok(Self {
            strategy: TimingStrategy::select(device, backend, timer)?,
            markers: Vec::new(),
        })
    }

    pub fn reset(&mut self) {
        self.markers.clear();
    }

    /// Called at each step boundary.
    pub fn step_begin(&mut self) {
        self.markers.push(self.strategy.marker());
    }

    /// One final marker capturing the tail step's completion. Without it
    /// the last step's duration is not observable.
    pub fn finish(&mut self) {
        self.markers.push(self.strategy.marker());
    }

    /// One device-wide synchronize covers every pending marker: they are
    /// all ordered on one execution stream.
    pub fn get_latency(&self) -> Result<Latency> {
        self.strategy.synchronize();
        Ok(Latency::from_values(consecutive_deltas(
            &self.strategy,
            &self.markers,
        )?))
    }

    pub fn get_throughput(&self, volume: u64, unit: ThroughputUnit) -> Result<Throughput> {
        Ok(Throughput::from_latency(&self.get_latency()?, volume, unit))
    }
}

/// Records one marker per generated token. [`TokenLatencyRecorder::reset`]
/// records the origin marker immediately, so the first token's latency is
/// measured from the start of generation.
pub struct TokenLatencyRecorder {
    strategy: TimingStrategy,
    markers: Vec<Marker>,
}

impl TokenLatencyRecorder {
    pub fn new(
        device: Device,
        backend: Backend,
        timer: Option<Arc<dyn DeviceTimer>>,
    ) -> Result<Self> {
        let mut recorder = Self {
            strategy: TimingStrategy::select(device, backend, timer)?,
            markers: Vec::new(),
        };
        recorder.reset();
        Ok(recorder)
    }

    pub fn reset(&mut self) {
        self.markers.clear();
        self.markers.push(self.strategy.marker());
    }

    /// Called once per generated token.
    pub fn on_token(&mut self) {
        self.markers.push(self.strategy.marker());
    }

    pub fn get_latency(&self) -> Result<Latency> {
        self.strategy.synchronize();
        Ok(Latency::from_values(consecutive_deltas(
            &self.strategy,
            &self.markers,
        )?))
    }

    pub fn get_throughput(&self, volume: u64, unit: ThroughputUnit) -> Result<Throughput> {
        Ok(Throughput::from_latency(&self.get_latency()?, volume, unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use wattbench_core::WattBenchError;

    /// Scripted device timer: every recorded marker advances a virtual
    /// clock by a fixed step, and synchronization calls are counted.
    struct MockTimer {
        step_secs: f64,
        timestamps: Mutex<Vec<f64>>,
        marker_syncs: AtomicUsize,
        device_syncs: AtomicUsize,
    }

    impl MockTimer {
        fn new(step_secs: f64) -> Self {
            Self {
                step_secs,
                timestamps: Mutex::new(Vec::new()),
                marker_syncs: AtomicUsize::new(0),
                device_syncs: AtomicUsize::new(0),
            }
        }
    }

    impl DeviceTimer for MockTimer {
        fn record(&self) -> crate::timing::MarkerId {
            let mut timestamps = self.timestamps.lock().unwrap();
            let id = timestamps.len() as u64;
            timestamps.push(id as f64 * self.step_secs);
            id
        }

        fn synchronize_marker(&self, _marker: crate::timing::MarkerId) {
            self.marker_syncs.fetch_add(1, Ordering::SeqCst);
        }

        fn synchronize(&self) {
            self.device_syncs.fetch_add(1, Ordering::SeqCst);
        }

        fn elapsed_secs(&self, start: crate::timing::MarkerId, end: crate::timing::MarkerId) -> Result<f64> {
            let timestamps = self.timestamps.lock().unwrap();
            Ok(timestamps[end as usize] - timestamps[start as usize])
        }
    }

    fn device_tracker(timer: Arc<MockTimer>) -> LatencyTracker {
        LatencyTracker::new(Device::Cuda, Backend::Candle, Some(timer), None).unwrap()
    }

    #[test]
    fn host_clock_records_one_sample_per_region() {
        let mut tracker = LatencyTracker::new(Device::Cpu, Backend::Candle, None, None).unwrap();
        for _ in 0..3 {
            tracker
                .track(|| {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(())
                })
                .unwrap();
        }

        let latency = tracker.get_latency().unwrap();
        assert_eq!(latency.values.len(), 3);
        assert!(latency.values.iter().all(|v| *v >= 0.005));
    }

    #[test]
    fn failed_region_is_discarded() {
        let mut tracker = LatencyTracker::new(Device::Cpu, Backend::Candle, None, None).unwrap();
        tracker.track(|| Ok(())).unwrap();

        let result: Result<()> = tracker.track(|| {
            Err(WattBenchError::Workload("forward pass exploded".to_string()))
        });
        assert!(result.is_err());

        // the interrupted region must not appear in the sample set
        let latency = tracker.get_latency().unwrap();
        assert_eq!(latency.values.len(), 1);
    }

    #[test]
    fn reset_clears_samples_and_elapsed_origin() {
        let mut tracker = LatencyTracker::new(Device::Cpu, Backend::Candle, None, None).unwrap();
        tracker.track(|| Ok(())).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(tracker.get_elapsed_time() >= 0.005);

        tracker.reset();
        assert_eq!(tracker.get_latency().unwrap().values.len(), 0);
        assert!(tracker.get_elapsed_time() < 0.005);
    }

    #[test]
    fn samples_accumulate_across_phases_without_reset() {
        let mut tracker = LatencyTracker::new(Device::Cpu, Backend::Candle, None, None).unwrap();
        tracker.track(|| Ok(())).unwrap();
        tracker.track(|| Ok(())).unwrap();
        assert_eq!(tracker.get_latency().unwrap().values.len(), 2);
    }

    #[test]
    fn device_strategy_synchronizes_only_the_last_pair() {
        let timer = Arc::new(MockTimer::new(0.010));
        let mut tracker = device_tracker(Arc::clone(&timer));
        for _ in 0..4 {
            tracker.track(|| Ok(())).unwrap();
        }

        let latency = tracker.get_latency().unwrap();
        assert_eq!(latency.values.len(), 4);
        // markers alternate start/end, each one step apart
        assert!(latency.values.iter().all(|v| (*v - 0.010).abs() < 1e-12));
        // one synchronize for the last start, one for the last end
        assert_eq!(timer.marker_syncs.load(Ordering::SeqCst), 2);
        assert_eq!(timer.device_syncs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn throughput_uses_the_tracked_latency() {
        let timer = Arc::new(MockTimer::new(0.5));
        let mut tracker = device_tracker(Arc::clone(&timer));
        tracker.track(|| Ok(())).unwrap();

        let throughput = tracker
            .get_throughput(10, ThroughputUnit::SamplesPerSec)
            .unwrap();
        assert!((throughput.value - 20.0).abs() < 1e-9);
    }

    #[test]
    fn step_recorder_produces_n_minus_one_deltas() {
        let timer = Arc::new(MockTimer::new(0.020));
        let mut recorder =
            StepLatencyRecorder::new(
                Device::Cuda,
                Backend::Candle,
                Some(Arc::clone(&timer) as Arc<dyn DeviceTimer>),
            )
                .unwrap();

        for _ in 0..5 {
            recorder.step_begin();
        }
        recorder.finish();

        let latency = recorder.get_latency().unwrap();
        assert_eq!(latency.values.len(), 5);
        assert!(latency.values.iter().all(|v| (*v - 0.020).abs() < 1e-12));
        // a single device-wide synchronize covers all markers
        assert_eq!(timer.device_syncs.load(Ordering::SeqCst), 1);
        assert_eq!(timer.marker_syncs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn step_recorder_without_final_marker_misses_the_tail_step() {
        let timer = Arc::new(MockTimer::new(0.020));
        let mut recorder =
            StepLatencyRecorder::new(Device::Cuda, Backend::Candle, Some(timer)).unwrap();

        for _ in 0..5 {
            recorder.step_begin();
        }
        // no finish(): only 4 deltas are observable
        assert_eq!(recorder.get_latency().unwrap().values.len(), 4);
    }

    #[test]
    fn token_recorder_measures_from_generation_start() {
        let timer = Arc::new(MockTimer::new(0.015));
        let mut recorder =
            TokenLatencyRecorder::new(Device::Cuda, Backend::Candle, Some(timer)).unwrap();

        for _ in 0..3 {
            recorder.on_token();
        }

        // origin marker from reset + 3 token markers -> 3 deltas
        let latency = recorder.get_latency().unwrap();
        assert_eq!(latency.values.len(), 3);
    }

    #[test]
    fn host_step_recorder_works_without_device_timer() {
        let mut recorder = StepLatencyRecorder::new(Device::Cpu, Backend::Ort, None).unwrap();
        recorder.step_begin();
        std::thread::sleep(Duration::from_millis(5));
        recorder.step_begin();
        recorder.finish();

        let latency = recorder.get_latency().unwrap();
        assert_eq!(latency.values.len(), 2);
        assert!(latency.values[0] >= 0.005);
    }
}
