use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;
use wattbench_core::{Backend, Device, Result, WattBenchError};

/// Opaque handle to an event recorded on a device execution stream.
pub type MarkerId = u64;

/// Seam to the accelerator driver's event and synchronization primitives.
///
/// The driver itself is an external collaborator; this trait captures the
/// three things measurement needs from it: enqueueing a lightweight timing
/// event without stalling the host, blocking until queued work completes,
/// and reading the elapsed time between two recorded events.
pub trait DeviceTimer: Send + Sync {
    /// Enqueue a timing event on the execution stream. Must not block the
    /// host on previously queued work.
    fn record(&self) -> MarkerId;

    /// Block until the given event has been reached on the stream.
    fn synchronize_marker(&self, marker: MarkerId);

    /// Block until all previously queued device work completes.
    fn synchronize(&self);

    /// Elapsed seconds between two recorded events. Only meaningful once
    /// the later event has been synchronized.
    fn elapsed_secs(&self, start: MarkerId, end: MarkerId) -> Result<f64>;
}

/// A single recorded time point.
#[derive(Debug, Clone, Copy)]
pub enum Marker {
    Host(Instant),
    Device(MarkerId),
}

/// How scoped regions are timed. Selected once at tracker construction
/// from the device/backend pair; measurement calls never re-inspect
/// identifier strings.
#[derive(Clone)]
pub enum TimingStrategy {
    HostClock,
    DeviceEvent(Arc<dyn DeviceTimer>),
}

impl TimingStrategy {
    /// The asynchronous pair requires device events: recording a host
    /// timestamp there would either measure nothing (work still queued)
    /// or force a stall that skews the measurement.
    pub fn select(
        device: Device,
        backend: Backend,
        timer: Option<Arc<dyn DeviceTimer>>,
    ) -> Result<TimingStrategy> {
        if backend.is_asynchronous_on(device) {
            match timer {
                Some(timer) => {
                    debug!("Timing {backend} on {device} through device events");
                    Ok(TimingStrategy::DeviceEvent(timer))
                }
                None => Err(WattBenchError::Config(format!(
                    "backend {backend} on {device} executes asynchronously and requires a device timer"
                ))),
            }
        } else {
            debug!("Timing {backend} on {device} with the host clock");
            Ok(TimingStrategy::HostClock)
        }
    }

    pub fn marker(&self) -> Marker {
        match self {
            TimingStrategy::HostClock => Marker::Host(Instant::now()),
            TimingStrategy::DeviceEvent(timer) => Marker::Device(timer.record()),
        }
    }

    /// Wait until `marker` has actually been recorded on the stream.
    /// Host markers are immediate.
    pub fn synchronize_marker(&self, marker: &Marker) {
        if let (TimingStrategy::DeviceEvent(timer), Marker::Device(id)) = (self, marker) {
            timer.synchronize_marker(*id);
        }
    }

    /// Device-wide synchronize; no-op on the host clock.
    pub fn synchronize(&self) {
        if let TimingStrategy::DeviceEvent(timer) = self {
            timer.synchronize();
        }
    }

    pub fn elapsed_secs(&self, start: &Marker, end: &Marker) -> Result<f64> {
        match (self, start, end) {
            (TimingStrategy::HostClock, Marker::Host(start), Marker::Host(end)) => {
                Ok(end.duration_since(*start).as_secs_f64())
            }
            (TimingStrategy::DeviceEvent(timer), Marker::Device(start), Marker::Device(end)) => {
                timer.elapsed_secs(*start, *end)
            }
            _ => Err(WattBenchError::Config(
                "marker does not match the tracker's timing strategy".to_string(),
            )),
        }
    }
}

impl fmt::Debug for TimingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimingStrategy::HostClock => f.write_str("HostClock"),
            TimingStrategy::DeviceEvent(_) => f.write_str("DeviceEvent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_pairs_select_the_host_clock() {
        let strategy = TimingStrategy::select(Device::Cpu, Backend::Candle, None).unwrap();
        assert!(matches!(strategy, TimingStrategy::HostClock));
    }

    #[test]
    fn synchronous_cuda_backends_select_the_host_clock() {
        let strategy = TimingStrategy::select(Device::Cuda, Backend::Ort, None).unwrap();
        assert!(matches!(strategy, TimingStrategy::HostClock));
    }

    #[test]
    fn asynchronous_pair_without_timer_is_a_config_error() {
        assert!(TimingStrategy::select(Device::Cuda, Backend::Candle, None).is_err());
    }
}
