use crate::error::Result;

/// Seam between measurement code and the distributed runtime.
///
/// Trackers take an optional `Arc<dyn Collective>` instead of consulting
/// process-global state; the launcher's process group implements it over
/// a TCP rendezvous. Barriers establish a happens-before relationship at
/// scoped-region boundaries only; recorded durations on each rank stay
/// independent.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Block until every rank has arrived.
    fn barrier(&self) -> Result<()>;
}
