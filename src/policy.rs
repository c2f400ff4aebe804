//! Tunable sync policy constants.
//!
//! The grace window and retry ceiling are operational heuristics carried
//! over from the production deployment; they are plain configuration here
//! so a site can adjust them without a rebuild.

use std::time::Duration;

/// Policy knobs shared by the sync engine, the reconciler, and the
/// connectivity monitor.
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    /// Maximum queue entries drained per cycle.
    pub batch_size: usize,
    /// Retries before a structurally-rejected queue entry is dropped.
    pub retry_ceiling: i64,
    /// How much newer a remote order must be before it beats an unsynced
    /// local copy on timestamp alone.
    pub remote_grace: Duration,
    /// Periodic drain trigger interval.
    pub drain_interval: Duration,
    /// Interval between connectivity health probes.
    pub probe_interval: Duration,
    /// Timeout for the lightweight health probe.
    pub probe_timeout: Duration,
    /// Timeout for regular remote calls.
    pub request_timeout: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            batch_size: 50,
            retry_ceiling: 5,
            remote_grace: Duration::from_secs(5 * 60),
            drain_interval: Duration::from_secs(30),
            probe_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}
