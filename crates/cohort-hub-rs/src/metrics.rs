use serde::Serialize;

/// Counters owned by the hub actor. Gauges are filled in at report time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubMetrics {
    pub connections: u64,
    pub registrations: u64,
    pub disconnects: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub frame_errors: u64,
    pub dropped_clients: u64,
    pub locks_granted: u64,
    pub locks_renewed: u64,
    pub locks_denied: u64,
    pub locks_released: u64,
    pub locks_expired: u64,
    pub stale_agents: u64,
    pub file_events: u64,
    pub duplicate_changes: u64,
    pub out_of_band_writes: u64,
    pub merges_clean: u64,
    pub merges_conflicted: u64,
    pub merges_applied: u64,
    pub workflow_rejections: u64,
    pub snapshots_written: u64,
    pub snapshot_errors: u64,
}

impl HubMetrics {
    /// Returns the current counters and zeroes them.
    pub fn take(&mut self) -> HubMetrics {
        std::mem::take(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub agents: usize,
    pub locks: usize,
    pub recent_changes: usize,
    pub cached_parses: usize,
    pub counters: HubMetrics,
}
