//! Per-slot running state and the report a finished reduction hands back.

use std::fmt;
use std::time::Duration;

use crate::comm::StatsPacket;
use crate::params::HapodParameters;
use crate::pod::Basis;
use crate::types::SlotId;

/// One rank's running state for a slot. Only vertices that merge carry a
/// basis; everyone tracks the sizes flowing through their POD calls.
pub(crate) struct SlotState {
    pub slot: SlotId,
    pub params: HapodParameters,
    pub basis: Basis,
    /// Snapshots accumulated under this vertex along the root path.
    pub total_num_snapshots: usize,
    /// Raw snapshots this rank itself fed into the tree.
    pub contributed_snapshots: usize,
    pub max_local_modes: usize,
    pub max_vectors_before_pod: usize,
    pub pod_time: Duration,
}

impl SlotState {
    pub fn new(slot: SlotId, params: HapodParameters, dim: usize) -> SlotState {
        SlotState {
            slot,
            params,
            basis: Basis::empty(dim),
            total_num_snapshots: 0,
            contributed_snapshots: 0,
            max_local_modes: 0,
            max_vectors_before_pod: 0,
            pod_time: Duration::ZERO,
        }
    }

    pub fn observe_input(&mut self, num_vectors: usize) {
        self.max_vectors_before_pod = self.max_vectors_before_pod.max(num_vectors);
    }

    pub fn observe_modes(&mut self, num_modes: usize) {
        self.max_local_modes = self.max_local_modes.max(num_modes);
    }

    pub fn stats_packet(&self) -> StatsPacket {
        StatsPacket {
            contributed_snapshots: self.contributed_snapshots,
            num_modes: self.basis.len(),
            max_vectors_before_pod: self.max_vectors_before_pod,
            max_local_modes: self.max_local_modes,
            pod_seconds: self.pod_time.as_secs_f64(),
        }
    }
}

/// Diagnostics for one finished slot, aggregated over the whole world.
#[derive(Clone, Debug)]
pub struct HapodStats {
    pub total_num_snapshots: usize,
    pub num_modes: usize,
    pub max_vectors_before_pod: usize,
    pub max_local_modes: usize,
    pub max_pod_seconds: f64,
    pub world_size: u32,
}

impl fmt::Display for HapodStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} final modes taken from a total of {} snapshots",
            self.num_modes, self.total_num_snapshots,
        )?;
        writeln!(f, "maximal number of local modes: {}", self.max_local_modes)?;
        writeln!(
            f,
            "maximal number of input vectors to a local POD: {}",
            self.max_vectors_before_pod,
        )?;
        write!(
            f,
            "maximal time spent in POD calls: {:.3}s across {} ranks",
            self.max_pod_seconds, self.world_size,
        )
    }
}

/// What one rank walks away with for a slot: the final basis on the vertex
/// that finished the tree, the snapshot total it saw, and world-aggregated
/// stats on world rank 0.
#[derive(Debug)]
pub struct SlotOutcome {
    pub slot: SlotId,
    pub basis: Option<Basis>,
    pub total_num_snapshots: usize,
    pub stats: Option<HapodStats>,
}

/// Outcomes for every slot a rank processed, in slot order.
#[derive(Debug)]
pub struct HapodReport {
    pub slots: Vec<SlotOutcome>,
}

impl HapodReport {
    pub fn slot(&self, slot: SlotId) -> Option<&SlotOutcome> {
        self.slots.iter().find(|s| s.slot == slot)
    }
}

/// Fold gathered per-rank packets into the world-level stats. Snapshot
/// contributions add up; everything else reports the worst rank.
pub(crate) fn aggregate_stats(packets: &[StatsPacket], world_size: u32) -> HapodStats {
    let mut stats = HapodStats {
        total_num_snapshots: 0,
        num_modes: 0,
        max_vectors_before_pod: 0,
        max_local_modes: 0,
        max_pod_seconds: 0.0,
        world_size,
    };
    for p in packets {
        stats.total_num_snapshots += p.contributed_snapshots;
        stats.num_modes = stats.num_modes.max(p.num_modes);
        stats.max_vectors_before_pod = stats.max_vectors_before_pod.max(p.max_vectors_before_pod);
        stats.max_local_modes = stats.max_local_modes.max(p.max_local_modes);
        stats.max_pod_seconds = stats.max_pod_seconds.max(p.pod_seconds);
    }
    stats
}
