pub mod chunks;
pub mod comm;
pub mod config;
pub mod error;
mod linalg;
pub mod params;
pub mod pod;
pub mod reduction;
pub mod results;
pub mod types;

pub use chunks::{ChunkBatch, ChunkGenerator, ChunkPlan, SnapshotSource};
pub use comm::grid::ProcessGrid;
pub use comm::{BasisPacket, GroupComm, Phase, StatsPacket, Tag};
pub use config::{DegeneracyPolicy, HapodConfig};
pub use error::{HapodError, Result};
pub use params::HapodParameters;
pub use pod::{local_pod, Basis, PodInput, PodOptions, Product};
pub use reduction::{binary_tree_hapod, broadcast_modes, SlotSpec};
pub use results::{HapodReport, HapodStats, SlotOutcome};
pub use types::{Rank, SlotId};
