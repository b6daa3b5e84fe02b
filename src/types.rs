//! Common type definitions shared across the crate.

/// Rank of a process within a communicator.
pub type Rank = u32;

/// Index of one independently reduced data stream.
pub type SlotId = usize;
