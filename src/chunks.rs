//! Chunked snapshot generation: cutting a solver trajectory into the
//! fixed-width pieces the reduction tree consumes.

use ndarray::{Array1, Array2};

use crate::error::{HapodError, Result};

/// Derived layout of a trajectory: how many time steps it has and how they
/// split into chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    num_time_steps: usize,
    num_chunks: usize,
    chunk_size: usize,
}

impl ChunkPlan {
    /// Derive the plan from the time grid. The initial values count as a
    /// step of their own, so a grid of n intervals yields n + 1 steps.
    pub fn new(t_end: f64, dt: f64, chunk_size: usize) -> Result<ChunkPlan> {
        if !t_end.is_finite() || t_end <= 0.0 {
            return Err(HapodError::config(format!(
                "end time must be finite and positive, got {t_end}"
            )));
        }
        if !dt.is_finite() || dt <= 0.0 {
            return Err(HapodError::config(format!(
                "time step must be finite and positive, got {dt}"
            )));
        }
        if chunk_size == 0 {
            return Err(HapodError::config("chunk size must be at least 1"));
        }

        let num_time_steps = (t_end / dt).ceil() as usize + 1;
        let num_chunks = (num_time_steps + chunk_size - 1) / chunk_size;
        if num_chunks < 2 {
            return Err(HapodError::config(format!(
                "time grid yields {num_chunks} chunk(s) of size {chunk_size}, \
                 but the reduction needs at least 2",
            )));
        }

        let last = num_time_steps - (num_chunks - 1) * chunk_size;
        debug_assert!(last >= 1 && last <= chunk_size);

        Ok(ChunkPlan {
            num_time_steps,
            num_chunks,
            chunk_size,
        })
    }

    pub fn num_time_steps(&self) -> usize {
        self.num_time_steps
    }

    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of time steps in chunk `index`. Every chunk is full except
    /// possibly the last.
    pub fn chunk_len(&self, index: usize) -> usize {
        debug_assert!(index < self.num_chunks);
        if index + 1 == self.num_chunks {
            self.num_time_steps - (self.num_chunks - 1) * self.chunk_size
        } else {
            self.chunk_size
        }
    }

    pub fn is_last(&self, index: usize) -> bool {
        index + 1 == self.num_chunks
    }
}

/// Produces one rank's share of the trajectory, one time step at a time.
///
/// A step yields one vector per slot, where slots are independent
/// decompositions running side by side over the same ranks.
pub trait SnapshotSource: Send {
    fn num_slots(&self) -> usize;

    /// Vectors for the initial time step. Consumed once, as the first step
    /// of the first chunk.
    fn initial_values(&mut self) -> Result<Vec<Array1<f64>>>;

    /// Vectors for the next time step.
    fn step(&mut self) -> Result<Vec<Array1<f64>>>;
}

/// One chunk of snapshots, one row matrix per slot.
#[derive(Clone, Debug)]
pub struct ChunkBatch {
    pub index: usize,
    pub is_last: bool,
    pub slots: Vec<Array2<f64>>,
}

/// Drives a [`SnapshotSource`] through the plan, assembling chunk matrices.
pub struct ChunkGenerator<S> {
    source: S,
    plan: ChunkPlan,
    next_chunk: usize,
}

impl<S: SnapshotSource> ChunkGenerator<S> {
    pub fn new(source: S, plan: ChunkPlan) -> ChunkGenerator<S> {
        ChunkGenerator {
            source,
            plan,
            next_chunk: 0,
        }
    }

    pub fn plan(&self) -> ChunkPlan {
        self.plan
    }

    pub fn chunk_index(&self) -> usize {
        self.next_chunk
    }

    pub fn is_done(&self) -> bool {
        self.next_chunk >= self.plan.num_chunks
    }

    /// Assemble the next chunk. The first chunk spends one of its steps on
    /// the initial values.
    pub fn next_batch(&mut self) -> Result<ChunkBatch> {
        if self.is_done() {
            return Err(HapodError::config("snapshot stream already exhausted"));
        }
        let index = self.next_chunk;
        let len = self.plan.chunk_len(index);
        let num_slots = self.source.num_slots();

        let mut steps: Vec<Vec<Array1<f64>>> = Vec::with_capacity(len);
        if index == 0 {
            let first = self.source.initial_values()?;
            check_width(&first, num_slots)?;
            steps.push(first);
        }
        while steps.len() < len {
            let step = self.source.step()?;
            check_width(&step, num_slots)?;
            steps.push(step);
        }

        let mut slots = Vec::with_capacity(num_slots);
        for slot in 0..num_slots {
            let dim = steps[0][slot].len();
            let mut mat = Array2::zeros((len, dim));
            for (row, step) in steps.iter().enumerate() {
                if step[slot].len() != dim {
                    return Err(HapodError::config(format!(
                        "slot {slot} changed dimension mid-chunk: {} vs {dim}",
                        step[slot].len(),
                    )));
                }
                mat.row_mut(row).assign(&step[slot]);
            }
            slots.push(mat);
        }

        self.next_chunk += 1;
        Ok(ChunkBatch {
            index,
            is_last: self.plan.is_last(index),
            slots,
        })
    }
}

fn check_width(step: &[Array1<f64>], num_slots: usize) -> Result<()> {
    if step.len() != num_slots {
        return Err(HapodError::config(format!(
            "snapshot source yielded {} slot vectors, expected {num_slots}",
            step.len(),
        )));
    }
    Ok(())
}
