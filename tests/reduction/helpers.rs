use hapod::{HapodError, ProcessGrid, Result, SnapshotSource};
use ndarray::{Array1, Array2};
use std::sync::Arc;
use std::time::Duration;

/// Helper: run one rank task per grid endpoint concurrently and collect the
/// outputs in world-rank order.
pub async fn run_on_grid<F, Fut, T>(num_nodes: u32, procs_per_node: u32, f: F) -> Vec<T>
where
    F: Fn(ProcessGrid) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let grids = ProcessGrid::bootstrap_local(num_nodes, procs_per_node, Duration::from_secs(30))
        .unwrap();

    let f = Arc::new(f);
    let mut handles = Vec::new();
    for grid in grids {
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move { f(grid).await }));
    }

    let mut out = Vec::with_capacity(handles.len());
    for h in handles {
        out.push(h.await.unwrap());
    }
    out
}

/// Deterministic source: step k yields `damping^k` times the k-th unit
/// vector, identically on every rank and in every slot.
pub struct UnitSource {
    slots: usize,
    dim: usize,
    damping: f64,
    next: usize,
}

impl UnitSource {
    pub fn new(slots: usize, dim: usize) -> UnitSource {
        UnitSource::damped(slots, dim, 1.0)
    }

    pub fn damped(slots: usize, dim: usize, damping: f64) -> UnitSource {
        UnitSource {
            slots,
            dim,
            damping,
            next: 0,
        }
    }
}

impl SnapshotSource for UnitSource {
    fn num_slots(&self) -> usize {
        self.slots
    }

    fn initial_values(&mut self) -> Result<Vec<Array1<f64>>> {
        self.step()
    }

    fn step(&mut self) -> Result<Vec<Array1<f64>>> {
        let k = self.next;
        self.next += 1;
        let scale = self.damping.powi(k as i32);
        Ok((0..self.slots)
            .map(|_| {
                let mut v = Array1::zeros(self.dim);
                v[k % self.dim] = scale;
                v
            })
            .collect())
    }
}

/// Replays a prebuilt matrix as a single-slot trajectory, one row per step.
pub struct MatrixSource {
    rows: Array2<f64>,
    next: usize,
}

impl MatrixSource {
    pub fn new(rows: Array2<f64>) -> MatrixSource {
        MatrixSource { rows, next: 0 }
    }
}

impl SnapshotSource for MatrixSource {
    fn num_slots(&self) -> usize {
        1
    }

    fn initial_values(&mut self) -> Result<Vec<Array1<f64>>> {
        self.step()
    }

    fn step(&mut self) -> Result<Vec<Array1<f64>>> {
        if self.next >= self.rows.nrows() {
            return Err(HapodError::config("matrix source ran out of rows"));
        }
        let row = self.rows.row(self.next).to_owned();
        self.next += 1;
        Ok(vec![row])
    }
}
