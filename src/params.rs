//! Per-slot reduction parameters and the per-level tolerance schedule.

use crate::error::{HapodError, Result};

/// Immutable per-slot parameters of one hierarchical reduction.
///
/// `tree_depth` counts every binary-merge level from a rank's first local
/// POD (level 0) to the single global root (level `tree_depth - 1`). The
/// per-level truncation bounds are fixed at construction: geometric weights
/// `omega^i`, normalized so the bounds compose to exactly `epsilon_ast`
/// under the orthogonal sum-of-squares rule. `omega = 1` degenerates to a
/// uniform split; `omega < 1` front-loads tolerance onto the cheap early
/// levels and tightens strictly toward the root.
#[derive(Debug, Clone)]
pub struct HapodParameters {
    tree_depth: usize,
    epsilon_ast: f64,
    omega: f64,
    level_bounds: Vec<f64>,
}

impl HapodParameters {
    pub fn new(tree_depth: usize, epsilon_ast: f64, omega: f64) -> Result<Self> {
        if tree_depth < 2 {
            return Err(HapodError::config(format!(
                "tree depth {tree_depth} is not a hierarchy, need at least 2 merge levels"
            )));
        }
        if !epsilon_ast.is_finite() || epsilon_ast <= 0.0 {
            return Err(HapodError::config(format!(
                "epsilon_ast must be positive and finite, got {epsilon_ast}"
            )));
        }
        if !(omega > 0.0 && omega <= 1.0) {
            return Err(HapodError::config(format!(
                "omega must lie in (0, 1], got {omega}"
            )));
        }

        let weights: Vec<f64> = (0..tree_depth).map(|i| omega.powi(i as i32)).collect();
        let norm = weights.iter().map(|w| w * w).sum::<f64>().sqrt();
        let level_bounds = weights.iter().map(|w| epsilon_ast * w / norm).collect();

        Ok(Self {
            tree_depth,
            epsilon_ast,
            omega,
            level_bounds,
        })
    }

    pub fn tree_depth(&self) -> usize {
        self.tree_depth
    }

    pub fn epsilon_ast(&self) -> f64 {
        self.epsilon_ast
    }

    pub fn omega(&self) -> f64 {
        self.omega
    }

    /// Mean-error truncation bound for merge level `level` (0 = leaf POD,
    /// `tree_depth - 1` = final root merge).
    pub fn level_bound(&self, level: usize) -> f64 {
        self.level_bounds[level]
    }

    pub fn level_bounds(&self) -> &[f64] {
        &self.level_bounds
    }

    /// l2 truncation budget for one local POD at `level` whose vertex covers
    /// `num_snaps` leaf snapshots: the mean-error bound times sqrt(count).
    pub fn local_bound(&self, level: usize, num_snaps: usize) -> f64 {
        self.level_bound(level) * (num_snaps as f64).sqrt()
    }
}
