//! Runtime-configurable tuning parameters for a reduction run.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `HAPOD_`) or by constructing a custom `HapodConfig`.

use std::time::Duration;

/// What to do when a local POD cannot meet the requested orthonormality
/// tolerance even after re-orthonormalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegeneracyPolicy {
    /// Log a warning and accept the best-effort basis.
    Warn,
    /// Abort the run.
    Fail,
}

/// Tuning parameters shared by every slot of a reduction run.
#[derive(Debug, Clone)]
pub struct HapodConfig {
    /// Tolerance decay factor across tree levels, in `(0, 1]`. Slots may
    /// override it individually.
    pub omega: f64,

    /// Orthonormality tolerance for every merge except the final one.
    /// Infinite by default, which skips the check entirely.
    pub orth_tol: f64,

    /// Orthonormality tolerance for the final merge at the tree root.
    pub final_orth_tol: f64,

    /// Reuse the prior basis block of the Gramian when merging, instead of
    /// recomputing inner products already known from the previous merge.
    pub incremental_gramian: bool,

    /// Policy for tolerances the POD cannot meet.
    pub degeneracy: DegeneracyPolicy,

    /// Timeout for individual receive operations within collectives. A
    /// stalled collective is fatal to the whole run.
    pub collective_timeout: Duration,
}

impl Default for HapodConfig {
    fn default() -> Self {
        Self {
            omega: 0.95,
            orth_tol: f64::INFINITY,
            final_orth_tol: 1e-10,
            incremental_gramian: false,
            degeneracy: DegeneracyPolicy::Warn,
            collective_timeout: Duration::from_secs(60),
        }
    }
}

impl HapodConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `HAPOD_OMEGA`
    /// - `HAPOD_ORTH_TOL`
    /// - `HAPOD_FINAL_ORTH_TOL`
    /// - `HAPOD_INCREMENTAL_GRAMIAN`
    /// - `HAPOD_DEGENERACY` (`warn` or `fail`)
    /// - `HAPOD_COLLECTIVE_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("HAPOD_OMEGA") {
            if let Ok(x) = v.parse::<f64>() {
                cfg.omega = x;
            }
        }
        if let Ok(v) = std::env::var("HAPOD_ORTH_TOL") {
            if let Ok(x) = v.parse::<f64>() {
                cfg.orth_tol = x;
            }
        }
        if let Ok(v) = std::env::var("HAPOD_FINAL_ORTH_TOL") {
            if let Ok(x) = v.parse::<f64>() {
                cfg.final_orth_tol = x;
            }
        }
        if let Ok(v) = std::env::var("HAPOD_INCREMENTAL_GRAMIAN") {
            if let Ok(b) = v.parse::<bool>() {
                cfg.incremental_gramian = b;
            }
        }
        if let Ok(v) = std::env::var("HAPOD_DEGENERACY") {
            match v.to_ascii_lowercase().as_str() {
                "warn" => cfg.degeneracy = DegeneracyPolicy::Warn,
                "fail" => cfg.degeneracy = DegeneracyPolicy::Fail,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("HAPOD_COLLECTIVE_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.collective_timeout = Duration::from_secs(s);
            }
        }

        cfg
    }
}
