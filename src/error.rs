use crate::types::Rank;

pub type Result<T> = std::result::Result<T, HapodError>;

#[derive(Debug, thiserror::Error)]
pub enum HapodError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("{operation} saw inconsistent payloads at rank {rank}: {reason}")]
    CollectiveMismatch {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("{operation} failed at rank {rank}: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("basis orthonormality defect {defect:.3e} exceeds tolerance {tolerance:.3e}")]
    Degenerate { defect: f64, tolerance: f64 },
}

impl HapodError {
    /// Create a `Configuration` error from any message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_display() {
        let e = HapodError::config("omega must lie in (0, 1], got 1.5");
        assert_eq!(
            e.to_string(),
            "invalid configuration: omega must lie in (0, 1], got 1.5"
        );
    }

    #[test]
    fn test_collective_failed_display() {
        let e = HapodError::CollectiveFailed {
            operation: "gather_basis",
            rank: 3,
            reason: "peer channel closed".into(),
        };
        assert_eq!(
            e.to_string(),
            "gather_basis failed at rank 3: peer channel closed"
        );
    }

    #[test]
    fn test_all_variants_display() {
        // Ensure all variants produce non-empty display strings
        let errors: Vec<HapodError> = vec![
            HapodError::config("x"),
            HapodError::CollectiveMismatch {
                operation: "gather_basis",
                rank: 0,
                reason: "x".into(),
            },
            HapodError::CollectiveFailed {
                operation: "barrier",
                rank: 1,
                reason: "x".into(),
            },
            HapodError::Degenerate {
                defect: 1e-3,
                tolerance: 1e-10,
            },
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
