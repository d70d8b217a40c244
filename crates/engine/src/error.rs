use serde::{Deserialize, Serialize};
use std::fmt;

use crate::timeline::{ticks_to_secs, TierAttemptResult};

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Realized duration fell outside the tolerance band, or reaching the band
/// would have required mangling a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToleranceViolation {
    pub target_ticks: i64,
    pub actual_ticks: i64,
    pub tolerance_ticks: i64,
    pub reason: String,
}

impl fmt::Display for ToleranceViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3}s vs target {:.3}s (±{:.3}s): {}",
            ticks_to_secs(self.actual_ticks),
            ticks_to_secs(self.target_ticks),
            ticks_to_secs(self.tolerance_ticks),
            self.reason
        )
    }
}

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid duration: {requested:.3}s is outside the {platform} bounds [{min:.3}s, {max:.3}s]")]
    InvalidDuration {
        platform: String,
        requested: f64,
        min: f64,
        max: f64,
    },

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The terminal tier failed; a correctly configured system never gets here.
    #[error("fallback exhausted for clip {sequence_index}: {reason}")]
    FallbackExhausted { sequence_index: usize, reason: String },

    #[error("duration out of tolerance: {0}")]
    DurationOutOfTolerance(ToleranceViolation),

    #[error("assembly error: {reason}")]
    Assembly {
        reason: String,
        attempts: Vec<TierAttemptResult>,
    },

    #[error("speech synthesis error: {0}")]
    Synthesis(String),

    #[error("cancelled during {0}")]
    Cancelled(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn invalid_parameters(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    pub fn assembly(reason: impl Into<String>, attempts: Vec<TierAttemptResult>) -> Self {
        Self::Assembly {
            reason: reason.into(),
            attempts,
        }
    }

    pub fn synthesis(msg: impl Into<String>) -> Self {
        Self::Synthesis(msg.into())
    }

    pub fn cancelled(stage: impl Into<String>) -> Self {
        Self::Cancelled(stage.into())
    }

    /// Stable identifier for persistence and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidDuration { .. } => "invalid_duration",
            Self::InvalidParameters(_) => "invalid_parameters",
            Self::FallbackExhausted { .. } => "fallback_exhausted",
            Self::DurationOutOfTolerance(_) => "duration_out_of_tolerance",
            Self::Assembly { .. } => "assembly_error",
            Self::Synthesis(_) => "synthesis_error",
            Self::Cancelled(_) => "cancelled",
            Self::Other(_) => "internal",
        }
    }

    /// Rejections raised before any external call is made.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::InvalidDuration { .. } | Self::InvalidParameters(_))
    }
}
