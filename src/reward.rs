//! Mapping from error-signal probability to bandit reward

use crate::error::ComputeError;
use serde::{Deserialize, Serialize};

/// Converts an error probability into a reward in [0, 1].
///
/// A high error probability means the user perceived the last decision as
/// wrong, so every mapping is non-increasing in the probability.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RewardMapping {
    /// `1 - p`
    #[default]
    Complement,
    /// 1 when `p < threshold`, otherwise 0
    Threshold { threshold: f64 },
    /// `offset - scale * p`, clamped to [0, 1]
    Linear { scale: f64, offset: f64 },
}

impl RewardMapping {
    pub fn reward(&self, probability: f64) -> f64 {
        let p = probability.clamp(0.0, 1.0);
        match *self {
            RewardMapping::Complement => 1.0 - p,
            RewardMapping::Threshold { threshold } => {
                if p < threshold {
                    1.0
                } else {
                    0.0
                }
            }
            RewardMapping::Linear { scale, offset } => (offset - scale * p).clamp(0.0, 1.0),
        }
    }

    pub fn validate(&self) -> Result<(), ComputeError> {
        match *self {
            RewardMapping::Complement => Ok(()),
            RewardMapping::Threshold { threshold } if (0.0..=1.0).contains(&threshold) => Ok(()),
            RewardMapping::Threshold { threshold } => Err(ComputeError::InvalidConfig(format!(
                "reward threshold {threshold} must lie in [0, 1]"
            ))),
            RewardMapping::Linear { scale, offset }
                if scale.is_finite() && scale >= 0.0 && offset.is_finite() =>
            {
                Ok(())
            }
            RewardMapping::Linear { .. } => Err(ComputeError::InvalidConfig(
                "linear reward needs a finite, non-negative scale and a finite offset".to_string(),
            )),
        }
    }
}
