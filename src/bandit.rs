//! LinUCB contextual bandit
//!
//! Each arm keeps a ridge-regression model: `A` (d×d, starts at λ·I) and `b`
//! (d, starts at 0). Selection scores every arm with
//!
//! ```text
//! θ = A⁻¹·b        score = θ·x + α·sqrt(xᵗ·A⁻¹·x)
//! ```
//!
//! using a Cholesky solve instead of an explicit inverse. Every arm sits behind
//! its own lock: updates to one arm are serialized, scoring an arm never sees a
//! half-applied update, and arms never wait on each other.

use crate::config::BanditConfig;
use crate::error::ComputeError;
use crate::linalg::{dot, ensure_finite, rank_one_update, scaled_identity, Cholesky};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Sufficient statistics of one arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmState {
    /// Row-major d×d design matrix
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    /// Number of rewards observed
    pub pulls: u64,
}

impl ArmState {
    fn new(dimension: usize, lambda: f64) -> Self {
        Self {
            a: scaled_identity(dimension, lambda),
            b: vec![0.0; dimension],
            pulls: 0,
        }
    }

    fn score(&self, x: &[f64], alpha: f64) -> Result<(f64, f64), ComputeError> {
        let chol = Cholesky::factor(&self.a, x.len())?;
        let theta = chol.solve(&self.b)?;
        let confidence = chol.inverse_quadratic(x)?.sqrt();
        Ok((dot(&theta, x), confidence * alpha))
    }
}

/// Score breakdown for one arm
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArmScore {
    pub arm: usize,
    /// Upper confidence bound, `mean + bonus`
    pub score: f64,
    /// Predicted reward `θ·x`
    pub mean: f64,
    /// Exploration bonus `α·sqrt(xᵗA⁻¹x)`
    pub bonus: f64,
}

/// Serializable state of a whole bandit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditSnapshot {
    pub dimension: usize,
    pub lambda: f64,
    pub alpha: f64,
    pub arms: Vec<ArmState>,
}

/// Session-scoped LinUCB bandit
#[derive(Debug)]
pub struct LinUcbBandit {
    dimension: usize,
    lambda: f64,
    alpha: f64,
    arms: Vec<Mutex<ArmState>>,
}

impl LinUcbBandit {
    pub fn new(config: &BanditConfig, dimension: usize) -> Result<Self, ComputeError> {
        config.validate()?;
        if dimension == 0 {
            return Err(ComputeError::InvalidConfig(
                "context dimension must be at least 1".to_string(),
            ));
        }
        let arms = (0..config.arms)
            .map(|_| Mutex::new(ArmState::new(dimension, config.lambda)))
            .collect();
        Ok(Self {
            dimension,
            lambda: config.lambda,
            alpha: config.alpha,
            arms,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn arm_count(&self) -> usize {
        self.arms.len()
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Score a single arm for context `x`
    pub fn score(&self, arm: usize, x: &[f64]) -> Result<ArmScore, ComputeError> {
        self.check_context(x)?;
        let state = self.arms.get(arm).ok_or(ComputeError::UnknownArm(arm))?;
        let (mean, bonus) = state.lock().score(x, self.alpha)?;
        Ok(ArmScore {
            arm,
            score: mean + bonus,
            mean,
            bonus,
        })
    }

    /// Score every arm, in arm order
    pub fn scores(&self, x: &[f64]) -> Result<Vec<ArmScore>, ComputeError> {
        (0..self.arms.len()).map(|arm| self.score(arm, x)).collect()
    }

    /// Pick the arm with the highest upper confidence bound.
    ///
    /// Ties go to the lowest arm id.
    pub fn select(&self, x: &[f64]) -> Result<ArmScore, ComputeError> {
        let mut best: Option<ArmScore> = None;
        for candidate in self.scores(x)? {
            if !candidate.score.is_finite() {
                return Err(ComputeError::NumericalError(format!(
                    "arm {} produced a non-finite score",
                    candidate.arm
                )));
            }
            match best {
                Some(ref current) if candidate.score <= current.score => {}
                _ => best = Some(candidate),
            }
        }
        let best = best.ok_or_else(|| {
            ComputeError::InvalidConfig("the bandit needs at least one arm".to_string())
        })?;
        trace!(arm = best.arm, score = best.score, "Arm selected");
        Ok(best)
    }

    /// Apply one observation: `A ← A + x·xᵗ`, `b ← b + r·x`
    pub fn update(&self, arm: usize, x: &[f64], reward: f64) -> Result<(), ComputeError> {
        self.check_context(x)?;
        if !reward.is_finite() {
            return Err(ComputeError::InvalidContext(format!(
                "reward must be finite, got {reward}"
            )));
        }
        let state = self.arms.get(arm).ok_or(ComputeError::UnknownArm(arm))?;
        let mut state = state.lock();
        rank_one_update(&mut state.a, x);
        for (b, xi) in state.b.iter_mut().zip(x) {
            *b += reward * xi;
        }
        state.pulls += 1;
        debug!(arm, reward, pulls = state.pulls, "Arm updated");
        Ok(())
    }

    /// Copy of one arm's statistics
    pub fn arm(&self, arm: usize) -> Result<ArmState, ComputeError> {
        self.arms
            .get(arm)
            .map(|state| state.lock().clone())
            .ok_or(ComputeError::UnknownArm(arm))
    }

    pub fn snapshot(&self) -> BanditSnapshot {
        BanditSnapshot {
            dimension: self.dimension,
            lambda: self.lambda,
            alpha: self.alpha,
            arms: self.arms.iter().map(|arm| arm.lock().clone()).collect(),
        }
    }

    pub fn from_snapshot(snapshot: BanditSnapshot) -> Result<Self, ComputeError> {
        let config = BanditConfig {
            arms: snapshot.arms.len(),
            lambda: snapshot.lambda,
            alpha: snapshot.alpha,
            ..Default::default()
        };
        config.validate()?;
        let d = snapshot.dimension;
        for (i, arm) in snapshot.arms.iter().enumerate() {
            if arm.a.len() != d * d || arm.b.len() != d {
                return Err(ComputeError::InvalidConfig(format!(
                    "arm {i} does not match dimension {d}"
                )));
            }
            ensure_finite(&arm.a, "arm matrix")?;
            ensure_finite(&arm.b, "arm vector")?;
        }
        Ok(Self {
            dimension: d,
            lambda: snapshot.lambda,
            alpha: snapshot.alpha,
            arms: snapshot.arms.into_iter().map(Mutex::new).collect(),
        })
    }

    pub fn to_json(&self) -> Result<String, ComputeError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    pub fn from_json(json: &str) -> Result<Self, ComputeError> {
        Self::from_snapshot(serde_json::from_str(json)?)
    }

    fn check_context(&self, x: &[f64]) -> Result<(), ComputeError> {
        if x.len() != self.dimension {
            return Err(ComputeError::InvalidContext(format!(
                "context has {} values, bandit expects {}",
                x.len(),
                self.dimension
            )));
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(ComputeError::InvalidContext(
                "context contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn two_arms() -> LinUcbBandit {
        let config = BanditConfig {
            arms: 2,
            lambda: 1.0,
            alpha: 1.0,
            ..Default::default()
        };
        LinUcbBandit::new(&config, 2).unwrap()
    }

    #[test]
    fn test_tie_resolves_to_lowest_arm_then_score_rises() {
        let bandit = two_arms();
        let x = [1.0, 0.0];
        let first = bandit.select(&x).unwrap();
        assert_eq!(first.arm, 0);
        assert_eq!(first.score, 1.0);

        bandit.update(0, &x, 1.0).unwrap();
        let after = bandit.score(0, &x).unwrap();
        assert!(after.score > first.score);
        // θ = 0.5, bonus = sqrt(1/2)
        assert!((after.mean - 0.5).abs() < 1e-12);
        assert!((after.bonus - 0.5f64.sqrt()).abs() < 1e-12);
        assert_eq!(bandit.select(&x).unwrap().arm, 0);
    }

    #[test]
    fn test_confidence_strictly_decreases() {
        let bandit = two_arms();
        let x = [0.3, 0.8];
        let mut previous = bandit.score(1, &x).unwrap().bonus;
        for _ in 0..10 {
            bandit.update(1, &x, 0.0).unwrap();
            let bonus = bandit.score(1, &x).unwrap().bonus;
            assert!(bonus < previous, "{bonus} !< {previous}");
            previous = bonus;
        }
    }

    #[test]
    fn test_selection_is_deterministic() {
        let bandit = two_arms();
        bandit.update(1, &[0.2, 0.9], 0.7).unwrap();
        let x = [0.5, 0.5];
        let picks: Vec<usize> = (0..20).map(|_| bandit.select(&x).unwrap().arm).collect();
        assert!(picks.iter().all(|a| *a == picks[0]));
    }

    #[test]
    fn test_context_and_arm_checks() {
        let bandit = two_arms();
        assert!(matches!(
            bandit.select(&[1.0]),
            Err(ComputeError::InvalidContext(_))
        ));
        assert!(matches!(
            bandit.select(&[f64::NAN, 0.0]),
            Err(ComputeError::InvalidContext(_))
        ));
        assert!(matches!(
            bandit.update(5, &[1.0, 0.0], 1.0),
            Err(ComputeError::UnknownArm(5))
        ));
    }

    #[test]
    fn test_concurrent_updates_are_serialized() {
        let bandit = Arc::new(LinUcbBandit::new(&BanditConfig::default(), 3).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let bandit = Arc::clone(&bandit);
                thread::spawn(move || {
                    for _ in 0..100 {
                        bandit.update(t % 3, &[1.0, 0.5, 0.25], 1.0).unwrap();
                        bandit.select(&[0.1, 0.2, 0.3]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let pulls: u64 = (0..3).map(|a| bandit.arm(a).unwrap().pulls).sum();
        assert_eq!(pulls, 800);
        // arm 0 took threads 0, 3, 6
        let arm0 = bandit.arm(0).unwrap();
        assert_eq!(arm0.pulls, 300);
        assert_eq!(arm0.a[0], 301.0);
        assert_eq!(arm0.b[0], 300.0);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let bandit = two_arms();
        bandit.update(1, &[0.5, 0.25], 0.75).unwrap();
        let json = bandit.to_json().unwrap();
        let restored = LinUcbBandit::from_json(&json).unwrap();
        assert_eq!(restored.snapshot(), bandit.snapshot());
        let x = [0.5, 0.25];
        assert_eq!(restored.select(&x).unwrap(), bandit.select(&x).unwrap());
    }

    #[test]
    fn test_corrupt_snapshot_rejected() {
        let mut snapshot = two_arms().snapshot();
        snapshot.arms[0].b.push(1.0);
        assert!(LinUcbBandit::from_snapshot(snapshot).is_err());
    }
}
