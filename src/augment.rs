//! Batch-level waveform augmentation.
//!
//! In-batch noise augmentation overlays short bursts cut from the other items
//! of the same batch onto a target item, so no separate noise corpus is needed.

use rand::Rng;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum AugmentError {
    #[error("Unknown augmentation effect {0:?}")]
    Unknown(String),
    #[error("In-batch noise augmentation needs at least 2 items, got {0}")]
    BatchTooSmall(usize),
    #[error("Empty {name} range [{lo}, {hi})")]
    EmptyRange {
        name: &'static str,
        lo: usize,
        hi: usize,
    },
    #[error("Noise pool of {pool} samples is too short for bursts up to {needed}")]
    PoolTooShort { pool: usize, needed: usize },
    #[error("Target of {target} samples is too short for a burst of {needed}")]
    TargetTooShort { target: usize, needed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Augmentation {
    /// Reserved slot; leaves the audio untouched.
    ComposedV1,
    InBatchNoise,
}

impl FromStr for Augmentation {
    type Err = AugmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "composed_augmentation_v1" => Ok(Self::ComposedV1),
            "inbatch_noise_augment" => Ok(Self::InBatchNoise),
            other => Err(AugmentError::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for Augmentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ComposedV1 => f.write_str("composed_augmentation_v1"),
            Self::InBatchNoise => f.write_str("inbatch_noise_augment"),
        }
    }
}

/// One augmentation pass with its per-item trigger probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentationPass {
    pub effect: Augmentation,
    pub prob: f64,
}

/// Burst lengths and counts are half-open ranges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseParams {
    pub len_min: usize,
    pub len_max: usize,
    pub count_min: usize,
    pub count_max: usize,
    pub volume: f32,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            len_min: 8000,
            len_max: 24000,
            count_min: 1,
            count_max: 3,
            volume: 1.0,
        }
    }
}

impl NoiseParams {
    pub fn validate(&self) -> Result<(), AugmentError> {
        if self.len_min >= self.len_max || self.len_min == 0 {
            return Err(AugmentError::EmptyRange {
                name: "noise length",
                lo: self.len_min,
                hi: self.len_max,
            });
        }
        if self.count_min >= self.count_max {
            return Err(AugmentError::EmptyRange {
                name: "noise count",
                lo: self.count_min,
                hi: self.count_max,
            });
        }
        Ok(())
    }
}

/// Add noise bursts taken from `batch` (every item except `target_idx`) onto
/// `target`. Energy is not renormalized.
pub fn inbatch_noise_augment<R: Rng + ?Sized>(
    target: &[f32],
    target_idx: usize,
    batch: &[Vec<f32>],
    params: &NoiseParams,
    rng: &mut R,
) -> Result<Vec<f32>, AugmentError> {
    if batch.len() < 2 {
        return Err(AugmentError::BatchTooSmall(batch.len()));
    }
    params.validate()?;

    let noise_pool: Vec<f32> = batch
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != target_idx)
        .flat_map(|(_, audio)| audio.iter().copied())
        .collect();

    if noise_pool.len() <= params.len_max {
        return Err(AugmentError::PoolTooShort {
            pool: noise_pool.len(),
            needed: params.len_max,
        });
    }

    let mut augmented = target.to_vec();
    let n_noise = rng.gen_range(params.count_min..params.count_max);

    for _ in 0..n_noise {
        let start = rng.gen_range(0..noise_pool.len() - params.len_max);
        let duration = rng.gen_range(params.len_min..params.len_max);
        if target.len() <= duration {
            return Err(AugmentError::TargetTooShort {
                target: target.len(),
                needed: duration,
            });
        }
        let position = rng.gen_range(0..target.len() - duration);

        for (dst, &noise) in augmented[position..position + duration]
            .iter_mut()
            .zip(&noise_pool[start..start + duration])
        {
            *dst += params.volume * noise;
        }
    }

    Ok(augmented)
}
