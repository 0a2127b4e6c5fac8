//! Dataset configuration.
//!
//! Field names and defaults follow the MERT pretraining task options so
//! existing JSON task configs load unchanged.

use crate::augment::{AugmentError, Augmentation, AugmentationPass, NoiseParams};
use crate::labels::LabelKind;
use crate::manifest::KeepBounds;
use crate::spectral::SpectralConfig;

use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{effects} augmentation effects but {probs} probabilities")]
    AugmentationArity { effects: usize, probs: usize },
    #[error("Augmentation error: {0}")]
    Augment(#[from] AugmentError),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// One pre-computed label track.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LabelConfig {
    pub path: PathBuf,
    /// Labels per second; negative for one sequence per item.
    #[serde(default = "default_label_rate")]
    pub rate: f64,
    #[serde(default)]
    pub pad: i64,
    /// Memory-map `<path>.npy` instead of reading a text file.
    #[serde(default)]
    pub memmap: bool,
}

fn default_label_rate() -> f64 {
    -1.0
}

impl LabelConfig {
    pub fn kind(&self) -> LabelKind {
        LabelKind::from_rate(self.rate)
    }

    /// File actually read for this track.
    pub fn resolved_path(&self) -> PathBuf {
        if self.memmap {
            let mut path = self.path.clone().into_os_string();
            path.push(".npy");
            PathBuf::from(path)
        } else {
            self.path.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub manifest_path: PathBuf,
    pub sample_rate: u32,
    /// Window length every item is read at.
    pub clip_secs: f32,
    pub labels: Vec<LabelConfig>,
    pub max_keep_sample_size: Option<usize>,
    pub min_keep_sample_size: Option<usize>,
    /// Upper bound on the collated length of a batch.
    pub max_sample_size: Option<usize>,
    pub shuffle: bool,
    /// Pad to the longest item instead of cropping to the shortest.
    pub pad_audio: bool,
    /// Per-item zero-mean unit-variance normalization.
    pub normalize: bool,
    /// Crop at a random offset instead of the start.
    pub random_crop: bool,
    /// Pick the read window at a random offset in long files.
    pub random_window: bool,
    pub single_target: bool,
    pub augmentation_effects: Vec<String>,
    pub augmentation_probs: Vec<f64>,
    pub inbatch_noise_augment_len_range: [usize; 2],
    pub inbatch_noise_augment_number_range: [usize; 2],
    pub inbatch_noise_augment_volume: f32,
    /// Spectral target bins; disabled when not positive.
    pub cqt_prediction_bin: i64,
    /// Re-selections after a failed read before giving up.
    pub max_retries: usize,
    /// Allowed label/audio duration disagreement in seconds.
    pub label_length_tolerance: f64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::new(),
            sample_rate: 16000,
            clip_secs: 5.0,
            labels: Vec::new(),
            max_keep_sample_size: None,
            min_keep_sample_size: None,
            max_sample_size: None,
            shuffle: true,
            pad_audio: false,
            normalize: false,
            random_crop: false,
            random_window: true,
            single_target: false,
            augmentation_effects: Vec::new(),
            augmentation_probs: Vec::new(),
            inbatch_noise_augment_len_range: [8000, 24000],
            inbatch_noise_augment_number_range: [1, 3],
            inbatch_noise_augment_volume: 1.0,
            cqt_prediction_bin: -1,
            max_retries: 100,
            label_length_tolerance: 0.1,
        }
    }
}

impl DatasetConfig {
    pub fn new<P: Into<PathBuf>>(manifest_path: P) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that can be checked before touching data.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(invalid("sample_rate", "must be positive"));
        }
        if !(self.clip_secs > 0.0) {
            return Err(invalid("clip_secs", format!("{} is not positive", self.clip_secs)));
        }
        if let (Some(min), Some(max)) = (self.min_keep_sample_size, self.max_keep_sample_size) {
            if min > max {
                return Err(invalid(
                    "min_keep_sample_size",
                    format!("{min} exceeds max_keep_sample_size {max}"),
                ));
            }
        }
        if self.max_sample_size == Some(0) {
            return Err(invalid("max_sample_size", "must be positive"));
        }
        for prob in &self.augmentation_probs {
            if !(0.0..=1.0).contains(prob) {
                return Err(invalid("augmentation_probs", format!("{prob} is not in [0, 1]")));
            }
        }
        let passes = self.augmentation_passes()?;
        if passes.iter().any(|p| p.effect == Augmentation::InBatchNoise) {
            self.noise_params().validate()?;
        }
        Ok(())
    }

    pub fn clip_samples(&self) -> usize {
        (self.clip_secs * self.sample_rate as f32) as usize
    }

    pub fn keep_bounds(&self) -> KeepBounds {
        KeepBounds {
            min_keep: self.min_keep_sample_size,
            max_keep: self.max_keep_sample_size,
        }
    }

    pub fn max_sample_size(&self) -> usize {
        self.max_sample_size.unwrap_or(usize::MAX)
    }

    /// Parsed augmentation passes; unknown effect names are an error.
    pub fn augmentation_passes(&self) -> Result<Vec<AugmentationPass>, ConfigError> {
        if self.augmentation_effects.len() != self.augmentation_probs.len() {
            return Err(ConfigError::AugmentationArity {
                effects: self.augmentation_effects.len(),
                probs: self.augmentation_probs.len(),
            });
        }
        self.augmentation_effects
            .iter()
            .zip(&self.augmentation_probs)
            .map(|(effect, &prob)| -> Result<AugmentationPass, ConfigError> {
                Ok(AugmentationPass {
                    effect: effect.parse()?,
                    prob,
                })
            })
            .collect()
    }

    pub fn noise_params(&self) -> NoiseParams {
        let [len_min, len_max] = self.inbatch_noise_augment_len_range;
        let [count_min, count_max] = self.inbatch_noise_augment_number_range;
        NoiseParams {
            len_min,
            len_max,
            count_min,
            count_max,
            volume: self.inbatch_noise_augment_volume,
        }
    }

    /// Spectral target settings, when enabled.
    pub fn spectral(&self) -> Option<SpectralConfig> {
        (self.cqt_prediction_bin > 0)
            .then(|| SpectralConfig::with_bins(self.sample_rate, self.cqt_prediction_bin as usize))
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.into(),
    }
}
