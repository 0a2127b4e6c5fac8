//! Fixed-length window extraction from audio files.
//!
//! A window is `n_samples` long at the target rate. Files that are at least one
//! second longer than the window are read from a random offset; shorter files
//! are read from the start and zero-padded.

use crate::decode::{DecodeError, DecodedAudio, decode_file};

use rand::Rng;
use std::path::Path;

/// Where a window sits inside its source file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowPlan {
    /// First source frame to read.
    pub offset: u64,
    /// Source frames to read, `None` for the whole file.
    pub num_frames: Option<usize>,
    pub start_fraction: f64,
    pub end_fraction: f64,
}

/// A decoded window plus its position metadata.
#[derive(Debug, Clone)]
pub struct Window {
    /// Exactly `n_samples` frames at the target rate, single channel.
    pub audio: DecodedAudio,
    /// First sample of the window in the file, at the target rate.
    pub start_sample: usize,
    pub start_fraction: f64,
    pub end_fraction: f64,
    pub seconds_start: u64,
    pub seconds_total: u64,
}

/// Reads, resamples and pads/truncates windows of a fixed size.
#[derive(Debug, Clone)]
pub struct WindowReader {
    n_samples: usize,
    sample_rate: u32,
}

impl WindowReader {
    pub fn new(n_samples: usize, sample_rate: u32) -> Self {
        Self {
            n_samples,
            sample_rate,
        }
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Window length in seconds.
    pub fn target_seconds(&self) -> f64 {
        self.n_samples as f64 / self.sample_rate as f64
    }

    /// Decide which source frames to read for a file of `duration` seconds.
    pub fn plan<R: Rng + ?Sized>(
        &self,
        duration: f64,
        source_rate: u32,
        randomize: bool,
        rng: &mut R,
    ) -> WindowPlan {
        let target_secs = self.target_seconds();

        if duration < target_secs + 1.0 {
            return WindowPlan {
                offset: 0,
                num_frames: None,
                start_fraction: 0.0,
                end_fraction: (target_secs / duration).min(1.0),
            };
        }

        let total_frames = (duration * source_rate as f64) as u64;
        let window_frames = (target_secs * source_rate as f64) as u64;
        let max_offset = total_frames.saturating_sub(window_frames);

        let offset = if randomize && max_offset > 0 {
            rng.gen_range(0..max_offset)
        } else {
            0
        };

        let start_fraction = offset as f64 / source_rate as f64 / duration;
        WindowPlan {
            offset,
            num_frames: Some(window_frames as usize),
            start_fraction,
            end_fraction: start_fraction + target_secs / duration,
        }
    }

    /// Read one window from `path`.
    ///
    /// `duration` and `source_rate` describe the file (see
    /// [`crate::decode::probe_info`]). Errors are returned as-is; retrying is
    /// the caller's business.
    pub fn read<R: Rng + ?Sized>(
        &self,
        path: &Path,
        duration: f64,
        source_rate: u32,
        randomize: bool,
        rng: &mut R,
    ) -> Result<Window, DecodeError> {
        let plan = self.plan(duration, source_rate, randomize, rng);
        let decoded = decode_file(path, plan.offset, plan.num_frames)?;

        let channel = if decoded.channels > 1 {
            decoded.channel(rng.gen_range(0..decoded.channels))
        } else {
            decoded.samples
        };

        let mut audio = DecodedAudio::mono(channel, decoded.sample_rate);
        if audio.sample_rate != self.sample_rate {
            audio = audio.resample(self.sample_rate)?;
        }
        audio.samples = fix_length(audio.samples, self.n_samples);

        let start_sample =
            (plan.offset as f64 * self.sample_rate as f64 / source_rate as f64).round() as usize;

        Ok(Window {
            audio,
            start_sample,
            start_fraction: plan.start_fraction,
            end_fraction: plan.end_fraction,
            seconds_start: plan.offset / source_rate as u64,
            seconds_total: duration.floor() as u64,
        })
    }
}

/// Zero-pad on the right or keep the first `len` samples.
pub fn fix_length(mut samples: Vec<f32>, len: usize) -> Vec<f32> {
    samples.resize(len, 0.0);
    samples
}
