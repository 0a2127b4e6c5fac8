//! On-the-fly spectral training targets: STFT magnitude -> log-frequency bins.
//!
//! Bins are spaced geometrically from `f_min` with `bins_per_octave` bins per
//! octave (constant-Q layout), one frame every `sample_rate / frame_rate`
//! samples, frames centred with zero padding.
//!
//! A single FFT size serves every bin, so it is chosen large enough to separate
//! the two lowest bins (capped at `MAX_N_FFT`). Bins spaced closer than
//! `sample_rate / n_fft` share FFT bins and come out nearly identical.

use ndarray::{Array3, ArrayView2};
use realfft::{RealFftPlanner, RealToComplex};
use std::f32::consts::PI;
use std::sync::Arc;

/// Batch waveform -> magnitude spectrogram.
pub trait SpectralFeatures: Send + Sync {
    /// `audio` is `[batch, n_samples]`; returns `[batch, n_frames, n_bins]`.
    fn compute(&self, audio: ArrayView2<f32>) -> Array3<f32>;
}

const MAX_N_FFT: usize = 16384;

#[derive(Debug, Clone, PartialEq)]
pub struct SpectralConfig {
    pub sample_rate: u32,
    pub n_bins: usize,
    /// Output frames per second.
    pub frame_rate: u32,
    pub f_min: f32,
    pub bins_per_octave: usize,
    pub n_fft: usize,
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            n_bins: 84,
            frame_rate: 50, // hop of 320 at 16kHz
            f_min: 32.7, // C1
            bins_per_octave: 12,
            n_fft: resolving_n_fft(16000, 32.7, 12),
        }
    }
}

/// Smallest power-of-two FFT whose bin width is below the spacing of the two
/// lowest log-frequency bins.
fn resolving_n_fft(sample_rate: u32, f_min: f32, bins_per_octave: usize) -> usize {
    let spacing = f_min * (2.0f32.powf(1.0 / bins_per_octave as f32) - 1.0);
    let n = (sample_rate as f32 / spacing).ceil() as usize;
    n.next_power_of_two().clamp(2048, MAX_N_FFT)
}

impl SpectralConfig {
    /// Defaults for `n_bins` bins spread over seven octaves.
    pub fn with_bins(sample_rate: u32, n_bins: usize) -> Self {
        let defaults = Self::default();
        let bins_per_octave = (n_bins / 7).max(1);
        Self {
            sample_rate,
            n_bins,
            bins_per_octave,
            n_fft: resolving_n_fft(sample_rate, defaults.f_min, bins_per_octave),
            ..defaults
        }
    }

    pub fn hop_length(&self) -> usize {
        (self.sample_rate / self.frame_rate).max(1) as usize
    }
}

/// Precomputed transform.
pub struct CqtTransform {
    config: SpectralConfig,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    filterbank: Vec<Filter>,
}

impl CqtTransform {
    pub fn new(config: SpectralConfig) -> Self {
        let mut planner = RealFftPlanner::new();
        let fft = planner.plan_fft_forward(config.n_fft);

        // Hann window
        let window: Vec<f32> = (0..config.n_fft)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / config.n_fft as f32).cos()))
            .collect();

        let filterbank = create_log_filterbank(
            config.sample_rate,
            config.n_fft,
            config.n_bins,
            config.f_min,
            config.bins_per_octave,
        );

        Self {
            config,
            fft,
            window,
            filterbank,
        }
    }

    pub fn config(&self) -> &SpectralConfig {
        &self.config
    }

    /// Magnitude features of one waveform, `[n_frames, n_bins]` row-major.
    pub fn transform(&self, samples: &[f32]) -> Vec<f32> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length();
        let n_bins = self.config.n_bins;
        let (n_frames, _) = self.output_shape(samples.len());
        let pad = n_fft / 2;

        let mut features = vec![0.0f32; n_frames * n_bins];

        // Scratch buffers
        let mut input = vec![0.0f32; n_fft];
        let mut spectrum = self.fft.make_output_vec();
        let mut magnitude = vec![0.0f32; spectrum.len()];

        for frame in 0..n_frames {
            // Frame centre sits at frame * hop; samples outside are zero.
            let start = (frame * hop) as isize - pad as isize;

            for (i, x) in input.iter_mut().enumerate() {
                let pos = start + i as isize;
                *x = if pos >= 0 && (pos as usize) < samples.len() {
                    samples[pos as usize] * self.window[i]
                } else {
                    0.0
                };
            }

            // Lengths always match the planned FFT.
            if self.fft.process(&mut input, &mut spectrum).is_err() {
                continue;
            }

            for (m, c) in magnitude.iter_mut().zip(spectrum.iter()) {
                *m = c.norm();
            }

            let row = &mut features[frame * n_bins..(frame + 1) * n_bins];
            for (out, filter) in row.iter_mut().zip(&self.filterbank) {
                *out = filter
                    .weights
                    .iter()
                    .zip(&magnitude[filter.start..])
                    .map(|(w, m)| w * m)
                    .sum();
            }
        }

        features
    }

    /// `(n_frames, n_bins)` for an input of `n_samples`.
    pub fn output_shape(&self, n_samples: usize) -> (usize, usize) {
        (n_samples / self.config.hop_length() + 1, self.config.n_bins)
    }
}

impl SpectralFeatures for CqtTransform {
    fn compute(&self, audio: ArrayView2<f32>) -> Array3<f32> {
        let (batch, n_samples) = audio.dim();
        let (n_frames, n_bins) = self.output_shape(n_samples);
        let mut out = Array3::<f32>::zeros((batch, n_frames, n_bins));

        for (row, mut dst) in audio.outer_iter().zip(out.outer_iter_mut()) {
            let samples = row.to_vec();
            let features = self.transform(&samples);
            for (d, s) in dst.iter_mut().zip(features) {
                *d = s;
            }
        }

        out
    }
}

/// Non-zero span of one triangular filter over the FFT bins.
struct Filter {
    start: usize,
    weights: Vec<f32>,
}

/// Triangular filters centred on `f_min * 2^(k / bins_per_octave)`.
///
/// Each filter spans its neighbours' centres, widened to at least one FFT bin
/// so low filters narrower than the FFT resolution still pick up energy.
fn create_log_filterbank(
    sample_rate: u32,
    n_fft: usize,
    n_bins: usize,
    f_min: f32,
    bins_per_octave: usize,
) -> Vec<Filter> {
    let n_fft_bins = n_fft / 2 + 1;
    let bin_hz = sample_rate as f32 / n_fft as f32;
    let nyquist = sample_rate as f32 / 2.0;
    let center = |k: f32| f_min * 2.0f32.powf(k / bins_per_octave as f32);

    (0..n_bins)
        .map(|k| {
            let fc = center(k as f32);
            if fc >= nyquist {
                return Filter {
                    start: 0,
                    weights: Vec::new(),
                };
            }
            let lower = (fc - center(k as f32 - 1.0)).max(bin_hz);
            let upper = (center(k as f32 + 1.0) - fc).max(bin_hz);

            let start = ((fc - lower) / bin_hz).ceil().max(0.0) as usize;
            let end = (((fc + upper) / bin_hz).floor() as usize).min(n_fft_bins - 1);
            let weights = (start..=end)
                .map(|bin| {
                    let f = bin as f32 * bin_hz;
                    if f <= fc {
                        1.0 - (fc - f) / lower
                    } else {
                        1.0 - (f - fc) / upper
                    }
                    .max(0.0)
                })
                .collect();
            Filter { start, weights }
        })
        .collect()
}
