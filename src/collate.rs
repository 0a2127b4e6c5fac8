//! Batch assembly: pad or crop variable-length waveforms to one length, build
//! the padding mask, compute spectral targets and apply augmentation.

use crate::augment::{AugmentError, Augmentation, AugmentationPass, NoiseParams, inbatch_noise_augment};
use crate::dataset::Sample;
use crate::labels::LabelKind;
use crate::spectral::SpectralFeatures;

use ndarray::{Array2, Array3, ArrayView1};
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CollateError {
    #[error("Sample {id} has {len} samples, shorter than batch size {audio_size}, but padding is disabled")]
    PaddingDisabled {
        id: usize,
        len: usize,
        audio_size: usize,
    },
    #[error("Sample {id} is missing label track {track}")]
    MissingLabels { id: usize, track: usize },
    #[error("Augmentation error: {0}")]
    Augment(#[from] AugmentError),
}

/// Collated targets of one label track.
#[derive(Debug, Clone, PartialEq)]
pub struct CollatedTargets {
    /// `[batch, max_len]`, right-padded with the track's pad value.
    pub targets: Array2<i64>,
    pub lengths: Vec<usize>,
    pub ntokens: usize,
}

/// One training batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub ids: Vec<usize>,
    /// `[batch, audio_size]`
    pub audio: Array2<f32>,
    /// Same shape as `audio`, `true` on zero-padded positions.
    pub padding_mask: Array2<bool>,
    /// Crop offset of each row into its source sample.
    pub audio_starts: Vec<usize>,
    /// `[batch, n_frames, n_bins]`
    pub spectral_labels: Option<Array3<f32>>,
    pub targets: Vec<CollatedTargets>,
}

impl Batch {
    pub fn empty() -> Self {
        Self {
            ids: Vec::new(),
            audio: Array2::zeros((0, 0)),
            padding_mask: Array2::from_elem((0, 0), false),
            audio_starts: Vec::new(),
            spectral_labels: None,
            targets: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn audio_size(&self) -> usize {
        self.audio.ncols()
    }
}

/// Combines samples into batches. Holds no state between calls.
pub struct BatchCollator {
    pad_audio: bool,
    random_crop: bool,
    max_sample_size: usize,
    sample_rate: u32,
    spectral: Option<Arc<dyn SpectralFeatures>>,
    augmentations: Vec<AugmentationPass>,
    noise: NoiseParams,
    label_tracks: Vec<(LabelKind, i64)>,
}

impl BatchCollator {
    pub fn new(pad_audio: bool, random_crop: bool, max_sample_size: usize, sample_rate: u32) -> Self {
        Self {
            pad_audio,
            random_crop,
            max_sample_size,
            sample_rate,
            spectral: None,
            augmentations: Vec::new(),
            noise: NoiseParams::default(),
            label_tracks: Vec::new(),
        }
    }

    pub fn with_spectral(mut self, spectral: Arc<dyn SpectralFeatures>) -> Self {
        self.spectral = Some(spectral);
        self
    }

    pub fn with_augmentations(mut self, passes: Vec<AugmentationPass>, noise: NoiseParams) -> Self {
        self.augmentations = passes;
        self.noise = noise;
        self
    }

    /// `(kind, pad)` of every label track, in sample label order.
    pub fn with_label_tracks(mut self, tracks: Vec<(LabelKind, i64)>) -> Self {
        self.label_tracks = tracks;
        self
    }

    pub fn set_spectral(&mut self, spectral: Option<Arc<dyn SpectralFeatures>>) {
        self.spectral = spectral;
    }

    /// Common length of a batch with these per-item lengths.
    pub fn audio_size(&self, sizes: &[usize]) -> usize {
        let size = if self.pad_audio {
            sizes.iter().max()
        } else {
            sizes.iter().min()
        };
        size.copied().unwrap_or(0).min(self.max_sample_size)
    }

    pub fn collate<R: Rng + ?Sized>(
        &self,
        samples: Vec<Sample>,
        rng: &mut R,
    ) -> Result<Batch, CollateError> {
        let samples: Vec<Sample> = samples
            .into_iter()
            .filter(|s| !s.source.is_empty())
            .collect();
        if samples.is_empty() {
            return Ok(Batch::empty());
        }

        let noise_configured = self
            .augmentations
            .iter()
            .any(|p| p.effect == Augmentation::InBatchNoise);
        if noise_configured && samples.len() < 2 {
            return Err(AugmentError::BatchTooSmall(samples.len()).into());
        }

        let ids: Vec<usize> = samples.iter().map(|s| s.id).collect();
        let sizes: Vec<usize> = samples.iter().map(|s| s.source.len()).collect();
        let audio_size = self.audio_size(&sizes);

        let (mut audio, padding_mask, audio_starts) =
            self.collate_audio(&samples, audio_size, rng)?;

        let spectral_labels = self.spectral.as_ref().map(|s| s.compute(audio.view()));

        if !self.augmentations.is_empty() {
            let raw: Vec<Vec<f32>> = samples.iter().map(|s| s.source.clone()).collect();
            for i in 0..samples.len() {
                for pass in &self.augmentations {
                    if rng.gen::<f64>() >= pass.prob {
                        continue;
                    }
                    match pass.effect {
                        Augmentation::ComposedV1 => {}
                        Augmentation::InBatchNoise => {
                            let row = audio.row(i).to_vec();
                            let out = inbatch_noise_augment(&row, i, &raw, &self.noise, rng)?;
                            audio.row_mut(i).assign(&ArrayView1::from(out.as_slice()));
                        }
                    }
                }
            }
        }

        let targets = self.collate_labels(&samples, audio_size, &audio_starts)?;

        Ok(Batch {
            ids,
            audio,
            padding_mask,
            audio_starts,
            spectral_labels,
            targets,
        })
    }

    fn collate_audio<R: Rng + ?Sized>(
        &self,
        samples: &[Sample],
        audio_size: usize,
        rng: &mut R,
    ) -> Result<(Array2<f32>, Array2<bool>, Vec<usize>), CollateError> {
        let mut audio = Array2::<f32>::zeros((samples.len(), audio_size));
        let mut padding_mask = Array2::from_elem((samples.len(), audio_size), false);
        let mut audio_starts = vec![0; samples.len()];

        for (i, sample) in samples.iter().enumerate() {
            let len = sample.source.len();
            if len < audio_size {
                if !self.pad_audio {
                    return Err(CollateError::PaddingDisabled {
                        id: sample.id,
                        len,
                        audio_size,
                    });
                }
                audio
                    .row_mut(i)
                    .slice_mut(ndarray::s![..len])
                    .assign(&ArrayView1::from(sample.source.as_slice()));
                padding_mask
                    .row_mut(i)
                    .slice_mut(ndarray::s![len..])
                    .fill(true);
            } else {
                let (window, start) =
                    crop_to_max_size(&sample.source, audio_size, self.random_crop, rng);
                audio.row_mut(i).assign(&ArrayView1::from(window));
                audio_starts[i] = start;
            }
        }

        Ok((audio, padding_mask, audio_starts))
    }

    fn collate_labels(
        &self,
        samples: &[Sample],
        audio_size: usize,
        audio_starts: &[usize],
    ) -> Result<Vec<CollatedTargets>, CollateError> {
        // Frame labels cover the whole file; offset crops by the read window.
        let file_starts: Vec<usize> = samples
            .iter()
            .zip(audio_starts)
            .map(|(s, &crop)| s.window_start + crop)
            .collect();
        let mut collated = Vec::with_capacity(self.label_tracks.len());
        for (track, &(kind, pad)) in self.label_tracks.iter().enumerate() {
            let targets = samples
                .iter()
                .map(|s| {
                    s.labels
                        .get(track)
                        .map(Vec::as_slice)
                        .ok_or(CollateError::MissingLabels { id: s.id, track })
                })
                .collect::<Result<Vec<_>, _>>()?;

            collated.push(match kind {
                LabelKind::Sequence => collate_tokens(&targets, pad),
                LabelKind::FrameAligned(rate) => collate_frame_labels(
                    &targets,
                    audio_size,
                    &file_starts,
                    rate / self.sample_rate as f64,
                    pad,
                    self.pad_audio,
                ),
            });
        }
        Ok(collated)
    }
}

/// Cut `wav` down to `target_size`. Returns the window and its start offset.
pub fn crop_to_max_size<'a, R: Rng + ?Sized>(
    wav: &'a [f32],
    target_size: usize,
    random_crop: bool,
    rng: &mut R,
) -> (&'a [f32], usize) {
    let size = wav.len();
    if size <= target_size {
        return (wav, 0);
    }
    let diff = size - target_size;
    let start = if random_crop {
        rng.gen_range(0..=diff)
    } else {
        0
    };
    (&wav[start..start + target_size], start)
}

/// Cut frame-aligned labels to the audio crop. `s2f` is label frames per
/// audio sample.
pub fn collate_frame_labels(
    targets: &[&[i64]],
    audio_size: usize,
    audio_starts: &[usize],
    s2f: f64,
    pad: i64,
    pad_audio: bool,
) -> CollatedTargets {
    let frm_starts: Vec<usize> = audio_starts
        .iter()
        .map(|&s| (s as f64 * s2f).round() as usize)
        .collect();
    let mut frm_size = (audio_size as f64 * s2f).round() as usize;
    if !pad_audio {
        for (t, &s) in targets.iter().zip(&frm_starts) {
            frm_size = frm_size.min(t.len().saturating_sub(s));
        }
    }
    debug!("audio_starts={audio_starts:?}");
    debug!("frame_starts={frm_starts:?}");
    debug!("frame_size={frm_size}");

    let cut: Vec<&[i64]> = targets
        .iter()
        .zip(&frm_starts)
        .map(|(t, &s)| {
            let start = s.min(t.len());
            &t[start..(s + frm_size).min(t.len())]
        })
        .collect();
    collate_tokens(&cut, pad)
}

/// Right-pad token sequences to the longest one.
pub fn collate_tokens(seqs: &[&[i64]], pad: i64) -> CollatedTargets {
    let max_len = seqs.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut targets = Array2::from_elem((seqs.len(), max_len), pad);
    for (mut row, seq) in targets.outer_iter_mut().zip(seqs) {
        row.slice_mut(ndarray::s![..seq.len()])
            .assign(&ArrayView1::from(*seq));
    }
    let lengths: Vec<usize> = seqs.iter().map(|s| s.len()).collect();
    let ntokens = lengths.iter().sum();
    CollatedTargets {
        targets,
        lengths,
        ntokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Axis;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn sample(id: usize, len: usize, value: f32) -> Sample {
        Sample {
            id,
            source: vec![value; len],
            window_start: 0,
            labels: Vec::new(),
        }
    }

    fn ramp(id: usize, len: usize) -> Sample {
        Sample {
            id,
            source: (0..len).map(|i| i as f32).collect(),
            window_start: 0,
            labels: Vec::new(),
        }
    }

    #[test]
    fn test_empty_input() {
        let collator = BatchCollator::new(true, false, usize::MAX, 16000);
        let mut rng = StdRng::seed_from_u64(0);
        let batch = collator
            .collate(vec![sample(0, 0, 1.0)], &mut rng)
            .unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch, Batch::empty());
    }

    #[test]
    fn test_pad_to_longest_mask() {
        let collator = BatchCollator::new(true, false, usize::MAX, 16000);
        let mut rng = StdRng::seed_from_u64(0);
        let samples = vec![sample(3, 10, 1.0), sample(7, 6, 2.0), sample(9, 10, 3.0)];
        let batch = collator.collate(samples, &mut rng).unwrap();

        assert_eq!(batch.ids, vec![3, 7, 9]);
        assert_eq!(batch.audio.dim(), (3, 10));
        assert_eq!(batch.padding_mask.dim(), batch.audio.dim());
        for (row, content_len) in [10usize, 6, 10].iter().enumerate() {
            for col in 0..10 {
                let padded = col >= *content_len;
                assert_eq!(batch.padding_mask[[row, col]], padded);
                if padded {
                    assert_eq!(batch.audio[[row, col]], 0.0);
                } else {
                    assert_ne!(batch.audio[[row, col]], 0.0);
                }
            }
        }
    }

    #[test]
    fn test_uniform_lengths_no_padding() {
        let collator = BatchCollator::new(true, false, usize::MAX, 16000);
        let mut rng = StdRng::seed_from_u64(0);
        let samples = (0..3).map(|i| sample(i, 80000, 0.5)).collect();
        let batch = collator.collate(samples, &mut rng).unwrap();
        assert_eq!(batch.audio_size(), 80000);
        assert!(batch.padding_mask.iter().all(|&m| !m));
    }

    #[test]
    fn test_crop_to_shortest() {
        let collator = BatchCollator::new(false, false, usize::MAX, 16000);
        let mut rng = StdRng::seed_from_u64(0);
        let batch = collator
            .collate(vec![ramp(0, 12), ramp(1, 8)], &mut rng)
            .unwrap();
        assert_eq!(batch.audio_size(), 8);
        // Deterministic crops start at zero.
        assert_eq!(batch.audio_starts, vec![0, 0]);
        assert_eq!(batch.audio[[0, 7]], 7.0);
        assert!(batch.padding_mask.iter().all(|&m| !m));
    }

    #[test]
    fn test_max_sample_size_random_crop() {
        let collator = BatchCollator::new(true, true, 5, 16000);
        let mut rng = StdRng::seed_from_u64(11);
        let batch = collator
            .collate(vec![ramp(0, 20), ramp(1, 9)], &mut rng)
            .unwrap();
        assert_eq!(batch.audio_size(), 5);
        for (row, start) in batch.audio_starts.iter().enumerate() {
            for col in 0..5 {
                assert_eq!(batch.audio[[row, col]], (start + col) as f32);
            }
        }
        assert!(batch.audio_starts[0] <= 15);
        assert!(batch.audio_starts[1] <= 4);
    }

    #[test]
    fn test_audio_size_policy() {
        let collator = BatchCollator::new(false, false, 4, 16000);
        let mut rng = StdRng::seed_from_u64(0);
        // max_sample_size caps the size below both lengths, so no padding occurs.
        assert!(collator.collate(vec![ramp(0, 6), ramp(1, 5)], &mut rng).is_ok());
        assert_eq!(collator.audio_size(&[6, 5]), 4);
        assert_eq!(
            BatchCollator::new(false, false, 100, 16000).audio_size(&[6, 5]),
            5
        );
        assert_eq!(
            BatchCollator::new(true, false, 100, 16000).audio_size(&[6, 5]),
            6
        );
    }

    #[test]
    fn test_collate_is_reproducible_with_seed() {
        let passes = vec![AugmentationPass {
            effect: Augmentation::InBatchNoise,
            prob: 0.7,
        }];
        let noise = NoiseParams {
            len_min: 4,
            len_max: 8,
            count_min: 1,
            count_max: 3,
            volume: 0.3,
        };
        let collator =
            BatchCollator::new(true, true, 40, 16000).with_augmentations(passes, noise);
        let samples: Vec<Sample> = (0..4).map(|i| ramp(i, 30 + 5 * i)).collect();

        let a = collator
            .collate(samples.clone(), &mut StdRng::seed_from_u64(5))
            .unwrap();
        let b = collator
            .collate(samples, &mut StdRng::seed_from_u64(5))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_inbatch_noise_on_single_item_batch_is_error() {
        let passes = vec![AugmentationPass {
            effect: Augmentation::InBatchNoise,
            prob: 1.0,
        }];
        let collator = BatchCollator::new(true, false, usize::MAX, 16000)
            .with_augmentations(passes, NoiseParams::default());
        let mut rng = StdRng::seed_from_u64(0);
        let err = collator
            .collate(vec![sample(0, 80000, 0.1)], &mut rng)
            .unwrap_err();
        assert!(matches!(
            err,
            CollateError::Augment(AugmentError::BatchTooSmall(1))
        ));
    }

    #[test]
    fn test_single_item_rejected_whatever_the_draw() {
        let passes = vec![AugmentationPass {
            effect: Augmentation::InBatchNoise,
            prob: 0.5,
        }];
        let collator = BatchCollator::new(true, false, usize::MAX, 16000)
            .with_augmentations(passes, NoiseParams::default());
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let err = collator
                .collate(vec![sample(0, 80000, 0.1), sample(1, 0, 0.0)], &mut rng)
                .unwrap_err();
            assert!(matches!(
                err,
                CollateError::Augment(AugmentError::BatchTooSmall(1))
            ));
        }
    }

    #[test]
    fn test_noop_augmentation_leaves_audio() {
        let passes = vec![AugmentationPass {
            effect: Augmentation::ComposedV1,
            prob: 1.0,
        }];
        let collator = BatchCollator::new(true, false, usize::MAX, 16000)
            .with_augmentations(passes, NoiseParams::default());
        let mut rng = StdRng::seed_from_u64(0);
        let batch = collator.collate(vec![ramp(0, 8)], &mut rng).unwrap();
        assert_eq!(batch.audio.row(0).to_vec(), ramp(0, 8).source);
    }

    struct RowSum;

    impl SpectralFeatures for RowSum {
        fn compute(&self, audio: ndarray::ArrayView2<f32>) -> Array3<f32> {
            let sums = audio.sum_axis(Axis(1));
            Array3::from_shape_fn((audio.nrows(), 1, 1), |(b, _, _)| sums[b])
        }
    }

    #[test]
    fn test_spectral_labels_see_padded_batch() {
        let collator =
            BatchCollator::new(true, false, usize::MAX, 16000).with_spectral(Arc::new(RowSum));
        let mut rng = StdRng::seed_from_u64(0);
        let batch = collator
            .collate(vec![sample(0, 4, 1.0), sample(1, 2, 1.0)], &mut rng)
            .unwrap();
        let labels = batch.spectral_labels.unwrap();
        assert_eq!(labels.dim(), (2, 1, 1));
        assert_eq!(labels[[0, 0, 0]], 4.0);
        assert_eq!(labels[[1, 0, 0]], 2.0);
    }

    #[test]
    fn test_frame_labels_follow_crop() {
        // 100 labels per second at 1 kHz audio: one label per 10 samples.
        let labels: Vec<i64> = (0..10).collect();
        let short: Vec<i64> = (100..106).collect();
        let out = collate_frame_labels(&[&labels, &short], 40, &[20, 0], 0.1, -1, false);
        assert_eq!(out.lengths, vec![4, 4]);
        assert_eq!(out.targets.row(0).to_vec(), vec![2, 3, 4, 5]);
        assert_eq!(out.targets.row(1).to_vec(), vec![100, 101, 102, 103]);
        assert_eq!(out.ntokens, 8);

        // Without the pad_audio clamp the short row keeps what it has and is padded.
        let out = collate_frame_labels(&[&labels, &short], 80, &[0, 0], 0.1, -1, true);
        assert_eq!(out.lengths, vec![8, 6]);
        assert_eq!(out.targets.row(1).to_vec(), vec![100, 101, 102, 103, 104, 105, -1, -1]);
    }

    #[test]
    fn test_frame_labels_start_at_read_window() {
        // 100 labels per second at 1 kHz audio; labels index the whole file.
        let collator = BatchCollator::new(true, false, usize::MAX, 1000)
            .with_label_tracks(vec![(LabelKind::FrameAligned(100.0), -1)]);
        let mut rng = StdRng::seed_from_u64(0);
        let mut a = sample(0, 40, 1.0);
        a.window_start = 30;
        a.labels = vec![(0..20).collect()];
        let mut b = sample(1, 40, 1.0);
        b.labels = vec![(100..120).collect()];

        let batch = collator.collate(vec![a, b], &mut rng).unwrap();
        assert_eq!(batch.audio_starts, vec![0, 0]);
        assert_eq!(batch.targets[0].targets.row(0).to_vec(), vec![3, 4, 5, 6]);
        assert_eq!(batch.targets[0].targets.row(1).to_vec(), vec![100, 101, 102, 103]);
    }

    #[test]
    fn test_sequence_labels_in_batch() {
        let collator = BatchCollator::new(true, false, usize::MAX, 16000)
            .with_label_tracks(vec![(LabelKind::Sequence, 0)]);
        let mut rng = StdRng::seed_from_u64(0);
        let mut a = sample(0, 4, 1.0);
        a.labels = vec![vec![5, 6, 7]];
        let mut b = sample(1, 4, 1.0);
        b.labels = vec![vec![8]];
        let batch = collator.collate(vec![a, b], &mut rng).unwrap();

        assert_eq!(batch.targets.len(), 1);
        assert_eq!(batch.targets[0].targets.row(1).to_vec(), vec![8, 0, 0]);
        assert_eq!(batch.targets[0].ntokens, 4);

        let err = collator
            .collate(vec![sample(2, 4, 1.0)], &mut rng)
            .unwrap_err();
        assert!(matches!(err, CollateError::MissingLabels { id: 2, track: 0 }));
    }
}
