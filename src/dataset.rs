//! Random-access waveform dataset for MERT-style pretraining.
//!
//! Every item is a fixed-length mono window read from the file named in the
//! manifest. Unreadable items are replaced by randomly chosen ones, up to
//! `max_retries` times.

use crate::collate::{Batch, BatchCollator, CollateError};
use crate::config::{ConfigError, DatasetConfig};
use crate::decode::{DecodeError, DecodedAudio, probe_info};
use crate::labels::{LabelError, LabelStore, LabelTrack, verify_label_lengths};
use crate::manifest::{Manifest, ManifestEntry, ManifestError};
use crate::order::OrderingPolicy;
use crate::spectral::{CqtTransform, SpectralFeatures};
use crate::window::WindowReader;

use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("Label error: {0}")]
    Label(#[from] LabelError),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Collate error: {0}")]
    Collate(#[from] CollateError),
    #[error("Index {index} out of range for dataset of {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("sr {got} != {expected}")]
    RateMismatch { got: u32, expected: u32 },
    #[error("No readable sample after {attempts} attempts starting at index {index}: {source}")]
    MaxRetriesExceeded {
        index: usize,
        attempts: usize,
        #[source]
        source: DecodeError,
    },
}

/// One dataset item.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Index actually read; differs from the requested one after a retry.
    pub id: usize,
    /// Mono waveform at the dataset sample rate.
    pub source: Vec<f32>,
    /// Where `source` starts in its file, in samples at the dataset rate.
    pub window_start: usize,
    /// One token sequence per label track.
    pub labels: Vec<Vec<i64>>,
}

pub struct MertDataset {
    config: DatasetConfig,
    manifest: Manifest,
    labels: Vec<LabelTrack>,
    reader: WindowReader,
    collator: BatchCollator,
    ordering: OrderingPolicy,
    epoch: AtomicI64,
}

impl MertDataset {
    pub fn new(config: DatasetConfig) -> Result<Self, DatasetError> {
        config.validate()?;

        let clip_samples = config.clip_samples();
        let manifest = Manifest::load(&config.manifest_path, config.keep_bounds(), clip_samples)?;
        info!("dataset len: {}", manifest.len());

        let labels = load_label_tracks(&config, &manifest)?;

        let mut collator = BatchCollator::new(
            config.pad_audio,
            config.random_crop,
            config.max_sample_size(),
            config.sample_rate,
        )
        .with_augmentations(config.augmentation_passes()?, config.noise_params())
        .with_label_tracks(labels.iter().map(|t| (t.kind, t.pad)).collect());

        if let Some(spectral) = config.spectral() {
            info!("preparing {}-bin spectral targets in the data loader", spectral.n_bins);
            collator = collator.with_spectral(Arc::new(CqtTransform::new(spectral)));
        }

        info!(
            "pad_audio={}, random_crop={}, normalize={}, max_sample_size={:?}",
            config.pad_audio, config.random_crop, config.normalize, config.max_sample_size
        );

        Ok(Self {
            reader: WindowReader::new(clip_samples, config.sample_rate),
            ordering: OrderingPolicy::detect(config.shuffle),
            config,
            manifest,
            labels,
            collator,
            epoch: AtomicI64::new(-1),
        })
    }

    /// Replace the spectral target computation.
    pub fn with_spectral_features(mut self, spectral: Option<Arc<dyn SpectralFeatures>>) -> Self {
        self.collator.set_spectral(spectral);
        self
    }

    pub fn with_ordering(mut self, ordering: OrderingPolicy) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn label_tracks(&self) -> &[LabelTrack] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.manifest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.is_empty()
    }

    /// Size estimate of item `index` for batching heuristics.
    pub fn size(&self, index: usize) -> usize {
        let size = self.manifest.sizes()[index];
        if self.config.pad_audio {
            size
        } else {
            size.min(self.config.max_sample_size())
        }
    }

    pub fn num_tokens(&self, index: usize) -> usize {
        self.size(index)
    }

    /// Item sizes change between epochs, so batches must be rebuilt each epoch.
    pub fn can_reuse_epoch_itr_across_epochs(&self) -> bool {
        false
    }

    /// Shared with loader threads, so this only needs `&self`.
    pub fn set_epoch(&self, epoch: i64) {
        self.epoch.store(epoch, Ordering::Relaxed);
    }

    pub fn epoch(&self) -> i64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Iteration order for the current epoch.
    pub fn ordered_indices(&self) -> Vec<usize> {
        self.ordering.order(self.epoch(), self.len())
    }

    pub fn get(&self, index: usize) -> Result<Sample, DatasetError> {
        self.get_with_rng(index, &mut rand::thread_rng())
    }

    /// Read item `index`. Decode failures re-select a random index; other
    /// errors are returned immediately.
    pub fn get_with_rng<R: Rng + ?Sized>(
        &self,
        index: usize,
        rng: &mut R,
    ) -> Result<Sample, DatasetError> {
        let len = self.len();
        if index >= len {
            return Err(DatasetError::IndexOutOfRange { index, len });
        }

        let mut current = index;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.read_audio(current, rng) {
                Ok((source, window_start)) => {
                    return Ok(Sample {
                        id: current,
                        source,
                        window_start,
                        labels: self.labels_for(current)?,
                    });
                }
                Err(DatasetError::Decode(e)) => {
                    let path = self.manifest.entries()[current].path.display();
                    warn!("skip damaged data {current} ({path}): {e}");
                    if attempts > self.config.max_retries {
                        return Err(DatasetError::MaxRetriesExceeded {
                            index,
                            attempts,
                            source: e,
                        });
                    }
                    current = rng.gen_range(0..len);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Window audio and its start sample in the file.
    fn read_audio<R: Rng + ?Sized>(
        &self,
        index: usize,
        rng: &mut R,
    ) -> Result<(Vec<f32>, usize), DatasetError> {
        let entry = &self.manifest.entries()[index];
        let (duration, source_rate) = source_timing(entry)?;
        let window = self.reader.read(
            &entry.path,
            duration,
            source_rate,
            self.config.random_window,
            rng,
        )?;
        let audio = postprocess(window.audio, self.config.sample_rate, self.config.normalize)?;
        Ok((audio, window.start_sample))
    }

    fn labels_for(&self, index: usize) -> Result<Vec<Vec<i64>>, DatasetError> {
        self.labels
            .iter()
            .map(|track| Ok(track.store.get(index)?))
            .collect()
    }

    pub fn collate(&self, samples: Vec<Sample>) -> Result<Batch, DatasetError> {
        self.collate_with_rng(samples, &mut rand::thread_rng())
    }

    pub fn collate_with_rng<R: Rng + ?Sized>(
        &self,
        samples: Vec<Sample>,
        rng: &mut R,
    ) -> Result<Batch, DatasetError> {
        Ok(self.collator.collate(samples, rng)?)
    }
}

/// Duration and sample rate from the file header, falling back to the
/// manifest for streams that do not report their length.
fn source_timing(entry: &ManifestEntry) -> Result<(f64, u32), DecodeError> {
    match probe_info(&entry.path) {
        Ok(info) => Ok((info.duration(), info.sample_rate)),
        Err(DecodeError::UnknownLength) => match (entry.duration, entry.sample_rate) {
            (Some(duration), Some(sample_rate)) => Ok((duration, sample_rate)),
            _ => Err(DecodeError::UnknownLength),
        },
        Err(e) => Err(e),
    }
}

fn load_label_tracks(
    config: &DatasetConfig,
    manifest: &Manifest,
) -> Result<Vec<LabelTrack>, DatasetError> {
    let file_sizes = file_sizes(manifest, config.sample_rate);
    let mut tracks = Vec::with_capacity(config.labels.len());
    for label in &config.labels {
        let path = label.resolved_path();
        let store = if label.memmap {
            LabelStore::load_npy(&path, manifest.indices(), manifest.total())?
        } else {
            LabelStore::load_text(&path, manifest.indices(), manifest.total())?
        };
        let track = LabelTrack {
            kind: label.kind(),
            pad: label.pad,
            store,
        };
        verify_label_lengths(
            &file_sizes,
            config.sample_rate,
            &track,
            config.label_length_tolerance,
        )?;
        tracks.push(track);
    }
    Ok(tracks)
}

/// Whole-file lengths at `rate`; labels describe files, not clipped windows.
fn file_sizes(manifest: &Manifest, rate: u32) -> Vec<Option<usize>> {
    manifest.entries().iter().map(|e| e.len_at(rate)).collect()
}

/// Collapse to mono, check the rate and optionally normalize.
pub fn postprocess(
    audio: DecodedAudio,
    target_rate: u32,
    normalize: bool,
) -> Result<Vec<f32>, DatasetError> {
    let mut wav = if audio.channels > 1 {
        audio.to_mono()
    } else {
        audio.samples
    };

    if audio.sample_rate != target_rate {
        return Err(DatasetError::RateMismatch {
            got: audio.sample_rate,
            expected: target_rate,
        });
    }

    if normalize {
        layer_norm(&mut wav);
    }
    Ok(wav)
}

/// Zero mean, unit variance over the whole waveform.
fn layer_norm(wav: &mut [f32]) {
    const EPS: f64 = 1e-5;
    if wav.is_empty() {
        return;
    }
    let n = wav.len() as f64;
    let mean = wav.iter().map(|&x| x as f64).sum::<f64>() / n;
    let var = wav.iter().map(|&x| (x as f64 - mean).powi(2)).sum::<f64>() / n;
    let scale = 1.0 / (var + EPS).sqrt();
    for x in wav.iter_mut() {
        *x = ((*x as f64 - mean) * scale) as f32;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::decode::tests::write_ramp_wav;
    use crate::order::DistributedContext;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::path::{Path, PathBuf};

    pub(crate) fn write_manifest(dir: &Path, entries: &[(PathBuf, f64, u32)]) -> PathBuf {
        let path = dir.join("train.jsonl");
        let lines: Vec<String> = entries
            .iter()
            .map(|(p, d, sr)| {
                format!(
                    r#"{{"path": "{}", "duration": {d}, "sample_rate": {sr}}}"#,
                    p.display()
                )
            })
            .collect();
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    /// Three 10 s files at 16 kHz.
    pub(crate) fn three_item_dataset(dir: &Path) -> DatasetConfig {
        let entries: Vec<(PathBuf, f64, u32)> = (0..3)
            .map(|i| {
                let p = write_ramp_wav(dir, &format!("{i}.wav"), 16000, 1, 160000);
                (p, 10.0, 16000)
            })
            .collect();
        DatasetConfig {
            pad_audio: true,
            ..DatasetConfig::new(write_manifest(dir, &entries))
        }
    }

    #[test]
    fn test_items_have_clip_length() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = MertDataset::new(three_item_dataset(dir.path())).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.size(0), 80000);

        let mut rng = StdRng::seed_from_u64(0);
        let samples: Vec<Sample> = (0..3)
            .map(|i| dataset.get_with_rng(i, &mut rng).unwrap())
            .collect();
        for (i, s) in samples.iter().enumerate() {
            assert_eq!(s.id, i);
            assert_eq!(s.source.len(), 80000);
        }

        let batch = dataset.collate_with_rng(samples, &mut rng).unwrap();
        assert_eq!(batch.ids, vec![0, 1, 2]);
        assert_eq!(batch.audio.dim(), (3, 80000));
        assert!(batch.padding_mask.iter().all(|&m| !m));
        assert!(batch.spectral_labels.is_none());
    }

    #[test]
    fn test_stereo_44k_is_resampled_to_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ramp_wav(dir.path(), "stereo.wav", 44100, 2, 44100 * 3);
        let manifest = write_manifest(dir.path(), &[(path, 3.0, 44100)]);
        let config = DatasetConfig {
            clip_secs: 1.0,
            ..DatasetConfig::new(manifest)
        };
        let dataset = MertDataset::new(config).unwrap();
        let sample = dataset.get(0).unwrap();
        assert_eq!(sample.source.len(), 16000);
    }

    #[test]
    fn test_damaged_item_is_replaced() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = tempfile::tempdir().unwrap();
        let good = write_ramp_wav(dir.path(), "good.wav", 16000, 1, 16000);
        let bad = dir.path().join("bad.wav");
        std::fs::write(&bad, b"not audio at all").unwrap();
        let manifest = write_manifest(dir.path(), &[(bad, 1.0, 16000), (good, 1.0, 16000)]);

        let config = DatasetConfig {
            clip_secs: 1.0,
            ..DatasetConfig::new(manifest)
        };
        let dataset = MertDataset::new(config).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let sample = dataset.get_with_rng(0, &mut rng).unwrap();
        assert_eq!(sample.id, 1);
        assert_eq!(sample.source.len(), 16000);
    }

    #[test]
    fn test_all_damaged_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.wav");
        let manifest = write_manifest(dir.path(), &[(missing.clone(), 1.0, 16000), (missing, 1.0, 16000)]);

        let config = DatasetConfig {
            max_retries: 3,
            ..DatasetConfig::new(manifest)
        };
        let dataset = MertDataset::new(config).unwrap();
        let err = dataset.get(1).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::MaxRetriesExceeded {
                index: 1,
                attempts: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_index_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = MertDataset::new(three_item_dataset(dir.path())).unwrap();
        assert!(matches!(
            dataset.get(3),
            Err(DatasetError::IndexOutOfRange { index: 3, len: 3 })
        ));
    }

    #[test]
    fn test_label_row_mismatch_fails_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = three_item_dataset(dir.path());
        let labels = dir.path().join("train.km");
        std::fs::write(&labels, "1 2\n3 4\n").unwrap();
        config.labels = vec![crate::config::LabelConfig {
            path: labels,
            rate: -1.0,
            pad: 0,
            memmap: false,
        }];
        assert!(matches!(
            MertDataset::new(config),
            Err(DatasetError::Label(LabelError::LengthMismatch {
                labels: 2,
                manifest: 3,
                ..
            }))
        ));
    }

    #[test]
    fn test_labels_travel_with_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = three_item_dataset(dir.path());
        let labels = dir.path().join("train.km");
        std::fs::write(&labels, "1 2\n3 4 5\n6\n").unwrap();
        config.labels = vec![crate::config::LabelConfig {
            path: labels,
            rate: -1.0,
            pad: -1,
            memmap: false,
        }];
        let dataset = MertDataset::new(config).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let samples = vec![
            dataset.get_with_rng(1, &mut rng).unwrap(),
            dataset.get_with_rng(2, &mut rng).unwrap(),
        ];
        assert_eq!(samples[0].labels, vec![vec![3, 4, 5]]);

        let batch = dataset.collate_with_rng(samples, &mut rng).unwrap();
        assert_eq!(batch.targets[0].lengths, vec![3, 1]);
        assert_eq!(batch.targets[0].targets.row(1).to_vec(), vec![6, -1, -1]);
    }

    /// One 20 s ramp file at 16 kHz with 50 Hz labels numbering its frames.
    fn long_labelled_dataset(dir: &Path) -> DatasetConfig {
        let audio = write_ramp_wav(dir, "long.wav", 16000, 1, 16000 * 20);
        let labels = dir.join("long.km");
        let tokens: Vec<String> = (0..1000).map(|i| i.to_string()).collect();
        std::fs::write(&labels, tokens.join(" ") + "\n").unwrap();
        DatasetConfig {
            pad_audio: true,
            labels: vec![crate::config::LabelConfig {
                path: labels,
                rate: 50.0,
                pad: -1,
                memmap: false,
            }],
            ..DatasetConfig::new(write_manifest(dir, &[(audio, 20.0, 16000)]))
        }
    }

    #[test]
    fn test_frame_labels_align_with_random_window() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = MertDataset::new(long_labelled_dataset(dir.path())).unwrap();
        let mut rng = StdRng::seed_from_u64(5);

        for _ in 0..4 {
            let sample = dataset.get_with_rng(0, &mut rng).unwrap();
            let start = sample.window_start;
            // frame f of the ramp holds (f % 1000) * 16
            let expected = ((start % 1000) * 16) as f32 / 32768.0;
            assert!((sample.source[0] - expected).abs() < 1e-6);

            let batch = dataset.collate_with_rng(vec![sample], &mut rng).unwrap();
            let targets = &batch.targets[0];
            let first_label = (start as f64 * 50.0 / 16000.0).round() as i64;
            assert_eq!(targets.targets[[0, 0]], first_label);
            assert_eq!(targets.lengths, vec![250]);
        }
    }

    #[test]
    fn test_whole_file_labels_pass_length_check() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = MertDataset::new(long_labelled_dataset(dir.path())).unwrap();
        let sizes = file_sizes(dataset.manifest(), 16000);
        assert_eq!(sizes, vec![Some(320000)]);
        let invalid =
            verify_label_lengths(&sizes, 16000, &dataset.label_tracks()[0], 0.1).unwrap();
        assert_eq!(invalid, 0);
    }

    #[test]
    fn test_tsv_items_sized_by_clip() {
        let dir = tempfile::tempdir().unwrap();
        write_ramp_wav(dir.path(), "a.wav", 16000, 1, 160000);
        let manifest = dir.path().join("train.tsv");
        std::fs::write(&manifest, format!("{}\na.wav\t160000\n", dir.path().display())).unwrap();

        let dataset = MertDataset::new(DatasetConfig::new(manifest)).unwrap();
        let sample = dataset.get(0).unwrap();
        assert_eq!(dataset.size(0), 80000);
        assert_eq!(dataset.num_tokens(0), sample.source.len());
    }

    #[test]
    fn test_spectral_labels_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatasetConfig {
            cqt_prediction_bin: 84,
            ..three_item_dataset(dir.path())
        };
        let dataset = MertDataset::new(config).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let samples = vec![
            dataset.get_with_rng(0, &mut rng).unwrap(),
            dataset.get_with_rng(1, &mut rng).unwrap(),
        ];
        let batch = dataset.collate_with_rng(samples, &mut rng).unwrap();
        assert_eq!(batch.spectral_labels.unwrap().dim(), (2, 251, 84));
    }

    #[test]
    fn test_ordered_indices_follow_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let ordering = OrderingPolicy::new(true, Some(DistributedContext::new(4, 2)));
        let dataset = MertDataset::new(three_item_dataset(dir.path()))
            .unwrap()
            .with_ordering(ordering);
        assert_eq!(dataset.epoch(), -1);
        assert!(!dataset.can_reuse_epoch_itr_across_epochs());
        dataset.set_epoch(5);
        assert_eq!(dataset.ordered_indices(), ordering.order(5, 3));

        let dataset = dataset.with_ordering(OrderingPolicy::new(false, None));
        assert_eq!(dataset.ordered_indices(), vec![0, 1, 2]);
    }

    #[test]
    fn test_postprocess() {
        let stereo = DecodedAudio {
            samples: vec![1.0, 3.0, 1.0, 3.0],
            sample_rate: 16000,
            channels: 2,
        };
        assert_eq!(postprocess(stereo, 16000, false).unwrap(), vec![2.0, 2.0]);

        let wrong_rate = DecodedAudio::mono(vec![0.0; 4], 8000);
        assert!(matches!(
            postprocess(wrong_rate, 16000, false),
            Err(DatasetError::RateMismatch {
                got: 8000,
                expected: 16000
            })
        ));

        let audio = DecodedAudio::mono((0..1000).map(|i| i as f32 * 0.01 + 3.0).collect(), 16000);
        let wav = postprocess(audio, 16000, true).unwrap();
        let mean = wav.iter().sum::<f32>() / wav.len() as f32;
        let var = wav.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / wav.len() as f32;
        assert!(mean.abs() < 1e-4);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_size_clamped_without_padding() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatasetConfig {
            pad_audio: false,
            max_sample_size: Some(50000),
            ..three_item_dataset(dir.path())
        };
        let dataset = MertDataset::new(config).unwrap();
        assert_eq!(dataset.size(0), 50000);
        assert_eq!(dataset.num_tokens(2), 50000);
    }
}
