//! Pre-computed per-item labels.
//!
//! A label track is a parallel array over the manifest: one integer token
//! sequence per record. Tracks are either whole-item sequences or
//! frame-aligned with the audio at a fixed label rate.

use crate::npy::{NpyError, NpyRows};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum LabelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Npy error: {0}")]
    Npy(#[from] NpyError),
    #[error("number of labels does not match ({labels} != {manifest}) in {path}")]
    LengthMismatch {
        path: PathBuf,
        labels: usize,
        manifest: usize,
    },
    #[error("Invalid token {token:?} on line {line} of {path}")]
    InvalidToken {
        path: PathBuf,
        line: usize,
        token: String,
    },
    #[error("Label index {index} out of range for {len} items")]
    OutOfRange { index: usize, len: usize },
}

/// How a label track lines up with the audio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LabelKind {
    /// One token sequence per item, independent of the audio length.
    Sequence,
    /// `rate` labels per second of audio.
    FrameAligned(f64),
}

impl LabelKind {
    /// Interpret a configured rate; negative rates mean sequence labels.
    pub fn from_rate(rate: f64) -> Self {
        if rate < 0.0 {
            Self::Sequence
        } else {
            Self::FrameAligned(rate)
        }
    }
}

#[derive(Debug)]
enum Backing {
    Memory(Vec<Vec<i64>>),
    Mapped { rows: NpyRows, selected: Vec<usize> },
}

/// Labels for the kept manifest records, addressed by dataset index.
#[derive(Debug)]
pub struct LabelStore {
    path: PathBuf,
    backing: Backing,
}

impl LabelStore {
    /// Eagerly read a text label file, one whitespace-separated sequence per
    /// line, and keep the rows listed in `selected`.
    pub fn load_text<P: AsRef<Path>>(
        path: P,
        selected: &[usize],
        total: usize,
    ) -> Result<Self, LabelError> {
        let path = path.as_ref().to_path_buf();
        let reader = BufReader::new(File::open(&path)?);

        let mut lines = Vec::new();
        for line in reader.lines() {
            lines.push(line?);
        }
        check_count(&path, lines.len(), total)?;

        let mut labels = Vec::with_capacity(selected.len());
        for &row in selected {
            labels.push(parse_tokens(&path, row, &lines[row])?);
        }

        info!("loaded {} label rows from {}", labels.len(), path.display());
        Ok(Self {
            path,
            backing: Backing::Memory(labels),
        })
    }

    /// Memory-map a 2-D integer `.npy` array with one row per manifest record.
    pub fn load_npy<P: AsRef<Path>>(
        path: P,
        selected: &[usize],
        total: usize,
    ) -> Result<Self, LabelError> {
        let path = path.as_ref().to_path_buf();
        let rows = NpyRows::open(&path)?;
        check_count(&path, rows.rows(), total)?;

        info!(
            "mapped {} x {} {:?} labels from {}",
            rows.rows(),
            rows.row_len(),
            rows.dtype(),
            path.display()
        );
        Ok(Self {
            path,
            backing: Backing::Mapped {
                rows,
                selected: selected.to_vec(),
            },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Memory(labels) => labels.len(),
            Backing::Mapped { selected, .. } => selected.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Token sequence of item `index`.
    pub fn get(&self, index: usize) -> Result<Vec<i64>, LabelError> {
        let len = self.len();
        match &self.backing {
            Backing::Memory(labels) => labels
                .get(index)
                .cloned()
                .ok_or(LabelError::OutOfRange { index, len }),
            Backing::Mapped { rows, selected } => {
                let row = *selected
                    .get(index)
                    .ok_or(LabelError::OutOfRange { index, len })?;
                Ok(rows.row(row)?)
            }
        }
    }

    /// Sequence length of item `index` without decoding mapped rows.
    pub fn label_len(&self, index: usize) -> Result<usize, LabelError> {
        match &self.backing {
            Backing::Memory(labels) => labels.get(index).map(Vec::len).ok_or(
                LabelError::OutOfRange {
                    index,
                    len: labels.len(),
                },
            ),
            Backing::Mapped { rows, selected } => {
                if index < selected.len() {
                    Ok(rows.row_len())
                } else {
                    Err(LabelError::OutOfRange {
                        index,
                        len: selected.len(),
                    })
                }
            }
        }
    }
}

fn check_count(path: &Path, labels: usize, manifest: usize) -> Result<(), LabelError> {
    if labels != manifest {
        return Err(LabelError::LengthMismatch {
            path: path.to_path_buf(),
            labels,
            manifest,
        });
    }
    Ok(())
}

fn parse_tokens(path: &Path, row: usize, line: &str) -> Result<Vec<i64>, LabelError> {
    line.split_whitespace()
        .map(|tok| {
            tok.parse::<i64>().map_err(|_| LabelError::InvalidToken {
                path: path.to_path_buf(),
                line: row + 1,
                token: tok.to_string(),
            })
        })
        .collect()
}

/// A label track with its alignment and padding value.
#[derive(Debug)]
pub struct LabelTrack {
    pub kind: LabelKind,
    pub pad: i64,
    pub store: LabelStore,
}

/// Compare the duration implied by each label sequence with the duration of
/// the whole audio file (`audio_sizes` at `audio_rate`, `None` when unknown).
/// Mismatches beyond `tol` seconds are logged; returns how many there were.
pub fn verify_label_lengths(
    audio_sizes: &[Option<usize>],
    audio_rate: u32,
    track: &LabelTrack,
    tol: f64,
) -> Result<usize, LabelError> {
    let label_rate = match track.kind {
        LabelKind::Sequence => {
            info!("{} is sequence label. skipped", track.store.path().display());
            return Ok(0);
        }
        LabelKind::FrameAligned(rate) => rate,
    };

    let mut num_invalid = 0;
    for (i, &audio_size) in audio_sizes.iter().enumerate() {
        let Some(audio_size) = audio_size else {
            continue;
        };
        let label_len = track.store.label_len(i)?;
        let dur_from_audio = audio_size as f64 / audio_rate as f64;
        let dur_from_label = label_len as f64 / label_rate;
        if (dur_from_audio - dur_from_label).abs() > tol {
            warn!(
                "audio and label duration differ too much (|{} - {}| > {}) in item {} of {}; \
                 check label_rate (currently {}), samples = {}, label length = {}",
                dur_from_audio,
                dur_from_label,
                tol,
                i,
                track.store.path().display(),
                label_rate,
                audio_size,
                label_len
            );
            num_invalid += 1;
        }
    }
    if num_invalid > 0 {
        warn!("total {num_invalid} (audio, label) pairs with mismatched lengths");
    }
    Ok(num_invalid)
}
