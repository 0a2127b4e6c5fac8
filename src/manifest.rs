//! Dataset manifests.
//!
//! Two line-oriented formats are understood:
//! - JSON lines: one object per line with at least a `path` field, usually
//!   `duration` (seconds) and `sample_rate` as well.
//! - Legacy TSV (`.tsv`): the first line is a root directory, every following
//!   line is `relative_path<TAB>length_in_samples`, the length counted at the
//!   dataset rate.
//!
//! Either way every kept item reports the clip length as its size, since reads
//! are always cut to one window. Record lengths only drive the keep filter and
//! label checks.

use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid JSON on line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("Malformed line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("Manifest {0} has no usable records")]
    Empty(PathBuf),
}

/// One audio item.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ManifestEntry {
    pub path: PathBuf,
    /// Seconds. Absent for legacy TSV rows.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    /// Length at the dataset rate, from legacy TSV rows.
    #[serde(skip)]
    pub num_samples: Option<usize>,
}

impl ManifestEntry {
    /// Length in source samples, when the record says.
    pub fn source_len(&self) -> Option<usize> {
        match (self.duration, self.sample_rate) {
            (Some(d), Some(sr)) => Some((d * sr as f64) as usize),
            _ => None,
        }
    }

    /// Length of the whole file at `target_rate`, when the record says.
    pub fn len_at(&self, target_rate: u32) -> Option<usize> {
        self.num_samples
            .or_else(|| self.duration.map(|d| (d * target_rate as f64).round() as usize))
    }
}

/// Records outside `[min_keep, max_keep]` samples are skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepBounds {
    pub min_keep: Option<usize>,
    pub max_keep: Option<usize>,
}

impl KeepBounds {
    fn classify(&self, size: usize) -> Keep {
        match (self.min_keep, self.max_keep) {
            (Some(min), _) if size < min => Keep::Short,
            (_, Some(max)) if size > max => Keep::Long,
            _ => Keep::Yes,
        }
    }
}

enum Keep {
    Yes,
    Short,
    Long,
}

/// In-memory index over the kept manifest records.
#[derive(Debug, Clone)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
    /// Sample count each kept item yields, used by batching heuristics.
    sizes: Vec<usize>,
    /// Line ordinal (0-based, header excluded) of each kept entry.
    indices: Vec<usize>,
    /// Total records in the file, kept or not.
    total: usize,
}

impl Manifest {
    /// Load a manifest, choosing the format from the extension.
    pub fn load<P: AsRef<Path>>(
        path: P,
        bounds: KeepBounds,
        clip_samples: usize,
    ) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let is_tsv = path.extension().is_some_and(|e| e == "tsv");
        let reader = BufReader::new(File::open(path)?);

        let manifest = if is_tsv {
            Self::parse_tsv(reader, bounds, clip_samples)?
        } else {
            Self::parse_json_lines(reader, bounds, clip_samples)?
        };

        if manifest.is_empty() {
            return Err(ManifestError::Empty(path.to_path_buf()));
        }

        info!(
            "loaded {} of {} records from {}, longest={}, shortest={}",
            manifest.len(),
            manifest.total,
            path.display(),
            manifest.sizes.iter().max().copied().unwrap_or(0),
            manifest.sizes.iter().min().copied().unwrap_or(0),
        );

        Ok(manifest)
    }

    pub fn parse_json_lines<R: BufRead>(
        reader: R,
        bounds: KeepBounds,
        clip_samples: usize,
    ) -> Result<Self, ManifestError> {
        let mut manifest = Self::empty();
        let (mut n_short, mut n_long) = (0, 0);

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let ordinal = manifest.total;
            manifest.total += 1;

            let entry: ManifestEntry = serde_json::from_str(&line)
                .map_err(|source| ManifestError::Json {
                    line: ordinal + 1,
                    source,
                })?;

            match bounds.classify(entry.source_len().unwrap_or(clip_samples)) {
                Keep::Short => n_short += 1,
                Keep::Long => n_long += 1,
                Keep::Yes => manifest.push(entry, clip_samples, ordinal),
            }
        }

        log_skipped(bounds, n_short, n_long);
        Ok(manifest)
    }

    pub fn parse_tsv<R: BufRead>(
        reader: R,
        bounds: KeepBounds,
        clip_samples: usize,
    ) -> Result<Self, ManifestError> {
        let mut lines = reader.lines();
        let root = match lines.next() {
            Some(line) => PathBuf::from(line?.trim()),
            None => return Ok(Self::empty()),
        };

        let mut manifest = Self::empty();
        let (mut n_short, mut n_long) = (0, 0);

        for line in lines {
            let line = line?;
            let ordinal = manifest.total;
            manifest.total += 1;

            let items: Vec<&str> = line.trim().split('\t').collect();
            let [name, size] = items.as_slice() else {
                return Err(ManifestError::Malformed {
                    line: ordinal + 2,
                    reason: format!("expected 2 tab-separated fields, got {}", items.len()),
                });
            };
            let size: usize = size.parse().map_err(|_| ManifestError::Malformed {
                line: ordinal + 2,
                reason: format!("invalid sample count {size:?}"),
            })?;

            match bounds.classify(size) {
                Keep::Short => n_short += 1,
                Keep::Long => n_long += 1,
                Keep::Yes => {
                    let entry = ManifestEntry {
                        path: root.join(name),
                        duration: None,
                        sample_rate: None,
                        num_samples: Some(size),
                    };
                    manifest.push(entry, clip_samples, ordinal);
                }
            }
        }

        log_skipped(bounds, n_short, n_long);
        Ok(manifest)
    }

    fn empty() -> Self {
        Self {
            entries: Vec::new(),
            sizes: Vec::new(),
            indices: Vec::new(),
            total: 0,
        }
    }

    fn push(&mut self, entry: ManifestEntry, size: usize, ordinal: usize) {
        self.entries.push(entry);
        self.sizes.push(size);
        self.indices.push(ordinal);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ManifestEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Original line ordinals of the kept records, for label alignment.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

fn log_skipped(bounds: KeepBounds, n_short: usize, n_long: usize) {
    if n_short > 0 || n_long > 0 {
        info!(
            "max_keep={:?}, min_keep={:?}, skipped {} short and {} long",
            bounds.max_keep, bounds.min_keep, n_short, n_long
        );
    }
}
