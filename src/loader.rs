//! Pipelined batch loader.
//!
//! Architecture:
//! Index Thread -> Index Channel -> Worker Threads -> Batch Channel -> Caller
//!
//! - Index thread walks one epoch of `ordered_indices()` in batch-sized chunks
//! - Workers read, decode and collate whole batches in parallel
//! - Batches arrive in completion order, not index order
//!
//! Each chunk is collated with an RNG seeded from the loader seed and the
//! chunk number, so a chunk's augmentation and crops do not depend on which
//! worker picked it up.

use crate::collate::Batch;
use crate::dataset::{DatasetError, MertDataset, Sample};

use crossbeam::channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LoaderError {
    #[error("{0} must be > 0")]
    Zero(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub n_workers: usize,
    /// Capacity of both the index and the batch channel.
    pub channel_size: usize,
    /// Skip a trailing chunk smaller than `batch_size`.
    pub drop_last: bool,
    /// Per-chunk RNG seed; drawn from entropy when `None`.
    pub seed: Option<u64>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            n_workers: 4,
            channel_size: 16,
            drop_last: false,
            seed: None,
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<(), LoaderError> {
        if self.batch_size == 0 {
            return Err(LoaderError::Zero("batch_size"));
        }
        if self.n_workers == 0 {
            return Err(LoaderError::Zero("n_workers"));
        }
        if self.channel_size == 0 {
            return Err(LoaderError::Zero("channel_size"));
        }
        Ok(())
    }
}

/// Chunk of indices plus its position in the epoch.
struct IndexChunk {
    number: u64,
    indices: Vec<usize>,
}

/// Iterates the batches of one epoch.
pub struct Loader {
    batch_rx: Receiver<Result<Batch, DatasetError>>,
    n_batches: usize,
    shutdown: Arc<AtomicBool>,
    index_handle: Option<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl Loader {
    /// Start loading the current epoch of `dataset`.
    pub fn new(dataset: Arc<MertDataset>, config: LoaderConfig) -> Result<Self, LoaderError> {
        config.validate()?;

        let order = dataset.ordered_indices();
        let seed = config.seed.unwrap_or_else(rand::random);
        let chunks = chunk_indices(order, config.batch_size, config.drop_last);
        let n_batches = chunks.len();
        debug!(
            "loader: epoch {}, {n_batches} batches, {} workers",
            dataset.epoch(),
            config.n_workers
        );

        let (index_tx, index_rx) = bounded(config.channel_size);
        let (batch_tx, batch_rx) = bounded(config.channel_size);
        let shutdown = Arc::new(AtomicBool::new(false));

        let index_handle = {
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || index_thread_main(chunks, index_tx, shutdown))
        };

        // Workers own the only batch senders: the batch channel disconnects
        // once all of them have exited.
        let worker_handles = (0..config.n_workers)
            .map(|_| {
                let dataset = Arc::clone(&dataset);
                let index_rx = index_rx.clone();
                let batch_tx = batch_tx.clone();
                let shutdown = Arc::clone(&shutdown);
                thread::spawn(move || worker_thread_main(dataset, index_rx, batch_tx, seed, shutdown))
            })
            .collect();

        Ok(Self {
            batch_rx,
            n_batches,
            shutdown,
            index_handle: Some(index_handle),
            worker_handles,
        })
    }

    /// Number of batches this epoch yields.
    pub fn n_batches(&self) -> usize {
        self.n_batches
    }

    /// Wait at most `timeout` for the next batch.
    /// `Err(RecvTimeoutError::Disconnected)` marks the end of the epoch.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Result<Batch, DatasetError>, RecvTimeoutError> {
        self.batch_rx.recv_timeout(timeout)
    }

    fn stop_pipeline(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(h) = self.index_handle.take() {
            let _ = h.join();
        }
        for h in self.worker_handles.drain(..) {
            let _ = h.join();
        }
    }
}

impl Iterator for Loader {
    type Item = Result<Batch, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.batch_rx.recv().ok()
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.stop_pipeline();
    }
}

fn chunk_indices(order: Vec<usize>, batch_size: usize, drop_last: bool) -> Vec<IndexChunk> {
    order
        .chunks(batch_size)
        .filter(|c| !drop_last || c.len() == batch_size)
        .enumerate()
        .map(|(number, indices)| IndexChunk {
            number: number as u64,
            indices: indices.to_vec(),
        })
        .collect()
}

// --- Index Thread ---

fn index_thread_main(chunks: Vec<IndexChunk>, index_tx: Sender<IndexChunk>, shutdown: Arc<AtomicBool>) {
    for chunk in chunks {
        if !send_with_shutdown(&index_tx, &shutdown, chunk) {
            return;
        }
    }
}

/// Send with retry on timeout, checking shutdown between attempts.
fn send_with_shutdown<T>(tx: &Sender<T>, shutdown: &AtomicBool, mut item: T) -> bool {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        match tx.send_timeout(item, POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => item = returned,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

// --- Worker Thread ---

fn worker_thread_main(
    dataset: Arc<MertDataset>,
    index_rx: Receiver<IndexChunk>,
    batch_tx: Sender<Result<Batch, DatasetError>>,
    seed: u64,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let chunk = match index_rx.recv_timeout(POLL) {
            Ok(c) => c,
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let mut rng = StdRng::seed_from_u64(splitmix64(seed ^ chunk.number));
        let batch = load_batch(&dataset, &chunk.indices, &mut rng);
        if let Err(e) = &batch {
            warn!("loader: batch {} failed: {e}", chunk.number);
        }

        if !send_with_shutdown(&batch_tx, &shutdown, batch) {
            return;
        }
    }
}

fn load_batch(
    dataset: &MertDataset,
    indices: &[usize],
    rng: &mut StdRng,
) -> Result<Batch, DatasetError> {
    let samples = indices
        .iter()
        .map(|&i| dataset.get_with_rng(i, rng))
        .collect::<Result<Vec<Sample>, _>>()?;
    dataset.collate_with_rng(samples, rng)
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
