//! Rust data pipeline for MERT-style audio pretraining.
//!
//! Random-access waveform dataset with:
//! - JSONL/TSV manifests with length filtering
//! - Windowed decoding (symphonia) and resampling to the model rate
//! - Optional frame-aligned or sequence label tracks (text or memory-mapped .npy)
//! - Batch collation with padding masks, spectral targets and in-batch noise
//! - Multi-threaded loading, and NumPy batches behind the `python` feature

pub mod augment;
pub mod collate;
pub mod config;
pub mod dataset;
pub mod decode;
pub mod labels;
pub mod loader;
pub mod manifest;
pub mod npy;
pub mod order;
pub mod spectral;
pub mod window;

#[cfg(feature = "python")]
mod python;

pub use collate::{Batch, BatchCollator};
pub use config::{DatasetConfig, LabelConfig};
pub use dataset::{DatasetError, MertDataset, Sample};
pub use loader::{Loader, LoaderConfig};
pub use order::{DistributedContext, OrderingPolicy};
pub use spectral::{CqtTransform, SpectralConfig, SpectralFeatures};

#[cfg(feature = "python")]
use pyo3::types::{PyModule, PyModuleMethods};
#[cfg(feature = "python")]
use pyo3::{Bound, PyResult, pymodule};

/// Python module entry point.
#[cfg(feature = "python")]
#[pymodule]
fn _rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<python::PyMertDataset>()?;
    m.add_class::<python::PyLoader>()?;
    Ok(())
}
