//! Python bindings: the dataset and the pipelined loader, returning batches as
//! dicts of owned NumPy arrays.

use crate::collate::Batch;
use crate::config::DatasetConfig;
use crate::dataset::{DatasetError, MertDataset, Sample};
use crate::decode::DecodeError;
use crate::loader::{Loader, LoaderConfig};

use crossbeam::channel::RecvTimeoutError;
use numpy::{IntoPyArray, PyArray1};
use pyo3::exceptions::{PyIOError, PyIndexError, PyValueError};
use pyo3::types::{PyDict, PyDictMethods, PyList, PyListMethods};
use pyo3::{Bound, PyErr, PyRef, PyResult, Python, pyclass, pymethods};
use std::sync::Arc;
use std::time::Duration;

fn to_py_err(e: DatasetError) -> PyErr {
    match e {
        DatasetError::IndexOutOfRange { .. } => PyIndexError::new_err(e.to_string()),
        DatasetError::Decode(DecodeError::Io(_)) | DatasetError::MaxRetriesExceeded { .. } => {
            PyIOError::new_err(e.to_string())
        }
        _ => PyValueError::new_err(e.to_string()),
    }
}

#[pyclass(name = "MertDataset")]
pub struct PyMertDataset {
    inner: Arc<MertDataset>,
}

#[pymethods]
impl PyMertDataset {
    /// Load a dataset from a JSON task config.
    #[new]
    fn new(config_path: &str) -> PyResult<Self> {
        let config = DatasetConfig::from_json_file(config_path)
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        let inner = MertDataset::new(config).map_err(to_py_err)?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    fn __len__(&self) -> usize {
        self.inner.len()
    }

    fn __getitem__<'py>(&self, py: Python<'py>, index: usize) -> PyResult<Bound<'py, PyDict>> {
        let sample = py.detach(|| self.inner.get(index)).map_err(to_py_err)?;
        sample_dict(py, sample)
    }

    /// Read and collate `indices` into one batch.
    fn batch<'py>(&self, py: Python<'py>, indices: Vec<usize>) -> PyResult<Bound<'py, PyDict>> {
        let batch = py
            .detach(|| {
                let samples = indices
                    .iter()
                    .map(|&i| self.inner.get(i))
                    .collect::<Result<Vec<Sample>, _>>()?;
                self.inner.collate(samples)
            })
            .map_err(to_py_err)?;
        batch_dict(py, batch, self.inner.config().single_target)
    }

    fn ordered_indices<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<usize>> {
        self.inner.ordered_indices().into_pyarray(py)
    }

    fn can_reuse_epoch_itr_across_epochs(&self) -> bool {
        self.inner.can_reuse_epoch_itr_across_epochs()
    }

    fn set_epoch(&self, epoch: i64) {
        self.inner.set_epoch(epoch);
    }

    fn size(&self, index: usize) -> PyResult<usize> {
        self.check_index(index)?;
        Ok(self.inner.size(index))
    }

    fn num_tokens(&self, index: usize) -> PyResult<usize> {
        self.check_index(index)?;
        Ok(self.inner.num_tokens(index))
    }

    /// Start a loader over the current epoch.
    #[pyo3(signature = (batch_size = 8, n_workers = 4, channel_size = 16, drop_last = false, seed = None))]
    fn loader(
        &self,
        batch_size: usize,
        n_workers: usize,
        channel_size: usize,
        drop_last: bool,
        seed: Option<u64>,
    ) -> PyResult<PyLoader> {
        let config = LoaderConfig {
            batch_size,
            n_workers,
            channel_size,
            drop_last,
            seed,
        };
        let inner = Loader::new(Arc::clone(&self.inner), config)
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        Ok(PyLoader {
            inner,
            single_target: self.inner.config().single_target,
        })
    }
}

impl PyMertDataset {
    fn check_index(&self, index: usize) -> PyResult<()> {
        let len = self.inner.len();
        if index >= len {
            return Err(to_py_err(DatasetError::IndexOutOfRange { index, len }));
        }
        Ok(())
    }
}

#[pyclass(name = "Loader")]
pub struct PyLoader {
    inner: Loader,
    single_target: bool,
}

#[pymethods]
impl PyLoader {
    fn __len__(&self) -> usize {
        self.inner.n_batches()
    }

    fn __iter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __next__<'py>(&self, py: Python<'py>) -> PyResult<Option<Bound<'py, PyDict>>> {
        loop {
            // Release GIL for blocking operation
            match py.detach(|| self.inner.recv_timeout(Duration::from_millis(100))) {
                Ok(batch) => {
                    let batch = batch.map_err(to_py_err)?;
                    return Ok(Some(batch_dict(py, batch, self.single_target)?));
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
                // Timeout - check for Python signals (Ctrl-C)
                Err(RecvTimeoutError::Timeout) => py.check_signals()?,
            }
        }
    }
}

fn sample_dict(py: Python<'_>, sample: Sample) -> PyResult<Bound<'_, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("id", sample.id)?;
    dict.set_item("source", sample.source.into_pyarray(py))?;
    dict.set_item("window_start", sample.window_start)?;
    let labels = PyList::empty(py);
    for label in sample.labels {
        labels.append(label.into_pyarray(py))?;
    }
    dict.set_item("label_list", labels)?;
    Ok(dict)
}

fn batch_dict(py: Python<'_>, batch: Batch, single_target: bool) -> PyResult<Bound<'_, PyDict>> {
    let dict = PyDict::new(py);
    let ids: Vec<i64> = batch.ids.iter().map(|&i| i as i64).collect();
    dict.set_item("id", ids.into_pyarray(py))?;
    dict.set_item("source", batch.audio.into_pyarray(py))?;
    dict.set_item("padding_mask", batch.padding_mask.into_pyarray(py))?;
    if let Some(cqt) = batch.spectral_labels {
        dict.set_item("cqt_labels", cqt.into_pyarray(py))?;
    }

    if single_target {
        if let Some(t) = batch.targets.into_iter().next() {
            dict.set_item("target_lengths", t.lengths.into_pyarray(py))?;
            dict.set_item("ntokens", t.ntokens)?;
            dict.set_item("target", t.targets.into_pyarray(py))?;
        }
    } else {
        let targets = PyList::empty(py);
        let lengths = PyList::empty(py);
        let ntokens = PyList::empty(py);
        for t in batch.targets {
            lengths.append(t.lengths.into_pyarray(py))?;
            ntokens.append(t.ntokens)?;
            targets.append(t.targets.into_pyarray(py))?;
        }
        dict.set_item("target_list", targets)?;
        dict.set_item("target_lengths_list", lengths)?;
        dict.set_item("ntokens_list", ntokens)?;
    }
    Ok(dict)
}
