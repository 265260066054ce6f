use std::path::PathBuf;

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::batch::split_pair;
use crate::config::QaMemnetConfig;
use crate::error::MemnetError;
use crate::model::QaMemnet;

type PairBatch = (Vec<Vec<u32>>, Vec<Vec<u32>>);

/// Accept `[contexts, replies]` as a list or a tuple.
fn extract_pair(batch: &Bound<'_, PyAny>) -> PyResult<PairBatch> {
    let parts: Vec<Vec<Vec<u32>>> = batch.extract()?;
    split_pair(parts).map_err(to_py_err)
}

fn to_py_err(err: MemnetError) -> PyErr {
    if err.is_input_error() {
        PyValueError::new_err(err.to_string())
    } else {
        PyRuntimeError::new_err(err.to_string())
    }
}

/// Context/reply relevance ranker.
#[pyclass(name = "QAMemnet")]
pub struct PyQaMemnet {
    inner: QaMemnet,
}

#[pymethods]
impl PyQaMemnet {
    /// Build from a JSON config string.
    #[new]
    fn new(config_json: &str) -> PyResult<Self> {
        let config = QaMemnetConfig::from_json_str(config_json).map_err(to_py_err)?;
        let inner = QaMemnet::new(config).map_err(to_py_err)?;
        Ok(Self { inner })
    }

    #[staticmethod]
    fn from_file(path: PathBuf) -> PyResult<Self> {
        let inner = QaMemnet::from_config_file(path).map_err(to_py_err)?;
        Ok(Self { inner })
    }

    /// Returns `[loss, accuracy]`.
    fn train_on_batch(&mut self, batch: &Bound<'_, PyAny>, y: Vec<f32>) -> PyResult<Vec<f32>> {
        let (contexts, replies) = extract_pair(batch)?;
        let metrics = self
            .inner
            .train_on_batch(&contexts, &replies, &y)
            .map_err(to_py_err)?;
        Ok(vec![metrics.loss, metrics.accuracy])
    }

    fn predict_score_on_batch(&self, batch: &Bound<'_, PyAny>) -> PyResult<Vec<f32>> {
        let (contexts, replies) = extract_pair(batch)?;
        self.inner
            .predict_score_on_batch(&contexts, &replies)
            .map_err(to_py_err)
    }

    fn rank_replies(&self, context: Vec<u32>, replies: Vec<Vec<u32>>) -> PyResult<Vec<(usize, f32)>> {
        self.inner.rank_replies(&context, &replies).map_err(to_py_err)
    }

    fn load_initial_emb_matrix(&mut self, matrix: Vec<Vec<f32>>) -> PyResult<()> {
        self.inner.load_initial_emb_matrix(&matrix).map_err(to_py_err)
    }

    fn load(&mut self, load_path: PathBuf) -> PyResult<()> {
        self.inner.load(load_path).map_err(to_py_err)
    }

    fn save(&self, save_path: PathBuf) -> PyResult<()> {
        self.inner.save(save_path).map_err(to_py_err)
    }
}

/// Install a stderr tracing subscriber, e.g. `init_logging("qa_memnet=debug")`.
#[pyfunction]
#[pyo3(signature = (level = "info"))]
pub fn init_logging(level: &str) -> PyResult<()> {
    let filter = EnvFilter::try_new(level).map_err(|e| PyValueError::new_err(e.to_string()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| PyRuntimeError::new_err(e.to_string()))
}
