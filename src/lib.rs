pub mod batch;
pub mod config;
pub mod embedder;
pub mod encoder;
pub mod error;
pub mod merge;
pub mod model;
pub mod scoring;
pub mod similarity;

#[cfg(feature = "python")]
mod python;

pub use config::{CellKind, QaMemnetConfig};
pub use error::{MemnetError, Result};
pub use model::{BatchMetrics, QaMemnet};

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
/// Context/reply relevance ranking for a Python training harness.
#[pymodule]
fn qa_memnet(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Model
    m.add_class::<python::PyQaMemnet>()?;

    // Logging
    m.add_function(wrap_pyfunction!(python::init_logging, m)?)?;

    Ok(())
}
