use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::models::job::JobView;

pub mod command;
pub mod inference;
pub mod raster;

pub use command::CommandProcessor;
pub use inference::InferenceProcessor;
pub use raster::RasterProcessor;

/// Runs the actual transformation for a job.
///
/// `input` is a file for single-input jobs and a directory holding `0..n` for
/// multi-input jobs. Implementations write exactly one artifact to `output`.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn execute(
        &self,
        job: &JobView<'_>,
        input: &Path,
        output: &Path,
    ) -> Result<(), ExecutionError>;
}

/// The processors a registry dispatches to.
#[derive(Clone)]
pub struct Processors {
    pub raster: Arc<dyn Processor>,
    pub inference: Arc<dyn Processor>,
    pub pdf: Arc<dyn Processor>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("Input missing: {0}")]
    MissingInput(String),

    #[error("{method} timed out after {secs}s")]
    Timeout { method: String, secs: u64 },

    #[error("Processor unavailable: {0}")]
    Unavailable(String),

    #[error("{method} does not support {detail}")]
    Unsupported { method: String, detail: String },

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
