//! Methods that turn an ordered batch of artifacts into one result.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use garde::Validate;

use super::{base_name, report, InputArity, MethodHandler, RawParams, ResultName, Validated, ValidationError};
use crate::models::job::{Job, JobView};
use crate::models::params::{CollageParams, MergeParams, MethodParams};
use crate::services::processors::{ExecutionError, Processor};

pub fn handlers(
    raster: Arc<dyn Processor>,
    pdf: Arc<dyn Processor>,
) -> Vec<Arc<dyn MethodHandler>> {
    vec![
        Arc::new(Collage { processor: raster }),
        Arc::new(PdfMerge { processor: pdf }),
    ]
}

/// Grid of 2–16 images.
pub struct Collage {
    processor: Arc<dyn Processor>,
}

#[async_trait]
impl MethodHandler for Collage {
    fn name(&self) -> &'static str {
        "collage"
    }

    fn arity(&self) -> InputArity {
        InputArity::Multi { min: 2, max: 16 }
    }

    fn checks_raster(&self) -> bool {
        false
    }

    fn validate(&self, raw: &RawParams, input_count: usize) -> Result<Validated, ValidationError> {
        let grid = |key: &str| -> Result<u32, ValidationError> {
            match raw.option_int(key)?.unwrap_or(2) {
                v @ 1..=4 => Ok(v as u32),
                _ => Err(ValidationError(format!("{key} must be between 1 and 4"))),
            }
        };
        let grid_rows = grid("grid_rows")?;
        let grid_cols = grid("grid_cols")?;
        if (grid_rows * grid_cols) as usize > input_count {
            return Err(ValidationError(format!(
                "collage grid {grid_rows}x{grid_cols} needs {} images, got {input_count}",
                grid_rows * grid_cols
            )));
        }

        let spacing = match raw.option_int("spacing")?.unwrap_or(10) {
            v @ 0..=200 => v as u32,
            _ => return Err(ValidationError::new("spacing must be between 0 and 200")),
        };
        let background = raw
            .option_str("background")?
            .filter(|s| !s.is_empty())
            .unwrap_or("#ffffff")
            .to_lowercase();

        let params = CollageParams {
            grid_rows,
            grid_cols,
            spacing,
            background,
            input_count,
        };
        report(params.validate())?;
        Ok(Validated::plain(MethodParams::Collage(params)))
    }

    async fn execute(
        &self,
        job: &JobView<'_>,
        input: &Path,
        output: &Path,
    ) -> Result<(), ExecutionError> {
        self.processor.execute(job, input, output).await
    }

    fn result_name(&self, job: &Job) -> ResultName {
        ResultName::png(format!("{}_collage.png", base_name(&job.original_filename)))
    }

    fn progress_detail(&self, job: &Job) -> String {
        format!(
            "Arranging {} images\u{2026}",
            job.input_count().unwrap_or_default()
        )
    }
}

/// Concatenate 2–20 PDFs in upload order.
pub struct PdfMerge {
    processor: Arc<dyn Processor>,
}

#[async_trait]
impl MethodHandler for PdfMerge {
    fn name(&self) -> &'static str {
        "pdf_merge"
    }

    fn arity(&self) -> InputArity {
        InputArity::Multi { min: 2, max: 20 }
    }

    fn checks_raster(&self) -> bool {
        false
    }

    fn validate(&self, _raw: &RawParams, input_count: usize) -> Result<Validated, ValidationError> {
        Ok(Validated::plain(MethodParams::PdfMerge(MergeParams {
            input_count,
        })))
    }

    async fn execute(
        &self,
        job: &JobView<'_>,
        input: &Path,
        output: &Path,
    ) -> Result<(), ExecutionError> {
        self.processor.execute(job, input, output).await
    }

    fn result_name(&self, job: &Job) -> ResultName {
        ResultName {
            filename: format!("{}_merged.pdf", base_name(&job.original_filename)),
            media_type: "application/pdf",
        }
    }

    fn output_file(&self, _job: &Job) -> &'static str {
        "output.pdf"
    }

    fn progress_detail(&self, _job: &Job) -> String {
        "Merging PDFs\u{2026}".to_string()
    }
}
