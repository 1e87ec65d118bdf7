//! Methods served by the remote inference processor.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::{base_name, InputArity, MethodHandler, RawParams, ResultName, Validated, ValidationError};
use crate::models::job::{Job, JobView};
use crate::models::params::MethodParams;
use crate::services::processors::{ExecutionError, Processor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Upscale,
    BackgroundRemove,
    Restore,
    Denoise,
}

/// A learned-model method. The four upscalers share one kind and differ by name.
pub struct LearnedMethod {
    name: &'static str,
    label: &'static str,
    kind: Kind,
    processor: Arc<dyn Processor>,
}

pub fn handlers(processor: Arc<dyn Processor>) -> Vec<Arc<dyn MethodHandler>> {
    [
        ("real_esrgan", "Real-ESRGAN", Kind::Upscale),
        ("esrgan", "ESRGAN (RRDB)", Kind::Upscale),
        ("real_esrgan_anime", "Anime (Real-ESRGAN)", Kind::Upscale),
        ("swinir", "SwinIR", Kind::Upscale),
        ("background_remove", "Background remove", Kind::BackgroundRemove),
        ("restore", "Restore & colorize", Kind::Restore),
        ("denoise", "Denoise", Kind::Denoise),
    ]
    .into_iter()
    .map(|(name, label, kind)| {
        Arc::new(LearnedMethod {
            name,
            label,
            kind,
            processor: processor.clone(),
        }) as Arc<dyn MethodHandler>
    })
    .collect()
}

impl LearnedMethod {
    fn unit_scale(&self, raw: &RawParams) -> Result<(), ValidationError> {
        match raw.scale {
            None | Some(1) => Ok(()),
            Some(_) => Err(ValidationError(format!(
                "scale must be 1 for {}",
                self.label.to_lowercase()
            ))),
        }
    }
}

#[async_trait]
impl MethodHandler for LearnedMethod {
    fn name(&self) -> &'static str {
        self.name
    }

    fn arity(&self) -> InputArity {
        InputArity::Single
    }

    fn validate(&self, raw: &RawParams, _input_count: usize) -> Result<Validated, ValidationError> {
        match self.kind {
            Kind::Upscale => {
                let scale = raw.scale.unwrap_or(4);
                if scale != 2 && scale != 4 {
                    return Err(ValidationError::new("scale must be 2 or 4"));
                }
                Ok(Validated {
                    scale: scale as i32,
                    params: MethodParams::Upscale,
                    denoise_first: raw.denoise_first,
                    face_enhance: raw.face_enhance,
                })
            }
            Kind::BackgroundRemove => {
                self.unit_scale(raw)?;
                Ok(Validated {
                    denoise_first: raw.denoise_first,
                    ..Validated::plain(MethodParams::BackgroundRemove)
                })
            }
            Kind::Restore => {
                self.unit_scale(raw)?;
                Ok(Validated::plain(MethodParams::Restore))
            }
            Kind::Denoise => Ok(Validated::plain(MethodParams::Denoise)),
        }
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
        let suffix = match self.kind {
            Kind::Upscale => "upscaled",
            Kind::BackgroundRemove => "nobg",
            Kind::Restore => "restored",
            Kind::Denoise => "denoised",
        };
        ResultName::png(format!("{}_{suffix}.png", base_name(&job.original_filename)))
    }

    fn progress_detail(&self, job: &Job) -> String {
        match self.kind {
            Kind::Upscale => format!(
                "Running {} ({}\u{d7}), may take several minutes\u{2026}",
                self.label, job.scale
            ),
            Kind::Denoise => "Denoising\u{2026}".to_string(),
            _ => format!("Running {}\u{2026}", self.label),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{raw, registry};
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    #[test]
    fn test_upscale_accepts_only_two_or_four() {
        let handler = registry().lookup("real_esrgan").unwrap();
        for (scale, ok) in [(2, true), (4, true), (3, false), (1, false), (8, false)] {
            let params = RawParams {
                scale: Some(scale),
                ..RawParams::default()
            };
            assert_eq!(handler.validate(&params, 1).is_ok(), ok, "scale {scale}");
        }
        let err = handler
            .validate(
                &RawParams {
                    scale: Some(3),
                    ..RawParams::default()
                },
                1,
            )
            .unwrap_err();
        assert_eq!(err.0, "scale must be 2 or 4");
    }

    #[test]
    fn test_upscale_keeps_flags() {
        let handler = registry().lookup("swinir").unwrap();
        let validated = handler
            .validate(
                &RawParams {
                    scale: Some(2),
                    denoise_first: true,
                    face_enhance: true,
                    ..RawParams::default()
                },
                1,
            )
            .unwrap();
        assert_eq!(validated.scale, 2);
        assert!(validated.denoise_first && validated.face_enhance);
    }

    #[test]
    fn test_background_remove_requires_unit_scale() {
        let handler = registry().lookup("background_remove").unwrap();
        let err = handler
            .validate(
                &RawParams {
                    scale: Some(4),
                    ..RawParams::default()
                },
                1,
            )
            .unwrap_err();
        assert_eq!(err.0, "scale must be 1 for background remove");

        let ok = handler
            .validate(
                &RawParams {
                    scale: Some(1),
                    denoise_first: true,
                    face_enhance: true,
                    ..RawParams::default()
                },
                1,
            )
            .unwrap();
        assert!(ok.denoise_first);
        assert!(!ok.face_enhance);
    }

    #[test]
    fn test_denoise_forces_unit_scale_and_clears_flags() {
        let handler = registry().lookup("denoise").unwrap();
        let mut params = raw(json!({}));
        params.scale = Some(4);
        params.face_enhance = true;
        let validated = handler.validate(&params, 1).unwrap();
        assert_eq!(validated, Validated::plain(MethodParams::Denoise));
    }

    #[test]
    fn test_result_names() {
        let registry = registry();
        let draft = crate::models::job::JobDraft {
            method: "restore".to_string(),
            original_filename: "grandma.scan.jpg".to_string(),
            scale: 1,
            params: MethodParams::Restore,
            denoise_first: false,
            face_enhance: false,
        };
        let job = Job::queued(draft, Utc::now(), Duration::minutes(60));
        let name = registry.lookup("restore").unwrap().result_name(&job);
        assert_eq!(name.filename, "grandma.scan_restored.png");
        assert_eq!(name.media_type, "image/png");

        let name = registry.lookup("background_remove").unwrap().result_name(&job);
        assert_eq!(name.filename, "grandma.scan_nobg.png");
    }
}
