//! Single-input methods executed by the native raster processor.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use garde::Validate;

use super::{base_name, report, MethodHandler, RawParams, ResultName, Validated, ValidationError};
use crate::models::job::{Job, JobView};
use crate::models::params::{
    CompressParams, ConvertParams, CropParams, MethodParams, ResizeFit, ResizeParams,
    RotateFlipParams, TargetFormat,
};
use crate::services::processors::{ExecutionError, Processor};

const CONVERT_FORMATS: [TargetFormat; 3] = [TargetFormat::Webp, TargetFormat::Png, TargetFormat::Jpeg];
const COMPRESS_FORMATS: [TargetFormat; 2] = [TargetFormat::Webp, TargetFormat::Jpeg];
const MAX_DIMENSION: i64 = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Convert,
    Compress,
    Resize,
    RotateFlip,
    Crop,
    StripMetadata,
}

pub struct RasterMethod {
    operation: Operation,
    processor: Arc<dyn Processor>,
}

pub fn handlers(processor: Arc<dyn Processor>) -> Vec<Arc<dyn MethodHandler>> {
    [
        Operation::Convert,
        Operation::Compress,
        Operation::Resize,
        Operation::RotateFlip,
        Operation::Crop,
        Operation::StripMetadata,
    ]
    .into_iter()
    .map(|operation| {
        Arc::new(RasterMethod {
            operation,
            processor: processor.clone(),
        }) as Arc<dyn MethodHandler>
    })
    .collect()
}

fn dimension(raw: &RawParams, key: &str) -> Result<Option<u32>, ValidationError> {
    match raw.option_int(key)? {
        None => Ok(None),
        Some(v) if (1..=MAX_DIMENSION).contains(&v) => Ok(Some(v as u32)),
        Some(_) => Err(ValidationError(format!(
            "{key} must be between 1 and {MAX_DIMENSION}"
        ))),
    }
}

fn required_int(raw: &RawParams, key: &str) -> Result<i64, ValidationError> {
    raw.option_int(key)?
        .ok_or_else(|| ValidationError(format!("crop requires option: {key}")))
}

fn validate_resize(raw: &RawParams) -> Result<MethodParams, ValidationError> {
    let max_width = dimension(raw, "max_width")?;
    let max_height = dimension(raw, "max_height")?;
    if max_width.is_none() && max_height.is_none() {
        return Err(ValidationError::new(
            "resize requires at least one of max_width, max_height",
        ));
    }
    let fit = match raw.option_str("fit")? {
        None => ResizeFit::default(),
        Some(fit) => fit
            .parse()
            .map_err(|_| ValidationError::new("fit must be one of: inside, exact, fill"))?,
    };
    let params = ResizeParams {
        max_width,
        max_height,
        fit,
    };
    report(params.validate())?;
    Ok(MethodParams::Resize(params))
}

fn validate_rotate_flip(raw: &RawParams) -> Result<MethodParams, ValidationError> {
    let rotate = raw.option_int("rotate")?.unwrap_or(0);
    if ![0, 90, 180, 270].contains(&rotate) {
        return Err(ValidationError::new("rotate must be 0, 90, 180, or 270"));
    }
    let params = RotateFlipParams {
        rotate: rotate as u16,
        flip_h: raw.option_bool("flip_h")?,
        flip_v: raw.option_bool("flip_v")?,
    };
    report(params.validate())?;
    Ok(MethodParams::RotateFlip(params))
}

fn validate_crop(raw: &RawParams) -> Result<MethodParams, ValidationError> {
    let x = required_int(raw, "x")?;
    let y = required_int(raw, "y")?;
    let width = required_int(raw, "width")?;
    let height = required_int(raw, "height")?;
    let in_range = |v: i64, min: i64| (min..=u32::MAX as i64).contains(&v);
    if !(in_range(x, 0) && in_range(y, 0) && in_range(width, 1) && in_range(height, 1)) {
        return Err(ValidationError::new(
            "crop x,y must be >= 0; width, height must be >= 1",
        ));
    }
    let params = CropParams {
        x: x as u32,
        y: y as u32,
        width: width as u32,
        height: height as u32,
    };
    report(params.validate())?;
    Ok(MethodParams::Crop(params))
}

#[async_trait]
impl MethodHandler for RasterMethod {
    fn name(&self) -> &'static str {
        match self.operation {
            Operation::Convert => "convert",
            Operation::Compress => "compress",
            Operation::Resize => "resize",
            Operation::RotateFlip => "rotate_flip",
            Operation::Crop => "crop",
            Operation::StripMetadata => "strip_metadata",
        }
    }

    fn validate(&self, raw: &RawParams, _input_count: usize) -> Result<Validated, ValidationError> {
        let params = match self.operation {
            Operation::Convert => {
                let params = ConvertParams {
                    target_format: raw.target_format(&CONVERT_FORMATS, "convert")?,
                    quality: raw.quality()?,
                };
                report(params.validate())?;
                MethodParams::Convert(params)
            }
            Operation::Compress => {
                let target_format = raw.target_format(&COMPRESS_FORMATS, "compress")?;
                let quality = raw
                    .quality()?
                    .ok_or_else(|| ValidationError::new("quality required for compress (1\u{2013}100)"))?;
                let params = CompressParams {
                    target_format,
                    quality,
                };
                report(params.validate())?;
                MethodParams::Compress(params)
            }
            Operation::Resize => validate_resize(raw)?,
            Operation::RotateFlip => validate_rotate_flip(raw)?,
            Operation::Crop => validate_crop(raw)?,
            Operation::StripMetadata => MethodParams::StripMetadata,
        };
        Ok(Validated::plain(params))
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
        let base = base_name(&job.original_filename);
        match (&job.params, self.operation) {
            (MethodParams::Convert(p), _) => ResultName {
                filename: format!("{base}_converted.{}", p.target_format.extension()),
                media_type: p.target_format.media_type(),
            },
            (MethodParams::Compress(p), _) => ResultName {
                filename: format!("{base}_compressed.{}", p.target_format.extension()),
                media_type: p.target_format.media_type(),
            },
            (_, Operation::Convert) => ResultName::png(format!("{base}_converted.png")),
            (_, Operation::Compress) => ResultName::png(format!("{base}_compressed.png")),
            (_, Operation::Resize) => ResultName::png(format!("{base}_resized.png")),
            (_, Operation::RotateFlip) => ResultName::png(format!("{base}_rotated.png")),
            (_, Operation::Crop) => ResultName::png(format!("{base}_cropped.png")),
            (_, Operation::StripMetadata) => ResultName::png(format!("{base}_stripped.png")),
        }
    }

    fn output_file(&self, job: &Job) -> &'static str {
        match &job.params {
            MethodParams::Convert(ConvertParams { target_format, .. })
            | MethodParams::Compress(CompressParams { target_format, .. }) => match target_format {
                TargetFormat::Webp => "output.webp",
                TargetFormat::Png => "output.png",
                TargetFormat::Jpeg => "output.jpeg",
            },
            _ => "output.png",
        }
    }

    fn progress_detail(&self, job: &Job) -> String {
        match (&job.params, self.operation) {
            (MethodParams::Convert(p), _) => format!("Converting to {}\u{2026}", p.target_format),
            (MethodParams::Compress(p), _) => format!("Compressing to {}\u{2026}", p.target_format),
            (_, Operation::Resize) => "Resizing\u{2026}".to_string(),
            (_, Operation::RotateFlip) => "Rotating & flipping\u{2026}".to_string(),
            (_, Operation::Crop) => "Cropping\u{2026}".to_string(),
            (_, Operation::StripMetadata) => "Stripping metadata\u{2026}".to_string(),
            (_, _) => format!("Running {}\u{2026}", self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{raw, registry};
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn validate(method: &str, params: RawParams) -> Result<Validated, ValidationError> {
        registry().lookup(method).unwrap().validate(&params, 1)
    }

    #[test]
    fn test_convert_requires_known_format() {
        let err = validate("convert", RawParams::default()).unwrap_err();
        assert_eq!(err.0, "target_format required for convert, one of: webp, png, jpeg");

        let ok = validate(
            "convert",
            RawParams {
                target_format: Some("jpeg".to_string()),
                quality: Some("85".to_string()),
                ..RawParams::default()
            },
        )
        .unwrap();
        assert_eq!(
            ok.params,
            MethodParams::Convert(ConvertParams {
                target_format: TargetFormat::Jpeg,
                quality: Some(85),
            })
        );
    }

    #[test]
    fn test_convert_rejects_bad_quality() {
        for quality in ["0", "101", "high"] {
            let result = validate(
                "convert",
                RawParams {
                    target_format: Some("png".to_string()),
                    quality: Some(quality.to_string()),
                    ..RawParams::default()
                },
            );
            assert!(result.is_err(), "quality {quality}");
        }
    }

    #[test]
    fn test_compress_requires_quality_and_lossy_format() {
        let png = RawParams {
            target_format: Some("png".to_string()),
            quality: Some("50".to_string()),
            ..RawParams::default()
        };
        assert!(validate("compress", png).is_err());

        let missing_quality = RawParams {
            target_format: Some("webp".to_string()),
            ..RawParams::default()
        };
        assert!(validate("compress", missing_quality).is_err());
    }

    #[test]
    fn test_resize_rules() {
        assert!(validate("resize", raw(json!({}))).is_err());
        assert!(validate("resize", raw(json!({"max_width": 0}))).is_err());
        assert!(validate("resize", raw(json!({"max_width": 16385}))).is_err());
        assert!(validate("resize", raw(json!({"max_width": 100, "fit": "stretch"}))).is_err());

        let ok = validate("resize", raw(json!({"max_height": "600"}))).unwrap();
        assert_eq!(
            ok.params,
            MethodParams::Resize(ResizeParams {
                max_width: None,
                max_height: Some(600),
                fit: ResizeFit::Inside,
            })
        );
    }

    #[test]
    fn test_rotate_flip_rules() {
        assert!(validate("rotate_flip", raw(json!({"rotate": 45}))).is_err());
        let ok = validate("rotate_flip", raw(json!({"flip_h": true}))).unwrap();
        assert_eq!(
            ok.params,
            MethodParams::RotateFlip(RotateFlipParams {
                rotate: 0,
                flip_h: true,
                flip_v: false,
            })
        );
    }

    #[test]
    fn test_crop_requires_all_fields() {
        let err = validate("crop", raw(json!({"x": 0, "y": 0, "width": 10}))).unwrap_err();
        assert_eq!(err.0, "crop requires option: height");
        assert!(validate("crop", raw(json!({"x": -1, "y": 0, "width": 1, "height": 1}))).is_err());
        assert!(validate("crop", raw(json!({"x": 0, "y": 0, "width": 0, "height": 1}))).is_err());
        assert!(validate("crop", raw(json!({"x": 5, "y": 5, "width": 1, "height": 1}))).is_ok());
    }

    #[test]
    fn test_raster_methods_clear_cross_cutting_flags() {
        let params = RawParams {
            scale: Some(4),
            denoise_first: true,
            face_enhance: true,
            ..RawParams::default()
        };
        let validated = validate("strip_metadata", params).unwrap();
        assert_eq!(validated, Validated::plain(MethodParams::StripMetadata));
    }

    #[test]
    fn test_convert_result_name_and_output_file_follow_format() {
        let registry = registry();
        let handler = registry.lookup("convert").unwrap();
        let draft = crate::models::job::JobDraft {
            method: "convert".to_string(),
            original_filename: "cat.png".to_string(),
            scale: 1,
            params: MethodParams::Convert(ConvertParams {
                target_format: TargetFormat::Webp,
                quality: None,
            }),
            denoise_first: false,
            face_enhance: false,
        };
        let job = Job::queued(draft, Utc::now(), Duration::minutes(60));
        let name = handler.result_name(&job);
        assert_eq!(name.filename, "cat_converted.webp");
        assert_eq!(name.media_type, "image/webp");
        assert_eq!(handler.output_file(&job), "output.webp");
        assert_eq!(handler.progress_detail(&job), "Converting to webp\u{2026}");
    }
}
