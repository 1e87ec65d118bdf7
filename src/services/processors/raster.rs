use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader, Rgb, RgbImage};

use super::{ExecutionError, Processor};
use crate::models::job::JobView;
use crate::models::params::{
    parse_hex_color, CollageParams, CropParams, MethodParams, ResizeFit, ResizeParams,
    RotateFlipParams, TargetFormat,
};

/// Native raster operations built on the `image` crate.
///
/// Decoding and encoding are CPU bound, so every job runs on the blocking pool.
#[derive(Debug, Clone, Copy)]
pub struct RasterProcessor {
    /// Ceiling for collage members and the assembled canvas, which skip the worker pre-flight.
    max_pixels: u64,
}

impl RasterProcessor {
    pub fn new(max_megapixels: u64) -> Self {
        Self {
            max_pixels: max_megapixels.saturating_mul(1_000_000),
        }
    }
}

#[async_trait]
impl Processor for RasterProcessor {
    async fn execute(
        &self,
        job: &JobView<'_>,
        input: &Path,
        output: &Path,
    ) -> Result<(), ExecutionError> {
        let method = job.method.to_string();
        let params = job.params.clone();
        let input = input.to_path_buf();
        let output = output.to_path_buf();
        let max_pixels = self.max_pixels;

        tokio::task::spawn_blocking(move || run(&method, &params, &input, &output, max_pixels))
            .await
            .map_err(|e| ExecutionError::Failed(format!("raster task aborted: {e}")))?
    }
}

fn run(
    method: &str,
    params: &MethodParams,
    input: &Path,
    output: &Path,
    max_pixels: u64,
) -> Result<(), ExecutionError> {
    match params {
        MethodParams::Collage(collage_params) => {
            let images = load_members(input, collage_params.input_count, max_pixels)?;
            let out = collage(&images, collage_params, max_pixels)?;
            write_png(&DynamicImage::ImageRgb8(out), output)
        }
        MethodParams::Convert(p) => encode(&decode(input)?, p.target_format, p.quality, output),
        MethodParams::Compress(p) => encode(&decode(input)?, p.target_format, Some(p.quality), output),
        MethodParams::Resize(p) => write_png(&resize(decode(input)?, p), output),
        MethodParams::RotateFlip(p) => write_png(&rotate_flip(decode(input)?, p), output),
        MethodParams::Crop(p) => write_png(&crop(&decode(input)?, p)?, output),
        MethodParams::StripMetadata => write_png(&decode(input)?, output),
        other => Err(ExecutionError::Unsupported {
            method: method.to_string(),
            detail: format!("{other:?} on the raster processor"),
        }),
    }
}

pub(crate) fn decode(path: &Path) -> Result<DynamicImage, ExecutionError> {
    if !path.is_file() {
        return Err(ExecutionError::MissingInput(path.display().to_string()));
    }
    Ok(ImageReader::open(path)?.with_guessed_format()?.decode()?)
}

fn load_members(
    dir: &Path,
    count: usize,
    max_pixels: u64,
) -> Result<Vec<DynamicImage>, ExecutionError> {
    (0..count)
        .map(|n| {
            let path = dir.join(n.to_string());
            if let Some((width, height)) = dimensions(&path) {
                if u64::from(width) * u64::from(height) > max_pixels {
                    return Err(ExecutionError::Failed(format!(
                        "Collage image {} exceeds {} megapixels",
                        n + 1,
                        max_pixels / 1_000_000
                    )));
                }
            }
            decode(&path)
        })
        .collect()
}

fn write_png(image: &DynamicImage, output: &Path) -> Result<(), ExecutionError> {
    ensure_parent(output)?;
    image.save_with_format(output, ImageFormat::Png)?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<(), ExecutionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Encode into the requested format. WebP output is lossless; `quality` only affects JPEG.
fn encode(
    image: &DynamicImage,
    format: TargetFormat,
    quality: Option<u8>,
    output: &Path,
) -> Result<(), ExecutionError> {
    ensure_parent(output)?;
    match format {
        TargetFormat::Png => write_png(image, output),
        TargetFormat::Jpeg => {
            let mut writer = BufWriter::new(File::create(output)?);
            let encoder = JpegEncoder::new_with_quality(&mut writer, quality.unwrap_or(90));
            DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
            Ok(())
        }
        TargetFormat::Webp => {
            let mut writer = BufWriter::new(File::create(output)?);
            let encoder = WebPEncoder::new_lossless(&mut writer);
            DynamicImage::ImageRgba8(image.to_rgba8()).write_with_encoder(encoder)?;
            Ok(())
        }
    }
}

fn resize(image: DynamicImage, params: &ResizeParams) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    let box_width = params.max_width.unwrap_or(width);
    let box_height = params.max_height.unwrap_or(height);

    match params.fit {
        ResizeFit::Inside => {
            let ratio = f64::min(
                box_width as f64 / width as f64,
                box_height as f64 / height as f64,
            );
            let target_width = ((width as f64 * ratio).round() as u32).max(1);
            let target_height = ((height as f64 * ratio).round() as u32).max(1);
            if (target_width, target_height) == (width, height) {
                image
            } else {
                image.resize_exact(target_width, target_height, FilterType::Lanczos3)
            }
        }
        ResizeFit::Exact => image.resize_exact(box_width, box_height, FilterType::Lanczos3),
        ResizeFit::Fill => image.resize_to_fill(box_width, box_height, FilterType::Lanczos3),
    }
}

/// Rotation is clockwise and applied before flips.
fn rotate_flip(image: DynamicImage, params: &RotateFlipParams) -> DynamicImage {
    let mut image = match params.rotate {
        90 => image.rotate90(),
        180 => image.rotate180(),
        270 => image.rotate270(),
        _ => image,
    };
    if params.flip_h {
        image = image.fliph();
    }
    if params.flip_v {
        image = image.flipv();
    }
    image
}

/// Crop, clamping the rectangle to the image bounds.
fn crop(image: &DynamicImage, params: &CropParams) -> Result<DynamicImage, ExecutionError> {
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(ExecutionError::Failed("Image has no pixels".to_string()));
    }
    let left = params.x.min(width - 1);
    let top = params.y.min(height - 1);
    let right = width.min(left.saturating_add(params.width));
    let bottom = height.min(top.saturating_add(params.height));
    if right <= left || bottom <= top {
        return Err(ExecutionError::Failed(
            "Crop region is empty or outside image".to_string(),
        ));
    }
    Ok(image.crop_imm(left, top, right - left, bottom - top))
}

/// Lay images out row-major on a grid of equal cells, each centered in its cell.
fn collage(
    images: &[DynamicImage],
    params: &CollageParams,
    max_pixels: u64,
) -> Result<RgbImage, ExecutionError> {
    let cells = (params.grid_rows * params.grid_cols) as usize;
    if images.len() < cells {
        return Err(ExecutionError::Failed(format!(
            "Not enough images: got {}, need {cells}",
            images.len()
        )));
    }
    let images = &images[..cells];
    let background = parse_hex_color(&params.background).unwrap_or([255, 255, 255]);

    let cell_width = images.iter().map(|i| i.width()).max().unwrap_or(1);
    let cell_height = images.iter().map(|i| i.height()).max().unwrap_or(1);
    let spacing = params.spacing;
    let too_large = || {
        ExecutionError::Failed(format!(
            "Collage canvas exceeds {} megapixels",
            max_pixels / 1_000_000
        ))
    };
    let out_width = canvas_span(params.grid_cols, cell_width, spacing).ok_or_else(too_large)?;
    let out_height = canvas_span(params.grid_rows, cell_height, spacing).ok_or_else(too_large)?;
    if u64::from(out_width) * u64::from(out_height) > max_pixels {
        return Err(too_large());
    }

    let mut canvas = RgbImage::from_pixel(out_width, out_height, Rgb(background));
    for (idx, image) in images.iter().enumerate() {
        let row = idx as u32 / params.grid_cols;
        let col = idx as u32 % params.grid_cols;
        let x = spacing + col * (cell_width + spacing) + (cell_width - image.width()) / 2;
        let y = spacing + row * (cell_height + spacing) + (cell_height - image.height()) / 2;
        imageops::overlay(&mut canvas, &image.to_rgb8(), x as i64, y as i64);
    }
    Ok(canvas)
}

/// `cells` cells of `cell` pixels with `spacing` around and between them.
fn canvas_span(cells: u32, cell: u32, spacing: u32) -> Option<u32> {
    cells
        .checked_mul(cell)?
        .checked_add(cells.checked_add(1)?.checked_mul(spacing)?)
}

/// Width and height from the image header without decoding pixels.
pub fn dimensions(path: &Path) -> Option<(u32, u32)> {
    ImageReader::open(path)
        .ok()?
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// Same as [`dimensions`] for an in-memory buffer.
pub fn dimensions_of(data: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(std::io::Cursor::new(data))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}
