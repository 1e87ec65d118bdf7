use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Strongly typed parameters stored on a job, one variant per parameter shape.
///
/// Stored as JSONB; the `kind` tag keeps rows readable when inspected by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MethodParams {
    Upscale,
    BackgroundRemove,
    Restore,
    Denoise,
    StripMetadata,
    Convert(ConvertParams),
    Compress(CompressParams),
    Resize(ResizeParams),
    RotateFlip(RotateFlipParams),
    Crop(CropParams),
    Collage(CollageParams),
    PdfMerge(MergeParams),
}

impl MethodParams {
    pub fn input_count(&self) -> Option<usize> {
        match self {
            MethodParams::Collage(p) => Some(p.input_count),
            MethodParams::PdfMerge(p) => Some(p.input_count),
            _ => None,
        }
    }
}

/// Raster encodings a job may produce.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TargetFormat {
    Webp,
    Png,
    Jpeg,
}

impl TargetFormat {
    pub fn extension(self) -> &'static str {
        match self {
            TargetFormat::Webp => "webp",
            TargetFormat::Png => "png",
            TargetFormat::Jpeg => "jpeg",
        }
    }

    pub fn media_type(self) -> &'static str {
        match self {
            TargetFormat::Webp => "image/webp",
            TargetFormat::Png => "image/png",
            TargetFormat::Jpeg => "image/jpeg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ConvertParams {
    #[garde(skip)]
    pub target_format: TargetFormat,
    #[garde(range(min = 1, max = 100))]
    pub quality: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CompressParams {
    #[garde(skip)]
    pub target_format: TargetFormat,
    #[garde(range(min = 1, max = 100))]
    pub quality: u8,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResizeFit {
    /// Fit inside the box, preserving aspect ratio.
    #[default]
    Inside,
    /// Stretch to exactly the box.
    Exact,
    /// Cover the box, then center-crop.
    Fill,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ResizeParams {
    #[garde(range(min = 1, max = 16384))]
    pub max_width: Option<u32>,
    #[garde(range(min = 1, max = 16384))]
    pub max_height: Option<u32>,
    #[garde(skip)]
    pub fit: ResizeFit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RotateFlipParams {
    #[garde(custom(quarter_turn))]
    pub rotate: u16,
    #[garde(skip)]
    pub flip_h: bool,
    #[garde(skip)]
    pub flip_v: bool,
}

fn quarter_turn(value: &u16, _ctx: &()) -> garde::Result {
    match value {
        0 | 90 | 180 | 270 => Ok(()),
        _ => Err(garde::Error::new("rotate must be 0, 90, 180, or 270")),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CropParams {
    #[garde(skip)]
    pub x: u32,
    #[garde(skip)]
    pub y: u32,
    #[garde(range(min = 1))]
    pub width: u32,
    #[garde(range(min = 1))]
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CollageParams {
    #[garde(range(min = 1, max = 4))]
    pub grid_rows: u32,
    #[garde(range(min = 1, max = 4))]
    pub grid_cols: u32,
    #[garde(range(max = 200))]
    pub spacing: u32,
    #[garde(custom(hex_color))]
    pub background: String,
    #[garde(skip)]
    pub input_count: usize,
}

fn hex_color(value: &String, _ctx: &()) -> garde::Result {
    parse_hex_color(value)
        .map(|_| ())
        .ok_or_else(|| garde::Error::new("background must be a #rrggbb color"))
}

/// Parse `#rrggbb` into RGB components.
pub fn parse_hex_color(value: &str) -> Option<[u8; 3]> {
    let hex = value.strip_prefix('#')?;
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeParams {
    pub input_count: usize,
}
