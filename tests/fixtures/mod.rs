//! Test fixtures: small generated images and canned method options

use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};

/// A solid-colour PNG of the given size.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([200, 40, 90]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode fixture png");
    out.into_inner()
}

/// A method submission used across tests.
#[derive(Debug, Clone)]
pub struct MethodFixture {
    pub method: &'static str,
    pub options: Option<&'static str>,
    pub expected_filename: &'static str,
    pub description: &'static str,
}

pub const RESIZE_HALF: MethodFixture = MethodFixture {
    method: "resize",
    options: Some(r#"{"max_width": 4}"#),
    expected_filename: "label_resized.png",
    description: "8x6 PNG resized to fit 4 px wide",
};

pub const ROTATE_QUARTER: MethodFixture = MethodFixture {
    method: "rotate_flip",
    options: Some(r#"{"rotate": 90}"#),
    expected_filename: "label_rotated.png",
    description: "8x6 PNG rotated clockwise",
};

/// Runs on the inference processor, which has no endpoint in tests.
pub const DENOISE_UNWIRED: MethodFixture = MethodFixture {
    method: "denoise",
    options: None,
    expected_filename: "label_denoised.png",
    description: "learned method with no inference endpoint configured",
};
