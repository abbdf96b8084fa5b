//! Decode, resize and normalize

use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{ImageReader, RgbImage};
use ndarray::Array4;
use tracing::debug;

use crate::PreprocessError;

/// Side length of the square model input
pub const INPUT_SIZE: u32 = 224;

/// Model input shape (batch, channels, height, width)
pub const INPUT_SHAPE: [usize; 4] = [1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize];

// ImageNet normalization constants (R, G, B)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decode arbitrary image bytes and force them into 8-bit RGB.
///
/// The format is sniffed from the content, so grayscale, RGBA and palette
/// images all end up as three channels.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, PreprocessError> {
    if bytes.is_empty() {
        return Err(PreprocessError::EmptyInput);
    }

    let img = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()?;

    debug!(
        "Decoded {}x{} image ({:?})",
        img.width(),
        img.height(),
        img.color()
    );

    if img.width() == 0 || img.height() == 0 {
        return Err(PreprocessError::NoPixels {
            width: img.width(),
            height: img.height(),
        });
    }

    Ok(img.to_rgb8())
}

/// Stretch to 224x224 and build a normalized `[1, 3, 224, 224]` tensor.
pub fn to_input_tensor(img: &RgbImage) -> Array4<f32> {
    let resized = if img.dimensions() == (INPUT_SIZE, INPUT_SIZE) {
        img.clone()
    } else {
        imageops::resize(img, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle)
    };

    let mut input = Array4::<f32>::zeros(INPUT_SHAPE);
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            input[[0, c, y as usize, x as usize]] = (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }

    input
}

/// Full pipeline: bytes -> RGB -> normalized NCHW tensor
pub fn preprocess(bytes: &[u8]) -> Result<Array4<f32>, PreprocessError> {
    let rgb = decode_rgb(bytes)?;
    Ok(to_input_tensor(&rgb))
}
