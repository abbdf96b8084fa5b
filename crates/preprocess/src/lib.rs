//! Image Preprocessing
//!
//! Turns uploaded image bytes into the normalized NCHW tensor the
//! classification models expect.

mod transform;

pub use transform::{
    decode_rgb, preprocess, to_input_tensor, IMAGENET_MEAN, IMAGENET_STD, INPUT_SHAPE, INPUT_SIZE,
};

use thiserror::Error;

/// Errors while preparing an image for inference
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Empty image payload")]
    EmptyInput,
    #[error("Image has no pixels ({width}x{height})")]
    NoPixels { width: u32, height: u32 },
    #[error("Failed to read image: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}
