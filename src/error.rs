use dicom::core::Tag;
use thiserror::Error;

use crate::csa::CsaError;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("No slices supplied")]
    NoSlices,

    #[error("Missing required element {0}")]
    MissingElement(Tag),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid pixel format: {0}")]
    InvalidPixelFormat(String),

    #[error("Pixel data too short: expected {expected} bytes, got {actual}")]
    PixelDataLength { expected: usize, actual: usize },

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Invalid mosaic: {0}")]
    InvalidMosaic(String),

    #[error("CSA header error: {0}")]
    Csa(#[from] CsaError),

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T, E = ConvertError> = std::result::Result<T, E>;
