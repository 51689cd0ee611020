use ndarray::Array2;
use tracing::info;

use crate::enums::{Dtype, NiftiType, SpatialUnits, XformCode};
use crate::error::{ConvertError, Result};
use crate::geometry::Geometry;
use crate::pixel_data::PixelBuffer;

/// Slices stacked into one buffer, with their geometry.
#[derive(Debug, Clone)]
pub struct Volume {
    /// Shape `(slices, rows, columns)`, plus a trailing sample axis for color
    pub data: PixelBuffer,
    pub geometry: Geometry,
    pub samples_per_pixel: usize,
}

/// Everything a NIfTI writer needs for one volume.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    /// Extent in NIfTI order: columns, rows, slices
    pub dim: [usize; 3],
    /// `[0, spacing..., 0...]`
    pub pixdim: [f64; 8],
    pub cal_min: f64,
    pub cal_max: f64,
    pub qform_code: XformCode,
    pub sform_code: XformCode,
    pub qform: Array2<f64>,
    pub sform: Array2<f64>,
    pub xyz_units: SpatialUnits,
    pub datatype: NiftiType,
    /// Same layout as [`Volume::data`]
    pub data: PixelBuffer,
}

impl Volume {
    /// Stacks slice buffers in the given order.
    ///
    /// Without a requested type the volume is `f32` as soon as one slice is
    /// floating point, and takes the type of the first slice otherwise.
    pub fn new(
        buffers: Vec<PixelBuffer>,
        geometry: Geometry,
        samples_per_pixel: usize,
        dtype: Option<Dtype>,
    ) -> Result<Self> {
        let first = buffers.first().ok_or(ConvertError::NoSlices)?;
        let dtype = match dtype {
            Some(dtype) => dtype,
            None => {
                let dtype = if buffers.iter().any(|b| b.dtype().is_float()) {
                    Dtype::F32
                } else {
                    // all slices are assumed to share one integer type
                    first.dtype()
                };
                info!("dtype deduced to be: {dtype:?}");
                dtype
            }
        };

        let buffers: Vec<_> = buffers.into_iter().map(|b| b.cast(dtype)).collect();
        Ok(Self {
            data: PixelBuffer::stack(&buffers)?,
            geometry,
            samples_per_pixel,
        })
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        match self.data.shape() {
            [depth, height, width, ..] => (*depth, *height, *width),
            _ => (0, 0, 0),
        }
    }

    pub fn dtype(&self) -> Dtype {
        self.data.dtype()
    }

    /// Builds the NIfTI record: scanner transform for grayscale volumes,
    /// RGB24 without transform for 8-bit color volumes.
    pub fn into_image_record(self) -> Result<ImageRecord> {
        let (depth, height, width) = self.dim();
        let spacing = self.geometry.spacing;

        let (datatype, code, transform) = match self.samples_per_pixel {
            1 => (
                NiftiType::from(self.dtype()),
                XformCode::ScannerAnat,
                self.geometry.ras_affine(),
            ),
            3 if self.dtype() == Dtype::U8 => (NiftiType::Rgb24, XformCode::Unknown, Array2::eye(4)),
            3 => {
                return Err(ConvertError::InvalidPixelFormat(format!(
                    "invalid dtype {:?} for RGB",
                    self.dtype()
                )));
            }
            samples => {
                return Err(ConvertError::InvalidPixelFormat(format!(
                    "{samples} samples per pixel"
                )));
            }
        };

        let (cal_min, cal_max) = self.data.min_max().unwrap_or((0.0, 0.0));

        let mut pixdim = [0.0; 8];
        pixdim[1..4].copy_from_slice(&spacing);

        Ok(ImageRecord {
            dim: [width, height, depth],
            pixdim,
            cal_min,
            cal_max,
            qform_code: code,
            sform_code: code,
            qform: transform.clone(),
            sform: transform,
            xyz_units: SpatialUnits::Millimeter,
            datatype,
            data: self.data,
        })
    }
}
