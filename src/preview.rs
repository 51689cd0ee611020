use image::{GrayImage, ImageBuffer};
use ndarray::{Axis, Ix3};
use rayon::prelude::*;

use crate::enums::NiftiType;
use crate::pixel_data::dispatch;
use crate::volume::ImageRecord;

#[inline]
fn normalize_to_u8(value: f64, min: f64, max: f64) -> u8 {
    if max <= min {
        return 0;
    }
    (((value - min) / (max - min)) * 255.0).clamp(0.0, 255.0) as u8
}

/// Renders one slice of a grayscale record, window-levelled to the
/// record's calibration range.
///
/// Returns `None` for color records and out-of-range indices.
pub fn axial_slice(record: &ImageRecord, index: usize) -> Option<GrayImage> {
    if record.datatype == NiftiType::Rgb24 {
        return None;
    }
    let (min, max) = (record.cal_min, record.cal_max);

    let (height, width, pixel_data) = dispatch!(&record.data, arr => {
        let volume = arr.view().into_dimensionality::<Ix3>().ok()?;
        if index >= volume.len_of(Axis(0)) {
            return None;
        }
        let slice = volume.index_axis_move(Axis(0), index);
        let (height, width) = slice.dim();
        let pixels: Vec<u8> = slice
            .into_par_iter()
            .map(|&v| normalize_to_u8(v as f64, min, max))
            .collect();
        (height, width, pixels)
    });

    ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
}

/// Middle slice of the record, the usual thumbnail.
pub fn middle_slice(record: &ImageRecord) -> Option<GrayImage> {
    axial_slice(record, record.dim[2] / 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{SpatialUnits, XformCode};
    use crate::pixel_data::PixelBuffer;
    use ndarray::{Array2, Array3};

    fn record(data: PixelBuffer, datatype: NiftiType) -> ImageRecord {
        let (cal_min, cal_max) = data.min_max().unwrap();
        let shape = data.shape().to_vec();
        ImageRecord {
            dim: [shape[2], shape[1], shape[0]],
            pixdim: [0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            cal_min,
            cal_max,
            qform_code: XformCode::ScannerAnat,
            sform_code: XformCode::ScannerAnat,
            qform: Array2::eye(4),
            sform: Array2::eye(4),
            xyz_units: SpatialUnits::Millimeter,
            datatype,
            data,
        }
    }

    #[test]
    fn scales_slice_to_calibration_range() {
        let data = Array3::from_shape_fn((3, 2, 4), |(z, y, x)| (z * 100 + y * 10 + x) as i16 - 50);
        let record = record(PixelBuffer::I16(data.into_dyn()), NiftiType::Int16);

        let image = middle_slice(&record).unwrap();
        assert_eq!(image.dimensions(), (4, 2));
        // value 50 in a [-50, 163] range
        assert_eq!(image.get_pixel(0, 0).0[0], 119);
        assert!(axial_slice(&record, 3).is_none());
    }

    #[test]
    fn skips_color_records() {
        let data = PixelBuffer::U8(ndarray::ArrayD::zeros(ndarray::IxDyn(&[1, 2, 2, 3])));
        assert!(axial_slice(&record(data, NiftiType::Rgb24), 0).is_none());
    }
}
