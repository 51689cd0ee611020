//! NIfTI-1 output through the `nifti` crate.

use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayD, Axis};
use nifti::error::NiftiError;
use nifti::writer::WriterOptions;
use nifti::NiftiHeader;
use thiserror::Error;
use tracing::debug;

use crate::enums::NiftiType;
use crate::pixel_data::{PixelBuffer, dispatch};
use crate::volume::ImageRecord;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("NIfTI error: {0}")]
    Nifti(#[from] NiftiError),

    #[error("Dimension {0} does not fit in a NIfTI-1 header")]
    DimensionTooLarge(usize),

    #[error("RGB24 record must hold unsigned bytes with three samples")]
    InvalidRgb,
}

/// Destination for converted volumes.
pub trait ImageWriter {
    type Error;

    fn write(&mut self, record: ImageRecord) -> Result<(), Self::Error>;
}

/// Writes records to a NIfTI file; a `.nii.gz` path is compressed.
#[derive(Debug, Clone)]
pub struct NiftiWriter {
    path: PathBuf,
}

impl NiftiWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImageWriter for NiftiWriter {
    type Error = WriteError;

    fn write(&mut self, record: ImageRecord) -> Result<(), WriteError> {
        let header = header(&record)?;
        let options = WriterOptions::new(&self.path).reference_header(&header);
        debug!(path = %self.path.display(), dim = ?record.dim, "writing NIfTI");

        if record.datatype == NiftiType::Rgb24 {
            let PixelBuffer::U8(samples) = &record.data else {
                return Err(WriteError::InvalidRgb);
            };
            let pixels = rgb_pixels(samples)?;
            // NIfTI axes are (columns, rows, slices)
            options.write_rgb_nifti(&pixels.t())?;
        } else {
            dispatch!(&record.data, arr => options.write_nifti(&arr.t())?);
        }
        Ok(())
    }
}

/// Writes one record to a `.nii` (or `.nii.gz`) file.
pub fn write_nifti(path: impl AsRef<Path>, record: ImageRecord) -> Result<(), WriteError> {
    NiftiWriter::new(path.as_ref()).write(record)
}

fn header(record: &ImageRecord) -> Result<NiftiHeader, WriteError> {
    let mut extents = [0_i16; 3];
    for (slot, &extent) in extents.iter_mut().zip(&record.dim) {
        *slot = i16::try_from(extent).map_err(|_| WriteError::DimensionTooLarge(extent))?;
    }
    let [x, y, z] = extents;

    let quatern = Quatern::from_affine(&record.qform);
    let mut pixdim = record.pixdim.map(|v| v as f32);
    pixdim[0] = quatern.qfac as f32;

    let srow = |row: usize| -> [f32; 4] {
        let mut values = [0.0; 4];
        for (value, &v) in values.iter_mut().zip(record.sform.row(row)) {
            *value = v as f32;
        }
        values
    };

    Ok(NiftiHeader {
        dim: [3, x as _, y as _, z as _, 1, 1, 1, 1],
        datatype: record.datatype as i16,
        bitpix: record.datatype.bitpix(),
        pixdim,
        // values are stored already rescaled
        scl_slope: 1.0,
        scl_inter: 0.0,
        xyzt_units: record.xyz_units as u8,
        cal_min: record.cal_min as f32,
        cal_max: record.cal_max as f32,
        qform_code: record.qform_code as i16,
        sform_code: record.sform_code as i16,
        quatern_b: quatern.b as f32,
        quatern_c: quatern.c as f32,
        quatern_d: quatern.d as f32,
        quatern_x: quatern.offset[0] as f32,
        quatern_y: quatern.offset[1] as f32,
        quatern_z: quatern.offset[2] as f32,
        srow_x: srow(0),
        srow_y: srow(1),
        srow_z: srow(2),
        ..NiftiHeader::default()
    })
}

/// Packs a `(slices, rows, columns, 3)` sample array into RGB pixels.
fn rgb_pixels(samples: &ArrayD<u8>) -> Result<ArrayD<[u8; 3]>, WriteError> {
    if samples.shape().last() != Some(&3) {
        return Err(WriteError::InvalidRgb);
    }
    let last = Axis(samples.ndim() - 1);
    let pixels: Vec<[u8; 3]> = samples
        .lanes(last)
        .into_iter()
        .map(|lane| [lane[0], lane[1], lane[2]])
        .collect();
    let shape = &samples.shape()[..samples.ndim() - 1];
    ArrayD::from_shape_vec(shape, pixels).map_err(|_| WriteError::InvalidRgb)
}

/// Quaternion form of a qform matrix, as stored in the header.
#[derive(Debug, Clone, PartialEq)]
struct Quatern {
    b: f64,
    c: f64,
    d: f64,
    offset: [f64; 3],
    qfac: f64,
}

impl Quatern {
    /// Rotation part of `affine` once column scaling (and a left-handed last
    /// axis) is removed. Columns are assumed orthogonal.
    fn from_affine(affine: &Array2<f64>) -> Self {
        let offset = [affine[[0, 3]], affine[[1, 3]], affine[[2, 3]]];
        let mut r = [[0.0_f64; 3]; 3];
        for j in 0..3 {
            let norm = (0..3).map(|i| affine[[i, j]].powi(2)).sum::<f64>().sqrt();
            let norm = if norm == 0.0 { 1.0 } else { norm };
            for i in 0..3 {
                r[i][j] = affine[[i, j]] / norm;
            }
        }

        let det = r[0][0] * (r[1][1] * r[2][2] - r[1][2] * r[2][1])
            - r[0][1] * (r[1][0] * r[2][2] - r[1][2] * r[2][0])
            + r[0][2] * (r[1][0] * r[2][1] - r[1][1] * r[2][0]);
        let qfac = if det < 0.0 {
            for row in &mut r {
                row[2] = -row[2];
            }
            -1.0
        } else {
            1.0
        };

        let trace = r[0][0] + r[1][1] + r[2][2] + 1.0;
        let (a, b, c, d) = if trace > 0.5 {
            let a = 0.5 * trace.sqrt();
            (
                a,
                0.25 * (r[2][1] - r[1][2]) / a,
                0.25 * (r[0][2] - r[2][0]) / a,
                0.25 * (r[1][0] - r[0][1]) / a,
            )
        } else {
            let xd = 1.0 + r[0][0] - (r[1][1] + r[2][2]);
            let yd = 1.0 + r[1][1] - (r[0][0] + r[2][2]);
            let zd = 1.0 + r[2][2] - (r[0][0] + r[1][1]);
            if xd > 1.0 {
                let b = 0.5 * xd.sqrt();
                (
                    0.25 * (r[2][1] - r[1][2]) / b,
                    b,
                    0.25 * (r[0][1] + r[1][0]) / b,
                    0.25 * (r[0][2] + r[2][0]) / b,
                )
            } else if yd > 1.0 {
                let c = 0.5 * yd.sqrt();
                (
                    0.25 * (r[0][2] - r[2][0]) / c,
                    0.25 * (r[0][1] + r[1][0]) / c,
                    c,
                    0.25 * (r[1][2] + r[2][1]) / c,
                )
            } else {
                let d = 0.5 * zd.sqrt();
                (
                    0.25 * (r[1][0] - r[0][1]) / d,
                    0.25 * (r[0][2] + r[2][0]) / d,
                    0.25 * (r[1][2] + r[2][1]) / d,
                    d,
                )
            }
        };
        let (b, c, d) = if a < 0.0 { (-b, -c, -d) } else { (b, c, d) };

        Self {
            b,
            c,
            d,
            offset,
            qfac,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{SpatialUnits, XformCode};
    use ndarray::IxDyn;
    use nifti::{IntoNdArray, NiftiObject, ReaderOptions};

    fn record(data: PixelBuffer, datatype: NiftiType, sform: Array2<f64>) -> ImageRecord {
        let shape = data.shape().to_vec();
        ImageRecord {
            dim: [shape[2], shape[1], shape[0]],
            pixdim: [0.0, 0.5, 0.5, 2.0, 0.0, 0.0, 0.0, 0.0],
            cal_min: 0.0,
            cal_max: 5.0,
            qform_code: XformCode::ScannerAnat,
            sform_code: XformCode::ScannerAnat,
            qform: sform.clone(),
            sform,
            xyz_units: SpatialUnits::Millimeter,
            datatype,
            data,
        }
    }

    #[test]
    fn header_carries_record_fields() {
        let data = PixelBuffer::U16(
            ArrayD::from_shape_vec(IxDyn(&[2, 1, 3]), vec![0, 1, 2, 3, 4, 5]).unwrap(),
        );
        let mut sform = Array2::eye(4);
        sform[[0, 0]] = -0.5;
        sform[[1, 1]] = -0.5;
        sform[[2, 2]] = 2.0;
        sform[[0, 3]] = 7.0;

        let header = header(&record(data, NiftiType::Uint16, sform)).unwrap();
        assert_eq!(
            header.dim.map(|d| d as i64),
            [3, 3, 1, 2, 1, 1, 1, 1]
        );
        assert_eq!(header.datatype, 512);
        assert_eq!(header.bitpix, 16);
        assert_eq!(header.pixdim[..4], [1.0, 0.5, 0.5, 2.0]);
        assert_eq!((header.scl_slope, header.scl_inter), (1.0, 0.0));
        assert_eq!(header.xyzt_units, 2);
        assert_eq!((header.cal_min, header.cal_max), (0.0, 5.0));
        assert_eq!((header.qform_code, header.sform_code), (1, 1));
        // flipped x and y axes: proper rotation of 180 degrees around z
        assert_eq!(
            (header.quatern_b, header.quatern_c, header.quatern_d),
            (0.0, 0.0, 1.0)
        );
        assert_eq!(header.quatern_x, 7.0);
        assert_eq!(header.srow_x, [-0.5, 0.0, 0.0, 7.0]);
        assert_eq!(header.srow_z, [0.0, 0.0, 2.0, 0.0]);
    }

    #[test]
    fn left_handed_transform_sets_negative_qfac() {
        let mut affine = Array2::eye(4);
        affine[[2, 2]] = -3.0;
        let quatern = Quatern::from_affine(&affine);
        assert_eq!(quatern.qfac, -1.0);
        assert_eq!((quatern.b, quatern.c, quatern.d), (0.0, 0.0, 0.0));
    }

    #[test]
    fn oversized_extent_is_rejected() {
        let data = PixelBuffer::U8(ArrayD::zeros(IxDyn(&[1, 1, 40_000])));
        assert!(matches!(
            header(&record(data, NiftiType::Uint8, Array2::eye(4))),
            Err(WriteError::DimensionTooLarge(40_000))
        ));
    }

    #[test]
    fn written_file_reads_back_in_nifti_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.nii");
        // (slices, rows, columns) = (2, 1, 3)
        let data = PixelBuffer::F32(
            ArrayD::from_shape_vec(IxDyn(&[2, 1, 3]), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.5])
                .unwrap(),
        );
        write_nifti(&path, record(data, NiftiType::Float32, Array2::eye(4))).unwrap();

        let object = ReaderOptions::new().read_file(&path).unwrap();
        let header = object.header();
        assert_eq!(header.datatype, 16);
        assert_eq!(header.dim[1..4].iter().map(|&d| d as usize).collect::<Vec<_>>(), [3, 1, 2]);
        assert_eq!(header.sform_code, 1);

        let volume = object.into_volume().into_ndarray::<f32>().unwrap();
        assert_eq!(volume.shape(), &[3, 1, 2]);
        // column 2 of the second slice
        assert_eq!(volume[[2, 0, 1]], 5.5);
        assert_eq!(volume[[1, 0, 0]], 1.0);
    }

    #[test]
    fn rgb_records_use_24_bit_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("color.nii");
        let data = PixelBuffer::U8(ArrayD::from_elem(IxDyn(&[1, 2, 2, 3]), 7));
        NiftiWriter::new(&path)
            .write(ImageRecord {
                qform_code: XformCode::Unknown,
                sform_code: XformCode::Unknown,
                ..record(data, NiftiType::Rgb24, Array2::eye(4))
            })
            .unwrap();

        let object = ReaderOptions::new().read_file(&path).unwrap();
        assert_eq!(object.header().datatype, 128);
        assert_eq!(object.header().bitpix, 24);
        assert_eq!(object.header().qform_code, 0);
    }

    #[test]
    fn rgb_pixels_pack_trailing_samples() {
        let samples =
            ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 3]), vec![1, 2, 3, 4, 5, 6]).unwrap();
        let pixels = rgb_pixels(&samples).unwrap();
        assert_eq!(pixels.shape(), &[1, 1, 2]);
        assert_eq!(pixels[[0, 0, 1]], [4, 5, 6]);

        let gray = ArrayD::<u8>::zeros(IxDyn(&[1, 2, 2]));
        assert!(matches!(rgb_pixels(&gray), Err(WriteError::InvalidRgb)));
    }
}
