//! Siemens mosaic reconstruction.
//!
//! Mosaic acquisitions store a whole volume as one single-frame image whose
//! slices are laid out as tiles on a square grid, row by row. See
//! <http://nipy.org/nibabel/dicom/dicom_mosaic.html>.

use dicom::core::Tag;
use dicom_dictionary_std::tags;
use ndarray::{ArrayD, IxDyn, s};
use tracing::debug;

use crate::csa::{self, CsaError, CsaHeader};
use crate::data_set::{DataSet, SliceRef};
use crate::error::{ConvertError, Result};
use crate::geometry::Geometry;
use crate::pixel_data::{PixelBuffer, map_buffer, samples_per_pixel};

/// Siemens CSA image header.
pub const CSA_IMAGE_HEADER_INFO: Tag = Tag(0x0029, 0x1010);

/// Whether a stack is a single mosaic image to be split into tiles.
pub fn is_mosaic<D: DataSet>(slices: &[SliceRef<'_, D>]) -> bool {
    let [slice] = slices else {
        return false;
    };
    samples_per_pixel(slice.data_set) == 1
        && slice
            .data_set
            .as_string(tags::IMAGE_TYPE)
            .is_some_and(|image_type| image_type.iter().any(|value| value == "MOSAIC"))
}

/// Splits the mosaic of a `(1, rows, columns)` stack into its tiles and
/// moves the geometry from the mosaic corner to the first tile.
pub fn unpack<D: DataSet>(
    slice: SliceRef<'_, D>,
    stack: PixelBuffer,
    geometry: Geometry,
) -> Result<(PixelBuffer, Geometry)> {
    let header_data = slice
        .data_set
        .as_binary(CSA_IMAGE_HEADER_INFO)
        .ok_or(CsaError::MissingHeader)?;
    let header = csa::parse(&header_data)?;
    unpack_with_header(&header, stack, geometry)
}

pub fn unpack_with_header(
    header: &CsaHeader,
    stack: PixelBuffer,
    mut geometry: Geometry,
) -> Result<(PixelBuffer, Geometry)> {
    let count = usize::try_from(header.int("NumberOfImagesInMosaic")?)
        .ok()
        .filter(|&count| count > 0)
        .ok_or_else(|| ConvertError::InvalidMosaic("no images in mosaic".to_string()))?;
    let grid = tiles_per_line(count);

    let &[1, mosaic_rows, mosaic_columns] = stack.shape() else {
        return Err(ConvertError::InvalidMosaic(format!(
            "expected a single grayscale image, got shape {:?}",
            stack.shape()
        )));
    };
    if mosaic_rows % grid != 0 || mosaic_columns % grid != 0 {
        return Err(ConvertError::InvalidMosaic(format!(
            "{mosaic_rows}x{mosaic_columns} image cannot hold a {grid}x{grid} grid"
        )));
    }
    let (rows, columns) = (mosaic_rows / grid, mosaic_columns / grid);
    debug!(count, grid, rows, columns, "unpacking mosaic");

    let tiles = map_buffer!(stack, arr => retile(arr, grid, rows, columns, count)?);

    // Shift from the corner of the mosaic to the corner of the first tile.
    let offsets = [
        (mosaic_columns - columns) as f64 / 2.0,
        (mosaic_rows - rows) as f64 / 2.0,
    ];
    for (axis, offset) in offsets.into_iter().enumerate() {
        let step = offset * geometry.spacing[axis];
        for i in 0..3 {
            geometry.origin[i] += geometry.direction[[i, axis]] * step;
        }
    }

    let normal = header
        .reals("SliceNormalVector")
        .map_err(|e| ConvertError::InvalidMosaic(e.to_string()))?;
    let &[x, y, z] = normal.as_slice() else {
        return Err(ConvertError::InvalidMosaic(format!(
            "slice normal has {} components",
            normal.len()
        )));
    };
    geometry
        .direction
        .column_mut(2)
        .assign(&ndarray::arr1(&[x, y, z]));

    Ok((tiles, geometry))
}

fn tiles_per_line(count: usize) -> usize {
    (count as f64).sqrt().ceil() as usize
}

/// Re-lays a `(1, grid·rows, grid·columns)` array as `(count, rows, columns)`,
/// tiles in row-major grid order.
fn retile<T: Clone>(
    mosaic: ArrayD<T>,
    grid: usize,
    rows: usize,
    columns: usize,
    count: usize,
) -> Result<ArrayD<T>> {
    let tiles = mosaic
        .into_shape_with_order(IxDyn(&[grid, rows, grid, columns]))?
        .permuted_axes(IxDyn(&[0, 2, 1, 3]))
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order(IxDyn(&[grid * grid, rows, columns]))?;
    Ok(tiles.slice_move(s![..count, .., ..]).into_dyn())
}
