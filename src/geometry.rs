//! Origin, spacing and direction of a stack of slices.
//!
//! Resolution never fails on missing attributes: each missing piece falls
//! back to a default (zero origin, unit spacing, identity direction) and the
//! decision is logged.

use dicom::core::Tag;
use dicom_dictionary_std::tags;
use ndarray::{Array1, Array2, arr1, s};
use tracing::{info, warn};

use crate::data_set::{DataSet, SliceRef};
use crate::error::{ConvertError, Result};

/// Patient-space geometry in the LPS convention.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    /// Position of the center of the first voxel, in mm
    pub origin: [f64; 3],
    /// Column, row and slice spacing, in mm
    pub spacing: [f64; 3],
    /// Columns are the row direction, the column direction and the slice
    /// normal
    pub direction: Array2<f64>,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            origin: [0.0; 3],
            spacing: [1.0; 3],
            direction: Array2::eye(3),
        }
    }
}

impl Geometry {
    pub fn normal(&self) -> Array1<f64> {
        self.direction.column(2).to_owned()
    }

    /// Voxel-to-world transform in the RAS convention.
    ///
    /// The linear part is `flip · direction · diag(spacing)` and the
    /// translation is `flip · origin`, with `flip = diag(-1, -1, 1)`.
    pub fn ras_affine(&self) -> Array2<f64> {
        let lps_to_ras = Array2::from_diag(&arr1(&[-1.0, -1.0, 1.0]));
        let scale = Array2::from_diag(&arr1(&self.spacing));
        let linear = lps_to_ras.dot(&self.direction).dot(&scale);
        let translation = lps_to_ras.dot(&arr1(&self.origin));

        let mut affine = Array2::eye(4);
        affine.slice_mut(s![..3, ..3]).assign(&linear);
        affine.slice_mut(s![..3, 3]).assign(&translation);
        affine
    }
}

/// Derives the geometry of slices already sorted along the slice axis.
pub fn resolve<D: DataSet>(slices: &[SliceRef<'_, D>]) -> Result<Geometry> {
    let first = slices.first().ok_or(ConvertError::NoSlices)?;
    let defaults = Geometry::default();

    let Some(origin) = position(first) else {
        info!("No geometry found, default returned");
        return Ok(defaults);
    };

    let Some(orientation) = orientation(first) else {
        info!("No orientation found, default returned");
        return Ok(Geometry {
            origin,
            ..defaults
        });
    };
    let direction = direction_from_orientation(&orientation);

    let Some([row_spacing, column_spacing]) = in_plane_spacing(slices) else {
        info!("No spacing found, default returned");
        return Ok(Geometry {
            origin,
            direction,
            ..defaults
        });
    };

    let mut geometry = Geometry {
        origin,
        spacing: [row_spacing, column_spacing, 1.0],
        direction,
    };
    geometry.spacing[2] = slice_spacing(slices, &geometry);
    Ok(geometry)
}

fn slice_spacing<D: DataSet>(slices: &[SliceRef<'_, D>], geometry: &Geometry) -> f64 {
    // A lone slice has no neighbour to measure against.
    let [first, second, ..] = slices else {
        return 1.0;
    };

    if !has_functional_groups(first.data_set) {
        if let Some(spacing) = first.data_set.first_real(tags::SPACING_BETWEEN_SLICES) {
            return spacing;
        }
    }

    let Some(second_position) = position(second) else {
        info!("No position found for one or more frames, default spacing returned");
        return 1.0;
    };

    let difference = &arr1(&second_position) - &arr1(&geometry.origin);
    let distance = difference.dot(&geometry.normal()).abs();
    if distance == 0.0 {
        // Usually a splitting or sorting problem upstream rather than a
        // genuine zero-thickness stack.
        warn!(
            "Something went wrong when splitting/sorting frames, \
             two or more frames with the same position were found"
        );
        return 1.0;
    }
    distance
}

fn direction_from_orientation(orientation: &[f64; 6]) -> Array2<f64> {
    let row = [orientation[0], orientation[1], orientation[2]];
    let column = [orientation[3], orientation[4], orientation[5]];
    let normal = cross(&row, &column);
    let columns = [row, column, normal];
    Array2::from_shape_fn((3, 3), |(i, j)| columns[j][i])
}

pub(crate) fn cross(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn has_functional_groups<D: DataSet>(data_set: &D) -> bool {
    data_set.has(tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE)
}

fn per_frame_group<'a, D: DataSet>(slice: &SliceRef<'a, D>, sequence: Tag) -> Option<&'a D> {
    slice
        .data_set
        .item(tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE, slice.frame_index())?
        .item(sequence, 0)
}

fn shared_group<'a, D: DataSet>(slice: &SliceRef<'a, D>, sequence: Tag) -> Option<&'a D> {
    slice
        .data_set
        .item(tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE, 0)?
        .item(sequence, 0)
}

/// Data set holding a frame-specific attribute: the per-frame functional
/// group first, then the shared one, or the slice itself for single-frame
/// objects.
fn frame_attributes<'a, D: DataSet>(slice: &SliceRef<'a, D>, sequence: Tag) -> Option<&'a D> {
    if has_functional_groups(slice.data_set) {
        per_frame_group(slice, sequence).or_else(|| shared_group(slice, sequence))
    } else {
        Some(slice.data_set)
    }
}

fn position<D: DataSet>(slice: &SliceRef<'_, D>) -> Option<[f64; 3]> {
    let values = frame_attributes(slice, tags::PLANE_POSITION_SEQUENCE)?
        .as_real(tags::IMAGE_POSITION_PATIENT)?;
    values.get(..3)?.try_into().ok()
}

fn orientation<D: DataSet>(slice: &SliceRef<'_, D>) -> Option<[f64; 6]> {
    let values = frame_attributes(slice, tags::PLANE_ORIENTATION_SEQUENCE)?
        .as_real(tags::IMAGE_ORIENTATION_PATIENT)?;
    values.get(..6)?.try_into().ok()
}

fn pixel_spacing<D: DataSet>(data_set: &D) -> Option<[f64; 2]> {
    data_set
        .as_real(tags::PIXEL_SPACING)?
        .get(..2)?
        .try_into()
        .ok()
}

fn in_plane_spacing<D: DataSet>(slices: &[SliceRef<'_, D>]) -> Option<[f64; 2]> {
    let first = slices.first()?;
    if !has_functional_groups(first.data_set) {
        return pixel_spacing(first.data_set).or_else(|| {
            info!("No pixel spacing found, unit in-plane spacing used");
            Some([1.0, 1.0])
        });
    }

    if let Some(measures) = shared_group(first, tags::PIXEL_MEASURES_SEQUENCE) {
        return pixel_spacing(measures);
    }

    let reference = pixel_spacing(per_frame_group(first, tags::PIXEL_MEASURES_SEQUENCE)?)?;
    let mismatch = slices.iter().skip(1).any(|slice| {
        per_frame_group(slice, tags::PIXEL_MEASURES_SEQUENCE)
            .and_then(pixel_spacing)
            .is_some_and(|spacing| spacing != reference)
    });
    if mismatch {
        warn!("One or more frames found with different spacings");
    }
    Some(reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_set::test_support::*;
    use dicom::core::{VR, dicom_value};
    use dicom::object::InMemDicomObject;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    /// Formatted log output of a test, shared with the subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    /// Runs `f` and returns its result with the warnings it logged.
    fn with_warnings<T>(f: impl FnOnce() -> T) -> (T, String) {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .without_time()
            .finish();
        let result = tracing::subscriber::with_default(subscriber, f);
        let output = String::from_utf8_lossy(&logs.0.lock().unwrap()).into_owned();
        (result, output)
    }

    const AXIAL: [f64; 6] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];

    fn slice_at(position: [f64; 3]) -> InMemDicomObject {
        object_with([
            (
                tags::IMAGE_POSITION_PATIENT,
                VR::DS,
                dicom_value!(F64, [position[0], position[1], position[2]]),
            ),
            (
                tags::IMAGE_ORIENTATION_PATIENT,
                VR::DS,
                dicom_value!(F64, [AXIAL[0], AXIAL[1], AXIAL[2], AXIAL[3], AXIAL[4], AXIAL[5]]),
            ),
            (tags::PIXEL_SPACING, VR::DS, dicom_value!(F64, [0.5, 0.75])),
        ])
    }

    fn refs(objects: &[InMemDicomObject]) -> Vec<SliceRef<'_, InMemDicomObject>> {
        objects.iter().map(SliceRef::new).collect()
    }

    #[test]
    fn empty_input_is_an_error() {
        let slices: Vec<SliceRef<'_, InMemDicomObject>> = Vec::new();
        assert!(matches!(resolve(&slices), Err(ConvertError::NoSlices)));
    }

    #[test]
    fn missing_position_returns_defaults() {
        let objects = [InMemDicomObject::new_empty()];
        assert_eq!(resolve(&refs(&objects)).unwrap(), Geometry::default());
    }

    #[test]
    fn missing_orientation_keeps_origin() {
        let objects = [object_with([(
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            dicom_value!(F64, [1.0, 2.0, 3.0]),
        )])];
        let geometry = resolve(&refs(&objects)).unwrap();
        assert_eq!(geometry.origin, [1.0, 2.0, 3.0]);
        assert_eq!(geometry.spacing, [1.0, 1.0, 1.0]);
        assert_eq!(geometry.direction, Array2::<f64>::eye(3));
    }

    #[test]
    fn single_slice_has_unit_thickness() {
        let mut object = slice_at([0.0, 0.0, 10.0]);
        put(&mut object, tags::SPACING_BETWEEN_SLICES, VR::DS, dicom_value!(F64, [4.0]));
        let geometry = resolve(&refs(&[object])).unwrap();
        assert_eq!(geometry.spacing, [0.5, 0.75, 1.0]);
    }

    #[test]
    fn slice_spacing_is_projected_on_normal() {
        let objects = [slice_at([0.0, 0.0, 10.0]), slice_at([3.0, 0.0, 12.5])];
        let geometry = resolve(&refs(&objects)).unwrap();
        assert_eq!(geometry.origin, [0.0, 0.0, 10.0]);
        assert_eq!(geometry.spacing, [0.5, 0.75, 2.5]);
        assert_eq!(geometry.normal(), arr1(&[0.0, 0.0, 1.0]));
    }

    #[test]
    fn spacing_between_slices_wins_for_single_frame_objects() {
        let mut first = slice_at([0.0, 0.0, 0.0]);
        put(&mut first, tags::SPACING_BETWEEN_SLICES, VR::DS, dicom_value!(F64, [4.0]));
        let objects = [first, slice_at([0.0, 0.0, 2.0])];
        let geometry = resolve(&refs(&objects)).unwrap();
        assert_eq!(geometry.spacing[2], 4.0);
    }

    #[test]
    fn duplicate_positions_fall_back_to_unit_spacing() {
        let objects = [slice_at([1.0, 1.0, 1.0]), slice_at([1.0, 1.0, 1.0])];
        let (geometry, warnings) = with_warnings(|| resolve(&refs(&objects)).unwrap());
        assert_eq!(geometry.spacing[2], 1.0);
        assert!(warnings.contains("WARN"), "{warnings}");
        assert!(warnings.contains("same position"), "{warnings}");
    }

    fn enhanced_object(per_frame_spacing: Option<[[f64; 2]; 2]>) -> InMemDicomObject {
        let orientation = object_with([(
            tags::IMAGE_ORIENTATION_PATIENT,
            VR::DS,
            dicom_value!(F64, [0.0, 1.0, 0.0, 0.0, 0.0, -1.0]),
        )]);
        let mut shared = InMemDicomObject::new_empty();
        put_sequence(&mut shared, tags::PLANE_ORIENTATION_SEQUENCE, vec![orientation]);
        if per_frame_spacing.is_none() {
            let measures = object_with([(
                tags::PIXEL_SPACING,
                VR::DS,
                dicom_value!(F64, [0.9, 0.9]),
            )]);
            put_sequence(&mut shared, tags::PIXEL_MEASURES_SEQUENCE, vec![measures]);
        }

        let frames = (0..2)
            .map(|index| {
                let mut frame = InMemDicomObject::new_empty();
                let position = object_with([(
                    tags::IMAGE_POSITION_PATIENT,
                    VR::DS,
                    dicom_value!(F64, [-3.0 * index as f64, 0.0, 0.0]),
                )]);
                put_sequence(&mut frame, tags::PLANE_POSITION_SEQUENCE, vec![position]);
                if let Some(spacings) = per_frame_spacing {
                    let [a, b] = spacings[index];
                    let measures = object_with([(
                        tags::PIXEL_SPACING,
                        VR::DS,
                        dicom_value!(F64, [a, b]),
                    )]);
                    put_sequence(&mut frame, tags::PIXEL_MEASURES_SEQUENCE, vec![measures]);
                }
                frame
            })
            .collect();

        let mut object = InMemDicomObject::new_empty();
        put_sequence(&mut object, tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE, vec![shared]);
        put_sequence(&mut object, tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE, frames);
        put(&mut object, tags::SPACING_BETWEEN_SLICES, VR::DS, dicom_value!(F64, [9.0]));
        object
    }

    #[test]
    fn functional_groups_resolve_per_frame_and_shared() {
        let object = enhanced_object(None);
        let slices = [SliceRef::frame(&object, 0), SliceRef::frame(&object, 1)];
        let (geometry, warnings) = with_warnings(|| resolve(&slices).unwrap());
        assert!(warnings.is_empty(), "{warnings}");

        assert_eq!(geometry.origin, [0.0, 0.0, 0.0]);
        assert_eq!(geometry.spacing, [0.9, 0.9, 3.0]);
        // sagittal: row along +y, column along -z, normal along -x
        assert_eq!(geometry.normal(), arr1(&[-1.0, 0.0, 0.0]));
    }

    #[test]
    fn mismatching_per_frame_spacing_keeps_first_frame() {
        let object = enhanced_object(Some([[0.5, 0.5], [0.7, 0.7]]));
        let slices = [SliceRef::frame(&object, 0), SliceRef::frame(&object, 1)];
        let (geometry, warnings) = with_warnings(|| resolve(&slices).unwrap());
        assert_eq!(geometry.spacing, [0.5, 0.5, 3.0]);
        assert!(warnings.contains("WARN"), "{warnings}");
        assert!(warnings.contains("different spacings"), "{warnings}");
    }

    #[test]
    fn ras_affine_flips_first_two_axes() {
        let geometry = Geometry {
            origin: [10.0, 20.0, 30.0],
            spacing: [0.5, 2.0, 3.0],
            direction: Array2::eye(3),
        };
        let affine = geometry.ras_affine();
        assert_eq!(affine.row(0).to_vec(), vec![-0.5, 0.0, 0.0, -10.0]);
        assert_eq!(affine.row(1).to_vec(), vec![0.0, -2.0, 0.0, -20.0]);
        assert_eq!(affine.row(2).to_vec(), vec![0.0, 0.0, 3.0, 30.0]);
        assert_eq!(affine.row(3).to_vec(), vec![0.0, 0.0, 0.0, 1.0]);
    }
}
