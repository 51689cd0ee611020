use std::collections::HashMap;
use std::{fs, path::Path};

use dicom::object::{FileDicomObject, InMemDicomObject, open_file};
use dicom_dictionary_std::tags;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::data_set::{DataSet, SliceRef};
use crate::enums::{Dtype, SortBy};
use crate::error::ConvertError;
use crate::geometry::{self, cross};
use crate::mosaic;
use crate::pixel_data::{self, samples_per_pixel};
use crate::volume::{ImageRecord, Volume};

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("Conversion failed: {0}")]
    Convert(#[from] ConvertError),
}

/// Settings shared by every conversion of a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversionOptions {
    /// Output sample type; deduced from the slices when unset
    pub dtype: Option<Dtype>,
}

/// DICOM objects of one series, as read from disk.
pub struct Series {
    pub series_instance_uid: String,
    pub objects: Vec<FileDicomObject<InMemDicomObject>>,
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Read every DICOM file of a directory and group them by series.
    ///
    /// Files which cannot be parsed as DICOM are skipped. Series come out
    /// sorted by Series Instance UID.
    pub fn scan_directory(path: impl AsRef<Path>) -> Result<Vec<Series>, VolumeLoaderError> {
        let paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();

        let objects: Vec<_> = paths
            .par_iter()
            .filter_map(|path| match open_file(path) {
                Ok(object) => Some(object),
                Err(e) => {
                    debug!("skipping {}: {e}", path.display());
                    None
                }
            })
            .collect();

        if objects.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        Ok(Self::group_by_series(objects))
    }

    /// Read the given files as one series.
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path>],
    ) -> Result<Vec<FileDicomObject<InMemDicomObject>>, VolumeLoaderError> {
        let objects: Result<Vec<_>, _> =
            paths.iter().map(|path| open_file(path.as_ref())).collect();
        let objects = objects?;
        if objects.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        Ok(objects)
    }

    fn group_by_series(objects: Vec<FileDicomObject<InMemDicomObject>>) -> Vec<Series> {
        let mut groups: HashMap<String, Vec<_>> = HashMap::new();
        for object in objects {
            let uid = object
                .as_string(tags::SERIES_INSTANCE_UID)
                .and_then(|values| values.into_iter().next())
                .unwrap_or_default();
            groups.entry(uid).or_default().push(object);
        }

        let mut series: Vec<_> = groups
            .into_iter()
            .map(|(series_instance_uid, objects)| Series {
                series_instance_uid,
                objects,
            })
            .collect();
        series.sort_by(|a, b| a.series_instance_uid.cmp(&b.series_instance_uid));
        series
    }

    /// One slice reference per frame of multiframe objects, and one per
    /// single-frame object, ordered by `sort_by`.
    ///
    /// Frames keep their stored order; only single-frame objects are sorted.
    pub fn slice_refs<'a, D: DataSet>(objects: &[&'a D], sort_by: SortBy) -> Vec<SliceRef<'a, D>> {
        let mut single_frame = Vec::new();
        let mut slices = Vec::new();
        for &object in objects {
            match number_of_frames(object) {
                Some(frames) => slices.extend((0..frames).map(|frame| SliceRef::frame(object, frame))),
                None => single_frame.push(SliceRef::new(object)),
            }
        }

        Self::sort_slices(&mut single_frame, sort_by);
        single_frame.extend(slices);
        single_frame
    }

    fn sort_slices<D: DataSet>(slices: &mut [SliceRef<'_, D>], sort_by: SortBy) {
        let normal = slices.first().and_then(|slice| {
            let orientation = slice.data_set.as_real(tags::IMAGE_ORIENTATION_PATIENT)?;
            let row: [f64; 3] = orientation.get(..3)?.try_into().ok()?;
            let column: [f64; 3] = orientation.get(3..6)?.try_into().ok()?;
            Some(cross(&row, &column))
        });

        let key = |slice: &SliceRef<'_, D>| -> Option<f64> {
            let data_set = slice.data_set;
            match sort_by {
                SortBy::ImagePositionPatient => {
                    let position = data_set.as_real(tags::IMAGE_POSITION_PATIENT)?;
                    let normal = normal.unwrap_or([0.0, 0.0, 1.0]);
                    Some(position.iter().zip(normal).map(|(p, n)| p * n).sum())
                }
                SortBy::TablePosition => data_set.first_real(tags::TABLE_POSITION),
                SortBy::InstanceNumber => data_set.first_int(tags::INSTANCE_NUMBER).map(|n| n as f64),
                SortBy::None => Some(0.0),
            }
        };

        if !matches!(sort_by, SortBy::None) {
            slices.sort_by(|a, b| {
                key(a)
                    .partial_cmp(&key(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
    }

    /// Convert spatially sorted slices into a NIfTI record.
    ///
    /// # Errors
    ///
    /// Returns error if no slices are given, pixel data cannot be decoded,
    /// slice dimensions are inconsistent, a mosaic header cannot be read, or
    /// a color volume is not 8-bit.
    pub fn convert<D: DataSet>(
        slices: &[SliceRef<'_, D>],
        options: &ConversionOptions,
    ) -> Result<ImageRecord, ConvertError> {
        let first = slices.first().ok_or(ConvertError::NoSlices)?;
        let buffers = slices
            .iter()
            .map(|slice| pixel_data::extract(*slice))
            .collect::<Result<Vec<_>, _>>()?;

        let geometry = geometry::resolve(slices)?;
        let samples_per_pixel = samples_per_pixel(first.data_set);
        let mut volume = Volume::new(buffers, geometry, samples_per_pixel, options.dtype)?;

        if mosaic::is_mosaic(slices) {
            let (data, geometry) = mosaic::unpack(*first, volume.data, volume.geometry)?;
            volume = Volume {
                data,
                geometry,
                samples_per_pixel,
            };
        }

        volume.into_image_record()
    }

    /// Convert independent series in parallel.
    ///
    /// Every series gets its own result: a failing series is logged and
    /// never stops the others.
    pub fn convert_series(
        series: &[Series],
        sort_by: SortBy,
        options: &ConversionOptions,
    ) -> Vec<(String, Result<ImageRecord, ConvertError>)> {
        series
            .par_iter()
            .map(|series| {
                let objects: Vec<&InMemDicomObject> =
                    series.objects.iter().map(|object| &**object).collect();
                let slices = Self::slice_refs(&objects, sort_by);
                let result = Self::convert(&slices, options);
                match &result {
                    Ok(record) => info!(
                        "converted series {} into {:?} volume",
                        series.series_instance_uid, record.dim
                    ),
                    Err(e) => warn!("could not convert series {}: {e}", series.series_instance_uid),
                }
                (series.series_instance_uid.clone(), result)
            })
            .collect()
    }
}

/// Frame count of multiframe objects; `None` for single-frame ones.
fn number_of_frames<D: DataSet>(object: &D) -> Option<usize> {
    let frames = object.first_int(tags::NUMBER_OF_FRAMES)?;
    usize::try_from(frames).ok().filter(|&frames| frames > 1)
}
