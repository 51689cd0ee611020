//! # DICOM to NIfTI volume library
//!
//! This crate turns a series of DICOM slices into a NIfTI volume: one typed
//! pixel buffer with a voxel-to-world transform.
//!
//! This library is part of the dicom-rs ecosystem and works on
//! [`InMemDicomObject`]s through the small [`DataSet`] accessor trait.
//! The conversion of one volume goes through four steps:
//!  - Pixel data of every slice is decoded (byte order, signedness, Bits
//!    Stored mask, rescale slope and intercept)
//!  - Origin, spacing and direction are derived from the slice metadata,
//!    including the shared and per-frame functional groups of enhanced
//!    multiframe objects. Missing attributes fall back to defaults.
//!  - Siemens mosaics are split into their tiles
//!  - Slices are stacked and the RAS transform, calibration range and NIfTI
//!    codes are gathered into an [`ImageRecord`]
//!
//! Slices must be given in spatial order. [`VolumeLoader`] reads and
//! groups files by series, expands multiframe objects into frames and sorts
//! single-frame slices. Independent series are converted in parallel using
//! rayon.
//!
//! # Examples
//!
//! ## Converting all series of a directory
//!
//! ```no_run
//! # use dicom_nifti_volume::{ConversionOptions, SortBy, VolumeLoader, write_nifti};
//! let series = VolumeLoader::scan_directory("dicom")
//!     .expect("should have loaded files from directory");
//! for (uid, record) in
//!     VolumeLoader::convert_series(&series, SortBy::default(), &ConversionOptions::default())
//! {
//!     if let Ok(record) = record {
//!         write_nifti(format!("{uid}.nii"), record).expect("should have written volume");
//!     }
//! }
//! ```
//!
//! [`InMemDicomObject`]: https://docs.rs/dicom-object/latest/dicom_object/mem/struct.InMemDicomObject.html

pub mod csa;
pub mod data_set;
pub mod enums;
pub mod error;
pub mod geometry;
pub mod mosaic;
pub mod nifti;
pub mod pixel_data;
pub mod preview;
pub mod volume;
pub mod volume_loader;

pub use data_set::{DataSet, SliceRef};
pub use enums::{Dtype, SortBy};
pub use error::ConvertError;
pub use geometry::Geometry;
pub use nifti::{ImageWriter, NiftiWriter, write_nifti};
pub use pixel_data::PixelBuffer;
pub use volume::{ImageRecord, Volume};
pub use volume_loader::{ConversionOptions, VolumeLoader};
