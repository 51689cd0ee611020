//! Read access to DICOM data sets.
//!
//! Conversion code only ever asks a data set whether an attribute exists
//! and for its value as a sequence of integers, reals, strings or raw bytes.
//! Sequence attributes expose their items as nested data sets.

use std::borrow::Cow;

use dicom::core::Tag;
use dicom::object::InMemDicomObject;

pub trait DataSet {
    fn has(&self, tag: Tag) -> bool;

    fn as_int(&self, tag: Tag) -> Option<Vec<i64>>;

    fn as_real(&self, tag: Tag) -> Option<Vec<f64>>;

    /// Multi-valued strings are split on the backslash delimiter.
    fn as_string(&self, tag: Tag) -> Option<Vec<String>>;

    fn as_binary(&self, tag: Tag) -> Option<Cow<'_, [u8]>>;

    fn items(&self, tag: Tag) -> Option<&[Self]>
    where
        Self: Sized;

    fn item(&self, tag: Tag, index: usize) -> Option<&Self>
    where
        Self: Sized,
    {
        self.items(tag)?.get(index)
    }

    fn first_int(&self, tag: Tag) -> Option<i64> {
        self.as_int(tag)?.first().copied()
    }

    fn first_real(&self, tag: Tag) -> Option<f64> {
        self.as_real(tag)?.first().copied()
    }
}

impl DataSet for InMemDicomObject {
    fn has(&self, tag: Tag) -> bool {
        self.get(tag).is_some()
    }

    fn as_int(&self, tag: Tag) -> Option<Vec<i64>> {
        self.get(tag)?.to_multi_int::<i64>().ok()
    }

    fn as_real(&self, tag: Tag) -> Option<Vec<f64>> {
        self.get(tag)?.to_multi_float64().ok()
    }

    fn as_string(&self, tag: Tag) -> Option<Vec<String>> {
        let value = self.get(tag)?.to_str().ok()?;
        Some(
            value
                .split('\\')
                .map(|s| s.trim_matches(|c: char| c.is_whitespace() || c == '\0').to_string())
                .collect(),
        )
    }

    fn as_binary(&self, tag: Tag) -> Option<Cow<'_, [u8]>> {
        self.get(tag)?.to_bytes().ok()
    }

    fn items(&self, tag: Tag) -> Option<&[Self]> {
        self.get(tag)?.value().items()
    }
}

/// One logical 2D slice: a data set, plus the frame index for multiframe
/// objects.
#[derive(Debug)]
pub struct SliceRef<'a, D> {
    pub data_set: &'a D,
    pub frame: Option<usize>,
}

impl<D> Clone for SliceRef<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for SliceRef<'_, D> {}

impl<'a, D> SliceRef<'a, D> {
    pub fn new(data_set: &'a D) -> Self {
        Self {
            data_set,
            frame: None,
        }
    }

    pub fn frame(data_set: &'a D, frame: usize) -> Self {
        Self {
            data_set,
            frame: Some(frame),
        }
    }

    /// Frame index to use when indexing per-frame data.
    pub fn frame_index(&self) -> usize {
        self.frame.unwrap_or(0)
    }
}
