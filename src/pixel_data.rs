//! Decoding of native (uncompressed) Pixel Data into typed buffers.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use dicom_dictionary_std::tags;
use ndarray::{ArrayD, Axis, IxDyn};
use tracing::debug;

use crate::data_set::{DataSet, SliceRef};
use crate::enums::Dtype;
use crate::error::{ConvertError, Result};

/// Row-major samples of one slice, or of a stack of slices.
///
/// A single slice has shape `(rows, columns)`, or `(rows, columns, samples)`
/// for color data. Stacks add a leading slice axis.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    U8(ArrayD<u8>),
    I8(ArrayD<i8>),
    U16(ArrayD<u16>),
    I16(ArrayD<i16>),
    U32(ArrayD<u32>),
    I32(ArrayD<i32>),
    F32(ArrayD<f32>),
}

/// Evaluates `$body` with `$arr` bound to the inner array, whatever its
/// sample type.
macro_rules! dispatch {
    ($buffer:expr, $arr:ident => $body:expr) => {
        match $buffer {
            $crate::pixel_data::PixelBuffer::U8($arr) => $body,
            $crate::pixel_data::PixelBuffer::I8($arr) => $body,
            $crate::pixel_data::PixelBuffer::U16($arr) => $body,
            $crate::pixel_data::PixelBuffer::I16($arr) => $body,
            $crate::pixel_data::PixelBuffer::U32($arr) => $body,
            $crate::pixel_data::PixelBuffer::I32($arr) => $body,
            $crate::pixel_data::PixelBuffer::F32($arr) => $body,
        }
    };
}
pub(crate) use dispatch;

/// Like `dispatch`, but rebuilds a buffer of the same variant from the
/// array produced by `$body`.
macro_rules! map_buffer {
    ($buffer:expr, $arr:ident => $body:expr) => {
        match $buffer {
            $crate::pixel_data::PixelBuffer::U8($arr) => $crate::pixel_data::PixelBuffer::U8($body),
            $crate::pixel_data::PixelBuffer::I8($arr) => $crate::pixel_data::PixelBuffer::I8($body),
            $crate::pixel_data::PixelBuffer::U16($arr) => $crate::pixel_data::PixelBuffer::U16($body),
            $crate::pixel_data::PixelBuffer::I16($arr) => $crate::pixel_data::PixelBuffer::I16($body),
            $crate::pixel_data::PixelBuffer::U32($arr) => $crate::pixel_data::PixelBuffer::U32($body),
            $crate::pixel_data::PixelBuffer::I32($arr) => $crate::pixel_data::PixelBuffer::I32($body),
            $crate::pixel_data::PixelBuffer::F32($arr) => $crate::pixel_data::PixelBuffer::F32($body),
        }
    };
}
pub(crate) use map_buffer;

macro_rules! cast_to {
    ($arr:expr, $dtype:expr) => {
        match $dtype {
            $crate::enums::Dtype::U8 => $crate::pixel_data::PixelBuffer::U8($arr.mapv(|v| v as u8)),
            $crate::enums::Dtype::I8 => $crate::pixel_data::PixelBuffer::I8($arr.mapv(|v| v as i8)),
            $crate::enums::Dtype::U16 => $crate::pixel_data::PixelBuffer::U16($arr.mapv(|v| v as u16)),
            $crate::enums::Dtype::I16 => $crate::pixel_data::PixelBuffer::I16($arr.mapv(|v| v as i16)),
            $crate::enums::Dtype::U32 => $crate::pixel_data::PixelBuffer::U32($arr.mapv(|v| v as u32)),
            $crate::enums::Dtype::I32 => $crate::pixel_data::PixelBuffer::I32($arr.mapv(|v| v as i32)),
            $crate::enums::Dtype::F32 => $crate::pixel_data::PixelBuffer::F32($arr.mapv(|v| v as f32)),
        }
    };
}

impl PixelBuffer {
    pub fn dtype(&self) -> Dtype {
        match self {
            PixelBuffer::U8(_) => Dtype::U8,
            PixelBuffer::I8(_) => Dtype::I8,
            PixelBuffer::U16(_) => Dtype::U16,
            PixelBuffer::I16(_) => Dtype::I16,
            PixelBuffer::U32(_) => Dtype::U32,
            PixelBuffer::I32(_) => Dtype::I32,
            PixelBuffer::F32(_) => Dtype::F32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        dispatch!(self, arr => arr.shape())
    }

    pub fn len(&self) -> usize {
        dispatch!(self, arr => arr.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts every sample with `as` semantics. Returns the buffer
    /// untouched when it already has the requested type.
    pub fn cast(self, dtype: Dtype) -> PixelBuffer {
        if self.dtype() == dtype {
            return self;
        }
        dispatch!(self, arr => cast_to!(arr, dtype))
    }

    /// Smallest and largest sample, `None` for an empty buffer.
    pub fn min_max(&self) -> Option<(f64, f64)> {
        dispatch!(self, arr => arr.iter().fold(None, |acc, &v| {
            let v = v as f64;
            match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((f64::min(lo, v), f64::max(hi, v))),
            }
        }))
    }

    /// Sample at a flat row-major index, as `f64`.
    pub fn value_at(&self, index: usize) -> Option<f64> {
        dispatch!(self, arr => arr.as_slice().and_then(|s| s.get(index)).map(|&v| v as f64))
    }

    /// Stacks buffers of one type and shape along a new leading axis.
    pub fn stack(buffers: &[PixelBuffer]) -> Result<PixelBuffer> {
        let first = buffers.first().ok_or(ConvertError::NoSlices)?;
        if buffers
            .iter()
            .any(|b| b.shape() != first.shape() || b.dtype() != first.dtype())
        {
            return Err(ConvertError::InconsistentDimensions);
        }

        macro_rules! stack_variant {
            ($variant:ident) => {{
                let views: Vec<_> = buffers
                    .iter()
                    .filter_map(|b| match b {
                        PixelBuffer::$variant(arr) => Some(arr.view()),
                        _ => None,
                    })
                    .collect();
                PixelBuffer::$variant(ndarray::stack(Axis(0), &views)?)
            }};
        }

        Ok(match first.dtype() {
            Dtype::U8 => stack_variant!(U8),
            Dtype::I8 => stack_variant!(I8),
            Dtype::U16 => stack_variant!(U16),
            Dtype::I16 => stack_variant!(I16),
            Dtype::U32 => stack_variant!(U32),
            Dtype::I32 => stack_variant!(I32),
            Dtype::F32 => stack_variant!(F32),
        })
    }
}

/// Layout of the stored samples, read from the image pixel module.
#[derive(Debug, Clone, Copy)]
struct PixelLayout {
    rows: usize,
    columns: usize,
    samples_per_pixel: usize,
    planar: bool,
    dtype: Dtype,
    big_endian: bool,
    bits_stored: u32,
}

impl PixelLayout {
    fn read<D: DataSet>(data_set: &D) -> Result<Self> {
        let high_bit = required_int(data_set, tags::HIGH_BIT)?;
        // Same convention as the source writer: a zero high bit marks
        // big-endian samples.
        let big_endian = high_bit == 0;

        let signed = data_set
            .first_int(tags::PIXEL_REPRESENTATION)
            .unwrap_or(0)
            == 1;

        let bits_allocated = required_int(data_set, tags::BITS_ALLOCATED)?;
        if bits_allocated % 8 != 0 {
            return Err(ConvertError::UnsupportedFormat(format!(
                "cannot handle non-byte types ({bits_allocated} bits allocated)"
            )));
        }
        let dtype = u32::try_from(bits_allocated)
            .ok()
            .and_then(|bits| Dtype::from_bits(bits, signed))
            .ok_or_else(|| {
                ConvertError::UnsupportedFormat(format!(
                    "{bits_allocated} bits allocated is not supported"
                ))
            })?;

        Ok(Self {
            rows: required_unsigned(data_set, tags::ROWS)?,
            columns: required_unsigned(data_set, tags::COLUMNS)?,
            samples_per_pixel: samples_per_pixel(data_set),
            planar: data_set.first_int(tags::PLANAR_CONFIGURATION) == Some(1),
            dtype,
            big_endian,
            bits_stored: required_unsigned(data_set, tags::BITS_STORED)?,
        })
    }

    fn frame_len(&self) -> usize {
        self.rows * self.columns * self.samples_per_pixel * self.dtype.size_in_bytes()
    }

    fn shape(&self) -> Vec<usize> {
        match (self.samples_per_pixel, self.planar) {
            (1, _) => vec![self.rows, self.columns],
            (spp, false) => vec![self.rows, self.columns, spp],
            (spp, true) => vec![spp, self.rows, self.columns],
        }
    }

    fn mask(&self) -> u64 {
        match self.bits_stored {
            bits if bits >= 64 => u64::MAX,
            bits => (1_u64 << bits) - 1,
        }
    }
}

pub(crate) fn required_int<D: DataSet>(data_set: &D, tag: dicom::core::Tag) -> Result<i64> {
    data_set
        .first_int(tag)
        .ok_or(ConvertError::MissingElement(tag))
}

fn required_unsigned<D, T>(data_set: &D, tag: dicom::core::Tag) -> Result<T>
where
    D: DataSet,
    T: TryFrom<i64>,
{
    let value = required_int(data_set, tag)?;
    T::try_from(value).map_err(|_| {
        ConvertError::UnsupportedFormat(format!("invalid value {value} for {tag}"))
    })
}

pub(crate) fn samples_per_pixel<D: DataSet>(data_set: &D) -> usize {
    data_set
        .first_int(tags::SAMPLES_PER_PIXEL)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(1)
}

macro_rules! decode_samples {
    ($bytes:expr, $big_endian:expr, $t:ty, $read:ident) => {{
        let width = std::mem::size_of::<$t>();
        $bytes
            .chunks_exact(width)
            .map(|chunk| {
                if $big_endian {
                    BigEndian::$read(chunk)
                } else {
                    LittleEndian::$read(chunk)
                }
            })
            .collect::<Vec<$t>>()
    }};
}

/// Decodes the pixel samples of one slice.
///
/// Samples are masked to Bits Stored. When the data set carries both a
/// rescale slope and intercept (in the Pixel Value Transformation Sequence
/// or at the top level), the result is rescaled into `f32`.
pub fn extract<D: DataSet>(slice: SliceRef<'_, D>) -> Result<PixelBuffer> {
    let data_set = slice.data_set;
    let layout = PixelLayout::read(data_set)?;

    let pixel_data = data_set
        .as_binary(tags::PIXEL_DATA)
        .ok_or(ConvertError::MissingElement(tags::PIXEL_DATA))?;

    let frame_len = layout.frame_len();
    let offset = if data_set.has(tags::NUMBER_OF_FRAMES) {
        slice.frame_index() * frame_len
    } else {
        0
    };
    let bytes = pixel_data.get(offset..offset + frame_len).ok_or(
        ConvertError::PixelDataLength {
            expected: offset + frame_len,
            actual: pixel_data.len(),
        },
    )?;

    let shape = IxDyn(&layout.shape());
    let mask = layout.mask();
    let big_endian = layout.big_endian;
    let buffer = match layout.dtype {
        Dtype::U8 => PixelBuffer::U8(ArrayD::from_shape_vec(shape, bytes.to_vec())?),
        Dtype::I8 => PixelBuffer::I8(ArrayD::from_shape_vec(
            shape,
            bytes.iter().map(|&b| b as i8).collect(),
        )?),
        Dtype::U16 => PixelBuffer::U16(ArrayD::from_shape_vec(
            shape,
            decode_samples!(bytes, big_endian, u16, read_u16),
        )?),
        Dtype::I16 => PixelBuffer::I16(ArrayD::from_shape_vec(
            shape,
            decode_samples!(bytes, big_endian, i16, read_i16),
        )?),
        Dtype::U32 => PixelBuffer::U32(ArrayD::from_shape_vec(
            shape,
            decode_samples!(bytes, big_endian, u32, read_u32),
        )?),
        Dtype::I32 => PixelBuffer::I32(ArrayD::from_shape_vec(
            shape,
            decode_samples!(bytes, big_endian, i32, read_i32),
        )?),
        Dtype::F32 => {
            return Err(ConvertError::UnsupportedFormat(
                "floating point pixel data".to_string(),
            ));
        }
    };

    // Color-by-plane data is moved to the trailing sample axis.
    let buffer = if layout.planar && layout.samples_per_pixel > 1 {
        map_buffer!(buffer, arr => arr.permuted_axes(IxDyn(&[1, 2, 0])).as_standard_layout().into_owned())
    } else {
        buffer
    };

    // Mask the data using Bits Stored, cf. PS 3.5, 8.1.1
    let buffer = dispatch!(buffer, arr => mask_samples(arr, mask));

    let buffer = match rescale_parameters(data_set) {
        Some((slope, intercept)) => {
            debug!(slope, intercept, "rescaling pixel data");
            let (slope, intercept) = (slope as f32, intercept as f32);
            PixelBuffer::F32(dispatch!(buffer, arr => arr.mapv(|v| v as f32 * slope + intercept)))
        }
        None => buffer,
    };

    Ok(buffer)
}

trait Masked: Copy {
    fn masked(self, mask: u64) -> Self;
}

macro_rules! impl_masked {
    ($($t:ty),*) => {
        $(
            impl Masked for $t {
                fn masked(self, mask: u64) -> Self {
                    self & (mask as $t)
                }
            }
        )*
    };
}

impl_masked!(u8, i8, u16, i16, u32, i32);

impl Masked for f32 {
    fn masked(self, _mask: u64) -> Self {
        self
    }
}

fn mask_samples<T>(mut arr: ArrayD<T>, mask: u64) -> PixelBuffer
where
    T: Masked,
    ArrayD<T>: Into<PixelBuffer>,
{
    arr.mapv_inplace(|v| v.masked(mask));
    arr.into()
}

macro_rules! impl_from_array {
    ($($t:ty => $variant:ident),*) => {
        $(
            impl From<ArrayD<$t>> for PixelBuffer {
                fn from(arr: ArrayD<$t>) -> Self {
                    PixelBuffer::$variant(arr)
                }
            }
        )*
    };
}

impl_from_array!(u8 => U8, i8 => I8, u16 => U16, i16 => I16, u32 => U32, i32 => I32, f32 => F32);

/// Slope and intercept, only when both are available.
fn rescale_parameters<D: DataSet>(data_set: &D) -> Option<(f64, f64)> {
    let transformation = data_set
        .item(tags::PIXEL_VALUE_TRANSFORMATION_SEQUENCE, 0)
        .unwrap_or(data_set);
    let slope = transformation.first_real(tags::RESCALE_SLOPE)?;
    let intercept = transformation.first_real(tags::RESCALE_INTERCEPT)?;
    Some((slope, intercept))
}
