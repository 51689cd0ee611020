use clap::ValueEnum;

/// Order applied to single-frame slices before conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SortBy {
    /// Distance along the slice normal
    #[default]
    #[value(name = "position")]
    ImagePositionPatient,
    #[value(name = "table")]
    TablePosition,
    #[value(name = "instance")]
    InstanceNumber,
    None,
}

/// Sample type of a pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Dtype {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
}

impl Dtype {
    pub fn is_float(self) -> bool {
        matches!(self, Dtype::F32)
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            Dtype::U8 | Dtype::I8 => 1,
            Dtype::U16 | Dtype::I16 => 2,
            Dtype::U32 | Dtype::I32 | Dtype::F32 => 4,
        }
    }

    /// Integer type matching the Bits Allocated / Pixel Representation pair.
    pub fn from_bits(bits_allocated: u32, signed: bool) -> Option<Self> {
        match (bits_allocated, signed) {
            (8, false) => Some(Dtype::U8),
            (8, true) => Some(Dtype::I8),
            (16, false) => Some(Dtype::U16),
            (16, true) => Some(Dtype::I16),
            (32, false) => Some(Dtype::U32),
            (32, true) => Some(Dtype::I32),
            _ => None,
        }
    }
}

/// NIfTI `qform_code` / `sform_code` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum XformCode {
    Unknown = 0,
    ScannerAnat = 1,
}

/// NIfTI spatial units stored in `xyzt_units`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpatialUnits {
    Unknown = 0,
    Millimeter = 2,
}

/// NIfTI `datatype` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum NiftiType {
    Uint8 = 2,
    Int16 = 4,
    Int32 = 8,
    Float32 = 16,
    Rgb24 = 128,
    Int8 = 256,
    Uint16 = 512,
    Uint32 = 768,
}

impl NiftiType {
    pub fn bitpix(self) -> i16 {
        match self {
            NiftiType::Uint8 | NiftiType::Int8 => 8,
            NiftiType::Int16 | NiftiType::Uint16 => 16,
            NiftiType::Rgb24 => 24,
            NiftiType::Int32 | NiftiType::Uint32 | NiftiType::Float32 => 32,
        }
    }
}

impl From<Dtype> for NiftiType {
    fn from(dtype: Dtype) -> Self {
        match dtype {
            Dtype::U8 => NiftiType::Uint8,
            Dtype::I8 => NiftiType::Int8,
            Dtype::U16 => NiftiType::Uint16,
            Dtype::I16 => NiftiType::Int16,
            Dtype::U32 => NiftiType::Uint32,
            Dtype::I32 => NiftiType::Int32,
            Dtype::F32 => NiftiType::Float32,
        }
    }
}
