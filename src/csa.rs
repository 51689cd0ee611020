//! Siemens CSA header parsing.
//!
//! Siemens stores acquisition details, among them the mosaic layout, in a
//! private "shadow" header, (0029,1010) for image attributes. Two layouts
//! exist: CSA1, which starts directly with the tag count, and CSA2, which
//! starts with the `SV10` magic followed by four filler bytes.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

const CSA2_MAGIC: &[u8; 4] = b"SV10";
const NAME_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum CsaError {
    #[error("CSA header is truncated")]
    Truncated,

    #[error("Invalid value {value:?} for CSA element {name}")]
    InvalidValue { name: String, value: String },

    #[error("Missing CSA element {0}")]
    MissingElement(String),

    #[error("No CSA image header")]
    MissingHeader,
}

impl From<std::io::Error> for CsaError {
    fn from(_: std::io::Error) -> Self {
        // Reads only ever fail on an in-memory cursor running out of data.
        CsaError::Truncated
    }
}

/// Values of one CSA element, typed after its value representation.
#[derive(Debug, Clone, PartialEq)]
pub enum CsaValues {
    Int(Vec<i64>),
    Real(Vec<f64>),
    Text(Vec<String>),
}

impl CsaValues {
    pub fn len(&self) -> usize {
        match self {
            CsaValues::Int(values) => values.len(),
            CsaValues::Real(values) => values.len(),
            CsaValues::Text(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Numeric values as reals; text yields `None`.
    pub fn as_reals(&self) -> Option<Vec<f64>> {
        match self {
            CsaValues::Int(values) => Some(values.iter().map(|&v| v as f64).collect()),
            CsaValues::Real(values) => Some(values.clone()),
            CsaValues::Text(_) => None,
        }
    }

    /// Numeric values as integers; reals are accepted only when integral.
    pub fn as_ints(&self) -> Option<Vec<i64>> {
        match self {
            CsaValues::Int(values) => Some(values.clone()),
            CsaValues::Real(values) => values
                .iter()
                .map(|&v| (v.fract() == 0.0).then_some(v as i64))
                .collect(),
            CsaValues::Text(_) => None,
        }
    }
}

/// Parsed CSA header: element name to values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsaHeader {
    elements: HashMap<String, CsaValues>,
}

impl CsaHeader {
    pub fn get(&self, name: &str) -> Option<&CsaValues> {
        self.elements.get(name)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn int(&self, name: &str) -> Result<i64, CsaError> {
        self.get(name)
            .and_then(CsaValues::as_ints)
            .and_then(|values| values.first().copied())
            .ok_or_else(|| CsaError::MissingElement(name.to_string()))
    }

    pub fn reals(&self, name: &str) -> Result<Vec<f64>, CsaError> {
        self.get(name)
            .and_then(CsaValues::as_reals)
            .filter(|values| !values.is_empty())
            .ok_or_else(|| CsaError::MissingElement(name.to_string()))
    }
}

/// Parses a CSA1 or CSA2 header.
pub fn parse(data: &[u8]) -> Result<CsaHeader, CsaError> {
    let mut cursor = Cursor::new(data);
    let csa2 = data.starts_with(CSA2_MAGIC);
    if csa2 {
        // magic, then four unused bytes
        cursor.set_position(8);
    }
    let n_tags = cursor.read_u32::<LittleEndian>()?;
    // unused, usually 77
    cursor.read_u32::<LittleEndian>()?;

    let mut elements = HashMap::new();
    let mut first_item_count = None;
    for _ in 0..n_tags {
        let name = read_name(&mut cursor)?;
        let vm = cursor.read_i32::<LittleEndian>()?;
        let mut vr = [0_u8; 4];
        cursor.read_exact(&mut vr)?;
        let vr = trim_nul(&vr);
        // SyngoDT
        cursor.read_i32::<LittleEndian>()?;
        let n_items = cursor.read_i32::<LittleEndian>()?;
        // check word, 77 or 205
        cursor.read_i32::<LittleEndian>()?;
        let first_item_count = *first_item_count.get_or_insert(n_items);

        let mut items = Vec::new();
        for item_index in 0..n_items.max(0) {
            let mut words = [0_i32; 4];
            cursor.read_i32_into::<LittleEndian>(&mut words)?;
            let item_len = if csa2 {
                words[1]
            } else {
                words[0]
                    .checked_sub(first_item_count)
                    .ok_or(CsaError::Truncated)?
            };
            let item_len = usize::try_from(item_len).map_err(|_| CsaError::Truncated)?;
            let remaining = data.len().saturating_sub(cursor.position() as usize);
            if item_len > remaining {
                return Err(CsaError::Truncated);
            }

            let mut item = vec![0_u8; item_len];
            cursor.read_exact(&mut item)?;
            let padding = (4 - item_len % 4) % 4;
            cursor.set_position(cursor.position() + padding as u64);

            if vm > 0 && item_index >= vm {
                continue;
            }
            let text = trim_nul(&item);
            if !text.trim().is_empty() {
                items.push(text.trim().to_string());
            }
        }

        let values = typed_values(&name, &vr, items)?;
        elements.insert(name, values);
    }

    Ok(CsaHeader { elements })
}

fn read_name(cursor: &mut Cursor<&[u8]>) -> Result<String, CsaError> {
    let mut name = [0_u8; NAME_LEN];
    cursor.read_exact(&mut name)?;
    Ok(trim_nul(&name))
}

fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn typed_values(name: &str, vr: &str, items: Vec<String>) -> Result<CsaValues, CsaError> {
    let invalid = |value: &String| CsaError::InvalidValue {
        name: name.to_string(),
        value: value.clone(),
    };
    Ok(match vr {
        "IS" | "SL" | "SS" | "UL" | "US" => CsaValues::Int(
            items
                .iter()
                .map(|item| {
                    // IS values are occasionally written as reals
                    item.parse::<i64>()
                        .or_else(|_| item.parse::<f64>().map(|v| v as i64))
                        .map_err(|_| invalid(item))
                })
                .collect::<Result<_, _>>()?,
        ),
        "DS" | "FD" | "FL" => CsaValues::Real(
            items
                .iter()
                .map(|item| item.parse::<f64>().map_err(|_| invalid(item)))
                .collect::<Result<_, _>>()?,
        ),
        _ => CsaValues::Text(items),
    })
}
