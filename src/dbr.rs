//! Represent CA DBR representations, as delivered by a transport.
//!
//! CA defines [DBR] kinds as fixed-layout structures used to transfer data back and
//! forth. These break down into seven basic array types, which define the data, and
//! five categories of attached metadata. This module models both, parses the byte
//! layout selected by a [`DbrType`] tag, and writes the same layout back out (which is
//! what [`crate::transport::MemoryTransport`] uses to simulate a server).
//!
//! The basic types are enumerated in [`DbrBasicType`] and are represented in
//! [`DbrValue`]. All numeric data types in CA are signed and any of them can be an
//! array:
//! - [`DbrValue::Char`] ([`Vec<i8>`])
//! - [`DbrValue::Int`] ([`Vec<i16>`])
//! - [`DbrValue::Long`] ([`Vec<i32>`])
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`Vec<u16>`]), an index into up to sixteen labels carried by
//!   the `GR`/`CTRL` categories.
//! - [`DbrValue::String`] - natively a `[u8; 40]` per element, represented here by
//!   [`Vec<String>`].
//!
//! `SHORT` is accepted as an alias for `INT` when parsing type names.
//!
//! The five metadata categories are enumerated by [`DbrCategory`] and represented by
//! [`Dbr`]:
//! - [`Dbr::Basic`] - No extra metadata included, just the plain data value.
//! - [`Dbr::Status`] - Alarm status and severity in addition to the data.
//! - [`Dbr::Time`] - All of [`Dbr::Status`], with the record timestamp.
//! - [`Dbr::Graphics`] - Status plus units, display precision, display/alarm/warning
//!   limits, or enum labels.
//! - [`Dbr::Control`] - All of [`Dbr::Graphics`] plus control limits.
//!
//! [DBR]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types
//!
use nom::{
    IResult, Parser,
    bytes::complete::take,
    multi::count,
    number::complete::{be_f32, be_f64, be_i8, be_i16, be_i32, be_u16, be_u32},
};
use num::{NumCast, cast::AsPrimitive, traits::ToBytes};
use std::{
    cmp,
    convert::TryFrom,
    fmt::{self, Debug},
    io::{self, Cursor},
    num::NonZeroUsize,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

use crate::error::ErrorCondition;

// Constants from EPICS
pub const MAX_STRING_SIZE: usize = 40;
pub const MAX_UNITS_SIZE: usize = 8;
pub const MAX_ENUM_STRING_SIZE: usize = 26;
pub const MAX_ENUM_STATES: usize = 16;
/// Seconds between the UNIX epoch and the EPICS epoch (1990-01-01)
const EPICS_EPOCH_OFFSET: u64 = 631152000;

/// Encode a String to a fixed-maximum-length byte array
///
/// We want to convert a string to a byte sequence but never a length > `max_length`.
/// We can't convert and truncate because although we don't _expect_ to ever handle
/// non-ASCII it technically isn't guaranteed. So, convert one-character-at-a-time
/// until the length would go over.
fn string_to_fixed_length_bytes(value: &str, max_length: usize) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(max_length);
    for c in value.chars() {
        if buffer.len() + c.len_utf8() <= max_length {
            let mut char_buffer = [0u8; 4];
            buffer.extend_from_slice(c.encode_utf8(&mut char_buffer).as_bytes());
        } else {
            break;
        }
    }
    buffer
}

/// Write a string as a NUL-padded field of exactly `size` bytes
fn fixed_field(value: &str, size: usize) -> Vec<u8> {
    let mut buffer = string_to_fixed_length_bytes(value, size - 1);
    buffer.resize(size, 0u8);
    buffer
}

/// Interpret bytes as text, ending at the first embedded NUL
pub(crate) fn trim_at_nul(raw: &[u8]) -> String {
    let end = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn fixed_string(length: usize) -> impl for<'a> FnMut(&'a [u8]) -> IResult<&'a [u8], String> {
    move |input| {
        let (input, raw) = take(length).parse(input)?;
        Ok((input, trim_at_nul(raw)))
    }
}

/// Represent actual data transferred over CA
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(Vec<u16>),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

/// Types of errors that can be returned from [`DbrValue::parse_into`]
#[derive(Debug, Error)]
pub enum DbrParseError {
    #[error("Value is not a string")]
    SelfIsNotString,
    #[error("Could not parse '{0}'")]
    CannotParse(String),
}

/// A payload did not match the layout required by its DBR type
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{length} byte payload is malformed or too short for {count} x {data_type}")]
    Malformed {
        data_type: DbrType,
        count: usize,
        length: usize,
    },
    #[error("Unknown DBR type id {0}")]
    UnknownType(u16),
}

impl DbrValue {
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(val) => val.len(),
            DbrValue::String(val) => val.len(),
            DbrValue::Char(val) => val.len(),
            DbrValue::Int(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }
    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// Every element widened to `f64`, or `None` for string data
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        fn widen<T: AsPrimitive<f64>>(from: &[T]) -> Vec<f64> {
            from.iter().map(|v| v.as_()).collect()
        }
        Some(match self {
            DbrValue::String(_) => return None,
            DbrValue::Enum(val) => widen(val),
            DbrValue::Char(val) => widen(val),
            DbrValue::Int(val) => widen(val),
            DbrValue::Long(val) => widen(val),
            DbrValue::Float(val) => widen(val),
            DbrValue::Double(val) => widen(val),
        })
    }

    /// Convert a DbrValue::String to another data type by parsing the numeric string
    ///
    /// Fails if the DbrValue is not String or if the value cannot be parsed. Asking
    /// for a convertion from String->String just copies without doing any extra parsing.
    pub fn parse_into(&self, basic_type: DbrBasicType) -> Result<DbrValue, DbrParseError> {
        fn parse_all<T: FromStr>(val: &[String]) -> Result<Vec<T>, DbrParseError> {
            val.iter()
                .map(|s| {
                    s.trim()
                        .parse()
                        .map_err(|_| DbrParseError::CannotParse(s.clone()))
                })
                .collect()
        }
        let DbrValue::String(val) = self else {
            return Err(DbrParseError::SelfIsNotString);
        };
        Ok(match basic_type {
            DbrBasicType::Enum => DbrValue::Enum(parse_all(val)?),
            DbrBasicType::String => self.clone(),
            DbrBasicType::Char => DbrValue::Char(parse_all(val)?),
            DbrBasicType::Int => DbrValue::Int(parse_all(val)?),
            DbrBasicType::Long => DbrValue::Long(parse_all(val)?),
            DbrBasicType::Float => DbrValue::Float(parse_all(val)?),
            DbrBasicType::Double => DbrValue::Double(parse_all(val)?),
        })
    }

    /// Convert a value supplied by a client into the native type of a channel
    ///
    /// Strings are parsed as numbers for numeric targets, and encoded as bytes for
    /// `CHAR` targets. Everything else goes through [`DbrValue::convert_to`].
    pub fn coerce_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        match (self, basic_type) {
            (DbrValue::String(_), DbrBasicType::Char | DbrBasicType::String) => {
                self.convert_to(basic_type)
            }
            (DbrValue::String(_), _) => self
                .parse_into(basic_type)
                .map_err(|_| ErrorCondition::NoConvert),
            _ => self.convert_to(basic_type),
        }
    }

    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        /// Utility function so that we don't have to repeat the map iter conversion
        fn _try_convert_vec<T, U>(from: &[T]) -> Result<Vec<U>, ErrorCondition>
        where
            T: Copy + NumCast,
            U: NumCast,
        {
            from.iter()
                .map(|n| NumCast::from(*n).ok_or(ErrorCondition::NoConvert))
                .collect()
        }
        /// Convert a single-item string to a numeric array of its bytes
        fn _encode_string<T>(from: &[String]) -> Result<Vec<T>, ErrorCondition>
        where
            T: Copy + 'static,
            u8: AsPrimitive<T>,
        {
            Ok(match from {
                [] => Vec::new(),
                [val] => val.as_bytes().iter().map(|c| c.as_()).collect(),
                _ => Err(ErrorCondition::NoConvert)?,
            })
        }
        fn _format_vec<T: ToString>(from: &[T]) -> Vec<String> {
            from.iter().map(|v| v.to_string()).collect()
        }

        Ok(match basic_type {
            DbrBasicType::Char => match self {
                DbrValue::Char(_val) => self.clone(),
                DbrValue::Int(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Char(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Char(_try_convert_vec(val)?),
            },
            DbrBasicType::Int => match self {
                DbrValue::Char(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Int(_val) => self.clone(),
                DbrValue::Long(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Int(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Int(_try_convert_vec(val)?),
            },
            DbrBasicType::Long => match self {
                DbrValue::Char(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Long(_val) => self.clone(),
                DbrValue::Float(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Long(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Long(_try_convert_vec(val)?),
            },
            DbrBasicType::Float => match self {
                DbrValue::Char(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Float(_val) => self.clone(),
                DbrValue::Double(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Float(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Float(_try_convert_vec(val)?),
            },
            DbrBasicType::Double => match self {
                DbrValue::Char(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Double(_val) => self.clone(),
                DbrValue::String(val) => DbrValue::Double(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Double(_try_convert_vec(val)?),
            },
            DbrBasicType::String => match self {
                DbrValue::String(_) => self.clone(),
                DbrValue::Char(val) => DbrValue::String(vec![trim_at_nul(
                    &val.iter().map(|c| *c as u8).collect::<Vec<u8>>(),
                )]),
                DbrValue::Int(val) => DbrValue::String(_format_vec(val)),
                DbrValue::Long(val) => DbrValue::String(_format_vec(val)),
                DbrValue::Float(val) => DbrValue::String(_format_vec(val)),
                DbrValue::Double(val) => DbrValue::String(_format_vec(val)),
                DbrValue::Enum(val) => DbrValue::String(_format_vec(val)),
            },
            DbrBasicType::Enum => match self {
                DbrValue::Enum(_val) => self.clone(),
                DbrValue::Char(val) => DbrValue::Enum(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Enum(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Enum(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Enum(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Enum(_try_convert_vec(val)?),
                DbrValue::String(_) => return Err(ErrorCondition::NoConvert),
            },
        })
    }

    /// Encode the value contents of a DBR into a byte vector
    ///
    /// If max_elems is `None`, then all elements available will be returned.
    ///
    /// Returns the number of elements along with the bytes
    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let elements = if let Some(max_elem) = max_elems {
            cmp::min(max_elem.into(), self.get_count())
        } else {
            self.get_count()
        };

        (
            elements,
            match self {
                DbrValue::Enum(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::String(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| fixed_field(v, MAX_STRING_SIZE))
                    .collect(),
                DbrValue::Char(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Int(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Long(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Float(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Double(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
            },
        )
    }

    fn parse_value(
        data_type: DbrBasicType,
        item_count: usize,
        data: &[u8],
    ) -> IResult<&[u8], DbrValue> {
        Ok(match data_type {
            DbrBasicType::Enum => {
                let (data, v) = count(be_u16, item_count).parse(data)?;
                (data, DbrValue::Enum(v))
            }
            DbrBasicType::String => {
                let (data, v) = count(fixed_string(MAX_STRING_SIZE), item_count).parse(data)?;
                (data, DbrValue::String(v))
            }
            DbrBasicType::Char => {
                let (data, v) = count(be_i8, item_count).parse(data)?;
                (data, DbrValue::Char(v))
            }
            DbrBasicType::Int => {
                let (data, v) = count(be_i16, item_count).parse(data)?;
                (data, DbrValue::Int(v))
            }
            DbrBasicType::Long => {
                let (data, v) = count(be_i32, item_count).parse(data)?;
                (data, DbrValue::Long(v))
            }
            DbrBasicType::Float => {
                let (data, v) = count(be_f32, item_count).parse(data)?;
                (data, DbrValue::Float(v))
            }
            DbrBasicType::Double => {
                let (data, v) = count(be_f64, item_count).parse(data)?;
                (data, DbrValue::Double(v))
            }
        })
    }

    pub fn resize(&mut self, to_size: usize) {
        match self {
            DbrValue::Enum(items) => items.resize(to_size, 0),
            DbrValue::String(items) => items.resize(to_size, String::new()),
            DbrValue::Char(items) => items.resize(to_size, 0),
            DbrValue::Int(items) => items.resize(to_size, 0),
            DbrValue::Long(items) => items.resize(to_size, 0),
            DbrValue::Float(items) => items.resize(to_size, 0.0),
            DbrValue::Double(items) => items.resize(to_size, 0.0),
        };
    }
}

/// Implement a From<datatype> for a specific dbrvalue kind
macro_rules! impl_dbrvalue_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<&$typ> for DbrValue {
            fn from(value: &$typ) -> Self {
                DbrValue::$variant(vec![value.clone()])
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                Ok(match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => v,
                    _ => unreachable!(),
                })
            }
        }
    };
}
impl_dbrvalue_conversions_between!(Char, i8);
impl_dbrvalue_conversions_between!(Int, i16);
impl_dbrvalue_conversions_between!(Long, i32);
impl_dbrvalue_conversions_between!(Float, f32);
impl_dbrvalue_conversions_between!(Double, f64);
impl_dbrvalue_conversions_between!(String, String);

macro_rules! impl_dbrvalue_copy_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
    };
}
impl_dbrvalue_copy_conversions_between!(Char, i8);
impl_dbrvalue_copy_conversions_between!(Int, i16);
impl_dbrvalue_copy_conversions_between!(Long, i32);
impl_dbrvalue_copy_conversions_between!(Float, f32);
impl_dbrvalue_copy_conversions_between!(Double, f64);

/// Single values, for DBR values that hold exactly one element
macro_rules! impl_dbrvalue_scalar_from {
    ($($typ:ty),+) => {
        $(
            impl TryFrom<&DbrValue> for $typ {
                type Error = ErrorCondition;
                fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                    let mut items = Vec::<$typ>::try_from(value)?;
                    match items.len() {
                        1 => Ok(items.remove(0)),
                        _ => Err(ErrorCondition::BadCount),
                    }
                }
            }
        )+
    };
}
impl_dbrvalue_scalar_from!(i8, i16, i32, f32, f64, String);

impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_string()])
    }
}

/// Display, alarm and warning limits, each stored as `(lower, upper)`
#[derive(Clone, Debug, PartialEq)]
pub struct Limits<T> {
    pub display_limits: (T, T),
    pub alarm_limits: (T, T),
    pub warning_limits: (T, T),
}

impl<T: Copy> Limits<T> {
    /// Build from the six values in the order they appear on the wire
    fn from_wire(v: &[T]) -> Self {
        Self {
            display_limits: (v[1], v[0]),
            alarm_limits: (v[5], v[2]),
            warning_limits: (v[4], v[3]),
        }
    }
}

impl<T: ToBytes> Limits<T> {
    fn to_be_bytes(&self) -> Vec<u8> {
        let (d_l, d_u) = &self.display_limits;
        let (a_l, a_u) = &self.alarm_limits;
        let (w_l, w_u) = &self.warning_limits;

        let values = [d_u, d_l, a_u, w_u, w_l, a_l];
        values
            .iter()
            .flat_map(|v| v.to_be_bytes().as_ref().to_vec())
            .collect()
    }
}

impl<T: AsPrimitive<f64>> Limits<T> {
    pub fn widen(&self) -> Limits<f64> {
        let w = |(l, u): (T, T)| (l.as_(), u.as_());
        Limits {
            display_limits: w(self.display_limits),
            alarm_limits: w(self.alarm_limits),
            warning_limits: w(self.warning_limits),
        }
    }
}

impl<T: num_traits::Bounded> Default for Limits<T> {
    fn default() -> Self {
        Self {
            display_limits: (T::min_value(), T::max_value()),
            alarm_limits: (T::min_value(), T::max_value()),
            warning_limits: (T::min_value(), T::max_value()),
        }
    }
}

/// Display metadata carried by the `GR` and `CTRL` categories
#[derive(Clone, Debug, PartialEq)]
pub enum DbrGraphics {
    /// There is no graphics structure for strings; `GR_STRING` is `STS_STRING`
    String,
    Enum {
        labels: Vec<String>,
    },
    Char {
        units: String,
        limits: Limits<i8>,
    },
    Int {
        units: String,
        limits: Limits<i16>,
    },
    Long {
        units: String,
        limits: Limits<i32>,
    },
    Float {
        units: String,
        limits: Limits<f32>,
        precision: i16,
    },
    Double {
        units: String,
        limits: Limits<f64>,
        precision: i16,
    },
}

impl DbrGraphics {
    pub fn default_for(kind: DbrBasicType) -> Self {
        match kind {
            DbrBasicType::String => DbrGraphics::String,
            DbrBasicType::Enum => DbrGraphics::Enum { labels: Vec::new() },
            DbrBasicType::Int => DbrGraphics::Int {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Char => DbrGraphics::Char {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Long => DbrGraphics::Long {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Float => DbrGraphics::Float {
                units: String::new(),
                limits: Limits::default(),
                precision: 0,
            },
            DbrBasicType::Double => DbrGraphics::Double {
                units: String::new(),
                limits: Limits::default(),
                precision: 0,
            },
        }
    }

    pub fn units(&self) -> Option<&str> {
        match self {
            DbrGraphics::String | DbrGraphics::Enum { .. } => None,
            DbrGraphics::Char { units, .. }
            | DbrGraphics::Int { units, .. }
            | DbrGraphics::Long { units, .. }
            | DbrGraphics::Float { units, .. }
            | DbrGraphics::Double { units, .. } => Some(units),
        }
    }

    pub fn precision(&self) -> Option<i16> {
        match self {
            DbrGraphics::Float { precision, .. } | DbrGraphics::Double { precision, .. } => {
                Some(*precision)
            }
            _ => None,
        }
    }

    pub fn labels(&self) -> Option<&[String]> {
        match self {
            DbrGraphics::Enum { labels } => Some(labels),
            _ => None,
        }
    }

    /// Limits converted to `f64`, whatever the native type
    pub fn limits(&self) -> Option<Limits<f64>> {
        match self {
            DbrGraphics::String | DbrGraphics::Enum { .. } => None,
            DbrGraphics::Char { limits, .. } => Some(limits.widen()),
            DbrGraphics::Int { limits, .. } => Some(limits.widen()),
            DbrGraphics::Long { limits, .. } => Some(limits.widen()),
            DbrGraphics::Float { limits, .. } => Some(limits.widen()),
            DbrGraphics::Double { limits, .. } => Some(limits.widen()),
        }
    }

    fn parse(kind: DbrBasicType, input: &[u8]) -> IResult<&[u8], DbrGraphics> {
        Ok(match kind {
            DbrBasicType::String => (input, DbrGraphics::String),
            DbrBasicType::Enum => {
                let (input, no_str) = be_i16(input)?;
                let (input, mut labels) =
                    count(fixed_string(MAX_ENUM_STRING_SIZE), MAX_ENUM_STATES).parse(input)?;
                labels.truncate(no_str.clamp(0, MAX_ENUM_STATES as i16) as usize);
                (input, DbrGraphics::Enum { labels })
            }
            DbrBasicType::Char => {
                let (input, units) = fixed_string(MAX_UNITS_SIZE).parse(input)?;
                let (input, v) = count(be_i8, 6).parse(input)?;
                let limits = Limits::from_wire(&v);
                (input, DbrGraphics::Char { units, limits })
            }
            DbrBasicType::Int => {
                let (input, units) = fixed_string(MAX_UNITS_SIZE).parse(input)?;
                let (input, v) = count(be_i16, 6).parse(input)?;
                let limits = Limits::from_wire(&v);
                (input, DbrGraphics::Int { units, limits })
            }
            DbrBasicType::Long => {
                let (input, units) = fixed_string(MAX_UNITS_SIZE).parse(input)?;
                let (input, v) = count(be_i32, 6).parse(input)?;
                let limits = Limits::from_wire(&v);
                (input, DbrGraphics::Long { units, limits })
            }
            DbrBasicType::Float => {
                // Precision is followed by a 16-bit alignment pad
                let (input, (precision, _)) = (be_i16, be_i16).parse(input)?;
                let (input, units) = fixed_string(MAX_UNITS_SIZE).parse(input)?;
                let (input, v) = count(be_f32, 6).parse(input)?;
                let limits = Limits::from_wire(&v);
                (
                    input,
                    DbrGraphics::Float {
                        units,
                        limits,
                        precision,
                    },
                )
            }
            DbrBasicType::Double => {
                let (input, (precision, _)) = (be_i16, be_i16).parse(input)?;
                let (input, units) = fixed_string(MAX_UNITS_SIZE).parse(input)?;
                let (input, v) = count(be_f64, 6).parse(input)?;
                let limits = Limits::from_wire(&v);
                (
                    input,
                    DbrGraphics::Double {
                        units,
                        limits,
                        precision,
                    },
                )
            }
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            DbrGraphics::String => Vec::new(),
            DbrGraphics::Enum { labels } => {
                let no_str = cmp::min(labels.len(), MAX_ENUM_STATES) as i16;
                let mut out = no_str.to_be_bytes().to_vec();
                for i in 0..MAX_ENUM_STATES {
                    let label = labels.get(i).map(String::as_str).unwrap_or("");
                    out.append(&mut fixed_field(label, MAX_ENUM_STRING_SIZE));
                }
                out
            }
            DbrGraphics::Char { units, limits } => {
                let mut units = fixed_field(units, MAX_UNITS_SIZE);
                units.append(&mut limits.to_be_bytes());
                units
            }
            DbrGraphics::Int { units, limits } => {
                let mut units = fixed_field(units, MAX_UNITS_SIZE);
                units.append(&mut limits.to_be_bytes());
                units
            }
            DbrGraphics::Long { units, limits } => {
                let mut units = fixed_field(units, MAX_UNITS_SIZE);
                units.append(&mut limits.to_be_bytes());
                units
            }
            DbrGraphics::Float {
                units,
                limits,
                precision,
            } => {
                let mut out = precision.to_be_bytes().to_vec();
                out.extend_from_slice(&[0u8; 2]);
                out.append(&mut fixed_field(units, MAX_UNITS_SIZE));
                out.append(&mut limits.to_be_bytes());
                out
            }
            DbrGraphics::Double {
                units,
                limits,
                precision,
            } => {
                let mut out = precision.to_be_bytes().to_vec();
                out.extend_from_slice(&[0u8; 2]);
                out.append(&mut fixed_field(units, MAX_UNITS_SIZE));
                out.append(&mut limits.to_be_bytes());
                out
            }
        }
    }
}

/// Control limits carried by the `CTRL` category, stored as `(lower, upper)`
#[derive(Clone, Debug, PartialEq)]
pub enum DbrControl {
    Enum,
    String,
    Char(i8, i8),
    Int(i16, i16),
    Long(i32, i32),
    Float(f32, f32),
    Double(f64, f64),
}

impl DbrControl {
    pub fn default_for(kind: DbrBasicType) -> Self {
        match kind {
            DbrBasicType::String => DbrControl::String,
            DbrBasicType::Enum => DbrControl::Enum,
            DbrBasicType::Int => DbrControl::Int(i16::MIN, i16::MAX),
            DbrBasicType::Float => DbrControl::Float(f32::MIN, f32::MAX),
            DbrBasicType::Char => DbrControl::Char(i8::MIN, i8::MAX),
            DbrBasicType::Long => DbrControl::Long(i32::MIN, i32::MAX),
            DbrBasicType::Double => DbrControl::Double(f64::MIN, f64::MAX),
        }
    }

    pub fn limits(&self) -> Option<(f64, f64)> {
        match *self {
            DbrControl::Enum | DbrControl::String => None,
            DbrControl::Char(l, u) => Some((l.into(), u.into())),
            DbrControl::Int(l, u) => Some((l.into(), u.into())),
            DbrControl::Long(l, u) => Some((l.into(), u.into())),
            DbrControl::Float(l, u) => Some((l.into(), u.into())),
            DbrControl::Double(l, u) => Some((l, u)),
        }
    }

    fn parse(kind: DbrBasicType, input: &[u8]) -> IResult<&[u8], DbrControl> {
        // On the wire the upper limit comes first
        Ok(match kind {
            DbrBasicType::String => (input, DbrControl::String),
            DbrBasicType::Enum => (input, DbrControl::Enum),
            DbrBasicType::Char => {
                let (input, (u, l)) = (be_i8, be_i8).parse(input)?;
                (input, DbrControl::Char(l, u))
            }
            DbrBasicType::Int => {
                let (input, (u, l)) = (be_i16, be_i16).parse(input)?;
                (input, DbrControl::Int(l, u))
            }
            DbrBasicType::Long => {
                let (input, (u, l)) = (be_i32, be_i32).parse(input)?;
                (input, DbrControl::Long(l, u))
            }
            DbrBasicType::Float => {
                let (input, (u, l)) = (be_f32, be_f32).parse(input)?;
                (input, DbrControl::Float(l, u))
            }
            DbrBasicType::Double => {
                let (input, (u, l)) = (be_f64, be_f64).parse(input)?;
                (input, DbrControl::Double(l, u))
            }
        })
    }

    fn to_be_bytes(&self) -> Vec<u8> {
        match self {
            DbrControl::Enum | DbrControl::String => Vec::new(),
            DbrControl::Char(l, u) => [u, l].iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrControl::Int(l, u) => [u, l].iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrControl::Long(l, u) => [u, l].iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrControl::Float(l, u) => [u, l].iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrControl::Double(l, u) => [u, l].iter().flat_map(|v| v.to_be_bytes()).collect(),
        }
    }
}

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}
impl TryFrom<u16> for DbrBasicType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::String as u16 => Ok(Self::String),
            x if x == Self::Int as u16 => Ok(Self::Int),
            x if x == Self::Float as u16 => Ok(Self::Float),
            x if x == Self::Enum as u16 => Ok(Self::Enum),
            x if x == Self::Char as u16 => Ok(Self::Char),
            x if x == Self::Long as u16 => Ok(Self::Long),
            x if x == Self::Double as u16 => Ok(Self::Double),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DbrBasicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DbrBasicType::String => "string",
            DbrBasicType::Int => "short",
            DbrBasicType::Float => "float",
            DbrBasicType::Enum => "enum",
            DbrBasicType::Char => "char",
            DbrBasicType::Long => "long",
            DbrBasicType::Double => "double",
        })
    }
}

/// Mapping of DBR categories
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
}
impl TryFrom<u16> for DbrCategory {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::Basic as u16 => Ok(Self::Basic),
            x if x == Self::Status as u16 => Ok(Self::Status),
            x if x == Self::Time as u16 => Ok(Self::Time),
            x if x == Self::Graphics as u16 => Ok(Self::Graphics),
            x if x == Self::Control as u16 => Ok(Self::Control),
            _ => Err(()),
        }
    }
}

/// Represent and translate from ID every combination of `DBR_*_*`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

impl TryFrom<u16> for DbrType {
    type Error = DecodeError;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let unknown = |_| DecodeError::UnknownType(value);
        Ok(Self {
            basic_type: (value % 7).try_into().map_err(unknown)?,
            category: (value / 7).try_into().map_err(unknown)?,
        })
    }
}

impl From<DbrType> for u16 {
    fn from(value: DbrType) -> Self {
        value.category as u16 * 7 + value.basic_type as u16
    }
}

impl DbrType {
    /// Give the lookup for the padding between metadata and value
    ///
    /// Every DBR structure is laid out so the value is aligned; for some
    /// combinations that means padding bytes sit between the metadata and the
    /// value. The padding after a `GR`/`CTRL` precision field is handled with the
    /// graphics structure itself.
    ///
    /// See <https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types>
    pub fn get_metadata_padding(&self) -> usize {
        match (self.category, self.basic_type) {
            (DbrCategory::Status, DbrBasicType::Char) => 1,
            (DbrCategory::Status, DbrBasicType::Double) => 4,
            (DbrCategory::Time, DbrBasicType::Int) => 2,
            (DbrCategory::Time, DbrBasicType::Enum) => 2,
            (DbrCategory::Time, DbrBasicType::Char) => 3,
            (DbrCategory::Time, DbrBasicType::Double) => 4,
            (DbrCategory::Graphics, DbrBasicType::Char) => 1,
            (DbrCategory::Control, DbrBasicType::Char) => 1,
            _ => 0,
        }
    }
    pub fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }
}

impl fmt::Display for DbrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.category {
            DbrCategory::Basic => "",
            DbrCategory::Status => "sts_",
            DbrCategory::Time => "time_",
            DbrCategory::Graphics => "gr_",
            DbrCategory::Control => "ctrl_",
        };
        write!(f, "{prefix}{}", self.basic_type)
    }
}

impl FromStr for DbrType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        let mut s: &str = &upper;
        if let Some(rest) = s.strip_prefix("DBR_") {
            s = rest;
        };
        let category = if let Some((cats, rest)) = s.split_once('_') {
            s = rest;
            match cats {
                "BASIC" => DbrCategory::Basic,
                "STS" => DbrCategory::Status,
                "TIME" => DbrCategory::Time,
                "GR" => DbrCategory::Graphics,
                "CTRL" => DbrCategory::Control,
                _ => return Err(()),
            }
        } else {
            DbrCategory::Basic
        };
        let kind = match s {
            "STRING" => DbrBasicType::String,
            "INT" => DbrBasicType::Int,
            "SHORT" => DbrBasicType::Int,
            "FLOAT" => DbrBasicType::Float,
            "ENUM" => DbrBasicType::Enum,
            "CHAR" => DbrBasicType::Char,
            "LONG" => DbrBasicType::Long,
            "DOUBLE" => DbrBasicType::Double,
            _ => return Err(()),
        };
        Ok(DbrType {
            basic_type: kind,
            category,
        })
    }
}

/// Represent alarm status of the record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

fn parse_status(input: &[u8]) -> IResult<&[u8], Status> {
    let (input, (status, severity)) = (be_i16, be_i16).parse(input)?;
    Ok((input, Status { status, severity }))
}

fn parse_timestamp(input: &[u8]) -> IResult<&[u8], SystemTime> {
    let (input, (time_s, time_ns)) = (be_u32, be_u32).parse(input)?;
    let since_unix = Duration::new(time_s as u64 + EPICS_EPOCH_OFFSET, time_ns.min(999_999_999));
    Ok((input, UNIX_EPOCH + since_unix))
}

/// Structured unit of exchange for records in the CA protocol
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Alarm status metadata alongside the record value
    Status { status: Status, value: DbrValue },
    /// Timestamp, alarm status, and value
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
    Graphics {
        status: Status,
        graphics: DbrGraphics,
        value: DbrValue,
    },
    Control {
        status: Status,
        graphics: DbrGraphics,
        control: DbrControl,
        value: DbrValue,
    },
}

impl Dbr {
    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }
    /// Retrieve the [`DbrValue`] contained by this DBR
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }
    /// If a DBR type encoding alarm status, fetch that
    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) => None,
            Dbr::Status { status, .. } => Some(*status),
            Dbr::Time { status, .. } => Some(*status),
            Dbr::Graphics { status, .. } => Some(*status),
            Dbr::Control { status, .. } => Some(*status),
        }
    }
    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
    pub fn graphics(&self) -> Option<&DbrGraphics> {
        match self {
            Dbr::Graphics { graphics, .. } | Dbr::Control { graphics, .. } => Some(graphics),
            _ => None,
        }
    }
    pub fn control(&self) -> Option<&DbrControl> {
        match self {
            Dbr::Control { control, .. } => Some(control),
            _ => None,
        }
    }
    pub fn data_type(&self) -> DbrType {
        let category = match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
            Dbr::Graphics { .. } => DbrCategory::Graphics,
            Dbr::Control { .. } => DbrCategory::Control,
        };
        DbrType::new(self.value().get_type(), category)
    }

    pub fn from_bytes(data_type: DbrType, data_count: usize, data: &[u8]) -> Result<Dbr, DecodeError> {
        Self::parse(data_type, data_count, data)
            .map(|(_, dbr)| dbr)
            .map_err(|_| DecodeError::Malformed {
                data_type,
                count: data_count,
                length: data.len(),
            })
    }

    fn parse(data_type: DbrType, data_count: usize, data: &[u8]) -> IResult<&[u8], Dbr> {
        let kind = data_type.basic_type;
        if data_type.category == DbrCategory::Basic {
            let (data, value) = DbrValue::parse_value(kind, data_count, data)?;
            return Ok((data, Dbr::Basic(value)));
        }

        let (data, status) = parse_status(data)?;
        let (data, timestamp) = if data_type.category == DbrCategory::Time {
            let (data, timestamp) = parse_timestamp(data)?;
            (data, Some(timestamp))
        } else {
            (data, None)
        };
        let (data, graphics) = if matches!(
            data_type.category,
            DbrCategory::Graphics | DbrCategory::Control
        ) {
            let (data, graphics) = DbrGraphics::parse(kind, data)?;
            (data, Some(graphics))
        } else {
            (data, None)
        };
        let (data, control) = if data_type.category == DbrCategory::Control {
            let (data, control) = DbrControl::parse(kind, data)?;
            (data, Some(control))
        } else {
            (data, None)
        };

        // Offset the read buffer to account for metadata padding
        let (data, _) = take(data_type.get_metadata_padding()).parse(data)?;
        let (data, value) = DbrValue::parse_value(kind, data_count, data)?;

        Ok((
            data,
            match (timestamp, graphics, control) {
                (Some(timestamp), _, _) => Dbr::Time {
                    status,
                    timestamp,
                    value,
                },
                (None, Some(graphics), Some(control)) => Dbr::Control {
                    status,
                    graphics,
                    control,
                    value,
                },
                (None, Some(graphics), None) => Dbr::Graphics {
                    status,
                    graphics,
                    value,
                },
                (None, None, _) => Dbr::Status { status, value },
            },
        ))
    }

    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let mut buffer = Cursor::new(Vec::new());
        // Writing into a Vec cannot fail
        let real_count = self.write_be(&mut buffer, max_elems).unwrap_or(0);
        (real_count, buffer.into_inner())
    }

    /// Write a requested number of elements to a stream
    ///
    /// Return the actual number of elements written
    pub fn write_be<W: io::Write>(
        &self,
        writer: &mut W,
        max_elems: Option<NonZeroUsize>,
    ) -> io::Result<usize> {
        let (real_elems, data) = self.value().to_bytes(max_elems);
        // All except Basic write status/severity
        if let Some(status) = self.status() {
            writer.write_all(&status.status.to_be_bytes())?;
            writer.write_all(&status.severity.to_be_bytes())?;
        }
        match self {
            Dbr::Time { timestamp, .. } => {
                let unix_time = timestamp
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO);
                let time_s = unix_time.as_secs().saturating_sub(EPICS_EPOCH_OFFSET) as u32;
                let time_ns = unix_time.subsec_nanos();
                writer.write_all(&time_s.to_be_bytes())?;
                writer.write_all(&time_ns.to_be_bytes())?;
            }
            Dbr::Graphics { graphics, .. } => {
                writer.write_all(&graphics.to_bytes())?;
            }
            Dbr::Control {
                graphics, control, ..
            } => {
                writer.write_all(&graphics.to_bytes())?;
                writer.write_all(&control.to_be_bytes())?;
            }
            _ => (),
        }

        writer.write_all(&vec![0u8; self.data_type().get_metadata_padding()])?;
        writer.write_all(&data)?;
        Ok(real_elems)
    }
}

#[cfg(test)]
mod tests {
    use std::vec;

    use super::*;

    #[test]
    fn single_or_vec() {
        let v: DbrValue = vec![500i32].into();
        assert!(v.convert_to(DbrBasicType::Int).is_ok());
        assert!(v.convert_to(DbrBasicType::Char).is_err());
        assert_eq!(v.to_bytes(None).1, vec![0x00, 0x00, 0x01, 0xF4]);
        assert_eq!(
            v.convert_to(DbrBasicType::Int).unwrap().to_bytes(None).1,
            vec![0x01, 0xF4]
        );

        let data = vec![500.23f32, 12.7f32];
        let v: DbrValue = data.clone().into();
        assert_eq!(v.get_count(), 2);
        assert_eq!(
            v.to_bytes(NonZeroUsize::new(1)).1,
            data.iter()
                .take(1)
                .flat_map(|v| v.to_be_bytes())
                .collect::<Vec<u8>>()
        );
        // Try converting this to an int with truncation
        let v = v.convert_to(DbrBasicType::Int).unwrap();
        assert_eq!(v.to_bytes(None).1, vec![0x01, 0xf4, 0x00, 0x0c]);
    }

    #[test]
    fn encode_time_long() {
        let example_packet = [
            0x0, 0x0, 0x0, 0x0, 0x42, 0x32, 0x19, 0x99, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x2a,
        ];
        let dbr = Dbr::Time {
            status: Status::default(),
            timestamp: SystemTime::UNIX_EPOCH
                .checked_add(Duration::from_secs(1741731609))
                .unwrap(),
            value: vec![42i32].into(),
        };

        let (size, out_data) = dbr.to_bytes(None);
        assert_eq!(size, 1);
        assert_eq!(out_data, example_packet);

        let parsed = Dbr::from_bytes(dbr.data_type(), 1, &example_packet).unwrap();
        assert_eq!(parsed, dbr);
    }

    #[test]
    fn layout_sizes_match_db_access() {
        fn size_of(dbr: Dbr) -> usize {
            dbr.to_bytes(None).1.len()
        }
        let status = Status::default();
        assert_eq!(
            size_of(Dbr::Control {
                status,
                graphics: DbrGraphics::default_for(DbrBasicType::Double),
                control: DbrControl::default_for(DbrBasicType::Double),
                value: 1.0f64.into(),
            }),
            88
        );
        assert_eq!(
            size_of(Dbr::Control {
                status,
                graphics: DbrGraphics::default_for(DbrBasicType::Float),
                control: DbrControl::default_for(DbrBasicType::Float),
                value: 1.0f32.into(),
            }),
            52
        );
        assert_eq!(
            size_of(Dbr::Control {
                status,
                graphics: DbrGraphics::default_for(DbrBasicType::Char),
                control: DbrControl::default_for(DbrBasicType::Char),
                value: 1i8.into(),
            }),
            22
        );
        assert_eq!(
            size_of(Dbr::Control {
                status,
                graphics: DbrGraphics::default_for(DbrBasicType::Enum),
                control: DbrControl::Enum,
                value: DbrValue::Enum(vec![1]),
            }),
            424
        );
        assert_eq!(
            size_of(Dbr::Time {
                status,
                timestamp: SystemTime::now(),
                value: 1i8.into(),
            }),
            16
        );
        assert_eq!(
            size_of(Dbr::Time {
                status,
                timestamp: SystemTime::now(),
                value: "x".into(),
            }),
            52
        );
    }

    #[test]
    fn control_metadata_survives_layout() {
        let dbr = Dbr::Control {
            status: Status {
                status: 3,
                severity: 2,
            },
            graphics: DbrGraphics::Double {
                units: "degC".to_string(),
                limits: Limits {
                    display_limits: (-10.0, 110.0),
                    alarm_limits: (0.0, 100.0),
                    warning_limits: (5.0, 95.0),
                },
                precision: 3,
            },
            control: DbrControl::Double(-5.0, 105.0),
            value: vec![23.4f64, 25.0].into(),
        };
        let (count, data) = dbr.to_bytes(None);
        let parsed = Dbr::from_bytes(dbr.data_type(), count, &data).unwrap();
        assert_eq!(parsed, dbr);
        assert_eq!(parsed.graphics().unwrap().units(), Some("degC"));
        assert_eq!(parsed.control().unwrap().limits(), Some((-5.0, 105.0)));
    }

    #[test]
    fn enum_labels_are_trimmed_to_count() {
        let dbr = Dbr::Graphics {
            status: Status::default(),
            graphics: DbrGraphics::Enum {
                labels: vec!["Off".to_string(), "On".to_string()],
            },
            value: DbrValue::Enum(vec![1]),
        };
        let (count, data) = dbr.to_bytes(None);
        let parsed = Dbr::from_bytes(dbr.data_type(), count, &data).unwrap();
        assert_eq!(
            parsed.graphics().unwrap().labels().unwrap(),
            &["Off".to_string(), "On".to_string()]
        );
    }

    #[test]
    fn short_payload_is_an_error() {
        let data_type = DbrType::new(DbrBasicType::Double, DbrCategory::Time);
        assert!(matches!(
            Dbr::from_bytes(data_type, 1, &[0u8; 10]),
            Err(DecodeError::Malformed { length: 10, .. })
        ));
    }

    #[test]
    fn test_string_to_char() {
        let test_string = "a test string".to_string();
        let s = DbrValue::String(vec![test_string.clone()]);
        let as_char = s.convert_to(DbrBasicType::Char).unwrap();
        let re_s = as_char.convert_to(DbrBasicType::String).unwrap();

        assert_eq!(s, re_s);
    }

    #[test]
    fn coerce_parses_numeric_strings() {
        let s: DbrValue = "2.5".into();
        assert_eq!(
            s.coerce_to(DbrBasicType::Double).unwrap(),
            DbrValue::Double(vec![2.5])
        );
        assert!(
            DbrValue::from("nope")
                .coerce_to(DbrBasicType::Long)
                .is_err()
        );
    }

    #[test]
    fn test_dbr_string_conversions() {
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Basic),
            "INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Status),
            "DBR_STS_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Time),
            "TIME_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Control),
            "DBR_CTRL_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::String, DbrCategory::Graphics),
            "GR_STRING".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Basic),
            "SHORT".parse().unwrap()
        );
        assert!("DBR_CLASS_INT".parse::<DbrType>().is_err());
        assert_eq!(
            DbrType::new(DbrBasicType::Double, DbrCategory::Time).to_string(),
            "time_double"
        );
        assert_eq!(<u16 as From<DbrType>>::from(DbrType::new(DbrBasicType::Double, DbrCategory::Control)), 34);
        assert_eq!(
            DbrType::try_from(20u16).unwrap(),
            DbrType::new(DbrBasicType::Double, DbrCategory::Time)
        );
    }
}
