//! Turn DBR payloads into values and metadata an application can use.
//!
//! Requests are made in a promoted form of the channel's native type (see
//! [`promote`]), so that alarm state, timestamps, or the full display/control
//! metadata arrive together with the value. [`decode`] parses the payload and
//! [`as_string`] renders a value the way `caget` would print it.

use std::time::SystemTime;

use crate::{
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrType, DbrValue, DecodeError, trim_at_nul},
    error::ErrorCondition,
};

/// Arrays longer than this are summarised by [`as_string`] instead of printed
pub const ARRAY_RENDER_LIMIT: usize = 16;

/// Which metadata accompanies a requested value
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum DecodeMode {
    /// The bare value
    Native,
    /// Value with alarm status, severity and timestamp
    #[default]
    Time,
    /// Value with alarm status, units, precision, limits and enum labels
    Ctrl,
}

impl DecodeMode {
    /// The type to request for a channel with this native type
    pub fn wire_type(&self, native: DbrBasicType) -> DbrType {
        promote(
            native,
            *self == DecodeMode::Time,
            *self == DecodeMode::Ctrl,
        )
    }
}

/// How numeric arrays are materialised
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ArrayMode {
    /// Keep the element type, as a [`Value::Array`]
    #[default]
    Typed,
    /// Widen every element to `f64`, as a [`Value::List`]
    Generic,
}

/// Map a native type to its TIME or CTRL variant
///
/// CTRL wins when both are asked for. There is no CTRL form of a string, so that
/// degrades to TIME.
pub fn promote(native: DbrBasicType, use_time: bool, use_ctrl: bool) -> DbrType {
    let category = match (use_ctrl, use_time) {
        (true, _) if native == DbrBasicType::String => DbrCategory::Time,
        (true, _) => DbrCategory::Control,
        (false, true) => DbrCategory::Time,
        (false, false) => DbrCategory::Basic,
    };
    DbrType::new(native, category)
}

/// A decoded channel value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Enum(u16),
    String(String),
    /// Multi-element string data
    Strings(Vec<String>),
    /// A numeric array in its native element type
    Array(DbrValue),
    /// A numeric array widened to `f64`
    List(Vec<f64>),
}

impl Value {
    fn from_dbr_value(value: DbrValue, array_mode: ArrayMode) -> Value {
        let count = value.get_count();
        match value {
            DbrValue::String(mut strings) => match strings.len() {
                0 => Value::String(String::new()),
                1 => Value::String(strings.remove(0)),
                _ => Value::Strings(strings),
            },
            // Character arrays carry text
            DbrValue::Char(chars) if count != 1 => {
                let bytes: Vec<u8> = chars.iter().map(|c| *c as u8).collect();
                Value::String(trim_at_nul(&bytes))
            }
            DbrValue::Char(chars) => Value::Integer(chars[0].into()),
            DbrValue::Enum(indices) if count == 1 => Value::Enum(indices[0]),
            DbrValue::Int(v) if count == 1 => Value::Integer(v[0].into()),
            DbrValue::Long(v) if count == 1 => Value::Integer(v[0].into()),
            DbrValue::Float(v) if count == 1 => Value::Float(v[0].into()),
            DbrValue::Double(v) if count == 1 => Value::Float(v[0]),
            array => match array_mode {
                ArrayMode::Typed => Value::Array(array),
                ArrayMode::Generic => Value::List(array.to_f64_vec().unwrap_or_default()),
            },
        }
    }

    /// The value as a DBR value, for writing or typed conversion
    pub fn to_dbr_value(&self) -> DbrValue {
        match self {
            Value::Integer(v) => match i32::try_from(*v) {
                Ok(v) => DbrValue::Long(vec![v]),
                Err(_) => DbrValue::Double(vec![*v as f64]),
            },
            Value::Float(v) => DbrValue::Double(vec![*v]),
            Value::Enum(v) => DbrValue::Enum(vec![*v]),
            Value::String(v) => DbrValue::String(vec![v.clone()]),
            Value::Strings(v) => DbrValue::String(v.clone()),
            Value::Array(v) => v.clone(),
            Value::List(v) => DbrValue::Double(v.clone()),
        }
    }

    /// Convert to a value suitable for a channel of the `native` type
    pub(crate) fn to_native(&self, native: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        match (self, native) {
            // A single string written to a character array is sent as its bytes
            (Value::String(text), DbrBasicType::Char) => {
                let mut bytes: Vec<i8> = text.bytes().map(|b| b as i8).collect();
                bytes.push(0);
                Ok(DbrValue::Char(bytes))
            }
            _ => self.to_dbr_value().coerce_to(native),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Enum(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

macro_rules! impl_value_from {
    ($variant:ident, $via:ty, $($typ:ty),+) => {
        $(
            impl From<$typ> for Value {
                fn from(value: $typ) -> Self {
                    Value::$variant(<$via>::from(value))
                }
            }
        )+
    };
}
impl_value_from!(Integer, i64, i8, i16, i32, i64, u8, u16, u32);
impl_value_from!(Float, f64, f32, f64);
impl_value_from!(String, String, &str, String);

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Value::Strings(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(value: Vec<f64>) -> Self {
        Value::List(value)
    }
}

impl From<DbrValue> for Value {
    fn from(value: DbrValue) -> Self {
        Value::Array(value)
    }
}

/// Alarm state and display metadata reported alongside values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub status: Option<i16>,
    pub severity: Option<i16>,
    pub timestamp: Option<SystemTime>,
    pub units: Option<String>,
    pub precision: Option<i16>,
    pub enum_strs: Option<Vec<String>>,
    /// Each limit pair is `(lower, upper)`
    pub display_limits: Option<(f64, f64)>,
    pub alarm_limits: Option<(f64, f64)>,
    pub warning_limits: Option<(f64, f64)>,
    pub control_limits: Option<(f64, f64)>,
}

impl Metadata {
    fn from_dbr(dbr: &Dbr) -> Self {
        let status = dbr.status();
        let graphics = dbr.graphics();
        let limits = graphics.and_then(|g| g.limits());
        Metadata {
            status: status.map(|s| s.status),
            severity: status.map(|s| s.severity),
            timestamp: dbr.timestamp(),
            units: graphics.and_then(|g| g.units()).map(str::to_string),
            precision: graphics.and_then(|g| g.precision()),
            enum_strs: graphics.and_then(|g| g.labels()).map(<[String]>::to_vec),
            display_limits: limits.as_ref().map(|l| l.display_limits),
            alarm_limits: limits.as_ref().map(|l| l.alarm_limits),
            warning_limits: limits.as_ref().map(|l| l.warning_limits),
            control_limits: dbr.control().and_then(|c| c.limits()),
        }
    }

    /// Overwrite fields with any that are present in `newer`
    pub fn merge(&mut self, newer: &Metadata) {
        fn take<T: Clone>(into: &mut Option<T>, from: &Option<T>) {
            if from.is_some() {
                into.clone_from(from);
            }
        }
        take(&mut self.status, &newer.status);
        take(&mut self.severity, &newer.severity);
        take(&mut self.timestamp, &newer.timestamp);
        take(&mut self.units, &newer.units);
        take(&mut self.precision, &newer.precision);
        take(&mut self.enum_strs, &newer.enum_strs);
        take(&mut self.display_limits, &newer.display_limits);
        take(&mut self.alarm_limits, &newer.alarm_limits);
        take(&mut self.warning_limits, &newer.warning_limits);
        take(&mut self.control_limits, &newer.control_limits);
    }
}

/// One decoded delivery: the value with whatever metadata its type carried
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: Value,
    pub count: usize,
    pub data_type: DbrType,
    pub meta: Metadata,
}

impl Reading {
    pub fn severity(&self) -> i16 {
        self.meta.severity.unwrap_or(0)
    }

    pub fn as_string(&self) -> String {
        as_string(&self.value, self.data_type, self.count, &self.meta)
    }
}

/// Decode a payload of `count` elements of `wire_type`
pub fn decode(
    data: &[u8],
    count: usize,
    wire_type: DbrType,
    array_mode: ArrayMode,
) -> Result<Reading, DecodeError> {
    let dbr = Dbr::from_bytes(wire_type, count, data)?;
    let meta = Metadata::from_dbr(&dbr);
    Ok(Reading {
        value: Value::from_dbr_value(dbr.take_value(), array_mode),
        count,
        data_type: wire_type,
        meta,
    })
}

fn format_float(value: f64, precision: Option<i16>) -> String {
    match precision {
        Some(p) if p >= 0 => format!("{:.*}", p as usize, value),
        _ => value.to_string(),
    }
}

fn label_for(index: u16, meta: &Metadata) -> String {
    meta.enum_strs
        .as_ref()
        .and_then(|labels| labels.get(index as usize))
        .cloned()
        .unwrap_or_else(|| index.to_string())
}

/// Render a value as text
///
/// Enum values use the channel's labels, floats use its display precision, and
/// arrays longer than [`ARRAY_RENDER_LIMIT`] become `<array size=N, type=...>`.
pub fn as_string(value: &Value, wire_type: DbrType, count: usize, meta: &Metadata) -> String {
    let summary = || format!("<array size={count}, type={wire_type}>");
    match value {
        Value::Integer(v) => v.to_string(),
        Value::Float(v) => format_float(*v, meta.precision),
        Value::Enum(v) => label_for(*v, meta),
        Value::String(v) => v.clone(),
        Value::Strings(v) => v.join(" "),
        Value::Array(_) | Value::List(_) if count > ARRAY_RENDER_LIMIT => summary(),
        Value::Array(DbrValue::Enum(v)) => v
            .iter()
            .map(|i| label_for(*i, meta))
            .collect::<Vec<_>>()
            .join(" "),
        Value::Array(DbrValue::Float(v)) => v
            .iter()
            .map(|f| format_float((*f).into(), meta.precision))
            .collect::<Vec<_>>()
            .join(" "),
        Value::Array(array) => {
            let elements = array.to_f64_vec().unwrap_or_default();
            if array.get_type() == DbrBasicType::Double {
                elements
                    .iter()
                    .map(|f| format_float(*f, meta.precision))
                    .collect::<Vec<_>>()
                    .join(" ")
            } else {
                elements
                    .iter()
                    .map(|f| f.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            }
        }
        Value::List(elements) => elements
            .iter()
            .map(|f| format_float(*f, meta.precision))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dbr::{DbrControl, DbrGraphics, Limits, Status};

    fn roundtrip(dbr: Dbr, array_mode: ArrayMode) -> Reading {
        let (count, data) = dbr.to_bytes(None);
        decode(&data, count, dbr.data_type(), array_mode).unwrap()
    }

    #[test]
    fn promotion() {
        use DbrBasicType::*;
        assert_eq!(
            promote(Double, true, false),
            DbrType::new(Double, DbrCategory::Time)
        );
        assert_eq!(
            promote(Double, true, true),
            DbrType::new(Double, DbrCategory::Control)
        );
        assert_eq!(
            promote(String, false, true),
            DbrType::new(String, DbrCategory::Time)
        );
        assert_eq!(
            promote(Long, false, false),
            DbrType::new(Long, DbrCategory::Basic)
        );
        assert_eq!(u16::from(DecodeMode::Ctrl.wire_type(Enum)), 31);
    }

    #[test]
    fn scalars_and_text() {
        let reading = roundtrip(Dbr::Basic(5i16.into()), ArrayMode::Typed);
        assert_eq!(reading.value, Value::Integer(5));

        let text: Vec<i8> = b"hello\0junk".iter().map(|c| *c as i8).collect();
        let reading = roundtrip(Dbr::Basic(text.into()), ArrayMode::Typed);
        assert_eq!(reading.value, Value::String("hello".into()));

        let reading = roundtrip(
            Dbr::Basic(DbrValue::String(vec!["a".into(), "b".into()])),
            ArrayMode::Typed,
        );
        assert_eq!(reading.value, Value::Strings(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn arrays_by_mode() {
        let dbr = Dbr::Basic(vec![1i32, 2, 3].into());
        assert_eq!(
            roundtrip(dbr.clone(), ArrayMode::Typed).value,
            Value::Array(DbrValue::Long(vec![1, 2, 3]))
        );
        assert_eq!(
            roundtrip(dbr, ArrayMode::Generic).value,
            Value::List(vec![1.0, 2.0, 3.0])
        );
    }

    #[test]
    fn time_metadata() {
        let timestamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1741731609);
        let reading = roundtrip(
            Dbr::Time {
                status: Status {
                    status: 7,
                    severity: 2,
                },
                timestamp,
                value: 23.9f64.into(),
            },
            ArrayMode::Typed,
        );
        assert_eq!(reading.value, Value::Float(23.9));
        assert_eq!(reading.severity(), 2);
        assert_eq!(reading.meta.timestamp, Some(timestamp));
        assert_eq!(reading.meta.units, None);
    }

    #[test]
    fn control_metadata_and_rendering() {
        let reading = roundtrip(
            Dbr::Control {
                status: Status::default(),
                graphics: DbrGraphics::Double {
                    units: "mm".into(),
                    limits: Limits {
                        display_limits: (0.0, 10.0),
                        alarm_limits: (1.0, 9.0),
                        warning_limits: (2.0, 8.0),
                    },
                    precision: 2,
                },
                control: DbrControl::Double(0.5, 9.5),
                value: 3.14159f64.into(),
            },
            ArrayMode::Typed,
        );
        assert_eq!(reading.meta.units.as_deref(), Some("mm"));
        assert_eq!(reading.meta.alarm_limits, Some((1.0, 9.0)));
        assert_eq!(reading.meta.control_limits, Some((0.5, 9.5)));
        assert_eq!(reading.as_string(), "3.14");
    }

    #[test]
    fn enum_rendering() {
        let reading = roundtrip(
            Dbr::Control {
                status: Status::default(),
                graphics: DbrGraphics::Enum {
                    labels: vec!["Off".into(), "On".into()],
                },
                control: DbrControl::Enum,
                value: DbrValue::Enum(vec![1]),
            },
            ArrayMode::Typed,
        );
        assert_eq!(reading.value, Value::Enum(1));
        assert_eq!(reading.as_string(), "On");
    }

    #[test]
    fn large_arrays_are_summarised() {
        let data_type = DbrType::new(DbrBasicType::Double, DbrCategory::Time);
        let value = Value::List(vec![0.0; 100]);
        assert_eq!(
            as_string(&value, data_type, 100, &Metadata::default()),
            "<array size=100, type=time_double>"
        );
        let small = Value::Array(DbrValue::Long(vec![1, 2]));
        assert_eq!(as_string(&small, data_type, 2, &Metadata::default()), "1 2");
    }

    #[test]
    fn merge_keeps_older_fields() {
        let mut meta = Metadata {
            units: Some("V".into()),
            severity: Some(1),
            ..Default::default()
        };
        meta.merge(&Metadata {
            severity: Some(0),
            ..Default::default()
        });
        assert_eq!(meta.units.as_deref(), Some("V"));
        assert_eq!(meta.severity, Some(0));
    }

    #[test]
    fn values_for_native_types() {
        assert_eq!(
            Value::from("1.5").to_native(DbrBasicType::Double).unwrap(),
            DbrValue::Double(vec![1.5])
        );
        assert_eq!(
            Value::from("hi").to_native(DbrBasicType::Char).unwrap(),
            DbrValue::Char(vec![104, 105, 0])
        );
        assert_eq!(
            Value::Integer(3).to_native(DbrBasicType::Enum).unwrap(),
            DbrValue::Enum(vec![3])
        );
    }
}
