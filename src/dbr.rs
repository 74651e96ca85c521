//! Typed value containers exchanged between channels and providers.
//!
//! A PV value is always array-shaped and of one of seven basic element types,
//! enumerated by [`DbrBasicType`] and carried in [`DbrValue`]:
//! - [`DbrValue::Char`] ([`Vec<i8>`]), the "byte" type
//! - [`DbrValue::Int`] ([`Vec<i16>`]), the "short" type
//! - [`DbrValue::Long`] ([`Vec<i32>`]), the "int" type
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`u16`]), an index into a set of state strings
//! - [`DbrValue::String`] ([`Vec<String>`])
//!
//! A fetched value can carry extra metadata, selected by [`DbrCategory`] and
//! represented by [`Dbr`]:
//! - [`Dbr::Basic`] - the plain value.
//! - [`Dbr::Status`] - the value with alarm status and severity.
//! - [`Dbr::Time`] - everything in [`Dbr::Status`] plus the time of last change.
//! - [`Dbr::Control`] - status plus units, precision and the four limit pairs
//!   (see [`ControlInfo`]).
//!
//! [`DbrType`] combines a basic type and a category, and can be parsed from the
//! conventional names (`"DBR_TIME_DOUBLE"`, `"STS_INT"`, `"DOUBLE"`, ...).
use num::{NumCast, cast::AsPrimitive};
use std::{str::FromStr, time::SystemTime};

use crate::protocol::ErrorCondition;

/// Represent the value of a PV
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(u16),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}
/// Error returned when trying to resize a DBR but it's a data type that can't
#[derive(Debug, thiserror::Error)]
#[error("Enum values cannot be resized")]
pub struct DbrValueIsEnumError;

/// Types of errors that can be returned from [`DbrValue::parse_into`]
#[derive(Debug, thiserror::Error)]
pub enum DbrParseError {
    #[error("Only string values can be parsed")]
    SelfIsNotString,
    #[error("Could not parse '{0}'")]
    CannotParse(String),
}

impl DbrValue {
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(_) => 1,
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

    /// A zero-filled value of the given type and element count
    pub fn zeroed(basic_type: DbrBasicType, count: usize) -> DbrValue {
        match basic_type {
            DbrBasicType::Enum => DbrValue::Enum(0),
            DbrBasicType::String => DbrValue::String(vec![String::new(); count]),
            DbrBasicType::Char => DbrValue::Char(vec![0; count]),
            DbrBasicType::Int => DbrValue::Int(vec![0; count]),
            DbrBasicType::Long => DbrValue::Long(vec![0; count]),
            DbrBasicType::Float => DbrValue::Float(vec![0.0; count]),
            DbrBasicType::Double => DbrValue::Double(vec![0.0; count]),
        }
    }

    /// Convert a DbrValue::String to another data type by parsing the numeric string
    ///
    /// Fails if the DbrValue is not String or if the value cannot be parsed. Asking
    /// for a convertion from String->String just copies without doing any extra parsing.
    pub fn parse_into(&self, basic_type: DbrBasicType) -> Result<DbrValue, DbrParseError> {
        fn _parse_all<T: FromStr>(val: &[String]) -> Result<Vec<T>, DbrParseError> {
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
            DbrBasicType::Enum => match _parse_all::<u16>(val)?.as_slice() {
                [index] => DbrValue::Enum(*index),
                _ => return Err(DbrParseError::CannotParse(val.join(" "))),
            },
            DbrBasicType::String => self.clone(),
            DbrBasicType::Char => DbrValue::Char(_parse_all(val)?),
            DbrBasicType::Int => DbrValue::Int(_parse_all(val)?),
            DbrBasicType::Long => DbrValue::Long(_parse_all(val)?),
            DbrBasicType::Float => DbrValue::Float(_parse_all(val)?),
            DbrBasicType::Double => DbrValue::Double(_parse_all(val)?),
        })
    }

    /// Every element cast to a numeric type, failing if any would not fit.
    ///
    /// A single string is taken as its bytes, which is how CHAR waveforms
    /// carry text.
    fn cast_numeric<U>(&self) -> Result<Vec<U>, ErrorCondition>
    where
        U: NumCast + Copy + 'static,
        u8: AsPrimitive<U>,
    {
        fn cast_all<T: Copy + NumCast, U: NumCast>(from: &[T]) -> Result<Vec<U>, ErrorCondition> {
            from.iter()
                .map(|n| U::from(*n).ok_or(ErrorCondition::NoConvert))
                .collect()
        }
        match self {
            DbrValue::Char(v) => cast_all(v),
            DbrValue::Int(v) => cast_all(v),
            DbrValue::Long(v) => cast_all(v),
            DbrValue::Float(v) => cast_all(v),
            DbrValue::Double(v) => cast_all(v),
            DbrValue::Enum(index) => cast_all(&[*index]),
            DbrValue::String(v) => match v.as_slice() {
                [] => Ok(Vec::new()),
                [text] => Ok(text.bytes().map(|b| b.as_()).collect()),
                _ => Err(ErrorCondition::NoConvert),
            },
        }
    }

    fn to_strings(&self) -> Result<Vec<String>, ErrorCondition> {
        fn format_all<T: ToString>(from: &[T]) -> Vec<String> {
            from.iter().map(T::to_string).collect()
        }
        Ok(match self {
            DbrValue::String(v) => v.clone(),
            DbrValue::Char(v) => vec![
                String::from_utf8(v.iter().map(|c| *c as u8).collect())
                    .map_err(|_| ErrorCondition::NoConvert)?,
            ],
            DbrValue::Int(v) => format_all(v),
            DbrValue::Long(v) => format_all(v),
            DbrValue::Float(v) => format_all(v),
            DbrValue::Double(v) => format_all(v),
            DbrValue::Enum(index) => vec![index.to_string()],
        })
    }

    /// Convert to another basic type.
    ///
    /// Numeric conversions fail with [`ErrorCondition::NoConvert`] when a value
    /// is out of range for the target. Converting a string to a number encodes
    /// its bytes; use [`DbrValue::parse_into`] to parse it instead.
    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        if self.get_type() == basic_type {
            return Ok(self.clone());
        }
        Ok(match basic_type {
            DbrBasicType::Char => DbrValue::Char(self.cast_numeric()?),
            DbrBasicType::Int => DbrValue::Int(self.cast_numeric()?),
            DbrBasicType::Long => DbrValue::Long(self.cast_numeric()?),
            DbrBasicType::Float => DbrValue::Float(self.cast_numeric()?),
            DbrBasicType::Double => DbrValue::Double(self.cast_numeric()?),
            DbrBasicType::String => DbrValue::String(self.to_strings()?),
            DbrBasicType::Enum => match self {
                DbrValue::String(_) => self
                    .parse_into(DbrBasicType::Enum)
                    .map_err(|_| ErrorCondition::NoConvert)?,
                other => match other.cast_numeric::<u16>()?.as_slice() {
                    [index] => DbrValue::Enum(*index),
                    _ => return Err(ErrorCondition::NoConvert),
                },
            },
        })
    }

    pub fn resize(&mut self, to_size: usize) -> Result<(), DbrValueIsEnumError> {
        match self {
            DbrValue::Enum(_) => Err(DbrValueIsEnumError)?,
            DbrValue::String(items) => items.resize(to_size, String::new()),
            DbrValue::Char(items) => items.resize(to_size, 0),
            DbrValue::Int(items) => items.resize(to_size, 0),
            DbrValue::Long(items) => items.resize(to_size, 0),
            DbrValue::Float(items) => items.resize(to_size, 0.0),
            DbrValue::Double(items) => items.resize(to_size, 0.0),
        };
        Ok(())
    }

    /// Shorten to at most `count` elements. Enums are left untouched.
    pub fn truncate(&mut self, count: usize) {
        match self {
            DbrValue::Enum(_) => (),
            DbrValue::String(items) => items.truncate(count),
            DbrValue::Char(items) => items.truncate(count),
            DbrValue::Int(items) => items.truncate(count),
            DbrValue::Long(items) => items.truncate(count),
            DbrValue::Float(items) => items.truncate(count),
            DbrValue::Double(items) => items.truncate(count),
        }
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
        impl From<&[$typ]> for DbrValue {
            fn from(value: &[$typ]) -> Self {
                DbrValue::$variant(value.to_vec())
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => Ok(v),
                    _ => Err(ErrorCondition::NoConvert),
                }
            }
        }
        impl TryFrom<&DbrValue> for $typ {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                Vec::<$typ>::try_from(value)?
                    .into_iter()
                    .next()
                    .ok_or(ErrorCondition::BadCount)
            }
        }
        impl IntoDbrBasicType for $typ {
            fn get_dbr_basic_type() -> DbrBasicType {
                DbrBasicType::$variant
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
impl_dbrvalue_copy_conversions_between!(String, String);

impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_owned()])
    }
}

/// Units, display precision and limit pairs of a PV
///
/// Every limit pair is `(lower, upper)`. Unset pairs are `(0.0, 0.0)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlInfo {
    pub units: String,
    pub precision: i16,
    pub display_limits: (f64, f64),
    pub alarm_limits: (f64, f64),
    pub warning_limits: (f64, f64),
    pub control_limits: (f64, f64),
}

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

impl DbrBasicType {
    /// Is this one of the numeric array types?
    pub fn is_numeric(&self) -> bool {
        !matches!(self, DbrBasicType::String | DbrBasicType::Enum)
    }
}

/// Rust types that have a natural [`DbrBasicType`] to request from a server
pub trait IntoDbrBasicType {
    fn get_dbr_basic_type() -> DbrBasicType;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Control = 4,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

impl DbrType {
    pub fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unrecognised DBR type name '{0}'")]
pub struct UnknownDbrType(pub String);

impl FromStr for DbrBasicType {
    type Err = UnknownDbrType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_uppercase().trim_start_matches("DBR_") {
            "STRING" => DbrBasicType::String,
            "INT" | "SHORT" => DbrBasicType::Int,
            "FLOAT" => DbrBasicType::Float,
            "ENUM" => DbrBasicType::Enum,
            "CHAR" | "BYTE" => DbrBasicType::Char,
            "LONG" => DbrBasicType::Long,
            "DOUBLE" => DbrBasicType::Double,
            _ => return Err(UnknownDbrType(s.to_owned())),
        })
    }
}

impl FromStr for DbrType {
    type Err = UnknownDbrType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        let name = upper.strip_prefix("DBR_").unwrap_or(&upper);
        let (category, kind) = match name.split_once('_') {
            Some((cats, kind)) => (
                match cats {
                    "BASIC" => DbrCategory::Basic,
                    "STS" => DbrCategory::Status,
                    "TIME" => DbrCategory::Time,
                    "CTRL" => DbrCategory::Control,
                    _ => return Err(UnknownDbrType(s.to_owned())),
                },
                kind,
            ),
            None => (DbrCategory::Basic, name),
        };
        let basic_type = kind
            .parse::<DbrBasicType>()
            .map_err(|_| UnknownDbrType(s.to_owned()))?;
        Ok(DbrType::new(basic_type, category))
    }
}

/// Alarm status and severity attached to a value
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    Basic(DbrValue),
    Status {
        status: Status,
        value: DbrValue,
    },
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
    Control {
        status: Status,
        info: ControlInfo,
        value: DbrValue,
    },
}

impl Dbr {
    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }
    fn value_mut(&mut self) -> &mut DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }
    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) => None,
            Dbr::Status { status, .. } => Some(*status),
            Dbr::Time { status, .. } => Some(*status),
            Dbr::Control { status, .. } => Some(*status),
        }
    }
    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
    pub fn control_info(&self) -> Option<&ControlInfo> {
        match self {
            Dbr::Control { info, .. } => Some(info),
            _ => None,
        }
    }
    pub fn data_type(&self) -> DbrType {
        let category = match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
            Dbr::Control { .. } => DbrCategory::Control,
        };
        DbrType::new(self.value().get_type(), category)
    }

    /// Replace the value, keeping the metadata
    pub fn map_value(mut self, f: impl FnOnce(DbrValue) -> DbrValue) -> Dbr {
        let value = std::mem::replace(self.value_mut(), DbrValue::Enum(0));
        *self.value_mut() = f(value);
        self
    }

    /// Limit the record to at most `count` elements
    pub fn truncate(&mut self, count: usize) {
        self.value_mut().truncate(count);
    }

    /// Convert this record to another type and category.
    ///
    /// Metadata missing from the source category is filled with defaults; a
    /// Time record made from anything else is stamped with the current time.
    /// Enum values have no control record.
    pub fn convert_to(&self, dbr_type: DbrType) -> Result<Dbr, ErrorCondition> {
        let value = self.value().convert_to(dbr_type.basic_type)?;
        let status = self.status().unwrap_or_default();
        Ok(match dbr_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp: self.timestamp().unwrap_or_else(SystemTime::now),
                value,
            },
            DbrCategory::Control => {
                if dbr_type.basic_type == DbrBasicType::Enum {
                    return Err(ErrorCondition::BadType);
                }
                Dbr::Control {
                    status,
                    info: self.control_info().cloned().unwrap_or_default(),
                    value,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn numeric_casts_check_range() {
        let v: DbrValue = vec![500i32].into();
        assert!(v.convert_to(DbrBasicType::Int).is_ok());
        assert!(v.convert_to(DbrBasicType::Char).is_err());

        let data = vec![500.23f32, 12.7f32];
        let v: DbrValue = data.clone().into();
        assert_eq!(v.get_count(), 2);
        let v = v.convert_to(DbrBasicType::Int).unwrap();
        assert_eq!(v, DbrValue::Int(vec![500, 12]));

        assert_eq!(
            DbrValue::Float(vec![455.9f32])
                .convert_to(DbrBasicType::Long)
                .unwrap(),
            DbrValue::Long(vec![455])
        );
    }

    #[test]
    fn scalar_extraction() {
        let v = DbrValue::Double(vec![2.5, 3.5]);
        assert_eq!(f64::try_from(&v).unwrap(), 2.5);
        assert_eq!(i32::try_from(&v).unwrap(), 2);
        assert_eq!(Vec::<f32>::try_from(&v).unwrap(), vec![2.5f32, 3.5]);
        assert!(matches!(
            f64::try_from(&DbrValue::Double(Vec::new())),
            Err(ErrorCondition::BadCount)
        ));
        assert_eq!(String::try_from(&v).unwrap(), "2.5");
    }

    #[test]
    fn char_waveforms_carry_text() {
        let test_string = "a test string".to_string();
        let s = DbrValue::String(vec![test_string.clone()]);
        let as_char = s.convert_to(DbrBasicType::Char).unwrap();
        let re_s = as_char.convert_to(DbrBasicType::String).unwrap();

        assert_eq!(s, re_s);
    }

    #[test]
    fn strings_parse_into_numbers() {
        let s: DbrValue = "  12.5 ".into();
        assert_eq!(
            s.parse_into(DbrBasicType::Double).unwrap(),
            DbrValue::Double(vec![12.5])
        );
        assert!(s.parse_into(DbrBasicType::Long).is_err());
        assert_eq!(
            DbrValue::from("3").parse_into(DbrBasicType::Enum).unwrap(),
            DbrValue::Enum(3)
        );
        assert!(matches!(
            DbrValue::Long(vec![1]).parse_into(DbrBasicType::Long),
            Err(DbrParseError::SelfIsNotString)
        ));
    }

    #[test]
    fn resize_and_truncate() {
        let mut v = DbrValue::Double(vec![1.0, 2.0]);
        v.resize(4).unwrap();
        assert_eq!(v, DbrValue::Double(vec![1.0, 2.0, 0.0, 0.0]));
        v.truncate(1);
        assert_eq!(v, DbrValue::Double(vec![1.0]));
        assert!(DbrValue::Enum(1).resize(3).is_err());
    }

    #[test]
    fn record_categories_convert() {
        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1741731609);
        let dbr = Dbr::Time {
            status: Status {
                status: 3,
                severity: 1,
            },
            timestamp: stamp,
            value: vec![42i32].into(),
        };
        let status = dbr
            .convert_to(DbrType::new(DbrBasicType::Double, DbrCategory::Status))
            .unwrap();
        assert_eq!(
            status,
            Dbr::Status {
                status: Status {
                    status: 3,
                    severity: 1
                },
                value: DbrValue::Double(vec![42.0]),
            }
        );
        let time = status
            .convert_to(DbrType::new(DbrBasicType::Long, DbrCategory::Time))
            .unwrap();
        assert!(time.timestamp().is_some());
        let ctrl = dbr
            .convert_to(DbrType::new(DbrBasicType::Long, DbrCategory::Control))
            .unwrap();
        assert_eq!(ctrl.control_info(), Some(&ControlInfo::default()));
        assert_eq!(
            Dbr::Basic(DbrValue::Enum(2))
                .convert_to(DbrType::new(DbrBasicType::Enum, DbrCategory::Control)),
            Err(ErrorCondition::BadType)
        );
    }

    #[test]
    fn type_names_parse() {
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
            DbrType::new(DbrBasicType::Double, DbrCategory::Control),
            "DBR_CTRL_DOUBLE".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Basic),
            "SHORT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Float, DbrCategory::Basic),
            "FLOAT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Long, DbrCategory::Basic),
            "LONG".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Enum, DbrCategory::Basic),
            "ENUM".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Char, DbrCategory::Basic),
            "CHAR".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Double, DbrCategory::Basic),
            "double".parse().unwrap()
        );
        assert!("DBR_GR_DOUBLE".parse::<DbrType>().is_err());
        assert!("DBR_TIME_QUAD".parse::<DbrType>().is_err());
    }
}
