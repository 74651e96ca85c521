//! Conversions between the raw values a PV holds and the physical values
//! callers work with.
//!
//! A [`Channel`](crate::Channel) applies its transform on the non-raw get and
//! put paths: `get_value`, `get_value_record`, `put_val` and friends, plus the
//! limit accessors. The `*_raw_*` methods and monitors see raw values.

use std::fmt;

use crate::dbr::{DbrBasicType, DbrValue};

pub trait ValueTransform: Send + Sync + fmt::Debug {
    /// Raw PV value to physical value
    fn from_raw(&self, raw: DbrValue) -> DbrValue;
    /// Physical value to the raw value written to the PV
    fn to_raw(&self, physical: DbrValue) -> DbrValue;
}

/// Leaves values untouched. The default for every channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Identity;

impl ValueTransform for Identity {
    fn from_raw(&self, raw: DbrValue) -> DbrValue {
        raw
    }
    fn to_raw(&self, physical: DbrValue) -> DbrValue {
        physical
    }
}

/// `physical = scale * raw + offset`, element by element
///
/// Numeric values come out as doubles. Strings and enums are passed through,
/// except that strings being written are parsed as numbers first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearTransform {
    scale: f64,
    offset: f64,
}

impl LinearTransform {
    /// `None` unless `scale` is finite and non-zero, so the transform can be inverted
    pub fn new(scale: f64, offset: f64) -> Option<Self> {
        (scale.is_finite() && scale != 0.0 && offset.is_finite())
            .then_some(LinearTransform { scale, offset })
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    fn map(value: DbrValue, f: impl Fn(f64) -> f64) -> DbrValue {
        if !value.get_type().is_numeric() {
            return value;
        }
        match value.convert_to(DbrBasicType::Double) {
            Ok(DbrValue::Double(values)) => DbrValue::Double(values.into_iter().map(f).collect()),
            _ => value,
        }
    }
}

impl ValueTransform for LinearTransform {
    fn from_raw(&self, raw: DbrValue) -> DbrValue {
        Self::map(raw, |x| self.scale * x + self.offset)
    }

    fn to_raw(&self, physical: DbrValue) -> DbrValue {
        let physical = match physical.get_type() {
            DbrBasicType::String => physical
                .parse_into(DbrBasicType::Double)
                .unwrap_or(physical),
            _ => physical,
        };
        Self::map(physical, |x| (x - self.offset) / self.scale)
    }
}
