//! Typed snapshots of a fetched value.
//!
//! Each request or monitor update produces one immutable record. The three
//! flavors nest: a [`ChannelTimeRecord`] is a [`ChannelStatusRecord`] with a
//! timestamp, which is a [`ChannelRecord`] with alarm information, and each
//! dereferences to the smaller one.

use std::{
    fmt,
    ops::Deref,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    dbr::{Dbr, DbrBasicType, DbrValue, Status},
    protocol::ErrorCondition,
};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Record carries no alarm status")]
    MissingStatus,
    #[error("Record carries no timestamp")]
    MissingTimestamp,
    #[error("Record carries no control information")]
    MissingControlInfo,
}

/// A fetched value without metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRecord {
    value: DbrValue,
}

impl ChannelRecord {
    pub fn new(value: DbrValue) -> Self {
        Self { value }
    }
    pub fn value(&self) -> &DbrValue {
        &self.value
    }
    pub fn into_value(self) -> DbrValue {
        self.value
    }
    pub fn count(&self) -> usize {
        self.value.get_count()
    }
    pub fn value_type(&self) -> DbrBasicType {
        self.value.get_type()
    }
    /// The first element, converted to `T`
    pub fn scalar<T>(&self) -> Result<T, ErrorCondition>
    where
        T: for<'a> TryFrom<&'a DbrValue, Error = ErrorCondition>,
    {
        T::try_from(&self.value)
    }
    /// Every element, converted to `T`
    pub fn array<T>(&self) -> Result<Vec<T>, ErrorCondition>
    where
        Vec<T>: for<'a> TryFrom<&'a DbrValue, Error = ErrorCondition>,
    {
        Vec::<T>::try_from(&self.value)
    }
    pub fn double_value(&self) -> Result<f64, ErrorCondition> {
        self.scalar()
    }
    pub fn double_array(&self) -> Result<Vec<f64>, ErrorCondition> {
        self.array()
    }
    pub fn string_value(&self) -> String {
        self.to_string()
    }
}

impl TryFrom<Dbr> for ChannelRecord {
    type Error = RecordError;
    fn try_from(value: Dbr) -> Result<Self, Self::Error> {
        Ok(ChannelRecord::new(value.take_value()))
    }
}

impl fmt::Display for ChannelRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn _join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }
        match &self.value {
            DbrValue::Enum(v) => write!(f, "{v}"),
            DbrValue::String(v) => _join(f, v),
            DbrValue::Char(v) => _join(f, v),
            DbrValue::Int(v) => _join(f, v),
            DbrValue::Long(v) => _join(f, v),
            DbrValue::Float(v) => _join(f, v),
            DbrValue::Double(v) => _join(f, v),
        }
    }
}

/// A fetched value with alarm status and severity
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatusRecord {
    record: ChannelRecord,
    status: Status,
}

impl ChannelStatusRecord {
    pub fn new(value: DbrValue, status: Status) -> Self {
        Self {
            record: ChannelRecord::new(value),
            status,
        }
    }
    pub fn status(&self) -> i16 {
        self.status.status
    }
    pub fn severity(&self) -> i16 {
        self.status.severity
    }
    pub fn alarm(&self) -> Status {
        self.status
    }
}

impl Deref for ChannelStatusRecord {
    type Target = ChannelRecord;
    fn deref(&self) -> &Self::Target {
        &self.record
    }
}

impl TryFrom<Dbr> for ChannelStatusRecord {
    type Error = RecordError;
    fn try_from(value: Dbr) -> Result<Self, Self::Error> {
        let status = value.status().ok_or(RecordError::MissingStatus)?;
        Ok(ChannelStatusRecord::new(value.take_value(), status))
    }
}

/// A fetched value with alarm status, severity, and time of last change
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelTimeRecord {
    record: ChannelStatusRecord,
    timestamp: SystemTime,
}

impl ChannelTimeRecord {
    pub fn new(value: DbrValue, status: Status, timestamp: SystemTime) -> Self {
        Self {
            record: ChannelStatusRecord::new(value, status),
            timestamp,
        }
    }
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
    /// Seconds since the unix epoch, with sub-second precision
    pub fn time_in_seconds(&self) -> f64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl Deref for ChannelTimeRecord {
    type Target = ChannelStatusRecord;
    fn deref(&self) -> &Self::Target {
        &self.record
    }
}

impl TryFrom<Dbr> for ChannelTimeRecord {
    type Error = RecordError;
    fn try_from(value: Dbr) -> Result<Self, Self::Error> {
        let status = value.status().ok_or(RecordError::MissingStatus)?;
        let timestamp = value.timestamp().ok_or(RecordError::MissingTimestamp)?;
        Ok(ChannelTimeRecord::new(value.take_value(), status, timestamp))
    }
}
