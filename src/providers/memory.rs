//! Memory-backed PVs.
//!
//! A [`MemoryProvider`] holds named values that can be read, written and
//! monitored through a transport, and read or written locally through the
//! [`PvHandle`] returned when each PV is added. Writes from either side are
//! converted to the PV's native type and published to subscribers.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::{
    Provider,
    dbr::{ControlInfo, Dbr, DbrBasicType, DbrCategory, DbrType, DbrValue, Status},
    error::ServerError,
    protocol::{Access, ErrorCondition, MonitorEvent, MonitorMask},
    utils::lock,
};

/// Updates queued per PV for each subscriber before the oldest are dropped
pub const EVENT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug)]
struct Pv {
    value: DbrValue,
    /// Minimum array length. At least this many elements are sent to
    /// clients, and assigning a longer value raises it.
    minimum_length: Option<usize>,
    /// The last time this value was written
    timestamp: SystemTime,
    status: Status,
    info: ControlInfo,
    read_only: bool,
    sender: broadcast::Sender<MonitorEvent>,
}

impl Pv {
    fn new(value: DbrValue) -> Self {
        let count = value.get_count();
        Pv {
            value,
            minimum_length: (count > 1).then_some(count),
            timestamp: SystemTime::now(),
            status: Status::default(),
            info: ControlInfo::default(),
            read_only: false,
            sender: broadcast::Sender::new(EVENT_QUEUE_CAPACITY),
        }
    }

    /// The value as sent to clients, padded to the minimum length
    fn padded_value(&self) -> DbrValue {
        let mut value = self.value.clone();
        if let Some(size) = self.minimum_length
            && value.get_count() < size
        {
            let _ = value.resize(size);
        }
        value
    }

    fn record(&self, category: DbrCategory) -> Dbr {
        let value = self.padded_value();
        match category {
            DbrCategory::Control => Dbr::Control {
                status: self.status,
                info: self.info.clone(),
                value,
            },
            _ => Dbr::Time {
                status: self.status,
                timestamp: self.timestamp,
                value,
            },
        }
    }

    fn publish(&self, mask: MonitorMask) {
        let _ = self.sender.send(MonitorEvent {
            mask,
            record: self.record(DbrCategory::Time),
        });
    }

    fn store(&mut self, value: &DbrValue) -> Result<(), ErrorCondition> {
        self.value = value.convert_to(self.value.get_type())?;
        if let Some(size) = self.minimum_length
            && self.value.get_count() > size
        {
            self.minimum_length = Some(self.value.get_count());
        }
        self.timestamp = SystemTime::now();
        self.publish(MonitorMask::VALUE | MonitorMask::LOG);
        Ok(())
    }

    /// Store a value written by a client. Strings are parsed into numeric PVs.
    fn store_from_client(&mut self, value: &DbrValue) -> Result<(), ErrorCondition> {
        let native_type = self.value.get_type();
        if value.get_type() == DbrBasicType::String && native_type != DbrBasicType::String {
            let parsed = value
                .parse_into(native_type)
                .map_err(|_| ErrorCondition::NoConvert)?;
            self.store(&parsed)
        } else {
            self.store(value)
        }
    }
}

/// Local read/write access to one PV of a [`MemoryProvider`]
#[derive(Clone, Debug)]
pub struct PvHandle {
    name: String,
    pv: Arc<Mutex<Pv>>,
}

impl PvHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn native_type(&self) -> DbrBasicType {
        lock(&self.pv).value.get_type()
    }

    pub fn element_count(&self) -> usize {
        lock(&self.pv).padded_value().get_count()
    }

    pub fn load(&self) -> DbrValue {
        lock(&self.pv).value.clone()
    }

    /// Replace the value, converting to the native type, and notify subscribers
    pub fn store(&self, value: impl Into<DbrValue>) -> Result<(), ErrorCondition> {
        lock(&self.pv).store(&value.into())
    }

    pub fn timestamp(&self) -> SystemTime {
        lock(&self.pv).timestamp
    }

    pub fn status(&self) -> Status {
        lock(&self.pv).status
    }

    /// Change the alarm state. Subscribers watching alarms are notified on change.
    pub fn set_status(&self, status: Status) {
        let mut pv = lock(&self.pv);
        if pv.status != status {
            pv.status = status;
            pv.publish(MonitorMask::ALARM);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        lock(&self.pv).sender.subscribe()
    }

    pub fn control_info(&self) -> ControlInfo {
        lock(&self.pv).info.clone()
    }

    pub fn units(&self) -> String {
        lock(&self.pv).info.units.clone()
    }
    pub fn set_units(&self, units: &str) {
        lock(&self.pv).info.units = units.to_owned();
    }
    pub fn precision(&self) -> i16 {
        lock(&self.pv).info.precision
    }
    pub fn set_precision(&self, precision: i16) {
        lock(&self.pv).info.precision = precision;
    }

    pub fn display_limits(&self) -> (f64, f64) {
        lock(&self.pv).info.display_limits
    }
    pub fn set_display_limits(&self, lower: f64, upper: f64) {
        lock(&self.pv).info.display_limits = (lower, upper);
    }
    pub fn alarm_limits(&self) -> (f64, f64) {
        lock(&self.pv).info.alarm_limits
    }
    pub fn set_alarm_limits(&self, lower: f64, upper: f64) {
        lock(&self.pv).info.alarm_limits = (lower, upper);
    }
    pub fn warning_limits(&self) -> (f64, f64) {
        lock(&self.pv).info.warning_limits
    }
    pub fn set_warning_limits(&self, lower: f64, upper: f64) {
        lock(&self.pv).info.warning_limits = (lower, upper);
    }
    pub fn control_limits(&self) -> (f64, f64) {
        lock(&self.pv).info.control_limits
    }
    pub fn set_control_limits(&self, lower: f64, upper: f64) {
        lock(&self.pv).info.control_limits = (lower, upper);
    }

    /// Set display, alarm, warning and control limits to the same pair
    pub fn set_limits(&self, lower: f64, upper: f64) {
        let mut pv = lock(&self.pv);
        let info = &mut pv.info;
        info.display_limits = (lower, upper);
        info.alarm_limits = (lower, upper);
        info.warning_limits = (lower, upper);
        info.control_limits = (lower, upper);
    }

    pub fn is_read_only(&self) -> bool {
        lock(&self.pv).read_only
    }

    /// Refuse client writes. Local [`PvHandle::store`] still works.
    pub fn set_read_only(&self, read_only: bool) {
        lock(&self.pv).read_only = read_only;
    }
}

/// A [`Provider`] serving PVs held in memory
#[derive(Clone, Default, Debug)]
pub struct MemoryProvider {
    pvs: Arc<Mutex<HashMap<String, Arc<Mutex<Pv>>>>>,
}

impl MemoryProvider {
    pub fn new() -> MemoryProvider {
        MemoryProvider::default()
    }

    /// Add a PV whose native type is that of `initial_value`
    pub fn add_pv(
        &self,
        name: &str,
        initial_value: impl Into<DbrValue>,
    ) -> Result<PvHandle, ServerError> {
        let mut pvmap = lock(&self.pvs);
        if pvmap.contains_key(name) {
            return Err(ServerError::AlreadyExists(name.to_owned()));
        }
        let pv = Arc::new(Mutex::new(Pv::new(initial_value.into())));
        pvmap.insert(name.to_owned(), pv.clone());
        debug!("Added PV {name}");
        Ok(PvHandle {
            name: name.to_owned(),
            pv,
        })
    }

    /// Add a PV with an explicit native type, converting the initial value
    pub fn add_pv_as(
        &self,
        name: &str,
        initial_value: impl Into<DbrValue>,
        native_type: DbrBasicType,
    ) -> Result<PvHandle, ServerError> {
        let initial_value: DbrValue = initial_value.into();
        let converted = match initial_value.get_type() {
            DbrBasicType::String if native_type != DbrBasicType::String => initial_value
                .parse_into(native_type)
                .map_err(|_| ErrorCondition::NoConvert),
            _ => initial_value.convert_to(native_type),
        }
        .map_err(|condition| ServerError::BadInitialValue {
            name: name.to_owned(),
            condition,
        })?;
        self.add_pv(name, converted)
    }

    pub fn pv(&self, name: &str) -> Option<PvHandle> {
        lock(&self.pvs).get(name).map(|pv| PvHandle {
            name: name.to_owned(),
            pv: pv.clone(),
        })
    }

    /// Every PV name, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.pvs).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        lock(&self.pvs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every PV. Existing handles keep working but are no longer served.
    pub fn clear(&self) {
        lock(&self.pvs).clear();
    }

    fn get(&self, name: &str) -> Result<Arc<Mutex<Pv>>, ErrorCondition> {
        lock(&self.pvs)
            .get(name)
            .cloned()
            .ok_or(ErrorCondition::UnavailInServ)
    }
}

impl Provider for MemoryProvider {
    fn provides(&self, pv_name: &str) -> bool {
        lock(&self.pvs).contains_key(pv_name)
    }

    fn read_value(
        &self,
        pv_name: &str,
        requested_type: Option<DbrType>,
    ) -> Result<Dbr, ErrorCondition> {
        let pv = self.get(pv_name)?;
        let category = requested_type
            .map(|t| t.category)
            .unwrap_or(DbrCategory::Time);
        Ok(lock(&pv).record(category))
    }

    fn get_access_right(
        &self,
        pv_name: &str,
        _client_user_name: Option<&str>,
        _client_host_name: Option<&str>,
    ) -> Access {
        match self.get(pv_name) {
            Ok(pv) if lock(&pv).read_only => Access::Read,
            Ok(_) => Access::ReadWrite,
            Err(_) => Access::None,
        }
    }

    fn write_value(&self, pv_name: &str, value: DbrValue) -> Result<(), ErrorCondition> {
        let pv = self.get(pv_name)?;
        let mut pv = lock(&pv);
        if pv.read_only {
            return Err(ErrorCondition::NoWtAccess);
        }
        trace!("Processing write to {pv_name}: {value:?}");
        pv.store_from_client(&value).inspect_err(|e| {
            debug!("Write to {pv_name} failed: {e}");
        })
    }

    fn monitor_value(
        &self,
        pv_name: &str,
        _mask: MonitorMask,
    ) -> Result<broadcast::Receiver<MonitorEvent>, ErrorCondition> {
        let pv = self.get(pv_name)?;
        let receiver = lock(&pv).sender.subscribe();
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_converts_to_native_type() {
        let provider = MemoryProvider::new();
        let pv = provider.add_pv("TEST:I", 0.0f64).unwrap();
        pv.store(3i32).unwrap();
        assert_eq!(pv.load(), DbrValue::Double(vec![3.0]));
        let long = provider.add_pv("TEST:L", 0i32).unwrap();
        assert_eq!(long.store(1e10f64), Err(ErrorCondition::NoConvert));
        assert!(matches!(
            provider.add_pv("TEST:I", 1i32),
            Err(ServerError::AlreadyExists(_))
        ));
    }

    #[test]
    fn client_strings_are_parsed() {
        let provider = MemoryProvider::new();
        provider.add_pv("TEST:L", vec![0i32, 0]).unwrap();
        provider
            .write_value("TEST:L", DbrValue::String(vec!["4".into(), " 5".into()]))
            .unwrap();
        let dbr = provider.read_value("TEST:L", None).unwrap();
        assert_eq!(dbr.value(), &DbrValue::Long(vec![4, 5]));
        assert_eq!(
            provider.write_value("TEST:L", "x".into()),
            Err(ErrorCondition::NoConvert)
        );
    }

    #[test]
    fn arrays_keep_minimum_length() {
        let provider = MemoryProvider::new();
        let pv = provider
            .add_pv_as("TEST:TBT", vec![0.0f64; 4], DbrBasicType::Double)
            .unwrap();
        pv.store(vec![1.0f64]).unwrap();
        let dbr = provider.read_value("TEST:TBT", None).unwrap();
        assert_eq!(dbr.value(), &DbrValue::Double(vec![1.0, 0.0, 0.0, 0.0]));
        assert_eq!(pv.element_count(), 4);
    }

    #[test]
    fn control_records_carry_limits() {
        let provider = MemoryProvider::new();
        let pv = provider.add_pv("TEST:C", 1.5f64).unwrap();
        pv.set_limits(0.0, 50.0);
        pv.set_warning_limits(1.0, 49.0);
        pv.set_units("A");
        let requested = DbrType::new(DbrBasicType::Double, DbrCategory::Control);
        let dbr = provider.read_value("TEST:C", Some(requested)).unwrap();
        let info = dbr.control_info().unwrap();
        assert_eq!(info.units, "A");
        assert_eq!(info.display_limits, (0.0, 50.0));
        assert_eq!(info.warning_limits, (1.0, 49.0));
    }

    #[test]
    fn read_only_refuses_client_writes() {
        let provider = MemoryProvider::new();
        let pv = provider.add_pv("TEST:RO", 1i32).unwrap();
        pv.set_read_only(true);
        assert_eq!(provider.get_access_right("TEST:RO", None, None), Access::Read);
        assert_eq!(
            provider.write_value("TEST:RO", 2i32.into()),
            Err(ErrorCondition::NoWtAccess)
        );
        pv.store(2i32).unwrap();
        assert_eq!(pv.load(), DbrValue::Long(vec![2]));
    }

    #[test]
    fn updates_are_published() {
        let provider = MemoryProvider::new();
        let pv = provider.add_pv("TEST:M", 1i32).unwrap();
        let mut rx = provider.monitor_value("TEST:M", MonitorMask::all()).unwrap();
        pv.store(7i32).unwrap();
        let event = rx.try_recv().unwrap();
        assert!(event.mask.contains(MonitorMask::VALUE));
        assert_eq!(event.record.value(), &DbrValue::Long(vec![7]));

        pv.set_status(Status {
            status: 3,
            severity: 2,
        });
        let event = rx.try_recv().unwrap();
        assert_eq!(event.mask, MonitorMask::ALARM);
        assert_eq!(event.record.status().unwrap().severity, 2);
    }
}
