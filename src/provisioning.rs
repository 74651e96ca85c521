//! Bulk registration of simulated device signals.
//!
//! Devices are described by [`DeviceNode`]s mapping logical handles (such as
//! `fieldRB`) to PV names. [`register_node_channels`] selects the devices that
//! match a [`NodeFilter`], asks the [`SignalProcessor`] for that device family
//! which handles to serve, and registers one PV per distinct signal on a
//! [`PvServer`], with the family's limits attached.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt,
    hash::{Hash, Hasher},
};

use tracing::{debug, info, warn};

use crate::{
    dbr::{DbrBasicType, DbrValue},
    error::ServerError,
    naming::signal_size,
    server::PvServer,
};

pub const FIELD_RB_HANDLE: &str = "fieldRB";
pub const FIELD_SET_HANDLE: &str = "fieldSet";
pub const PS_FIELD_RB_HANDLE: &str = "psFieldRB";
pub const FIELD_BOOK_HANDLE: &str = "fieldBook";
pub const TRIM_RB_HANDLE: &str = "trimRB";
pub const TRIM_SET_HANDLE: &str = "trimSet";
pub const AMP_AVG_HANDLE: &str = "amplitudeAvg";
pub const H_SIGMA_M_HANDLE: &str = "hSigmaM";
pub const V_SIGMA_M_HANDLE: &str = "vSigmaM";
pub const H_SIGMA_F_HANDLE: &str = "hSigmaF";
pub const V_SIGMA_F_HANDLE: &str = "vSigmaF";

/// Soft type distinguishing profile monitors from wire scanners
pub const PROFILE_MONITOR_SOFT_TYPE: &str = "Version 1.0.0";

/// Units given to every provisioned signal
pub const DEFAULT_UNITS: &str = "units";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Quadrupole,
    TrimmedQuadrupole,
    Bend,
    Sextupole,
    HDipoleCorr,
    VDipoleCorr,
    ExtractionKicker,
    RfCavity,
    CurrentMonitor,
    Bpm,
    Blm,
    Solenoid,
    ProfileMonitor,
    TimingCenter,
}

impl DeviceType {
    /// Is this type `kind` or a specialization of it?
    pub fn is_kind_of(&self, kind: DeviceType) -> bool {
        *self == kind || (*self == DeviceType::TrimmedQuadrupole && kind == DeviceType::Quadrupole)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A device and the PV behind each of its handles
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceNode {
    pub id: String,
    pub device_type: DeviceType,
    pub soft_type: Option<String>,
    /// Devices that are switched off are never provisioned
    pub status: bool,
    channels: BTreeMap<String, Option<String>>,
}

impl DeviceNode {
    pub fn new(id: &str, device_type: DeviceType) -> Self {
        DeviceNode {
            id: id.to_owned(),
            device_type,
            soft_type: None,
            status: true,
            channels: BTreeMap::new(),
        }
    }

    pub fn soft_type(mut self, soft_type: &str) -> Self {
        self.soft_type = Some(soft_type.to_owned());
        self
    }

    pub fn status(mut self, status: bool) -> Self {
        self.status = status;
        self
    }

    /// Map `handle` to the PV `signal`
    pub fn channel(mut self, handle: &str, signal: &str) -> Self {
        self.channels
            .insert(handle.to_owned(), Some(signal.to_owned()));
        self
    }

    /// Declare a handle that has no PV configured
    pub fn unbound_handle(mut self, handle: &str) -> Self {
        self.channels.insert(handle.to_owned(), None);
        self
    }

    pub fn handles(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// The PV behind `handle`, if the device has one
    pub fn signal(&self, handle: &str) -> Option<&str> {
        self.channels.get(handle).and_then(|s| s.as_deref())
    }
}

/// Selects the devices of one family
#[derive(Debug, Clone, PartialEq)]
pub struct NodeFilter {
    pub kind: DeviceType,
    pub exclude: Vec<DeviceType>,
    pub soft_type: Option<String>,
}

impl NodeFilter {
    pub fn kind(kind: DeviceType) -> Self {
        NodeFilter {
            kind,
            exclude: Vec::new(),
            soft_type: None,
        }
    }

    pub fn excluding(mut self, kind: DeviceType) -> Self {
        self.exclude.push(kind);
        self
    }

    pub fn with_soft_type(mut self, soft_type: &str) -> Self {
        self.soft_type = Some(soft_type.to_owned());
        self
    }

    pub fn matches(&self, node: &DeviceNode) -> bool {
        node.status
            && node.device_type.is_kind_of(self.kind)
            && !self.exclude.iter().any(|k| node.device_type.is_kind_of(*k))
            && self
                .soft_type
                .as_ref()
                .is_none_or(|s| node.soft_type.as_ref() == Some(s))
    }
}

/// A signal to register, and the handle it was found through.
///
/// Two entries are the same entry when their signals match, whatever the
/// handle; the first handle seen decides the limits.
#[derive(Debug, Clone)]
pub struct SignalEntry {
    pub signal: String,
    pub handle: String,
}

impl SignalEntry {
    pub fn new(signal: &str, handle: &str) -> Self {
        SignalEntry {
            signal: signal.to_owned(),
            handle: handle.to_owned(),
        }
    }
}

impl PartialEq for SignalEntry {
    fn eq(&self, other: &Self) -> bool {
        self.signal == other.signal
    }
}
impl Eq for SignalEntry {}

impl Hash for SignalEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.signal.hash(state);
    }
}

impl PartialOrd for SignalEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SignalEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.signal.cmp(&other.signal)
    }
}

/// Which handles a device family serves and what limits they carry
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SignalProcessor {
    /// Quadrupoles, bends and solenoids
    UnipolarElectromagnet,
    TrimmedQuadrupole,
    Sextupole,
    DipoleCorrector,
    Bpm,
    /// Serves only the four sigma handles
    ProfileMonitor,
    /// Serves every handle without limits
    Default,
}

impl SignalProcessor {
    pub fn for_device(device_type: DeviceType, soft_type: Option<&str>) -> Self {
        match device_type {
            DeviceType::Quadrupole | DeviceType::Bend | DeviceType::Solenoid => {
                SignalProcessor::UnipolarElectromagnet
            }
            DeviceType::TrimmedQuadrupole => SignalProcessor::TrimmedQuadrupole,
            DeviceType::Bpm => SignalProcessor::Bpm,
            DeviceType::HDipoleCorr | DeviceType::VDipoleCorr => SignalProcessor::DipoleCorrector,
            DeviceType::Sextupole => SignalProcessor::Sextupole,
            DeviceType::ProfileMonitor if soft_type == Some(PROFILE_MONITOR_SOFT_TYPE) => {
                SignalProcessor::ProfileMonitor
            }
            _ => SignalProcessor::Default,
        }
    }

    pub fn handles_to_process(&self, node: &DeviceNode) -> Vec<String> {
        match self {
            SignalProcessor::ProfileMonitor => [
                H_SIGMA_M_HANDLE,
                V_SIGMA_M_HANDLE,
                H_SIGMA_F_HANDLE,
                V_SIGMA_F_HANDLE,
            ]
            .map(String::from)
            .to_vec(),
            _ => node.handles(),
        }
    }

    /// The (lower, upper) limits given to a handle's PV, if any
    pub fn limits(&self, handle: &str) -> Option<(f64, f64)> {
        const MAIN: [&str; 4] = [
            FIELD_RB_HANDLE,
            FIELD_SET_HANDLE,
            PS_FIELD_RB_HANDLE,
            FIELD_BOOK_HANDLE,
        ];
        match self {
            SignalProcessor::UnipolarElectromagnet => {
                MAIN.contains(&handle).then_some((0.0, 50.0))
            }
            SignalProcessor::TrimmedQuadrupole => {
                if MAIN.contains(&handle) {
                    Some((0.0, 50.0))
                } else if [TRIM_RB_HANDLE, TRIM_SET_HANDLE].contains(&handle) {
                    Some((-1.0, 1.0))
                } else {
                    None
                }
            }
            SignalProcessor::Sextupole => MAIN[..3].contains(&handle).then_some((-10.0, 10.0)),
            SignalProcessor::DipoleCorrector => {
                MAIN[..3].contains(&handle).then_some((-0.01, 0.01))
            }
            SignalProcessor::Bpm => Some(if handle == AMP_AVG_HANDLE {
                (0.0, 50.0)
            } else {
                (-1000.0, 1000.0)
            }),
            SignalProcessor::ProfileMonitor | SignalProcessor::Default => None,
        }
    }

    /// Register the PV for one entry, and its limit PVs if it is a scalar
    fn make_pv(&self, server: &PvServer, entry: &SignalEntry) -> Result<usize, ServerError> {
        let size = signal_size(&entry.signal);
        let pv = server.register_pv(
            &entry.signal,
            DbrValue::Double(vec![0.0; size]),
            DbrBasicType::Double,
        )?;
        pv.set_units(DEFAULT_UNITS);
        if let Some((lower, upper)) = self.limits(&entry.handle) {
            pv.set_limits(lower, upper);
        }
        Ok(server.register_limit_pvs(&pv)?.len())
    }
}

/// What a provisioning run registered and skipped
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisioningReport {
    /// Signals registered, in registration order
    pub registered: Vec<String>,
    /// Number of limit PVs registered alongside them
    pub limit_pvs: usize,
    /// (device id, handle) pairs that had no PV
    pub skipped: Vec<(String, String)>,
}

impl ProvisioningReport {
    fn merge(&mut self, other: ProvisioningReport) {
        self.registered.extend(other.registered);
        self.limit_pvs += other.limit_pvs;
        self.skipped.extend(other.skipped);
    }
}

fn register_entries(
    server: &PvServer,
    processor: SignalProcessor,
    signals: BTreeSet<SignalEntry>,
    report: &mut ProvisioningReport,
) -> Result<(), ServerError> {
    for entry in signals {
        match processor.make_pv(server, &entry) {
            Ok(limit_pvs) => {
                report.limit_pvs += limit_pvs;
                report.registered.push(entry.signal);
            }
            Err(ServerError::AlreadyExists(name)) => {
                warn!("{name} is already served, skipping");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Register PVs for every device in `nodes` that matches `filter`.
///
/// Handles without a PV are logged and skipped; registration carries on with
/// the rest.
pub fn register_node_channels(
    server: &PvServer,
    nodes: &[DeviceNode],
    filter: &NodeFilter,
) -> Result<ProvisioningReport, ServerError> {
    let processor = SignalProcessor::for_device(filter.kind, filter.soft_type.as_deref());
    let mut report = ProvisioningReport::default();
    let mut signals = BTreeSet::new();

    debug!("Provisioning {} devices with {processor:?}", filter.kind);
    for node in nodes.iter().filter(|n| filter.matches(n)) {
        let handles = processor.handles_to_process(node);
        debug!("{} ({}): handles {handles:?}", node.id, node.device_type);
        for handle in handles {
            match node.signal(&handle) {
                Some(signal) => {
                    signals.insert(SignalEntry::new(signal, &handle));
                }
                None => {
                    debug!("{} has no PV for handle {handle}", node.id);
                    report.skipped.push((node.id.clone(), handle));
                }
            }
        }
    }
    register_entries(server, processor, signals, &mut report)?;
    Ok(report)
}

/// Register every handle of the timing center with no limits
pub fn register_timing_signals(
    server: &PvServer,
    timing_center: &DeviceNode,
) -> Result<ProvisioningReport, ServerError> {
    let mut report = ProvisioningReport::default();
    let mut signals = BTreeSet::new();
    for handle in timing_center.handles() {
        match timing_center.signal(&handle) {
            Some(signal) => {
                signals.insert(SignalEntry::new(signal, &handle));
            }
            None => report.skipped.push((timing_center.id.clone(), handle)),
        }
    }
    register_entries(server, SignalProcessor::Default, signals, &mut report)?;
    Ok(report)
}

/// Stand up the usual simulated devices of a sequence.
///
/// Untrimmed quadrupoles are handled separately from trimmed ones, and only
/// profile monitors with the profile monitor soft type are served.
pub fn register_standard_nodes(
    server: &PvServer,
    nodes: &[DeviceNode],
    timing_center: Option<&DeviceNode>,
) -> Result<ProvisioningReport, ServerError> {
    let filters = [
        NodeFilter::kind(DeviceType::Quadrupole).excluding(DeviceType::TrimmedQuadrupole),
        NodeFilter::kind(DeviceType::TrimmedQuadrupole),
        NodeFilter::kind(DeviceType::Bend),
        NodeFilter::kind(DeviceType::Sextupole),
        NodeFilter::kind(DeviceType::HDipoleCorr),
        NodeFilter::kind(DeviceType::VDipoleCorr),
        NodeFilter::kind(DeviceType::ExtractionKicker),
        NodeFilter::kind(DeviceType::RfCavity),
        NodeFilter::kind(DeviceType::CurrentMonitor),
        NodeFilter::kind(DeviceType::Bpm),
        NodeFilter::kind(DeviceType::Blm),
        NodeFilter::kind(DeviceType::Solenoid),
        NodeFilter::kind(DeviceType::ProfileMonitor).with_soft_type(PROFILE_MONITOR_SOFT_TYPE),
    ];
    let mut report = ProvisioningReport::default();
    for filter in &filters {
        report.merge(register_node_channels(server, nodes, filter)?);
    }
    if let Some(timing_center) = timing_center {
        report.merge(register_timing_signals(server, timing_center)?);
    }
    info!(
        "Provisioned {} signals and {} limit PVs, skipped {} handles",
        report.registered.len(),
        report.limit_pvs,
        report.skipped.len()
    );
    Ok(report)
}
