//! Status codes, access rights and event masks shared by channels and providers.

use crate::dbr::Dbr;

/// Completion status of a request, with the conventional CA numbering
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCondition {
    Normal = 0,
    Timeout = 10,
    BadType = 14,
    Internal = 17,
    GetFail = 19,
    PutFail = 20,
    BadCount = 22,
    BadStr = 23,
    Disconn = 24,
    EvDisallow = 26,
    BadMonId = 30,
    BadMask = 41,
    NoRdAccess = 46,
    NoWtAccess = 47,
    NoConvert = 50,
    BadChId = 51,
    UnavailInServ = 54,
    ChanDestroy = 55,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
}

impl ErrorCondition {
    pub fn get_severity(&self) -> ErrorSeverity {
        match self {
            Self::Normal => ErrorSeverity::Success,
            Self::Timeout => ErrorSeverity::Warning,
            Self::BadType => ErrorSeverity::Error,
            Self::Internal => ErrorSeverity::Severe,
            Self::GetFail => ErrorSeverity::Warning,
            Self::PutFail => ErrorSeverity::Warning,
            Self::BadCount => ErrorSeverity::Warning,
            Self::BadStr => ErrorSeverity::Error,
            Self::Disconn => ErrorSeverity::Warning,
            Self::EvDisallow => ErrorSeverity::Error,
            Self::BadMonId => ErrorSeverity::Error,
            Self::BadMask => ErrorSeverity::Error,
            Self::NoRdAccess => ErrorSeverity::Warning,
            Self::NoWtAccess => ErrorSeverity::Warning,
            Self::NoConvert => ErrorSeverity::Warning,
            Self::BadChId => ErrorSeverity::Error,
            Self::UnavailInServ => ErrorSeverity::Warning,
            Self::ChanDestroy => ErrorSeverity::Warning,
        }
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Normal => "Normal successful completion",
                Self::Timeout => "User specified timeout on IO operation expired",
                Self::BadType => "The data type specified is invalid",
                Self::Internal => "Channel Access Internal Failure",
                Self::GetFail => "Channel read request failed",
                Self::PutFail => "Channel write request failed",
                Self::BadCount => "Invalid element count requested",
                Self::BadStr => "Invalid string",
                Self::Disconn => "Virtual circuit disconnect",
                Self::EvDisallow =>
                    "Request inappropriate within subscription (monitor) update callback",
                Self::BadMonId => "Bad event subscription (monitor) identifier",
                Self::BadMask => "Invalid event selection mask",
                Self::NoRdAccess => "Read access denied",
                Self::NoWtAccess => "Write access denied",
                Self::NoConvert => "No reasonable data conversion between client and server types",
                Self::BadChId => "Invalid channel identifier",
                Self::UnavailInServ => "Not supported by attached service",
                Self::ChanDestroy => "User destroyed channel",
            }
        )
    }
}

impl std::error::Error for ErrorCondition {}

/// Access rights a client has on a PV
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Access {
    #[default]
    None = 0,
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl Access {
    pub fn can_read(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
    pub fn can_write(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

bitflags::bitflags! {
    /// Which kinds of change a subscription wants to hear about
    ///
    /// The default is [`MonitorMask::VALUE`] | [`MonitorMask::ALARM`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MonitorMask: u16 {
        /// Value changed by more than the deadband
        const VALUE = 1;
        /// Value changed by more than the archive deadband
        const LOG = 2;
        /// Alarm status or severity changed
        const ALARM = 4;
    }
}

impl Default for MonitorMask {
    fn default() -> Self {
        MonitorMask::VALUE | MonitorMask::ALARM
    }
}

/// A change published by a provider for a single PV
///
/// `mask` says what kind of change happened; subscribers only see events
/// that intersect the mask they asked for.
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub mask: MonitorMask,
    pub record: Dbr,
}
