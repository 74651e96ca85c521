//! Interface between a server and the code that owns PV values

pub mod memory;
pub use memory::{MemoryProvider, PvHandle};

use tokio::sync::broadcast;

use crate::{
    dbr::{Dbr, DbrType, DbrValue},
    protocol::{Access, ErrorCondition, MonitorEvent, MonitorMask},
};

/// Provides PV values to clients attached through a transport
pub trait Provider: Send + Sync + 'static {
    /// Does this provider control the given PV name?
    fn provides(&self, pv_name: &str) -> bool;

    /// Fetch a single PV value.
    ///
    /// The type requested by the caller is provided, but this is only
    /// a request - you can return any type you wish from this function,
    /// and it will be automatically converted to the target type (if
    /// such a safe conversion exists).
    ///
    /// The record that you return with no requested_type is used for
    /// the native type and data count that is reported to new channels.
    fn read_value(
        &self,
        pv_name: &str,
        requested_type: Option<DbrType>,
    ) -> Result<Dbr, ErrorCondition>;

    #[allow(unused_variables)]
    fn get_access_right(
        &self,
        pv_name: &str,
        client_user_name: Option<&str>,
        client_host_name: Option<&str>,
    ) -> Access {
        Access::Read
    }

    /// Write a value sent by a client to a PV
    #[allow(unused_variables)]
    fn write_value(&self, pv_name: &str, value: DbrValue) -> Result<(), ErrorCondition> {
        Err(ErrorCondition::NoWtAccess)
    }

    /// Subscribe to changes of a PV.
    ///
    /// Every event is sent to every receiver; the transport filters on `mask`.
    #[allow(unused_variables)]
    fn monitor_value(
        &self,
        pv_name: &str,
        mask: MonitorMask,
    ) -> Result<broadcast::Receiver<MonitorEvent>, ErrorCondition> {
        Err(ErrorCondition::UnavailInServ)
    }
}
