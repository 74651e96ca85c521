//! In-process PV server.
//!
//! A [`PvServer`] owns a [`MemoryProvider`] and publishes it on an
//! [`InprocBus`], so channels created by any context on the same bus can find,
//! read, write and monitor its PVs. Registering a PV announces the server on the
//! bus, so channels already searching for that name connect promptly.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::{
    dbr::{DbrBasicType, DbrValue},
    error::ServerError,
    naming::{LimitKind, limit_pvs},
    providers::{MemoryProvider, PvHandle},
    transport::{InprocBus, ServerId},
    utils::lock,
};

pub struct PvServer {
    bus: InprocBus,
    provider: MemoryProvider,
    host_name: String,
    /// Present until destroyed
    id: Mutex<Option<ServerId>>,
}

impl PvServer {
    /// Start serving on `bus`, named after this host
    pub fn new(bus: &InprocBus) -> Self {
        let host_name = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".into());
        Self::with_host_name(bus, &host_name)
    }

    pub fn with_host_name(bus: &InprocBus, host_name: &str) -> Self {
        let provider = MemoryProvider::new();
        let id = bus.attach(host_name, Arc::new(provider.clone()));
        info!("Started PV server {id:?} on {host_name}");
        PvServer {
            bus: bus.clone(),
            provider,
            host_name: host_name.to_owned(),
            id: Mutex::new(Some(id)),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn provider(&self) -> &MemoryProvider {
        &self.provider
    }

    fn id(&self) -> Result<ServerId, ServerError> {
        lock(&self.id).ok_or(ServerError::Destroyed)
    }

    /// Create a memory-backed PV holding `initial`, stored as `native_type`
    pub fn register_pv(
        &self,
        name: &str,
        initial: impl Into<DbrValue>,
        native_type: DbrBasicType,
    ) -> Result<PvHandle, ServerError> {
        let id = self.id()?;
        let handle = self.provider.add_pv_as(name, initial, native_type)?;
        debug!(
            "Registered {name} as {native_type:?}[{}]",
            handle.element_count()
        );
        self.bus.announce(id);
        Ok(handle)
    }

    /// Register the eight limit PVs of a scalar PV.
    ///
    /// Warning and alarm limits start at zero, operation limits at the PV's
    /// display limits, and drive limits at its control limits. Limit PVs that
    /// already exist are left alone, and only the newly registered ones are
    /// returned. Array PVs get no limit PVs.
    pub fn register_limit_pvs(&self, pv: &PvHandle) -> Result<Vec<PvHandle>, ServerError> {
        if pv.element_count() != 1 {
            return Ok(Vec::new());
        }
        let mut registered = Vec::with_capacity(8);
        for kind in LimitKind::ALL {
            let (lower, upper) = match kind {
                LimitKind::Warning | LimitKind::Alarm => (0.0, 0.0),
                LimitKind::Operation => pv.display_limits(),
                LimitKind::Drive => pv.control_limits(),
            };
            let [lower_name, upper_name] = limit_pvs(pv.name(), kind);
            for (name, value) in [(lower_name, lower), (upper_name, upper)] {
                match self.register_pv(&name, value, DbrBasicType::Double) {
                    Ok(handle) => registered.push(handle),
                    Err(ServerError::AlreadyExists(_)) => {
                        debug!("{name} is already served, keeping it");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(registered)
    }

    pub fn pv(&self, name: &str) -> Option<PvHandle> {
        self.provider.pv(name)
    }

    pub fn pv_names(&self) -> Vec<String> {
        self.provider.names()
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.id).is_none()
    }

    /// Withdraw every PV. Connected channels see their connection drop.
    /// Calling this again does nothing.
    pub fn destroy(&self) {
        let Some(id) = lock(&self.id).take() else {
            return;
        };
        self.bus.detach(id);
        self.provider.clear();
        info!("PV server {id:?} destroyed");
    }
}

impl Drop for PvServer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for PvServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PvServer")
            .field("host_name", &self.host_name)
            .field("id", &*lock(&self.id))
            .field("pvs", &self.provider.len())
            .finish()
    }
}
