//! The seam between channels and whatever actually moves PV data.
//!
//! A [`Transport`] creates [`NativeChannel`]s, one per PV name, and services
//! them on its own threads. Requests are queued until [`Transport::flush_io`]
//! and resolved through [`Completion`]s; connection changes and monitor
//! updates are always delivered from transport threads, never inline from the
//! call that registered for them.
//!
//! The only transport shipped is [`inproc`], which connects channels to
//! [`Provider`](crate::Provider)s attached to an [`InprocBus`].

use std::{fmt, sync::Arc};

use tokio::runtime::Handle;
use tracing::warn;

use crate::{
    dbr::{Dbr, DbrBasicType, DbrType, DbrValue},
    pending::Completion,
    protocol::{Access, ErrorCondition, MonitorMask},
};

pub mod inproc;
pub use inproc::{InprocBus, InprocTransport, ServerId};

/// Name of the transport used when none is configured
pub const DEFAULT_TRANSPORT: &str = "inproc";

/// Called with `true` when a native channel connects and `false` when it drops
pub type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;
/// Receives every record delivered for a subscription
pub type EventSink = Arc<dyn Fn(Dbr) + Send + Sync>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Requests left unanswered by [`Transport::shutdown`]
///
/// Each one fails with an error when this is dropped, which runs any user
/// callback attached to it. Callers drop it once they hold no locks.
#[derive(Default)]
pub struct Stranded(Vec<Box<dyn FnOnce() + Send>>);

impl Stranded {
    pub fn push(&mut self, fail: impl FnOnce() + Send + 'static) {
        self.0.push(Box::new(fail));
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for Stranded {
    fn drop(&mut self) {
        for fail in self.0.drain(..) {
            fail();
        }
    }
}

impl fmt::Debug for Stranded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Stranded").field(&self.0.len()).finish()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum NativeState {
    #[default]
    NeverConnected,
    Connected,
    Disconnected,
    Closed,
}

/// What a server reported about a PV when the channel connected
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub native_type: DbrBasicType,
    pub native_count: usize,
    pub access: Access,
    pub host_name: String,
}

/// One transport-level connection to a single PV
pub trait NativeChannel: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn state(&self) -> NativeState;

    /// Metadata from the most recent connection, if there ever was one
    fn info(&self) -> Option<ChannelInfo>;

    /// Register for connection changes.
    ///
    /// The callback only ever runs on a transport thread; a channel that is
    /// already connected does not call it from inside this method.
    fn add_connection_listener(&self, listener: ConnectionCallback) -> ListenerId;

    fn remove_connection_listener(&self, id: ListenerId);

    /// Start looking for the PV. Returns immediately.
    fn connect(&self) -> Result<(), ErrorCondition>;

    /// Queue a read. A `count` of `None` asks for every element.
    fn get(&self, dbr_type: DbrType, count: Option<usize>, reply: Completion<Dbr>);

    /// Queue a write
    fn put(&self, value: DbrValue, reply: Completion<()>);

    /// Queue a subscription.
    ///
    /// `confirm` resolves once the server has accepted or rejected it. The
    /// first record delivered to `sink` is the current value.
    fn subscribe(
        &self,
        dbr_type: DbrType,
        count: Option<usize>,
        mask: MonitorMask,
        sink: EventSink,
        confirm: Completion<()>,
    ) -> SubscriptionId;

    /// Stop a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Close the channel for good
    fn destroy(&self);
}

/// Factory and service loop for native channels
pub trait Transport: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Start servicing on `runtime`. Calling this on a running transport is a no-op.
    fn initialize(&self, runtime: &Handle) -> Result<(), ErrorCondition>;

    fn is_initialized(&self) -> bool;

    fn create_channel(&self, name: &str) -> Result<Arc<dyn NativeChannel>, ErrorCondition>;

    /// Send every queued request, in the order they were queued
    fn flush_io(&self) -> Result<(), ErrorCondition>;

    /// Resolve `reply` once everything sent before it has been handled
    fn echo(&self, reply: Completion<()>);

    /// Stop servicing. Requests that were queued but never sent are returned
    /// and resolve with an error when the result is dropped.
    fn shutdown(&self) -> Stranded;
}

/// Pick a transport by its configured name, falling back to the default
pub fn select_transport(name: &str) -> Arc<dyn Transport> {
    match name.trim().to_ascii_lowercase().as_str() {
        "" | DEFAULT_TRANSPORT => Arc::new(InprocTransport::new(InprocBus::shared())),
        other => {
            warn!("Unknown transport '{other}', falling back to '{DEFAULT_TRANSPORT}'");
            Arc::new(InprocTransport::new(InprocBus::shared()))
        }
    }
}
