//! Subscriptions to value changes.
//!
//! A [`Monitor`] is created through one of the `add_monitor_*` methods on
//! [`Channel`] and delivers a typed record to its sink for the current value
//! and then for every change matching its mask. Records arrive on transport
//! threads. Once [`Monitor::clear`] returns, the sink is never called again,
//! except by a delivery that is already running on the calling thread.

use std::{
    fmt,
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, ThreadId},
};

use tracing::{debug, warn};

use crate::{
    channel::Channel,
    dbr::{Dbr, DbrCategory, DbrType},
    error::MonitorError,
    pending::Completion,
    protocol::MonitorMask,
    records::RecordError,
    transport::{EventSink, NativeChannel, SubscriptionId},
    utils::{call_guarded, lock},
};

/// Which record flavor a monitor delivers
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MonitorKind {
    /// [`ChannelRecord`](crate::records::ChannelRecord)
    Value,
    /// [`ChannelStatusRecord`](crate::records::ChannelStatusRecord)
    ValueStatus,
    /// [`ChannelTimeRecord`](crate::records::ChannelTimeRecord)
    ValueTime,
}

impl MonitorKind {
    pub fn category(&self) -> DbrCategory {
        match self {
            MonitorKind::Value => DbrCategory::Basic,
            MonitorKind::ValueStatus => DbrCategory::Status,
            MonitorKind::ValueTime => DbrCategory::Time,
        }
    }
}

#[derive(Debug)]
struct GateState {
    active: bool,
    delivering: Vec<ThreadId>,
}

/// Tracks deliveries in progress so that closing can wait for them
#[derive(Debug)]
struct DeliveryGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

struct DeliveryGuard<'a> {
    gate: &'a DeliveryGate,
    thread: ThreadId,
}

impl DeliveryGate {
    fn new() -> Self {
        DeliveryGate {
            state: Mutex::new(GateState {
                active: true,
                delivering: Vec::new(),
            }),
            idle: Condvar::new(),
        }
    }

    /// `None` once closed
    fn enter(&self) -> Option<DeliveryGuard<'_>> {
        let mut state = lock(&self.state);
        if !state.active {
            return None;
        }
        let thread = thread::current().id();
        state.delivering.push(thread);
        Some(DeliveryGuard { gate: self, thread })
    }

    fn is_open(&self) -> bool {
        lock(&self.state).active
    }

    /// Close, then wait out deliveries running on other threads
    fn close(&self) {
        let me = thread::current().id();
        let mut state = lock(&self.state);
        state.active = false;
        let _state = self
            .idle
            .wait_while(state, |s| s.delivering.iter().any(|t| *t != me))
            .unwrap_or_else(PoisonError::into_inner);
    }
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.gate.state);
        if let Some(pos) = state.delivering.iter().position(|t| *t == self.thread) {
            state.delivering.swap_remove(pos);
        }
        self.gate.idle.notify_all();
    }
}

/// An active subscription, cleared on drop
///
/// A served PV queues at most
/// [`EVENT_QUEUE_CAPACITY`](crate::providers::memory::EVENT_QUEUE_CAPACITY)
/// updates for a subscriber. A sink that falls further behind than that loses
/// the oldest queued updates; a warning is logged and delivery carries on with
/// the newer ones, so the latest value always arrives.
pub struct Monitor {
    channel_name: String,
    kind: MonitorKind,
    mask: MonitorMask,
    native: Arc<dyn NativeChannel>,
    subscription: SubscriptionId,
    gate: Arc<DeliveryGate>,
    cleared: AtomicBool,
}

impl Monitor {
    /// Subscribe on `channel`, which must be connected, and wait for the
    /// server to confirm.
    pub(crate) fn begin<R, S>(
        channel: &Channel,
        kind: MonitorKind,
        mask: MonitorMask,
        sink: S,
    ) -> Result<Monitor, MonitorError>
    where
        R: TryFrom<Dbr, Error = RecordError> + 'static,
        S: Fn(R) + Send + Sync + 'static,
    {
        let name = channel.channel_name().to_owned();
        let (native, info) = channel.native_link()?;
        let handle = channel.context().ready()?;
        let gate = Arc::new(DeliveryGate::new());

        let event_sink: EventSink = {
            let gate = gate.clone();
            let name = name.clone();
            Arc::new(move |dbr: Dbr| {
                let Some(_delivering) = gate.enter() else {
                    return;
                };
                match R::try_from(dbr) {
                    Ok(record) => {
                        call_guarded(&name, || sink(record));
                    }
                    Err(e) => warn!("{name}: dropping monitor update: {e}"),
                }
            })
        };

        let (confirm, pending) = Completion::pending(handle);
        let subscription = native.subscribe(
            DbrType::new(info.native_type, kind.category()),
            Some(info.native_count),
            mask,
            event_sink,
            confirm,
        );
        if let Err(e) = channel.context().flush_io() {
            debug!("{name}: flush failed: {e}");
        }
        let monitor = Monitor {
            channel_name: name,
            kind,
            mask,
            native,
            subscription,
            gate,
            cleared: AtomicBool::new(false),
        };
        match pending.wait(channel.io_timeout()) {
            Ok(()) => {
                debug!(
                    "{}: monitor {:?} started with mask {:#05b}",
                    monitor.channel_name,
                    monitor.subscription,
                    mask.bits()
                );
                Ok(monitor)
            }
            Err(e) => {
                monitor.clear();
                Err(MonitorError::from_request(&monitor.channel_name, e))
            }
        }
    }

    /// Stop delivery. Safe to call more than once, including from inside the
    /// sink.
    pub fn clear(&self) {
        if self.cleared.swap(true, Ordering::AcqRel) {
            return;
        }
        self.gate.close();
        self.native.unsubscribe(self.subscription);
        debug!("{}: monitor {:?} cleared", self.channel_name, self.subscription);
    }

    pub fn is_active(&self) -> bool {
        !self.cleared.load(Ordering::Acquire) && self.gate.is_open()
    }

    pub fn kind(&self) -> MonitorKind {
        self.kind
    }

    pub fn mask(&self) -> MonitorMask {
        self.mask
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("channel", &self.channel_name)
            .field("kind", &self.kind)
            .field("mask", &self.mask)
            .field("active", &self.is_active())
            .finish()
    }
}
