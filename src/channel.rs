//! The per-PV facade.
//!
//! A [`Channel`] names one PV and mediates every interaction with it:
//! connecting, reading metadata, getting and putting values, and installing
//! [`Monitor`]s. Channels for the same name share one native channel through
//! the context's [`NativeChannelCache`](crate::cache::NativeChannelCache).
//!
//! Connection state moves `Unconnected -> Connecting -> Connected`. When the
//! transport reports a drop the channel returns to `Unconnected`, fires
//! [`ConnectionEvent::Dropped`], and keeps the native channel so that the
//! transport can reconnect it. [`Channel::has_ever_been_connected`] never goes
//! back to false, and metadata cached from the last connection stays readable.
//!
//! Every blocking call is bounded by the channel's IO timeout. Listeners for
//! asynchronous requests run exactly once, on a transport thread.
//!
//! A channel may carry a [`ValueTransform`]. Values read through the non-raw
//! methods are converted from raw, and values written through them are
//! converted back to raw before they are sent.

use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tracing::{debug, trace, warn};

use crate::{
    context::Context,
    dbr::{ControlInfo, Dbr, DbrBasicType, DbrCategory, DbrType, DbrValue},
    error::{ConnectionError, GetError, MonitorError, PutError, RequestError},
    monitor::{Monitor, MonitorKind},
    naming::{LimitKind, limit_pvs},
    pending::{Completion, Pending},
    protocol::{ErrorCondition, MonitorMask},
    records::{ChannelRecord, ChannelStatusRecord, ChannelTimeRecord, RecordError},
    transform::{Identity, ValueTransform},
    transport::{ChannelInfo, ListenerId, NativeChannel, NativeState},
    utils::{call_guarded, lock, wrapping_inplace_add},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Made,
    Dropped,
}

pub type ConnectionListener = Arc<dyn Fn(ConnectionEvent) + Send + Sync + 'static>;
/// Receives the single result of an asynchronous get
pub type GetListener<R> = Box<dyn FnOnce(Result<R, GetError>) + Send + 'static>;
/// Receives the single result of an asynchronous put
pub type PutListener = Box<dyn FnOnce(Result<(), PutError>) + Send + 'static>;

struct NativeLink {
    channel: Arc<dyn NativeChannel>,
    listener: ListenerId,
}

struct ChannelState {
    state: ConnectionState,
    ever_connected: bool,
    native: Option<NativeLink>,
    /// Metadata from the last connection
    info: Option<ChannelInfo>,
    /// Bumped whenever the native link changes, so stale callbacks are ignored
    epoch: u64,
    io_timeout: Duration,
    event_timeout: Duration,
    valid: bool,
    listeners: Vec<(ListenerId, ConnectionListener)>,
    next_listener: u64,
}

/// Listeners to call once the state lock is released
type Notification = (ConnectionEvent, Vec<ConnectionListener>);

pub struct Channel {
    name: String,
    context: Context,
    acquired: bool,
    transform: Arc<dyn ValueTransform>,
    state: Mutex<ChannelState>,
    connected: Condvar,
    this: Weak<Channel>,
}

impl Channel {
    /// Create a channel for `name`, holding a reference on `context`
    pub fn new(name: &str, context: &Context) -> Arc<Channel> {
        Self::with_transform(name, context, Arc::new(Identity))
    }

    /// As [`Channel::new`], converting values through `transform`
    pub fn with_transform(
        name: &str,
        context: &Context,
        transform: Arc<dyn ValueTransform>,
    ) -> Arc<Channel> {
        let acquired = match context.acquire() {
            Ok(()) => true,
            Err(e) => {
                warn!("Channel {name} could not start its context: {e}");
                false
            }
        };
        Arc::new_cyclic(|this| Channel {
            name: name.to_owned(),
            context: context.clone(),
            acquired,
            transform,
            state: Mutex::new(ChannelState {
                state: ConnectionState::Unconnected,
                ever_connected: false,
                native: None,
                info: None,
                epoch: 0,
                io_timeout: context.default_io_timeout(),
                event_timeout: context.default_event_timeout(),
                valid: true,
                listeners: Vec::new(),
                next_listener: 0,
            }),
            connected: Condvar::new(),
            this: this.clone(),
        })
    }

    pub fn channel_name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn value_transform(&self) -> &Arc<dyn ValueTransform> {
        &self.transform
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.state).state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn has_ever_been_connected(&self) -> bool {
        lock(&self.state).ever_connected
    }

    pub fn io_timeout(&self) -> Duration {
        lock(&self.state).io_timeout
    }
    pub fn set_io_timeout(&self, timeout: Duration) {
        lock(&self.state).io_timeout = timeout;
    }
    pub fn event_timeout(&self) -> Duration {
        lock(&self.state).event_timeout
    }
    pub fn set_event_timeout(&self, timeout: Duration) {
        lock(&self.state).event_timeout = timeout;
    }

    /// A flag for callers to mark channels whose values should not be trusted
    pub fn is_valid(&self) -> bool {
        lock(&self.state).valid
    }
    pub fn set_valid(&self, valid: bool) {
        lock(&self.state).valid = valid;
    }

    /// Register for connection changes.
    ///
    /// If the channel is already connected, `listener` is called with
    /// [`ConnectionEvent::Made`] before this returns.
    pub fn add_connection_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        let listener: ConnectionListener = Arc::new(listener);
        let (id, connected) = {
            let mut state = lock(&self.state);
            let id = ListenerId(wrapping_inplace_add(&mut state.next_listener));
            state.listeners.push((id, listener.clone()));
            (id, state.state == ConnectionState::Connected)
        };
        if connected {
            listener(ConnectionEvent::Made);
        }
        id
    }

    pub fn remove_connection_listener(&self, id: ListenerId) {
        lock(&self.state).listeners.retain(|(l, _)| *l != id);
    }

    /// Start connecting without waiting.
    ///
    /// Does nothing if connected, already connecting, or the channel has no
    /// name. If the shared native channel is already connected the connection
    /// is made before this returns.
    pub fn request_connection(&self) -> Result<(), ConnectionError> {
        if self.name.is_empty() {
            return Ok(());
        }
        let mut state = lock(&self.state);
        if state.state == ConnectionState::Connected {
            return Ok(());
        }
        let existing = state.native.as_ref().map(|link| link.channel.clone());
        let native = match existing {
            Some(native) => native,
            None => {
                self.context.ready()?;
                let native = self.context.cache().get_channel(&self.name)?;
                state.epoch += 1;
                let epoch = state.epoch;
                let this = self.this.clone();
                let listener = native.add_connection_listener(Arc::new(move |up| {
                    if let Some(channel) = this.upgrade() {
                        channel.on_native_connection(epoch, up);
                    }
                }));
                state.native = Some(NativeLink {
                    channel: native.clone(),
                    listener,
                });
                trace!("{}: attached to native channel", self.name);
                if let Err(e) = native.connect() {
                    warn!("{}: could not start connecting: {e}", self.name);
                }
                native
            }
        };
        state.state = ConnectionState::Connecting;
        if native.state() == NativeState::Connected {
            let notification = self.connection_made(&mut state);
            drop(state);
            self.notify(notification);
        }
        Ok(())
    }

    fn try_connect_and_wait(&self, timeout: Duration) -> Result<bool, ConnectionError> {
        self.request_connection()?;
        if let Err(e) = self.context.flush_io() {
            debug!("{}: flush failed: {e}", self.name);
        }
        let state = lock(&self.state);
        let (state, _) = self
            .connected
            .wait_timeout_while(state, timeout, |s| s.state != ConnectionState::Connected)
            .unwrap_or_else(PoisonError::into_inner);
        Ok(state.state == ConnectionState::Connected)
    }

    /// Connect, blocking for at most `timeout`. Returns whether connected.
    pub fn connect_and_wait(&self, timeout: Duration) -> bool {
        match self.try_connect_and_wait(timeout) {
            Ok(connected) => connected,
            Err(e) => {
                debug!("{}: cannot connect: {e}", self.name);
                false
            }
        }
    }

    /// Connect with the IO timeout if needed
    pub fn check_connection(&self) -> Result<(), ConnectionError> {
        if self.is_connected() || self.try_connect_and_wait(self.io_timeout())? {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected(self.name.clone()))
        }
    }

    /// Let go of the native channel. Connection listeners see
    /// [`ConnectionEvent::Dropped`] if the channel was connected.
    pub fn disconnect(&self) {
        let mut state = lock(&self.state);
        let Some(link) = state.native.take() else {
            return;
        };
        link.channel.remove_connection_listener(link.listener);
        state.epoch += 1;
        let was_connected = state.state == ConnectionState::Connected;
        state.state = ConnectionState::Unconnected;
        let notification = was_connected
            .then(|| (ConnectionEvent::Dropped, Self::listeners(&state)));
        drop(state);
        debug!("{}: disconnected", self.name);
        self.context.cache().release(&self.name);
        self.notify(notification);
    }

    fn listeners(state: &ChannelState) -> Vec<ConnectionListener> {
        state.listeners.iter().map(|(_, l)| l.clone()).collect()
    }

    fn on_native_connection(&self, epoch: u64, up: bool) {
        let mut state = lock(&self.state);
        if state.epoch != epoch || state.native.is_none() {
            trace!("{}: ignoring stale connection callback", self.name);
            return;
        }
        let notification = if up {
            self.connection_made(&mut state)
        } else {
            Self::connection_dropped(&self.name, &mut state)
        };
        drop(state);
        self.notify(notification);
    }

    fn connection_made(&self, state: &mut MutexGuard<'_, ChannelState>) -> Option<Notification> {
        if state.state == ConnectionState::Connected {
            return None;
        }
        let info = state.native.as_ref().and_then(|n| n.channel.info());
        if info.is_some() {
            state.info = info;
        }
        state.state = ConnectionState::Connected;
        state.ever_connected = true;
        self.connected.notify_all();
        debug!("{}: connected", self.name);
        Some((ConnectionEvent::Made, Self::listeners(state)))
    }

    fn connection_dropped(name: &str, state: &mut ChannelState) -> Option<Notification> {
        if state.state != ConnectionState::Connected {
            state.state = ConnectionState::Unconnected;
            return None;
        }
        state.state = ConnectionState::Unconnected;
        debug!("{name}: connection dropped");
        Some((ConnectionEvent::Dropped, Self::listeners(state)))
    }

    fn notify(&self, notification: Option<Notification>) {
        if let Some((event, listeners)) = notification {
            for listener in listeners {
                call_guarded(&self.name, || listener(event));
            }
        }
    }

    /// The native channel and metadata of a live connection
    pub(crate) fn native_link(
        &self,
    ) -> Result<(Arc<dyn NativeChannel>, ChannelInfo), ConnectionError> {
        let state = lock(&self.state);
        match (&state.native, &state.info, state.state) {
            (Some(link), Some(info), ConnectionState::Connected) => {
                Ok((link.channel.clone(), info.clone()))
            }
            _ => Err(ConnectionError::NotConnected(self.name.clone())),
        }
    }

    fn cached_info(&self) -> Result<ChannelInfo, ConnectionError> {
        let state = lock(&self.state);
        match (&state.info, state.ever_connected) {
            (Some(info), true) => Ok(info.clone()),
            _ => Err(ConnectionError::NeverConnected(self.name.clone())),
        }
    }

    fn flush(&self) {
        if let Err(e) = self.context.flush_io() {
            debug!("{}: flush failed: {e}", self.name);
        }
    }

    pub fn element_type(&self) -> Result<DbrBasicType, ConnectionError> {
        Ok(self.cached_info()?.native_type)
    }

    pub fn element_count(&self) -> Result<usize, ConnectionError> {
        Ok(self.cached_info()?.native_count)
    }

    pub fn native_type(&self) -> Result<DbrType, ConnectionError> {
        Ok(DbrType::new(self.element_type()?, DbrCategory::Basic))
    }

    pub fn read_access(&self) -> Result<bool, ConnectionError> {
        Ok(self.cached_info()?.access.can_read())
    }

    pub fn write_access(&self) -> Result<bool, ConnectionError> {
        Ok(self.cached_info()?.access.can_write())
    }

    /// Host serving the PV. Needs a live connection.
    pub fn host_name(&self) -> Result<String, ConnectionError> {
        self.check_connection()?;
        Ok(self.native_link()?.1.host_name)
    }

    pub fn operation_limit_pvs(&self) -> [String; 2] {
        limit_pvs(&self.name, LimitKind::Operation)
    }
    pub fn warning_limit_pvs(&self) -> [String; 2] {
        limit_pvs(&self.name, LimitKind::Warning)
    }
    pub fn alarm_limit_pvs(&self) -> [String; 2] {
        limit_pvs(&self.name, LimitKind::Alarm)
    }
    pub fn drive_limit_pvs(&self) -> [String; 2] {
        limit_pvs(&self.name, LimitKind::Drive)
    }

    fn adapt<R>(name: &str, result: Result<Dbr, RequestError>) -> Result<R, GetError>
    where
        R: TryFrom<Dbr, Error = RecordError>,
    {
        let dbr = result.map_err(|e| GetError::from_request(name, e))?;
        R::try_from(dbr).map_err(|source| GetError::BadRecord {
            name: name.to_owned(),
            source,
        })
    }

    fn fetch(&self, category: DbrCategory) -> Result<Dbr, GetError> {
        self.check_connection()?;
        let (native, info) = self.native_link()?;
        let handle = self.context.ready()?;
        let (completion, pending) = Completion::pending(handle);
        native.get(
            DbrType::new(info.native_type, category),
            None,
            completion.tracked(self.context.io_tracker()),
        );
        self.flush();
        pending
            .wait(self.io_timeout())
            .map_err(|e| GetError::from_request(&self.name, e))
    }

    fn fetch_record<R>(&self, category: DbrCategory) -> Result<R, GetError>
    where
        R: TryFrom<Dbr, Error = RecordError>,
    {
        let dbr = self.fetch(category)?;
        R::try_from(dbr).map_err(|source| GetError::BadRecord {
            name: self.name.clone(),
            source,
        })
    }

    pub fn get_raw_value_record(&self) -> Result<ChannelRecord, GetError> {
        self.fetch_record(DbrCategory::Basic)
    }

    pub fn get_raw_status_record(&self) -> Result<ChannelStatusRecord, GetError> {
        self.fetch_record(DbrCategory::Status)
    }

    pub fn get_raw_time_record(&self) -> Result<ChannelTimeRecord, GetError> {
        self.fetch_record(DbrCategory::Time)
    }

    fn fetch_physical<R>(&self, category: DbrCategory) -> Result<R, GetError>
    where
        R: TryFrom<Dbr, Error = RecordError>,
    {
        let dbr = self.fetch(category)?.map_value(|v| self.transform.from_raw(v));
        R::try_from(dbr).map_err(|source| GetError::BadRecord {
            name: self.name.clone(),
            source,
        })
    }

    /// The value, converted from raw by the channel's transform
    pub fn get_value_record(&self) -> Result<ChannelRecord, GetError> {
        self.fetch_physical(DbrCategory::Basic)
    }

    pub fn get_status_record(&self) -> Result<ChannelStatusRecord, GetError> {
        self.fetch_physical(DbrCategory::Status)
    }

    pub fn get_time_record(&self) -> Result<ChannelTimeRecord, GetError> {
        self.fetch_physical(DbrCategory::Time)
    }

    /// The first element of the physical value, converted to `T`
    pub fn get_value<T>(&self) -> Result<T, GetError>
    where
        T: for<'a> TryFrom<&'a DbrValue, Error = ErrorCondition>,
    {
        self.get_value_record()?
            .scalar()
            .map_err(|condition| GetError::Failed {
                name: self.name.clone(),
                condition,
            })
    }

    /// Every element of the physical value, converted to `T`
    pub fn get_array<T>(&self) -> Result<Vec<T>, GetError>
    where
        Vec<T>: for<'a> TryFrom<&'a DbrValue, Error = ErrorCondition>,
    {
        self.get_value_record()?
            .array()
            .map_err(|condition| GetError::Failed {
                name: self.name.clone(),
                condition,
            })
    }

    fn get_callback<R>(
        &self,
        category: DbrCategory,
        listener: Option<GetListener<R>>,
        transform: Option<Arc<dyn ValueTransform>>,
    ) -> Result<(), GetError>
    where
        R: TryFrom<Dbr, Error = RecordError> + 'static,
    {
        self.check_connection()?;
        let (native, info) = self.native_link()?;
        let dbr_type = DbrType::new(info.native_type, category);
        let io = self.context.io_tracker();
        match listener {
            Some(listener) => {
                let name = self.name.clone();
                let completion = Completion::callback(move |result: Result<Dbr, ErrorCondition>| {
                    let result = match &transform {
                        Some(t) => result.map(|dbr| dbr.map_value(|v| t.from_raw(v))),
                        None => result,
                    };
                    listener(Self::adapt(&name, result.map_err(RequestError::Failed)))
                });
                native.get(dbr_type, None, completion.tracked(io));
                self.flush();
                Ok(())
            }
            None => {
                native.get(dbr_type, None, Completion::callback(|_| ()).tracked(io));
                if self.context.pend_io(self.io_timeout()) {
                    Ok(())
                } else {
                    Err(GetError::Timeout {
                        name: self.name.clone(),
                    })
                }
            }
        }
    }

    /// Fetch the value, calling `listener` once with the result.
    ///
    /// Without a listener this flushes and waits for outstanding IO instead.
    pub fn get_raw_value_callback(
        &self,
        listener: Option<GetListener<ChannelRecord>>,
    ) -> Result<(), GetError> {
        self.get_callback(DbrCategory::Basic, listener, None)
    }

    /// As [`Channel::get_raw_value_callback`], with status and timestamp
    pub fn get_raw_value_time_callback(
        &self,
        listener: Option<GetListener<ChannelTimeRecord>>,
    ) -> Result<(), GetError> {
        self.get_callback(DbrCategory::Time, listener, None)
    }

    /// As [`Channel::get_raw_value_callback`], with the value converted from raw
    pub fn get_value_callback(
        &self,
        listener: Option<GetListener<ChannelRecord>>,
    ) -> Result<(), GetError> {
        self.get_callback(DbrCategory::Basic, listener, Some(self.transform.clone()))
    }

    /// As [`Channel::get_raw_value_time_callback`], with the value converted from raw
    pub fn get_value_time_callback(
        &self,
        listener: Option<GetListener<ChannelTimeRecord>>,
    ) -> Result<(), GetError> {
        self.get_callback(DbrCategory::Time, listener, Some(self.transform.clone()))
    }

    fn get_async<R>(&self, category: DbrCategory) -> Result<Pending<R>, GetError>
    where
        R: TryFrom<Dbr, Error = RecordError> + Send + 'static,
    {
        self.check_connection()?;
        let (native, info) = self.native_link()?;
        let (reply, pending) = Completion::pending(self.context.ready()?);
        let completion = Completion::callback(move |result: Result<Dbr, ErrorCondition>| {
            reply.complete(
                result.and_then(|dbr| R::try_from(dbr).map_err(|_| ErrorCondition::BadType)),
            )
        });
        native.get(
            DbrType::new(info.native_type, category),
            None,
            completion.tracked(self.context.io_tracker()),
        );
        self.flush();
        Ok(pending)
    }

    /// Issue a get and return its pending result
    pub fn get_raw_value_record_async(&self) -> Result<Pending<ChannelRecord>, GetError> {
        self.get_async(DbrCategory::Basic)
    }

    pub fn get_raw_time_record_async(&self) -> Result<Pending<ChannelTimeRecord>, GetError> {
        self.get_async(DbrCategory::Time)
    }

    /// The control record: units, precision and limits. ENUM channels have none.
    pub fn control_info(&self) -> Result<ControlInfo, GetError> {
        self.check_connection()?;
        if self.element_type()? == DbrBasicType::Enum {
            return Err(GetError::NoControlRecord(self.name.clone()));
        }
        match self.fetch(DbrCategory::Control) {
            Ok(dbr) => dbr.control_info().cloned().ok_or(GetError::BadRecord {
                name: self.name.clone(),
                source: RecordError::MissingControlInfo,
            }),
            Err(GetError::Failed {
                condition: ErrorCondition::BadType,
                ..
            }) => Err(GetError::NoControlRecord(self.name.clone())),
            Err(e) => Err(e),
        }
    }

    pub fn units(&self) -> Result<String, GetError> {
        Ok(self.control_info()?.units)
    }
    pub fn precision(&self) -> Result<i16, GetError> {
        Ok(self.control_info()?.precision)
    }

    /// A raw (lower, upper) limit pair in physical units
    fn physical_limits(&self, (lower, upper): (f64, f64)) -> Result<(f64, f64), GetError> {
        let limits = self.transform.from_raw(DbrValue::Double(vec![lower, upper]));
        match Vec::<f64>::try_from(&limits).as_deref() {
            Ok(&[lower, upper]) => Ok((lower, upper)),
            _ => Err(GetError::Failed {
                name: self.name.clone(),
                condition: ErrorCondition::NoConvert,
            }),
        }
    }

    /// (lower, upper) display limits, in physical units
    pub fn display_limits(&self) -> Result<(f64, f64), GetError> {
        self.physical_limits(self.control_info()?.display_limits)
    }
    pub fn alarm_limits(&self) -> Result<(f64, f64), GetError> {
        self.physical_limits(self.control_info()?.alarm_limits)
    }
    pub fn warning_limits(&self) -> Result<(f64, f64), GetError> {
        self.physical_limits(self.control_info()?.warning_limits)
    }
    pub fn control_limits(&self) -> Result<(f64, f64), GetError> {
        self.physical_limits(self.control_info()?.control_limits)
    }

    fn writable_link(&self) -> Result<Arc<dyn NativeChannel>, PutError> {
        self.check_connection()?;
        let (native, info) = self.native_link()?;
        if !info.access.can_write() {
            return Err(PutError::NoWriteAccess(self.name.clone()));
        }
        Ok(native)
    }

    /// Write a value.
    ///
    /// With a listener, it is called once when the write completes. Without
    /// one, this flushes and blocks until the write completes or the IO
    /// timeout passes.
    pub fn put_raw_val_callback<V>(
        &self,
        value: V,
        listener: Option<PutListener>,
    ) -> Result<(), PutError>
    where
        V: Into<DbrValue>,
    {
        let native = self.writable_link()?;
        let io = self.context.io_tracker();
        match listener {
            Some(listener) => {
                let name = self.name.clone();
                let completion = Completion::callback(move |result: Result<(), ErrorCondition>| {
                    listener(
                        result.map_err(|c| PutError::from_request(&name, RequestError::Failed(c))),
                    )
                });
                native.put(value.into(), completion.tracked(io));
                self.flush();
                Ok(())
            }
            None => {
                let (completion, pending) = Completion::pending(self.context.ready()?);
                native.put(value.into(), completion.tracked(io));
                self.flush();
                pending
                    .wait(self.io_timeout())
                    .map_err(|e| PutError::from_request(&self.name, e))
            }
        }
    }

    /// As [`Channel::put_raw_val_callback`], converting `value` to raw first
    pub fn put_val_callback<V>(&self, value: V, listener: Option<PutListener>) -> Result<(), PutError>
    where
        V: Into<DbrValue>,
    {
        self.put_raw_val_callback(self.transform.to_raw(value.into()), listener)
    }

    /// Write a physical value and wait for it to complete
    pub fn put_val<V: Into<DbrValue>>(&self, value: V) -> Result<(), PutError> {
        self.put_val_callback(value, None)
    }

    /// Issue a write of a physical value and return its pending completion
    pub fn put_val_async<V: Into<DbrValue>>(&self, value: V) -> Result<Pending<()>, PutError> {
        let native = self.writable_link()?;
        let (completion, pending) = Completion::pending(self.context.ready()?);
        native.put(
            self.transform.to_raw(value.into()),
            completion.tracked(self.context.io_tracker()),
        );
        self.flush();
        Ok(pending)
    }

    /// Monitor the value
    pub fn add_monitor_value<S>(&self, sink: S, mask: MonitorMask) -> Result<Monitor, MonitorError>
    where
        S: Fn(ChannelRecord) + Send + Sync + 'static,
    {
        self.check_connection()?;
        Monitor::begin(self, MonitorKind::Value, mask, sink)
    }

    /// Monitor the value with its alarm status
    pub fn add_monitor_val_status<S>(
        &self,
        sink: S,
        mask: MonitorMask,
    ) -> Result<Monitor, MonitorError>
    where
        S: Fn(ChannelStatusRecord) + Send + Sync + 'static,
    {
        self.check_connection()?;
        Monitor::begin(self, MonitorKind::ValueStatus, mask, sink)
    }

    /// Monitor the value with its alarm status and timestamp
    pub fn add_monitor_val_time<S>(
        &self,
        sink: S,
        mask: MonitorMask,
    ) -> Result<Monitor, MonitorError>
    where
        S: Fn(ChannelTimeRecord) + Send + Sync + 'static,
    {
        self.check_connection()?;
        Monitor::begin(self, MonitorKind::ValueTime, mask, sink)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.disconnect();
        if self.acquired {
            self.context.release();
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("state", &self.connection_state())
            .field("ever_connected", &self.has_ever_been_connected())
            .field("transform", &self.transform)
            .finish()
    }
}
