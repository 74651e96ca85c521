//! In-process transport.
//!
//! Channels find their PV on an [`InprocBus`]: a directory of attached
//! [`Provider`]s plus a beacon channel announcing servers coming and going.
//! Each [`InprocTransport`] runs one circuit task which searches for PVs with
//! exponential backoff, answers queued requests strictly in the order they
//! were flushed, and forwards provider updates to subscriptions. When a server
//! goes down its channels drop, start searching again, and have their
//! subscriptions restored once they reconnect.

use std::{
    cmp::min,
    collections::HashMap,
    fmt, future,
    pin::Pin,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::{
    runtime::Handle,
    select,
    sync::{broadcast, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, trace, warn};

use crate::{
    dbr::{Dbr, DbrType, DbrValue},
    pending::Completion,
    protocol::{Access, ErrorCondition, MonitorMask},
    providers::Provider,
    transport::{
        ChannelInfo, ConnectionCallback, EventSink, ListenerId, NativeChannel, NativeState,
        Stranded, SubscriptionId, Transport,
    },
    utils::{get_default_max_search_interval, lock, wrapping_inplace_add},
};

/// Identifies a provider attached to an [`InprocBus`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ServerId(u64);

/// Announcements sent to every transport on a bus
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Beacon {
    /// A server appeared, or has new PVs
    Up(ServerId),
    /// A server went away and its channels should drop
    Down(ServerId),
}

struct Attached {
    id: ServerId,
    host_name: String,
    provider: Arc<dyn Provider>,
}

struct BusInner {
    servers: Mutex<Vec<Attached>>,
    next_server: AtomicU64,
    beacons: broadcast::Sender<Beacon>,
}

/// Rendezvous point between in-process servers and transports
#[derive(Clone)]
pub struct InprocBus {
    inner: Arc<BusInner>,
}

impl InprocBus {
    pub fn new() -> Self {
        InprocBus {
            inner: Arc::new(BusInner {
                servers: Mutex::new(Vec::new()),
                next_server: AtomicU64::new(1),
                beacons: broadcast::Sender::new(64),
            }),
        }
    }

    /// The process-wide bus used by default
    pub fn shared() -> Self {
        static SHARED: OnceLock<InprocBus> = OnceLock::new();
        SHARED.get_or_init(InprocBus::new).clone()
    }

    /// Attach a provider. Earlier attachments win if two provide the same name.
    pub fn attach(&self, host_name: &str, provider: Arc<dyn Provider>) -> ServerId {
        let id = ServerId(self.inner.next_server.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.servers).push(Attached {
            id,
            host_name: host_name.to_owned(),
            provider,
        });
        debug!("Attached server {id:?} ({host_name}) to in-process bus");
        let _ = self.inner.beacons.send(Beacon::Up(id));
        id
    }

    /// Remove a provider. Returns false if it was not attached.
    pub fn detach(&self, id: ServerId) -> bool {
        let removed = {
            let mut servers = lock(&self.inner.servers);
            let before = servers.len();
            servers.retain(|s| s.id != id);
            before != servers.len()
        };
        if removed {
            debug!("Detached server {id:?} from in-process bus");
            let _ = self.inner.beacons.send(Beacon::Down(id));
        }
        removed
    }

    /// Tell searching transports that a server has new PVs
    pub fn announce(&self, id: ServerId) {
        let _ = self.inner.beacons.send(Beacon::Up(id));
    }

    pub fn server_count(&self) -> usize {
        lock(&self.inner.servers).len()
    }

    fn find(&self, name: &str) -> Option<(ServerId, String, Arc<dyn Provider>)> {
        let servers: Vec<_> = lock(&self.inner.servers)
            .iter()
            .map(|s| (s.id, s.host_name.clone(), s.provider.clone()))
            .collect();
        servers.into_iter().find(|(_, _, p)| p.provides(name))
    }

    fn beacons(&self) -> broadcast::Receiver<Beacon> {
        self.inner.beacons.subscribe()
    }
}

impl Default for InprocBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InprocBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InprocBus")
            .field("servers", &self.server_count())
            .finish()
    }
}

enum CircuitRequest {
    Echo(Completion<()>),
    Search(Arc<ChannelCore>),
    Clear(Arc<ChannelCore>),
    Read {
        channel: Arc<ChannelCore>,
        dbr_type: DbrType,
        count: Option<usize>,
        reply: Completion<Dbr>,
    },
    Write {
        channel: Arc<ChannelCore>,
        value: DbrValue,
        reply: Completion<()>,
    },
    Subscribe {
        channel: Arc<ChannelCore>,
        id: SubscriptionId,
        record: SubscriptionRecord,
        confirm: Completion<()>,
    },
    Unsubscribe(SubscriptionId),
}

impl CircuitRequest {
    /// Resolve whatever completion this request carries with an error
    fn fail(self, condition: ErrorCondition) {
        match self {
            CircuitRequest::Echo(reply) => reply.complete(Err(condition)),
            CircuitRequest::Read { reply, .. } => reply.complete(Err(condition)),
            CircuitRequest::Write { reply, .. } => reply.complete(Err(condition)),
            CircuitRequest::Subscribe { confirm, .. } => confirm.complete(Err(condition)),
            CircuitRequest::Search(_)
            | CircuitRequest::Clear(_)
            | CircuitRequest::Unsubscribe(_) => (),
        }
    }
}

/// Request plumbing shared by a transport and its channels
#[derive(Default)]
struct Link {
    requests: Mutex<Option<mpsc::UnboundedSender<CircuitRequest>>>,
    /// Requests waiting for the next flush
    outbound: Mutex<Vec<CircuitRequest>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Link {
    fn sender(&self) -> Option<mpsc::UnboundedSender<CircuitRequest>> {
        lock(&self.requests)
            .as_ref()
            .filter(|tx| !tx.is_closed())
            .cloned()
    }

    /// Send straight to the circuit, bypassing the flush queue
    fn send_now(&self, request: CircuitRequest) -> Result<(), ErrorCondition> {
        let Some(tx) = self.sender() else {
            request.fail(ErrorCondition::Disconn);
            return Err(ErrorCondition::Disconn);
        };
        tx.send(request).map_err(|mpsc::error::SendError(request)| {
            request.fail(ErrorCondition::Disconn);
            ErrorCondition::Disconn
        })
    }

    fn queue(&self, request: CircuitRequest) {
        lock(&self.outbound).push(request);
    }

    fn flush(&self) -> Result<(), ErrorCondition> {
        let mut failed = Vec::new();
        {
            // Hold the queue while sending so concurrent flushes cannot interleave
            let mut outbound = lock(&self.outbound);
            if outbound.is_empty() {
                return Ok(());
            }
            match self.sender() {
                None => failed.extend(outbound.drain(..)),
                Some(tx) => {
                    for request in outbound.drain(..) {
                        if let Err(mpsc::error::SendError(request)) = tx.send(request) {
                            failed.push(request);
                        }
                    }
                }
            }
        }
        if failed.is_empty() {
            return Ok(());
        }
        warn!("Flush failed, {} requests dropped", failed.len());
        for request in failed {
            request.fail(ErrorCondition::Disconn);
        }
        Err(ErrorCondition::Disconn)
    }

    fn shutdown(&self) -> Stranded {
        if let Some(cancel) = lock(&self.cancel).take() {
            cancel.cancel();
        }
        lock(&self.requests).take();
        let mut stranded = Stranded::default();
        for request in lock(&self.outbound).drain(..) {
            stranded.push(move || request.fail(ErrorCondition::Disconn));
        }
        stranded
    }
}

#[derive(Default)]
struct CoreState {
    state: NativeState,
    info: Option<ChannelInfo>,
    listeners: Vec<(ListenerId, ConnectionCallback)>,
    next_listener: u64,
}

/// Per-PV state shared between a native channel and the circuit task
struct ChannelCore {
    key: u64,
    name: String,
    state: Mutex<CoreState>,
}

impl ChannelCore {
    fn state(&self) -> NativeState {
        lock(&self.state).state
    }

    fn notify(&self, connected: bool) {
        let listeners: Vec<_> = lock(&self.state)
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(connected);
        }
    }
}

/// A channel on an [`InprocTransport`]
pub struct InprocChannel {
    core: Arc<ChannelCore>,
    link: Arc<Link>,
    next_subscription: Arc<AtomicU64>,
}

impl fmt::Debug for InprocChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InprocChannel")
            .field("name", &self.core.name)
            .field("key", &self.core.key)
            .field("state", &self.core.state())
            .finish()
    }
}

impl NativeChannel for InprocChannel {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn state(&self) -> NativeState {
        self.core.state()
    }

    fn info(&self) -> Option<ChannelInfo> {
        lock(&self.core.state).info.clone()
    }

    fn add_connection_listener(&self, listener: ConnectionCallback) -> ListenerId {
        let mut state = lock(&self.core.state);
        let id = ListenerId(wrapping_inplace_add(&mut state.next_listener));
        state.listeners.push((id, listener));
        id
    }

    fn remove_connection_listener(&self, id: ListenerId) {
        lock(&self.core.state).listeners.retain(|(l, _)| *l != id);
    }

    fn connect(&self) -> Result<(), ErrorCondition> {
        if self.core.state() == NativeState::Closed {
            return Err(ErrorCondition::ChanDestroy);
        }
        self.link.send_now(CircuitRequest::Search(self.core.clone()))
    }

    fn get(&self, dbr_type: DbrType, count: Option<usize>, reply: Completion<Dbr>) {
        self.link.queue(CircuitRequest::Read {
            channel: self.core.clone(),
            dbr_type,
            count,
            reply,
        });
    }

    fn put(&self, value: DbrValue, reply: Completion<()>) {
        self.link.queue(CircuitRequest::Write {
            channel: self.core.clone(),
            value,
            reply,
        });
    }

    fn subscribe(
        &self,
        dbr_type: DbrType,
        count: Option<usize>,
        mask: MonitorMask,
        sink: EventSink,
        confirm: Completion<()>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.link.queue(CircuitRequest::Subscribe {
            channel: self.core.clone(),
            id,
            record: SubscriptionRecord {
                channel_key: self.core.key,
                dbr_type,
                count,
                mask,
                sink,
                task: None,
            },
            confirm,
        });
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.link.send_now(CircuitRequest::Unsubscribe(id));
    }

    fn destroy(&self) {
        {
            let mut state = lock(&self.core.state);
            state.state = NativeState::Closed;
            state.listeners.clear();
        }
        let _ = self.link.send_now(CircuitRequest::Clear(self.core.clone()));
    }
}

/// Transport connecting channels to providers on an [`InprocBus`]
pub struct InprocTransport {
    bus: InprocBus,
    link: Arc<Link>,
    next_channel: AtomicU64,
    next_subscription: Arc<AtomicU64>,
    max_search_interval: Duration,
}

impl InprocTransport {
    pub fn new(bus: InprocBus) -> Self {
        InprocTransport {
            bus,
            link: Arc::new(Link::default()),
            next_channel: AtomicU64::new(0),
            next_subscription: Arc::new(AtomicU64::new(0)),
            max_search_interval: Duration::from_secs_f32(get_default_max_search_interval()),
        }
    }

    /// Cap the interval between repeated searches for a missing PV
    pub fn max_search_interval(mut self, interval: Duration) -> Self {
        self.max_search_interval = interval;
        self
    }

    pub fn bus(&self) -> &InprocBus {
        &self.bus
    }
}

impl fmt::Debug for InprocTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InprocTransport")
            .field("bus", &self.bus)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Transport for InprocTransport {
    fn name(&self) -> &str {
        super::DEFAULT_TRANSPORT
    }

    fn initialize(&self, runtime: &Handle) -> Result<(), ErrorCondition> {
        let mut requests = lock(&self.link.requests);
        if let Some(tx) = requests.as_ref()
            && !tx.is_closed()
        {
            return Ok(());
        }
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        // Work out what to call ourselves
        let client_user_name = whoami::username();
        let client_host_name = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".into());

        let internal = CircuitInternal {
            bus: self.bus.clone(),
            requests_rx,
            beacons: self.bus.beacons(),
            cancel: cancel.clone(),
            max_search_interval: self.max_search_interval,
            client_user_name,
            client_host_name,
            searches: Default::default(),
            connections: Default::default(),
            subscriptions: Default::default(),
        };
        runtime.spawn(internal.circuit_lifecycle());
        *requests = Some(requests_tx);
        *lock(&self.link.cancel) = Some(cancel);
        debug!("In-process transport initialized");
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.link.sender().is_some()
    }

    fn create_channel(&self, name: &str) -> Result<Arc<dyn NativeChannel>, ErrorCondition> {
        if name.is_empty() {
            return Err(ErrorCondition::BadStr);
        }
        let key = self.next_channel.fetch_add(1, Ordering::Relaxed);
        trace!("Creating native channel {key} for '{name}'");
        Ok(Arc::new(InprocChannel {
            core: Arc::new(ChannelCore {
                key,
                name: name.to_owned(),
                state: Mutex::new(CoreState::default()),
            }),
            link: self.link.clone(),
            next_subscription: self.next_subscription.clone(),
        }))
    }

    fn flush_io(&self) -> Result<(), ErrorCondition> {
        self.link.flush()
    }

    fn echo(&self, reply: Completion<()>) {
        self.link.queue(CircuitRequest::Echo(reply));
    }

    fn shutdown(&self) -> Stranded {
        debug!("Shutting down in-process transport");
        self.link.shutdown()
    }
}

impl Drop for InprocTransport {
    fn drop(&mut self) {
        drop(self.link.shutdown());
    }
}

#[derive(Debug)]
struct SearchAttempt {
    channel: Arc<ChannelCore>,
    attempts: u32,
    next_search_at: Instant,
}

impl SearchAttempt {
    fn new(channel: Arc<ChannelCore>, max_interval: Duration) -> Self {
        let mut attempt = SearchAttempt {
            channel,
            attempts: 0,
            next_search_at: Instant::now(),
        };
        attempt.schedule_retry(max_interval);
        attempt
    }

    /// Push the next search out, doubling the wait each time up to the cap
    fn schedule_retry(&mut self, max_interval: Duration) {
        let backoff = Duration::from_millis(32 * 2u64.pow(min(self.attempts, 11)));
        self.attempts += 1;
        self.next_search_at = Instant::now() + backoff.min(max_interval);
    }
}

impl fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelCore({}, '{}')", self.key, self.name)
    }
}

struct Connection {
    channel: Arc<ChannelCore>,
    server: ServerId,
    provider: Arc<dyn Provider>,
    access: Access,
}

struct SubscriptionRecord {
    channel_key: u64,
    dbr_type: DbrType,
    count: Option<usize>,
    mask: MonitorMask,
    sink: EventSink,
    /// Present while updates are being forwarded
    task: Option<CancellationToken>,
}

/// Inner circuit state, owned by the circuit task
struct CircuitInternal {
    bus: InprocBus,
    requests_rx: mpsc::UnboundedReceiver<CircuitRequest>,
    beacons: broadcast::Receiver<Beacon>,
    cancel: CancellationToken,
    max_search_interval: Duration,
    client_user_name: String,
    client_host_name: String,
    searches: HashMap<u64, SearchAttempt>,
    connections: HashMap<u64, Connection>,
    subscriptions: HashMap<SubscriptionId, SubscriptionRecord>,
}

impl CircuitInternal {
    async fn circuit_lifecycle(mut self) {
        debug!("Started in-process circuit");
        loop {
            let next_attempt = self.next_attempt();
            select! {
                _ = self.cancel.cancelled() => break,
                request = self.requests_rx.recv() => match request {
                    None => break,
                    Some(request) => self.handle_request(request),
                },
                beacon = self.beacons.recv() => match beacon {
                    Ok(beacon) => self.handle_beacon(beacon),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {n} beacons, retrying every search");
                        self.retry_all_searches();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("Beacon channel closed, stopping circuit");
                        break;
                    }
                },
                _ = next_attempt => self.handle_search_retries(),
            }
        }
        self.cancel.cancel();
        for record in self.subscriptions.values_mut() {
            if let Some(task) = record.task.take() {
                task.cancel();
            }
        }
        for (_, connection) in self.connections.drain() {
            let mut state = lock(&connection.channel.state);
            if state.state == NativeState::Connected {
                state.state = NativeState::Disconnected;
            }
        }
        self.requests_rx.close();
        while let Ok(request) = self.requests_rx.try_recv() {
            request.fail(ErrorCondition::Disconn);
        }
        debug!("In-process circuit stopped");
    }

    /// Wait until it's time for the next search retry
    fn next_attempt(&self) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        match self.searches.values().map(|s| s.next_search_at).min() {
            None => Box::pin(future::pending()),
            Some(instant) => {
                if instant < Instant::now() {
                    Box::pin(future::ready(()))
                } else {
                    Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(
                        instant,
                    )))
                }
            }
        }
    }

    fn handle_request(&mut self, request: CircuitRequest) {
        match request {
            CircuitRequest::Echo(reply) => reply.complete(Ok(())),
            CircuitRequest::Search(channel) => self.start_search(channel),
            CircuitRequest::Clear(channel) => self.clear_channel(channel.key),
            CircuitRequest::Read {
                channel,
                dbr_type,
                count,
                reply,
            } => {
                let _span = debug_span!("read", channel = %channel.name).entered();
                let result = self.read(&channel, dbr_type, count);
                if let Err(e) = &result {
                    debug!("Read failed: {e}");
                }
                reply.complete(result);
            }
            CircuitRequest::Write {
                channel,
                value,
                reply,
            } => {
                let _span = debug_span!("write", channel = %channel.name).entered();
                let result = self.write(&channel, value);
                if let Err(e) = &result {
                    debug!("Write failed: {e}");
                }
                reply.complete(result);
            }
            CircuitRequest::Subscribe {
                channel,
                id,
                record,
                confirm,
            } => {
                let _span = debug_span!("subscribe", channel = %channel.name).entered();
                let result = self.subscribe(&channel, id, record);
                if let Err(e) = &result {
                    debug!("Subscription {id:?} rejected: {e}");
                }
                confirm.complete(result);
            }
            CircuitRequest::Unsubscribe(id) => {
                if let Some(record) = self.subscriptions.remove(&id) {
                    trace!("Removing subscription {id:?}");
                    if let Some(task) = record.task {
                        task.cancel();
                    }
                }
            }
        }
    }

    fn read(
        &self,
        channel: &ChannelCore,
        dbr_type: DbrType,
        count: Option<usize>,
    ) -> Result<Dbr, ErrorCondition> {
        let connection = self
            .connections
            .get(&channel.key)
            .ok_or(ErrorCondition::Disconn)?;
        if !connection.access.can_read() {
            return Err(ErrorCondition::NoRdAccess);
        }
        let mut dbr = connection
            .provider
            .read_value(&channel.name, Some(dbr_type))?
            .convert_to(dbr_type)?;
        if let Some(count) = count {
            dbr.truncate(count);
        }
        trace!("Read {dbr:?}");
        Ok(dbr)
    }

    fn write(&self, channel: &ChannelCore, value: DbrValue) -> Result<(), ErrorCondition> {
        let connection = self
            .connections
            .get(&channel.key)
            .ok_or(ErrorCondition::Disconn)?;
        if !connection.access.can_write() {
            return Err(ErrorCondition::NoWtAccess);
        }
        trace!("Writing {value:?}");
        connection.provider.write_value(&channel.name, value)
    }

    fn subscribe(
        &mut self,
        channel: &ChannelCore,
        id: SubscriptionId,
        mut record: SubscriptionRecord,
    ) -> Result<(), ErrorCondition> {
        if record.mask.is_empty() {
            return Err(ErrorCondition::BadMask);
        }
        let connection = self
            .connections
            .get(&channel.key)
            .ok_or(ErrorCondition::Disconn)?;
        if !connection.access.can_read() {
            return Err(ErrorCondition::NoRdAccess);
        }
        // Reject types the PV can never be delivered as
        connection
            .provider
            .read_value(&channel.name, Some(record.dbr_type))?
            .convert_to(record.dbr_type)?;
        start_delivery(
            &self.cancel,
            &connection.provider,
            &channel.name,
            &mut record,
        )?;
        debug!("Started subscription {id:?} with mask {:?}", record.mask);
        self.subscriptions.insert(id, record);
        Ok(())
    }

    fn handle_beacon(&mut self, beacon: Beacon) {
        match beacon {
            Beacon::Up(server) => {
                trace!("Observed beacon from {server:?}");
                self.retry_all_searches();
            }
            Beacon::Down(server) => {
                let dropped: Vec<u64> = self
                    .connections
                    .iter()
                    .filter(|(_, c)| c.server == server)
                    .map(|(k, _)| *k)
                    .collect();
                for key in dropped {
                    let Some(connection) = self.connections.remove(&key) else {
                        continue;
                    };
                    self.stop_deliveries(key);
                    {
                        let mut state = lock(&connection.channel.state);
                        if state.state == NativeState::Connected {
                            state.state = NativeState::Disconnected;
                        }
                    }
                    debug!(
                        "Server {server:?} went away, dropped '{}'",
                        connection.channel.name
                    );
                    connection.channel.notify(false);
                    self.start_search(connection.channel);
                }
            }
        }
    }

    fn start_search(&mut self, channel: Arc<ChannelCore>) {
        if self.connections.contains_key(&channel.key)
            || self.searches.contains_key(&channel.key)
            || channel.state() == NativeState::Closed
        {
            return;
        }
        if let Some(found) = self.bus.find(&channel.name)
            && self.connect_channel(&channel, found)
        {
            return;
        }
        debug!("No server has '{}' yet, searching", channel.name);
        self.searches.insert(
            channel.key,
            SearchAttempt::new(channel, self.max_search_interval),
        );
    }

    fn handle_search_retries(&mut self) {
        let now = Instant::now();
        let due: Vec<u64> = self
            .searches
            .iter()
            .filter(|(_, s)| s.next_search_at <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in due {
            self.retry_search(key);
        }
    }

    fn retry_all_searches(&mut self) {
        let keys: Vec<u64> = self.searches.keys().copied().collect();
        for key in keys {
            if let Some(search) = self.searches.get_mut(&key) {
                search.attempts = 0;
            }
            self.retry_search(key);
        }
    }

    fn retry_search(&mut self, key: u64) {
        let Some(channel) = self.searches.get(&key).map(|s| s.channel.clone()) else {
            return;
        };
        if channel.state() == NativeState::Closed {
            self.searches.remove(&key);
            return;
        }
        if let Some(found) = self.bus.find(&channel.name)
            && self.connect_channel(&channel, found)
        {
            self.searches.remove(&key);
            return;
        }
        if let Some(search) = self.searches.get_mut(&key) {
            trace!(
                "Search attempt {} for '{}' found nothing",
                search.attempts, channel.name
            );
            search.schedule_retry(self.max_search_interval);
        }
    }

    /// Bind a channel to the server that claims it. Returns false if the server
    /// could not actually produce the PV.
    fn connect_channel(
        &mut self,
        channel: &Arc<ChannelCore>,
        (server, host_name, provider): (ServerId, String, Arc<dyn Provider>),
    ) -> bool {
        let _span = debug_span!("connect", channel = %channel.name).entered();
        let native = match provider.read_value(&channel.name, None) {
            Ok(native) => native,
            Err(e) => {
                warn!("Server {server:?} claims '{}' but cannot read it: {e}", channel.name);
                return false;
            }
        };
        let access = provider.get_access_right(
            &channel.name,
            Some(&self.client_user_name),
            Some(&self.client_host_name),
        );
        let info = ChannelInfo {
            native_type: native.value().get_type(),
            native_count: native.value().get_count(),
            access,
            host_name,
        };
        {
            let mut state = lock(&channel.state);
            if state.state == NativeState::Closed {
                return true;
            }
            state.state = NativeState::Connected;
            state.info = Some(info);
        }
        // Restore any subscriptions that were running before a disconnect
        for record in self
            .subscriptions
            .values_mut()
            .filter(|r| r.channel_key == channel.key && r.task.is_none())
        {
            if let Err(e) = start_delivery(&self.cancel, &provider, &channel.name, record) {
                warn!("Could not restore subscription on '{}': {e}", channel.name);
            }
        }
        self.connections.insert(
            channel.key,
            Connection {
                channel: channel.clone(),
                server,
                provider,
                access,
            },
        );
        debug!("Connected to server {server:?}");
        channel.notify(true);
        true
    }

    fn stop_deliveries(&mut self, channel_key: u64) {
        for record in self
            .subscriptions
            .values_mut()
            .filter(|r| r.channel_key == channel_key)
        {
            if let Some(task) = record.task.take() {
                task.cancel();
            }
        }
    }

    fn clear_channel(&mut self, channel_key: u64) {
        trace!("Clearing native channel {channel_key}");
        self.searches.remove(&channel_key);
        self.connections.remove(&channel_key);
        self.stop_deliveries(channel_key);
        self.subscriptions
            .retain(|_, r| r.channel_key != channel_key);
    }
}

/// Spawn the task forwarding provider updates into a subscription's sink.
///
/// The current value is delivered first, then every event whose mask
/// intersects the subscription's.
fn start_delivery(
    cancel: &CancellationToken,
    provider: &Arc<dyn Provider>,
    name: &str,
    record: &mut SubscriptionRecord,
) -> Result<(), ErrorCondition> {
    let mut events = provider.monitor_value(name, record.mask)?;
    let initial = provider
        .read_value(name, Some(record.dbr_type))
        .and_then(|d| d.convert_to(record.dbr_type));
    let token = cancel.child_token();
    record.task = Some(token.clone());

    let (dbr_type, count, mask, sink) = (
        record.dbr_type,
        record.count,
        record.mask,
        record.sink.clone(),
    );
    let name = name.to_owned();
    tokio::spawn(async move {
        let deliver = |mut dbr: Dbr| {
            if let Some(count) = count {
                dbr.truncate(count);
            }
            sink(dbr);
        };
        match initial {
            Ok(dbr) => deliver(dbr),
            Err(e) => warn!("Could not read initial value of '{name}': {e}"),
        }
        loop {
            select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        if !event.mask.intersects(mask) {
                            continue;
                        }
                        match event.record.convert_to(dbr_type) {
                            Ok(dbr) => deliver(dbr),
                            Err(e) => warn!("Could not convert update of '{name}': {e}"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Subscription to '{name}' lagged, {n} updates dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        trace!("Delivery for '{name}' finished");
    });
    Ok(())
}
