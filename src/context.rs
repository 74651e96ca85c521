//! The transport context shared by every channel of an application.
//!
//! A [`Context`] owns the selected [`Transport`], the runtime it is serviced
//! on, the [`NativeChannelCache`], and the count of outstanding requests used
//! by [`Context::pend_io`]. Holders announce themselves with
//! [`Context::acquire`] and leave with [`Context::release`]; the first holder
//! starts the transport and the last one shuts it down.

use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, warn};

use crate::{
    cache::NativeChannelCache,
    error::{ConnectionError, ContextError},
    pending::{Completion, IoTracker, mark_transport_thread, on_transport_thread},
    transport::{Stranded, Transport, select_transport},
    utils::{
        get_default_event_timeout, get_default_io_timeout, get_default_transport,
        get_default_transport_threads, lock,
    },
};

/// Settings for a [`Context`]
#[derive(Debug, Clone, PartialEq)]
pub struct ContextConfig {
    transport: String,
    io_timeout: Duration,
    event_timeout: Duration,
    worker_threads: usize,
}

impl ContextConfig {
    /// Defaults, overridden by the `PVLINK_*` environment variables
    pub fn from_env() -> Self {
        ContextConfig {
            transport: get_default_transport(),
            io_timeout: Duration::from_secs_f32(get_default_io_timeout()),
            event_timeout: Duration::from_secs_f32(get_default_event_timeout()),
            worker_threads: get_default_transport_threads(),
        }
    }

    /// Name of the transport to bind. Unknown names fall back to the default.
    pub fn transport(mut self, name: &str) -> Self {
        self.transport = name.to_owned();
        self
    }
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }
    pub fn event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[derive(Default)]
struct Lifecycle {
    refs: usize,
    debug: bool,
    runtime: Option<Runtime>,
}

struct ContextInner {
    config: ContextConfig,
    transport: Arc<dyn Transport>,
    cache: NativeChannelCache,
    io: Arc<IoTracker>,
    lifecycle: Mutex<Lifecycle>,
}

impl ContextInner {
    /// Build the runtime and start the transport, unless in debug mode
    fn start(&self, lifecycle: &mut Lifecycle) -> Result<(), ContextError> {
        if lifecycle.debug {
            return Ok(());
        }
        let runtime = match lifecycle.runtime.take() {
            Some(runtime) => runtime,
            None => tokio::runtime::Builder::new_multi_thread()
                .worker_threads(self.config.worker_threads)
                .thread_name("pvlink-transport")
                .on_thread_start(mark_transport_thread)
                .enable_all()
                .build()?,
        };
        let started = self.transport.initialize(runtime.handle());
        lifecycle.runtime = Some(runtime);
        started?;
        debug!("Context started on transport '{}'", self.transport.name());
        Ok(())
    }

    /// Shut the transport down. Stranded requests are handed back so that
    /// their callbacks can run once the lifecycle lock is released.
    fn stop(&self, lifecycle: &mut Lifecycle) -> Stopped {
        let stranded = self.transport.shutdown();
        self.cache.clear();
        debug!("Context stopped");
        Stopped {
            stranded,
            runtime: lifecycle.runtime.take(),
        }
    }
}

/// What is left to tear down after [`ContextInner::stop`]
struct Stopped {
    stranded: Stranded,
    runtime: Option<Runtime>,
}

impl Stopped {
    fn finish(self) {
        let Stopped { stranded, runtime } = self;
        if !stranded.is_empty() {
            debug!("Failing {} stranded requests", stranded.len());
        }
        drop(stranded);
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let stopped = self.stop(&mut lock(&self.lifecycle));
        stopped.finish();
    }
}

/// Cheaply cloneable handle to one transport context
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(config: ContextConfig) -> Self {
        let transport = select_transport(&config.transport);
        Self::with_transport(transport, config)
    }

    pub fn from_env() -> Self {
        Self::new(ContextConfig::from_env())
    }

    /// Use an already constructed transport
    pub fn with_transport(transport: Arc<dyn Transport>, config: ContextConfig) -> Self {
        info!("Creating context on transport '{}'", transport.name());
        Context {
            inner: Arc::new(ContextInner {
                cache: NativeChannelCache::new(transport.clone()),
                config,
                transport,
                io: IoTracker::new(),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// Start the transport if needed and check it answers a round trip
    pub fn init(&self) -> bool {
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if lifecycle.debug {
                return false;
            }
            if !self.inner.transport.is_initialized()
                && let Err(e) = self.inner.start(&mut lifecycle)
            {
                warn!("Could not initialize context: {e}");
                return false;
            }
        }
        let Some(handle) = self.handle() else {
            return false;
        };
        let (completion, pending) = Completion::pending(handle);
        self.inner.transport.echo(completion);
        if self.inner.transport.flush_io().is_err() {
            return false;
        }
        match pending.wait(self.inner.config.io_timeout) {
            Ok(()) => true,
            Err(e) => {
                warn!("Context echo failed: {e}");
                false
            }
        }
    }

    /// Register a holder. The first holder starts the transport.
    pub fn acquire(&self) -> Result<(), ContextError> {
        let mut lifecycle = lock(&self.inner.lifecycle);
        lifecycle.refs += 1;
        if lifecycle.refs == 1 || !self.inner.transport.is_initialized() {
            if let Err(e) = self.inner.start(&mut lifecycle) {
                lifecycle.refs -= 1;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop a holder. The last holder shuts the transport down.
    pub fn release(&self) {
        let stopped = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            match lifecycle.refs {
                0 => {
                    warn!("Context released more times than acquired");
                    None
                }
                1 => {
                    lifecycle.refs = 0;
                    Some(self.inner.stop(&mut lifecycle))
                }
                _ => {
                    lifecycle.refs -= 1;
                    None
                }
            }
        };
        // Stranded callbacks may call back into the context
        if let Some(stopped) = stopped {
            stopped.finish();
        }
    }

    pub fn ref_count(&self) -> usize {
        lock(&self.inner.lifecycle).refs
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.transport.is_initialized()
    }

    /// Send every queued request now
    pub fn flush_io(&self) -> Result<(), ContextError> {
        if !self.inner.transport.is_initialized() {
            return Err(ContextError::NotInitialized);
        }
        Ok(self.inner.transport.flush_io()?)
    }

    /// Flush, then wait until every issued get and put has completed.
    ///
    /// Returns false if `timeout` passes first, or if called from a transport
    /// thread, where waiting would stall delivery.
    pub fn pend_io(&self, timeout: Duration) -> bool {
        if let Err(e) = self.flush_io() {
            warn!("pend_io could not flush: {e}");
            return false;
        }
        if on_transport_thread() {
            warn!("pend_io called from a transport thread");
            return false;
        }
        self.inner.io.wait_idle(timeout)
    }

    /// Flush, then give the transport `timeout` to deliver events
    pub fn pend_event(&self, timeout: Duration) {
        if let Err(e) = self.flush_io() {
            debug!("pend_event could not flush: {e}");
        }
        if !on_transport_thread() {
            std::thread::sleep(timeout);
        }
    }

    /// In debug mode the transport is never started. Leaving debug mode while
    /// the context is held starts it.
    pub fn set_debug_mode(&self, debug: bool) -> Result<(), ContextError> {
        let mut lifecycle = lock(&self.inner.lifecycle);
        lifecycle.debug = debug;
        if !debug && lifecycle.refs > 0 && !self.inner.transport.is_initialized() {
            info!("Leaving debug mode, starting transport");
            self.inner.start(&mut lifecycle)?;
        }
        Ok(())
    }

    pub fn is_debug_mode(&self) -> bool {
        lock(&self.inner.lifecycle).debug
    }

    pub fn default_io_timeout(&self) -> Duration {
        self.inner.config.io_timeout
    }

    pub fn default_event_timeout(&self) -> Duration {
        self.inner.config.event_timeout
    }

    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    pub fn cache(&self) -> &NativeChannelCache {
        &self.inner.cache
    }

    pub(crate) fn handle(&self) -> Option<Handle> {
        lock(&self.inner.lifecycle)
            .runtime
            .as_ref()
            .map(|r| r.handle().clone())
    }

    pub(crate) fn io_tracker(&self) -> &Arc<IoTracker> {
        &self.inner.io
    }

    /// The runtime handle, if the transport is running and usable
    pub(crate) fn ready(&self) -> Result<Handle, ConnectionError> {
        if self.is_debug_mode() || !self.is_initialized() {
            return Err(ConnectionError::NotInitialized);
        }
        self.handle().ok_or(ConnectionError::NotInitialized)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("transport", &self.transport_name())
            .field("refs", &self.ref_count())
            .field("initialized", &self.is_initialized())
            .field("debug", &self.is_debug_mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InprocBus, InprocTransport};

    fn context() -> Context {
        Context::with_transport(
            Arc::new(InprocTransport::new(InprocBus::new())),
            ContextConfig::from_env().io_timeout(Duration::from_secs(2)),
        )
    }

    #[test]
    fn acquire_and_release() {
        let context = context();
        assert!(!context.is_initialized());
        context.acquire().unwrap();
        context.acquire().unwrap();
        assert!(context.is_initialized());
        assert!(context.init());
        context.release();
        assert!(context.is_initialized());
        context.release();
        assert!(!context.is_initialized());
        assert_eq!(context.ref_count(), 0);
        assert!(matches!(context.flush_io(), Err(ContextError::NotInitialized)));
        // Starting again after a full release works
        context.acquire().unwrap();
        assert!(context.init());
        context.release();
    }

    #[test]
    fn debug_mode_suppresses_start() {
        let context = context();
        context.set_debug_mode(true).unwrap();
        context.acquire().unwrap();
        assert!(!context.is_initialized());
        assert!(!context.init());
        assert_eq!(context.ready().err(), Some(ConnectionError::NotInitialized));
        context.set_debug_mode(false).unwrap();
        assert!(context.is_initialized());
        assert!(context.ready().is_ok());
        context.release();
    }

    #[test]
    fn pend_io_with_nothing_outstanding() {
        let context = context();
        context.acquire().unwrap();
        assert!(context.pend_io(Duration::from_millis(50)));
        context.pend_event(Duration::from_millis(1));
        context.release();
    }

    #[test]
    fn stranded_callbacks_may_reenter_the_context() {
        use crate::dbr::{DbrBasicType, DbrCategory, DbrType};
        use std::{sync::mpsc, thread};

        let context = context();
        context.acquire().unwrap();
        let native = context.cache().get_channel("Nowhere:PV").unwrap();
        let (tx, rx) = mpsc::channel();
        let reentrant = context.clone();
        // Queued but never flushed, so only shutdown resolves it
        native.get(
            DbrType::new(DbrBasicType::Double, DbrCategory::Basic),
            None,
            Completion::callback(move |result| {
                let _ = tx.send((result.err(), reentrant.ref_count()));
            }),
        );

        let releaser = {
            let context = context.clone();
            thread::spawn(move || context.release())
        };
        let (error, refs) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(error, Some(crate::protocol::ErrorCondition::Disconn));
        assert_eq!(refs, 0);
        releaser.join().unwrap();
        assert!(!context.is_initialized());
    }

    #[test]
    fn config_builder() {
        let config = ContextConfig::from_env()
            .transport("inproc")
            .event_timeout(Duration::from_millis(5))
            .worker_threads(0);
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.event_timeout, Duration::from_millis(5));
        assert_eq!(Context::new(config).transport_name(), "inproc");
    }
}
