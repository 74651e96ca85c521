//! Exactly-once completion of in-flight requests.
//!
//! Every get, put and subscribe hands the transport a [`Completion`]. The
//! transport resolves it exactly once, either into a caller-supplied callback
//! or into a [`Pending`] that the caller awaits or waits on. A completion that
//! is dropped unresolved (e.g. because the transport shut down) resolves with
//! [`ErrorCondition::ChanDestroy`], so no waiter is ever left hanging.
//! Callbacks that panic are logged and never unwind into the transport.

use std::{
    cell::Cell,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex, PoisonError, mpsc},
    task::{Context as TaskContext, Poll},
    time::Duration,
};

use tokio::{runtime::Handle, sync::oneshot};

use crate::{
    error::RequestError,
    protocol::ErrorCondition,
    utils::{call_guarded, lock},
};

thread_local! {
    static TRANSPORT_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Mark the calling thread as one that services a transport. Used as the
/// `on_thread_start` hook of transport runtimes.
pub(crate) fn mark_transport_thread() {
    TRANSPORT_THREAD.with(|t| t.set(true));
}

/// Blocking here would stall the transport that has to wake us
pub(crate) fn on_transport_thread() -> bool {
    TRANSPORT_THREAD.with(Cell::get)
}

type Callback<T> = Box<dyn FnOnce(Result<T, ErrorCondition>) + Send + 'static>;

enum Target<T> {
    Reply(oneshot::Sender<Result<T, ErrorCondition>>),
    Callback(Callback<T>),
}

/// The transport's half of a single request
pub struct Completion<T> {
    target: Option<Target<T>>,
    _io: Option<IoGuard>,
}

impl<T> Completion<T> {
    /// Complete by calling `callback` on whichever thread resolves the request
    pub fn callback<F>(callback: F) -> Self
    where
        F: FnOnce(Result<T, ErrorCondition>) + Send + 'static,
    {
        Self {
            target: Some(Target::Callback(Box::new(callback))),
            _io: None,
        }
    }

    /// Complete into a [`Pending`] driven by `handle`
    pub fn pending(handle: Handle) -> (Self, Pending<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                target: Some(Target::Reply(tx)),
                _io: None,
            },
            Pending { rx, handle },
        )
    }

    /// Count this request as outstanding IO until it is resolved
    pub(crate) fn tracked(mut self, tracker: &Arc<IoTracker>) -> Self {
        self._io = Some(tracker.begin());
        self
    }

    pub fn complete(mut self, result: Result<T, ErrorCondition>) {
        if let Some(target) = self.target.take() {
            Self::deliver(target, result);
        }
    }

    fn deliver(target: Target<T>, result: Result<T, ErrorCondition>) {
        match target {
            Target::Reply(tx) => {
                let _ = tx.send(result);
            }
            Target::Callback(callback) => {
                call_guarded("request", move || callback(result));
            }
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            Self::deliver(target, Err(ErrorCondition::ChanDestroy));
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.target {
            Some(Target::Reply(_)) => "reply",
            Some(Target::Callback(_)) => "callback",
            None => "completed",
        };
        f.debug_struct("Completion").field("target", &kind).finish()
    }
}

/// The caller's half of a single request
///
/// Await it from async code, or call [`Pending::wait`] from a plain thread.
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, ErrorCondition>>,
    handle: Handle,
}

impl<T> Pending<T> {
    /// Block the calling thread until the request completes or `timeout` passes
    ///
    /// Any thread may block here, including `spawn_blocking` threads and the
    /// caller's own runtime threads, except the threads servicing the
    /// transport (every callback runs on one). There this fails at once with
    /// [`ErrorCondition::EvDisallow`].
    pub fn wait(self, timeout: Duration) -> Result<T, RequestError>
    where
        T: Send + 'static,
    {
        if on_transport_thread() {
            return Err(RequestError::Failed(ErrorCondition::EvDisallow));
        }
        let Pending { rx, handle } = self;
        let (tx, done) = mpsc::sync_channel(1);
        handle.spawn(async move {
            let _ = tx.send(tokio::time::timeout(timeout, rx).await);
        });
        // A runtime that has shut down drops the task, and with it `tx`
        match done.recv() {
            Err(_) | Ok(Ok(Err(_))) => Err(RequestError::Failed(ErrorCondition::ChanDestroy)),
            Ok(Err(_)) => Err(RequestError::Timeout),
            Ok(Ok(Ok(result))) => result.map_err(RequestError::Failed),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| match r {
            Err(_) => Err(RequestError::Failed(ErrorCondition::ChanDestroy)),
            Ok(result) => result.map_err(RequestError::Failed),
        })
    }
}

/// Counts requests that have been issued but not yet completed
#[derive(Debug, Default)]
pub(crate) struct IoTracker {
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl IoTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn begin(self: &Arc<Self>) -> IoGuard {
        *lock(&self.outstanding) += 1;
        IoGuard {
            tracker: self.clone(),
        }
    }

    pub fn outstanding(&self) -> usize {
        *lock(&self.outstanding)
    }

    /// Wait for the outstanding count to reach zero. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let guard = lock(&self.outstanding);
        let (guard, _) = self
            .idle
            .wait_timeout_while(guard, timeout, |n| *n > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *guard == 0
    }
}

#[derive(Debug)]
struct IoGuard {
    tracker: Arc<IoTracker>,
}

impl Drop for IoGuard {
    fn drop(&mut self) {
        let mut count = lock(&self.tracker.outstanding);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.tracker.idle.notify_all();
        }
    }
}
