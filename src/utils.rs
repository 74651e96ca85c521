use num::{FromPrimitive, traits::WrappingAdd};
use std::{
    env,
    panic::{self, AssertUnwindSafe},
    sync::{Mutex, MutexGuard, PoisonError},
};
use tracing::error;

use crate::transport::DEFAULT_TRANSPORT;

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    if let Some(one) = T::from_u8(1) {
        *value = value.wrapping_add(&one);
    }
    id
}

/// Lock a mutex, carrying on with the data if another thread panicked while holding it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run a user callback on a transport thread. A panic is logged and
/// swallowed so that it cannot unwind into the transport. Returns false if it
/// panicked.
pub(crate) fn call_guarded(context: &str, callback: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(()) => true,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            error!("{context}: callback panicked: {message}");
            false
        }
    }
}

/// Get the name of the transport to bind, either from environment or default "inproc"
pub fn get_default_transport() -> String {
    env::var("PVLINK_TRANSPORT")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_TRANSPORT.to_string())
}

/// Timeout for blocking get/put/connect calls, in seconds. Default 5.
pub fn get_default_io_timeout() -> f32 {
    env::var("PVLINK_IO_TIMEOUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5.0f32)
        .max(0.01f32)
}

/// Time given to event delivery by `pend_event`, in seconds. Default 0.1.
pub fn get_default_event_timeout() -> f32 {
    env::var("PVLINK_EVENT_TIMEOUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.1f32)
        .max(0.001f32)
}

/// Longest interval between repeated searches for a missing PV, in seconds
pub fn get_default_max_search_interval() -> f32 {
    env::var("PVLINK_MAX_SEARCH_PERIOD")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60.0f32)
        .max(1.0f32)
}

/// Number of worker threads servicing the transport
pub fn get_default_transport_threads() -> usize {
    env::var("PVLINK_TRANSPORT_THREADS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2usize)
        .max(1usize)
}
