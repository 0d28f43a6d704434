//! Observer hook for host API call metrics.
//!
//! The client itself has no metrics dependency; a binary installs an
//! observer once at startup and every API call is reported through it.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

type Observer = dyn Fn(&str, &str, Duration, bool) + Send + Sync;

static API_OBSERVER: OnceLock<Box<Observer>> = OnceLock::new();

/// Install the process-wide observer for host API calls.
///
/// The observer receives `(host, method, duration, success)`. Only the
/// first installation wins; later calls are ignored.
pub fn set_api_observer<F>(observer: F)
where
    F: Fn(&str, &str, Duration, bool) + Send + Sync + 'static,
{
    let _ = API_OBSERVER.set(Box::new(observer));
}

pub(crate) fn observe_api_call(host: &str, method: &str, started: Instant, ok: bool) {
    if let Some(observer) = API_OBSERVER.get() {
        observer(host, method, started.elapsed(), ok);
    }
}
