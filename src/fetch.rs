//! Deferred resource fetch.
//!
//! A [`DeferredFetch`] is a single-assignment future: the first request
//! starts exactly one background computation, requests made while it runs
//! queue a callback, and once resolved every request is answered
//! synchronously from the cached result. Resolution always happens on the
//! foreground thread.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};

use crate::host::ForegroundExecutor;
use crate::Result;

/// A background computation failed.
///
/// Cloned to every waiter, so it carries the rendered cause rather than the
/// original error value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to fetch {description}: {message}")]
pub struct FetchError {
    /// What was being fetched.
    pub description: String,
    /// Rendered cause.
    pub message: String,
}

/// Outcome delivered to waiters.
pub type FetchResult<T> = std::result::Result<Arc<T>, FetchError>;

type Callback<T> = Box<dyn FnOnce(FetchResult<T>) + Send + 'static>;
type FetchFn<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;

enum FetchState<T> {
    Pending(Option<FetchFn<T>>),
    InFlight(VecDeque<Callback<T>>),
    Resolved(FetchResult<T>),
}

struct Inner<T> {
    description: String,
    executor: ForegroundExecutor,
    state: Mutex<FetchState<T>>,
    seen_keys: Mutex<HashSet<String>>,
}

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A lazily started, once-computed value shared by many waiters.
pub struct DeferredFetch<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DeferredFetch<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for DeferredFetch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*lock(&self.inner.state) {
            FetchState::Pending(_) => "pending",
            FetchState::InFlight(_) => "in-flight",
            FetchState::Resolved(Ok(_)) => "resolved",
            FetchState::Resolved(Err(_)) => "failed",
        };
        f.debug_struct("DeferredFetch")
            .field("description", &self.inner.description)
            .field("state", &state)
            .finish()
    }
}

impl<T: Send + Sync + 'static> DeferredFetch<T> {
    /// Wrap `fetch` without starting it.
    pub fn new(
        description: impl Into<String>,
        executor: ForegroundExecutor,
        fetch: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                description: description.into(),
                executor,
                state: Mutex::new(FetchState::Pending(Some(Box::new(fetch)))),
                seen_keys: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// What this fetch acquires, for logs and error messages.
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// The result, if resolved. Never starts the computation.
    ///
    /// `Ok(None)` means the value is not available yet.
    pub fn get_if_finished(&self) -> std::result::Result<Option<Arc<T>>, FetchError> {
        match &*lock(&self.inner.state) {
            FetchState::Resolved(Ok(value)) => Ok(Some(Arc::clone(value))),
            FetchState::Resolved(Err(e)) => Err(e.clone()),
            FetchState::Pending(_) | FetchState::InFlight(_) => Ok(None),
        }
    }

    /// Deliver the result to `callback`, starting the computation if needed.
    ///
    /// Runs `callback` right away on the calling thread when already
    /// resolved; otherwise it runs on the foreground thread at resolution,
    /// after every callback registered before it.
    ///
    /// Ordering against the resolution batch holds only for calls made on
    /// the foreground thread. Waiters are handed their result after the
    /// state lock is released, so a call from another thread during that
    /// hand-off may run its callback alongside the batch.
    pub fn get_or_start(&self, callback: impl FnOnce(FetchResult<T>) + Send + 'static) {
        let mut state = lock(&self.inner.state);

        let fetch = match &mut *state {
            FetchState::Resolved(result) => {
                let result = result.clone();
                drop(state);
                callback(result);
                return;
            }
            FetchState::InFlight(waiters) => {
                waiters.push_back(Box::new(callback));
                return;
            }
            FetchState::Pending(fetch) => fetch.take(),
        };

        *state = FetchState::InFlight(VecDeque::from([Box::new(callback) as Callback<T>]));
        drop(state);

        if let Some(fetch) = fetch {
            self.start(fetch);
        }
    }

    /// Like [`get_or_start`](Self::get_or_start), but only the first call
    /// with a given `key` registers its callback.
    ///
    /// Same threading rule as `get_or_start`.
    pub fn get_once(
        &self,
        key: impl Into<String>,
        callback: impl FnOnce(FetchResult<T>) + Send + 'static,
    ) {
        if !lock(&self.inner.seen_keys).insert(key.into()) {
            return;
        }
        self.get_or_start(callback);
    }

    fn start(&self, fetch: FetchFn<T>) {
        debug!(resource = %self.inner.description, "starting background fetch");
        let inner = Arc::clone(&self.inner);

        self.inner.executor.spawn_background(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(fetch)) {
                Ok(Ok(value)) => Ok(Arc::new(value)),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("background computation panicked".to_string()),
            };

            let executor = inner.executor.clone();
            executor.post(move || inner.resolve(outcome));
        });
    }
}

impl<T> Inner<T> {
    fn resolve(&self, outcome: std::result::Result<Arc<T>, String>) {
        let result = outcome.map_err(|message| FetchError {
            description: self.description.clone(),
            message,
        });

        if let Err(e) = &result {
            warn!(resource = %self.description, error = %e.message, "background fetch failed");
        }

        let waiters = {
            let mut state = lock(&self.state);
            match std::mem::replace(&mut *state, FetchState::Resolved(result.clone())) {
                FetchState::InFlight(waiters) => waiters,
                FetchState::Pending(_) | FetchState::Resolved(_) => VecDeque::new(),
            }
        };

        debug!(resource = %self.description, waiters = waiters.len(), "fetch resolved");
        for waiter in waiters {
            waiter(result.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::host::Host;
    use crate::HostError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_get_if_finished_never_starts() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let fetch = DeferredFetch::new("logo", host.executor(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(1u32)
        });

        assert_eq!(fetch.get_if_finished().unwrap(), None);
        std::thread::sleep(Duration::from_millis(50));
        host.queue().run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_waiters_notified_in_registration_order() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let fetch = DeferredFetch::new("value", host.executor(), || {
            std::thread::sleep(Duration::from_millis(20));
            Ok(String::from("done"))
        });
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            fetch.get_or_start(move |result| {
                assert_eq!(result.unwrap().as_str(), "done");
                order.lock().unwrap().push(i);
            });
        }

        assert!(host
            .queue()
            .run_until(Duration::from_secs(5), || order.lock().unwrap().len() == 5));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(fetch.get_if_finished().unwrap().unwrap().as_str(), "done");
    }

    #[test]
    fn test_resolved_fetch_answers_synchronously() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let fetch = DeferredFetch::new("n", host.executor(), || Ok(7));
        let done = Arc::new(AtomicUsize::new(0));

        let d = Arc::clone(&done);
        fetch.get_or_start(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        assert!(host
            .queue()
            .run_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 1));

        let late = Arc::new(AtomicUsize::new(0));
        let l = Arc::clone(&late);
        fetch.get_or_start(move |result| {
            l.store(*result.unwrap() as usize, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_failure_reaches_current_and_future_waiters() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let fetch: DeferredFetch<u8> = DeferredFetch::new("manifest", host.executor(), || {
            Err(HostError::Fetch("HTTP error 404".to_string()))
        });
        let errors = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let errors = Arc::clone(&errors);
            fetch.get_or_start(move |result| {
                errors.lock().unwrap().push(result.unwrap_err());
            });
        }
        assert!(host
            .queue()
            .run_until(Duration::from_secs(5), || errors.lock().unwrap().len() == 2));

        let err = fetch.get_if_finished().unwrap_err();
        assert_eq!(err.description, "manifest");
        assert!(err.message.contains("404"));
        assert!(errors.lock().unwrap().iter().all(|e| *e == err));
    }

    #[test]
    fn test_panic_is_captured_as_failure() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let fetch: DeferredFetch<u8> =
            DeferredFetch::new("boom", host.executor(), || panic!("exploded"));
        let failed = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&failed);
        fetch.get_or_start(move |result| {
            if result.is_err() {
                f.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(host
            .queue()
            .run_until(Duration::from_secs(5), || failed.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_get_once_registers_each_key_once() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let fetch = DeferredFetch::new("x", host.executor(), || Ok(()));
        let calls = Arc::new(AtomicUsize::new(0));

        for key in ["a", "a", "b", "a"] {
            let c = Arc::clone(&calls);
            fetch.get_once(key, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(host
            .queue()
            .run_until(Duration::from_secs(5), || calls.load(Ordering::SeqCst) >= 2));
        std::thread::sleep(Duration::from_millis(20));
        host.queue().run_pending();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // keys stay consumed after resolution
        let c = Arc::clone(&calls);
        fetch.get_once("b", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_may_reenter_fetch() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let fetch = DeferredFetch::new("re", host.executor(), || Ok(3));
        let inner_value = Arc::new(AtomicUsize::new(0));

        let again = fetch.clone();
        let seen = Arc::clone(&inner_value);
        fetch.get_or_start(move |_| {
            again.get_or_start(move |result| {
                seen.store(*result.unwrap(), Ordering::SeqCst);
            });
        });

        assert!(host
            .queue()
            .run_until(Duration::from_secs(5), || inner_value.load(Ordering::SeqCst) == 3));
    }

    #[test]
    fn test_foreground_call_during_hand_off_runs_immediately() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let fetch = DeferredFetch::new("hand-off", host.executor(), || Ok(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        let again = fetch.clone();
        let first = Arc::clone(&order);
        fetch.get_or_start(move |_| {
            first.lock().unwrap().push("first");
            let nested = Arc::clone(&first);
            again.get_or_start(move |_| nested.lock().unwrap().push("nested"));
        });
        let second = Arc::clone(&order);
        fetch.get_or_start(move |_| second.lock().unwrap().push("second"));

        assert!(host
            .queue()
            .run_until(Duration::from_secs(5), || order.lock().unwrap().len() == 3));
        assert_eq!(*order.lock().unwrap(), ["first", "nested", "second"]);
    }
}
