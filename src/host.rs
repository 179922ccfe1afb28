//! Host threading model.
//!
//! One designated foreground thread owns every sandbox and runs every
//! callback. Background work (remote fetches, slow reads) runs on a bounded
//! blocking pool of the host's tokio runtime, and timers are tokio sleeps;
//! both hand their results back by posting a task to the foreground queue.

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::config::FetchConfig;
use crate::source::HttpAccess;
use crate::{HostError, Result};

/// A unit of work for the foreground thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle for dispatching work to the foreground and background contexts.
///
/// Cheap to clone and safe to share across threads.
#[derive(Clone)]
pub struct ForegroundExecutor {
    sender: Sender<Task>,
    runtime: Handle,
}

impl fmt::Debug for ForegroundExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForegroundExecutor").finish_non_exhaustive()
    }
}

impl ForegroundExecutor {
    /// Queue `task` to run on the foreground thread.
    ///
    /// Returns `false` when the foreground queue has been dropped.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        if self.sender.send(Box::new(task)).is_err() {
            warn!("foreground queue is gone, dropping task");
            return false;
        }
        true
    }

    /// Run blocking `work` on the background pool.
    pub fn spawn_background(&self, work: impl FnOnce() + Send + 'static) {
        drop(self.runtime.spawn_blocking(work));
    }

    /// Post `task` to the foreground once `deadline` has passed.
    ///
    /// Aborting the returned handle before the deadline disarms the timer.
    pub fn spawn_timer(
        &self,
        deadline: tokio::time::Instant,
        task: impl FnOnce() + Send + 'static,
    ) -> AbortHandle {
        let sender = self.sender.clone();

        self.runtime
            .spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if sender.send(Box::new(task)).is_err() {
                    debug!("timer fired after the foreground queue was dropped");
                }
            })
            .abort_handle()
    }

    /// Handle of the runtime that drives background work.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }
}

/// Receiving end of the foreground queue; lives on the foreground thread.
pub struct ForegroundQueue {
    receiver: Receiver<Task>,
}

impl fmt::Debug for ForegroundQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForegroundQueue").finish_non_exhaustive()
    }
}

impl ForegroundQueue {
    /// Run every task that is already queued. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task();
            count += 1;
        }
        count
    }

    /// Wait up to `timeout` for one task and run it.
    pub fn run_next(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(task) => {
                task();
                true
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Run tasks until `done` holds or `timeout` elapses.
    ///
    /// Returns whether `done` held.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            self.run_pending();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.run_next((deadline - now).min(Duration::from_millis(50)));
        }
    }
}

/// The async runtime plus the foreground queue of one host process.
pub struct Host {
    runtime: Option<Runtime>,
    executor: ForegroundExecutor,
    queue: ForegroundQueue,
    http: HttpAccess,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host").finish_non_exhaustive()
    }
}

impl Host {
    /// Start the runtime. The calling thread becomes the foreground thread.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.worker_threads.max(1))
            .thread_name("gamehost-worker")
            .enable_all()
            .build()
            .map_err(|e| HostError::Config(format!("failed to start runtime: {e}")))?;

        let (sender, receiver) = mpsc::channel();
        let executor = ForegroundExecutor {
            sender,
            runtime: runtime.handle().clone(),
        };
        let http = HttpAccess::new(config, runtime.handle().clone())?;

        Ok(Self {
            runtime: Some(runtime),
            executor,
            queue: ForegroundQueue { receiver },
            http,
        })
    }

    /// A new handle for dispatching work.
    pub fn executor(&self) -> ForegroundExecutor {
        self.executor.clone()
    }

    /// The foreground queue to pump.
    pub fn queue(&self) -> &ForegroundQueue {
        &self.queue
    }

    /// Shared HTTP access for remote sources.
    pub fn http(&self) -> HttpAccess {
        self.http.clone()
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_posted_tasks_run_in_order() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let executor = host.executor();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = Arc::clone(&log);
            executor.post(move || log.lock().unwrap().push(i));
        }

        assert_eq!(host.queue().run_pending(), 3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_background_result_comes_back_to_foreground() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let executor = host.executor();
        let foreground = std::thread::current().id();
        let seen = Arc::new(std::sync::Mutex::new(None));

        let seen_bg = Arc::clone(&seen);
        let poster = executor.clone();
        executor.spawn_background(move || {
            let worker = std::thread::current().id();
            poster.post(move || {
                *seen_bg.lock().unwrap() = Some((worker, std::thread::current().id()));
            });
        });

        assert!(host
            .queue()
            .run_until(Duration::from_secs(5), || seen.lock().unwrap().is_some()));
        let (worker, delivered) = seen.lock().unwrap().unwrap();
        assert_ne!(worker, foreground);
        assert_eq!(delivered, foreground);
    }

    #[test]
    fn test_aborted_timer_never_fires() {
        let host = Host::new(&FetchConfig::default()).unwrap();
        let executor = host.executor();
        let fired = Arc::new(AtomicUsize::new(0));

        let deadline = tokio::time::Instant::now() + Duration::from_millis(50);
        let f1 = Arc::clone(&fired);
        let cancelled = executor.spawn_timer(deadline, move || {
            f1.fetch_add(1, Ordering::SeqCst);
        });
        let f2 = Arc::clone(&fired);
        executor.spawn_timer(deadline, move || {
            f2.fetch_add(10, Ordering::SeqCst);
        });
        cancelled.abort();

        assert!(host
            .queue()
            .run_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst) > 0));
        std::thread::sleep(Duration::from_millis(100));
        host.queue().run_pending();
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }
}
