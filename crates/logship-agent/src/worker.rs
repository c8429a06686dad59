//! Worker threads and cooperative stop
//!
//! Monitors own blocking worker threads. A worker observes a [`StopToken`]
//! inside its wait loop; the owner signals the token and joins with a bounded
//! timeout. A worker stuck in an OS call past the timeout is detached rather
//! than blocking supervisor shutdown.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

/// How long a monitor waits for its worker to acknowledge stop.
pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Granularity of interruptible sleeps; bounds stop latency.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Shared stop flag polled by workers inside their wait sets.
#[derive(Clone, Debug, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps up to `duration`, waking early on stop. Returns `true` when the
    /// stop was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// A named worker thread with bounded-join shutdown.
pub struct Worker {
    name: String,
    stop: StopToken,
    // Never carries a message; disconnects when the worker body returns.
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns `body` on its own thread, handing it a stop token to poll.
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Worker>
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        let stop = StopToken::new();
        let token = stop.clone();
        let (done_tx, done_rx) = bounded::<()>(0);

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _done: Sender<()> = done_tx;
                body(token);
            })?;

        Ok(Worker {
            name: name.to_string(),
            stop,
            done_rx,
            handle: Some(handle),
        })
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Signals stop and joins the worker, waiting at most
    /// [`WORKER_JOIN_TIMEOUT`]. A worker that does not acknowledge in time is
    /// detached and a warning is logged.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.request_stop();

        match self.done_rx.recv_timeout(WORKER_JOIN_TIMEOUT) {
            Err(RecvTimeoutError::Disconnected) => {
                // The body returned; the join is immediate.
                let _ = handle.join();
            }
            Err(RecvTimeoutError::Timeout) | Ok(()) => {
                tracing::warn!(
                    worker = %self.name,
                    timeout_secs = WORKER_JOIN_TIMEOUT.as_secs(),
                    "worker did not stop in time, detaching its thread"
                );
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
