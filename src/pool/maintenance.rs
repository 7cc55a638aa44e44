//! Background pool maintenance.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::exclusive::PoolShared;
use crate::sync::{DelayOutcome, InterruptibleDelay};

/// Dedicated thread that prunes expired idle connections and keeps the pool
/// at its minimum size.
pub(crate) struct MaintenanceHelper {
    delay: Arc<InterruptibleDelay>,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl MaintenanceHelper {
    pub(crate) fn start(pool: Arc<PoolShared>, interval: Duration) -> io::Result<Self> {
        let delay = Arc::new(InterruptibleDelay::new());
        let cancel = CancellationToken::new();

        let thread = {
            let delay = Arc::clone(&delay);
            let cancel = cancel.clone();
            thread::Builder::new()
                .name(format!("docdb-pool-{}", pool.endpoint))
                .spawn(move || run(pool, delay, cancel, interval))?
        };

        Ok(Self {
            delay,
            cancel,
            thread: Some(thread),
        })
    }

    pub(crate) fn request_maintenance(&self) {
        self.delay.wake();
    }

    /// Stop the loop and wait for the thread to exit.
    pub(crate) fn stop(&mut self) {
        self.cancel.cancel();
        self.delay.stop();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for MaintenanceHelper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(pool: Arc<PoolShared>, delay: Arc<InterruptibleDelay>, cancel: CancellationToken, interval: Duration) {
    debug!(server = %pool.server_id, interval_ms = interval.as_millis() as u64, "Pool maintenance started");
    while !cancel.is_cancelled() {
        if let Err(err) = pool.prune(&cancel) {
            debug!(server = %pool.server_id, error = %err, "Pool prune failed");
        }
        if let Err(err) = pool.ensure_min_size(&cancel) {
            debug!(server = %pool.server_id, error = %err, "Pool min-size maintenance failed");
        }

        match delay.wait(interval) {
            DelayOutcome::Stopped => break,
            DelayOutcome::Woken => trace!(server = %pool.server_id, "Pool maintenance requested"),
            DelayOutcome::Elapsed => {}
        }
    }
    debug!(server = %pool.server_id, "Pool maintenance stopped");
}
