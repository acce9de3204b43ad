//! Shared timer for background pool work: idle eviction, background
//! validation and fill-to-minimum.
//!
//! Tasks run on the tokio runtime the timer was created on and stop when
//! the timer is shut down. A task that outlives its pool finds the pool
//! gone (it only holds a weak reference) and ends quietly.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use transx_core::{TransxError, TransxResult};

#[derive(Clone)]
pub struct MaintenanceTimer {
    runtime: Handle,
    shutdown: Arc<watch::Sender<bool>>,
}

impl MaintenanceTimer {
    pub fn new(runtime: Handle) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            runtime,
            shutdown: Arc::new(shutdown),
        }
    }

    /// A timer on the runtime of the calling task.
    pub fn current() -> TransxResult<Self> {
        Handle::try_current().map(Self::new).map_err(|e| {
            TransxError::IllegalState(format!("no tokio runtime for maintenance tasks: {e}"))
        })
    }

    /// Run `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let handle = self.runtime.spawn(async move {
            if *shutdown.borrow_and_update() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => task.await,
                _ = shutdown.changed() => {}
            }
        });
        ScheduledTask { handle }
    }

    /// Call `tick` every `period`, first after one full period, until it
    /// breaks or the timer shuts down.
    pub fn schedule_repeating<F, Fut>(&self, period: Duration, mut tick: F) -> ScheduledTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let handle = self.runtime.spawn(async move {
            if *shutdown.borrow_and_update() {
                return;
            }
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if tick().await.is_break() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        ScheduledTask { handle }
    }

    /// Stop every task scheduled on this timer (and its clones).
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        debug!("maintenance timer shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Handle to one scheduled task.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
