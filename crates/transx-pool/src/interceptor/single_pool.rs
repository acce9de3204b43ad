//! Match-all pool stage: one idle store for every subject, bounded by
//! `max_size`, kept at or above `min_size` by asynchronous fill tasks.
//!
//! Checked-out connections are bounded by a semaphore of `max_size`
//! permits. A permit is taken on borrow, forgotten once the borrow
//! succeeds, and handed back (`add_permits`) when the connection comes
//! home. Idle connections hold no permit.

use std::collections::HashMap;
use std::fmt::Write;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use transx_core::{PoolConfig, RequestInfo, Subject, TransxError, TransxResult};

use crate::info::{ConnectionId, ConnectionInfo, ManagedConnectionInfo, ReturnAction};
use crate::maintenance::{MaintenanceTimer, ScheduledTask};
use crate::managed::ManagedConnection;
use crate::resource::ResourceFactory;

use super::{ConnectionInterceptor, PoolCounts, PoolingInterceptor};

struct PoolState {
    idle: HashMap<ConnectionId, ManagedConnectionInfo>,
    /// Idle plus checked out plus fill creations in flight.
    connection_count: usize,
    /// Slots reserved by a fill task whose connection is still being opened.
    filling: usize,
    min_size: usize,
    max_size: usize,
    /// Checked-out connections to destroy on return after a shrink.
    shrink_later: usize,
}

enum Step<'a> {
    Matched(ManagedConnectionInfo),
    Create { victim: Option<ManagedConnectionInfo> },
    /// Full, nothing idle, but a fill is about to add a connection.
    AwaitFill(Notified<'a>),
}

/// Clears the pending-fill flag when the fill task finishes or is dropped
/// without running.
struct FillGuard(Arc<AtomicBool>);

impl Drop for FillGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SinglePoolInterceptor {
    name: String,
    next: Arc<dyn ConnectionInterceptor>,
    factory: Arc<dyn ResourceFactory>,
    state: Mutex<PoolState>,
    permits: parking_lot::Mutex<Arc<Semaphore>>,
    resize: RwLock<()>,
    blocking_timeout: Duration,
    idle_timeout: Duration,
    validate_on_match: bool,
    fill_delay: Duration,
    destroyed: AtomicBool,
    fill_pending: Arc<AtomicBool>,
    filled: Notify,
    timer: MaintenanceTimer,
    sweepers: parking_lot::Mutex<Vec<ScheduledTask>>,
    this: Weak<Self>,
}

impl SinglePoolInterceptor {
    pub fn new(
        next: Arc<dyn ConnectionInterceptor>,
        factory: Arc<dyn ResourceFactory>,
        config: &PoolConfig,
        timer: MaintenanceTimer,
        name: impl Into<String>,
    ) -> Arc<Self> {
        let pool = Arc::new_cyclic(|this| Self {
            name: name.into(),
            next,
            factory,
            state: Mutex::new(PoolState {
                idle: HashMap::new(),
                connection_count: 0,
                filling: 0,
                min_size: config.min_size,
                max_size: config.max_size,
                shrink_later: 0,
            }),
            permits: parking_lot::Mutex::new(Arc::new(Semaphore::new(config.max_size))),
            resize: RwLock::new(()),
            blocking_timeout: config.blocking_timeout,
            idle_timeout: config.idle_timeout,
            validate_on_match: config.validate_on_match,
            fill_delay: config.fill_delay,
            destroyed: AtomicBool::new(false),
            fill_pending: Arc::new(AtomicBool::new(false)),
            filled: Notify::new(),
            timer,
            sweepers: parking_lot::Mutex::new(Vec::new()),
            this: this.clone(),
        });
        pool.start_sweepers(config);
        info!(
            pool = %pool.name,
            min_size = config.min_size,
            max_size = config.max_size,
            "connection pool created"
        );
        pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn start_sweepers(&self, config: &PoolConfig) {
        let mut sweepers = self.sweepers.lock();

        let this = self.this.clone();
        sweepers.push(self.timer.schedule_repeating(self.idle_timeout, move || {
            let this = this.clone();
            async move {
                match this.upgrade() {
                    Some(pool) if !pool.is_destroyed() => {
                        pool.evict_expired().await;
                        ControlFlow::Continue(())
                    }
                    _ => ControlFlow::Break(()),
                }
            }
        }));

        if config.background_validation {
            let this = self.this.clone();
            sweepers.push(self.timer.schedule_repeating(config.validating_period, move || {
                let this = this.clone();
                async move {
                    match this.upgrade() {
                        Some(pool) if !pool.is_destroyed() => {
                            pool.validate_idle().await;
                            ControlFlow::Continue(())
                        }
                        _ => ControlFlow::Break(()),
                    }
                }
            }));
        }
    }

    async fn internal_get(&self, info: &mut ConnectionInfo, deadline: Instant) -> TransxResult<()> {
        let subject = info.mci.subject.clone();
        let request = info.mci.request.clone();

        loop {
            let step = {
                let mut state = self.state.lock().await;
                if self.is_destroyed() {
                    return Err(TransxError::PoolDestroyed);
                }
                let candidates: Vec<Arc<ManagedConnection>> = state
                    .idle
                    .values()
                    .filter_map(|mci| mci.connection.clone())
                    .filter(|mc| !mc.is_broken())
                    .collect();
                let matched = self
                    .factory
                    .match_existing(&candidates, subject.as_ref(), request.as_ref())
                    .and_then(|id| state.idle.remove(&id));

                match matched {
                    Some(mci) => Step::Matched(mci),
                    None if state.connection_count < state.max_size => {
                        state.connection_count += 1;
                        Step::Create { victim: None }
                    }
                    None => {
                        // Victim order is whatever the map yields. The
                        // victim's slot goes to the new connection.
                        let id = state.idle.keys().next().copied();
                        match id.and_then(|id| state.idle.remove(&id)) {
                            Some(mci) => Step::Create { victim: Some(mci) },
                            // Registered before the lock drops, so the
                            // fill's wakeup cannot be missed.
                            None if state.filling > 0 => Step::AwaitFill(self.filled.notified()),
                            None => {
                                return Err(TransxError::AllocationTimeout(format!(
                                    "pool {} is full and has no idle connection to evict",
                                    self.name
                                )));
                            }
                        }
                    }
                }
            };

            match step {
                Step::Matched(mci) => {
                    if self.validate_on_match {
                        if let Some(mc) = mci.connection.clone() {
                            if mc.is_broken() || !self.factory.validate(&mc).await {
                                debug!(pool = %self.name, connection_id = %mc.id(), "matched connection failed validation");
                                self.discard(mci).await;
                                continue;
                            }
                        }
                    }
                    trace!(pool = %self.name, connection_id = ?mci.id(), "supplying pooled connection");
                    info.mci = mci;
                    break;
                }
                Step::AwaitFill(filled) => {
                    trace!(pool = %self.name, "pool full, waiting for fill to finish");
                    if tokio::time::timeout_at(deadline, filled).await.is_err() {
                        return Err(TransxError::AllocationTimeout(format!(
                            "no connection available in pool {} within {:?}",
                            self.name, self.blocking_timeout
                        )));
                    }
                }
                Step::Create { victim } => {
                    if let Some(victim) = victim {
                        debug!(pool = %self.name, connection_id = ?victim.id(), "pool full, evicting idle connection");
                        self.next
                            .return_connection(ConnectionInfo::new(victim), ReturnAction::Destroy)
                            .await;
                    }
                    if let Err(e) = self.next.get_connection(info).await {
                        let mut state = self.state.lock().await;
                        state.connection_count = state.connection_count.saturating_sub(1);
                        return Err(e);
                    }
                    debug!(pool = %self.name, connection_id = ?info.mci.id(), "created new connection");
                    break;
                }
            }
        }

        let below_min = {
            let state = self.state.lock().await;
            state.connection_count < state.min_size
        };
        if below_min {
            self.schedule_fill(subject, request);
        }
        Ok(())
    }

    /// Destroy a connection that already left the idle store.
    async fn discard(&self, mci: ManagedConnectionInfo) {
        {
            let mut state = self.state.lock().await;
            state.connection_count = state.connection_count.saturating_sub(1);
        }
        self.next
            .return_connection(ConnectionInfo::new(mci), ReturnAction::Destroy)
            .await;
    }

    fn schedule_fill(&self, subject: Option<Subject>, request: Option<RequestInfo>) {
        if self.is_destroyed() || self.fill_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = self.this.clone();
        let guard = FillGuard(Arc::clone(&self.fill_pending));
        // Once started, runs to completion even if the timer shuts down
        // meanwhile; the fill loop itself checks for a destroyed pool.
        self.timer.schedule(self.fill_delay, async move {
            let _guard = guard;
            if let Some(pool) = this.upgrade() {
                pool.fill(subject, request).await;
            }
        });
    }

    async fn fill(&self, subject: Option<Subject>, request: Option<RequestInfo>) {
        let mut created = 0usize;
        loop {
            {
                let mut state = self.state.lock().await;
                if self.is_destroyed()
                    || state.connection_count >= state.min_size
                    || state.connection_count >= state.max_size
                {
                    break;
                }
                state.connection_count += 1;
                state.filling += 1;
            }

            let mut info = ConnectionInfo::new(ManagedConnectionInfo::new(
                Arc::clone(&self.factory),
                subject.clone(),
                request.clone(),
            ));
            if let Err(e) = self.next.get_connection(&mut info).await {
                {
                    let mut state = self.state.lock().await;
                    state.connection_count = state.connection_count.saturating_sub(1);
                    state.filling = state.filling.saturating_sub(1);
                }
                // Waiting borrowers may now create their own.
                self.filled.notify_waiters();
                warn!(pool = %self.name, error = %e, "fill to minimum failed");
                break;
            }

            let (mut mci, _) = info.into_parts();
            let mut state = self.state.lock().await;
            state.filling = state.filling.saturating_sub(1);
            if self.is_destroyed() {
                state.connection_count = state.connection_count.saturating_sub(1);
                drop(state);
                self.filled.notify_waiters();
                self.next
                    .return_connection(ConnectionInfo::new(mci), ReturnAction::Destroy)
                    .await;
                break;
            }
            match mci.id() {
                Some(id) => {
                    mci.last_used = Instant::now();
                    state.idle.insert(id, mci);
                    created += 1;
                }
                None => state.connection_count = state.connection_count.saturating_sub(1),
            }
            drop(state);
            self.filled.notify_waiters();
        }
        if created > 0 {
            debug!(pool = %self.name, created, "filled pool towards minimum");
        }
    }

    fn release_permit(&self) {
        self.permits.lock().add_permits(1);
    }

    /// Remove and destroy idle connections last used before `threshold`,
    /// plus any that reported a physical error. Returns how many went.
    pub async fn evict_idle_before(&self, threshold: Option<Instant>) -> usize {
        let victims: Vec<ManagedConnectionInfo> = {
            let mut state = self.state.lock().await;
            let ids: Vec<ConnectionId> = state
                .idle
                .iter()
                .filter(|(_, mci)| {
                    threshold.is_some_and(|t| mci.last_used < t)
                        || mci.connection.as_ref().is_some_and(|mc| mc.is_broken())
                })
                .map(|(id, _)| *id)
                .collect();
            let victims: Vec<_> = ids.iter().filter_map(|id| state.idle.remove(id)).collect();
            state.connection_count = state.connection_count.saturating_sub(victims.len());
            victims
        };

        let evicted = victims.len();
        for mci in victims {
            self.next
                .return_connection(ConnectionInfo::new(mci), ReturnAction::Destroy)
                .await;
        }
        if evicted > 0 {
            info!(pool = %self.name, evicted, "evicted idle connections");
        }
        evicted
    }

    /// Ask the factory which idle connections are invalid and destroy
    /// those still idle. Returns how many went.
    pub async fn validate_idle(&self) -> usize {
        let snapshot: Vec<Arc<ManagedConnection>> = {
            let state = self.state.lock().await;
            state.idle.values().filter_map(|mci| mci.connection.clone()).collect()
        };
        if snapshot.is_empty() {
            return 0;
        }
        let invalid = self.factory.invalid_connections(&snapshot).await;
        if invalid.is_empty() {
            return 0;
        }

        let victims: Vec<ManagedConnectionInfo> = {
            let mut state = self.state.lock().await;
            let victims: Vec<_> = invalid.iter().filter_map(|id| state.idle.remove(id)).collect();
            state.connection_count = state.connection_count.saturating_sub(victims.len());
            victims
        };
        let removed = victims.len();
        for mci in victims {
            self.next
                .return_connection(ConnectionInfo::new(mci), ReturnAction::Destroy)
                .await;
        }
        if removed > 0 {
            info!(pool = %self.name, removed, "background validation removed connections");
        }
        removed
    }

    /// Stop background work and destroy every idle connection.
    ///
    /// Checked-out connections are destroyed as they come back.
    pub(crate) async fn shutdown(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.lock().close();
        let sweepers = std::mem::take(&mut *self.sweepers.lock());
        for task in sweepers {
            task.cancel();
        }

        let drained: Vec<ManagedConnectionInfo> = {
            let mut state = self.state.lock().await;
            let drained: Vec<_> = state.idle.drain().map(|(_, mci)| mci).collect();
            state.connection_count = state.connection_count.saturating_sub(drained.len());
            drained
        };
        info!(pool = %self.name, drained = drained.len(), "connection pool destroyed");
        for mci in drained {
            self.next
                .return_connection(ConnectionInfo::new(mci), ReturnAction::Destroy)
                .await;
        }
    }
}

#[async_trait]
impl ConnectionInterceptor for SinglePoolInterceptor {
    async fn get_connection(&self, info: &mut ConnectionInfo) -> TransxResult<()> {
        if info.mci.connection.is_some() {
            return Ok(());
        }
        if self.is_destroyed() {
            return Err(TransxError::PoolDestroyed);
        }

        let now = Instant::now();
        let deadline = now
            .checked_add(self.blocking_timeout)
            .unwrap_or_else(|| now + Duration::from_secs(30 * 365 * 24 * 3600));
        let _resize = self.resize.read().await;
        let semaphore = self.permits.lock().clone();
        let permit = match tokio::time::timeout_at(deadline, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(TransxError::PoolDestroyed),
            Err(_) => {
                return Err(TransxError::AllocationTimeout(format!(
                    "no connection available in pool {} within {:?}",
                    self.name, self.blocking_timeout
                )));
            }
        };

        // A failed borrow drops the permit, giving it back.
        self.internal_get(info, deadline).await?;
        permit.forget();
        Ok(())
    }

    async fn return_connection(&self, info: ConnectionInfo, action: ReturnAction) {
        let Some(mc) = info.mci.connection.clone() else {
            return;
        };
        let _resize = self.resize.read().await;

        let mut action = action;
        if action == ReturnAction::ReturnToPool && mc.is_broken() {
            action = ReturnAction::Destroy;
        }
        if action == ReturnAction::ReturnToPool {
            if let Err(e) = mc.cleanup().await {
                warn!(pool = %self.name, connection_id = %mc.id(), error = %e, "cleanup failed, destroying connection");
                action = ReturnAction::Destroy;
            }
        }

        let (mut mci, _) = info.into_parts();
        let mut state = self.state.lock().await;
        let was_idle = state.idle.remove(&mc.id()).is_some();

        if action == ReturnAction::ReturnToPool && !self.is_destroyed() {
            if state.shrink_later == 0 {
                mci.last_used = Instant::now();
                state.idle.insert(mc.id(), mci);
                drop(state);
                if !was_idle {
                    self.release_permit();
                }
                trace!(pool = %self.name, connection_id = %mc.id(), "connection returned to pool");
                return;
            }
            state.shrink_later -= 1;
            state.connection_count = state.connection_count.saturating_sub(1);
            drop(state);
            debug!(pool = %self.name, connection_id = %mc.id(), "destroying returned connection to finish shrink");
        } else {
            state.connection_count = state.connection_count.saturating_sub(1);
            drop(state);
            if !was_idle {
                self.release_permit();
            }
        }

        self.next
            .return_connection(ConnectionInfo::new(mci), ReturnAction::Destroy)
            .await;
    }

    async fn destroy(&self) {
        self.shutdown().await;
        self.next.destroy().await;
    }

    fn info(&self, out: &mut String) {
        match self.state.try_lock() {
            Ok(state) => {
                let _ = writeln!(
                    out,
                    "SinglePoolInterceptor: pool={} min={} max={} idle={} total={} blocking_timeout={:?} idle_timeout={:?}",
                    self.name,
                    state.min_size,
                    state.max_size,
                    state.idle.len(),
                    state.connection_count,
                    self.blocking_timeout,
                    self.idle_timeout
                );
            }
            Err(_) => {
                let _ = writeln!(out, "SinglePoolInterceptor: pool={} (busy)", self.name);
            }
        }
        self.next.info(out);
    }
}

#[async_trait]
impl PoolingInterceptor for SinglePoolInterceptor {
    async fn counts(&self) -> PoolCounts {
        let state = self.state.lock().await;
        PoolCounts {
            idle: state.idle.len(),
            total: state.connection_count,
            partitions: 1,
        }
    }

    async fn set_max_size(&self, max_size: usize) -> TransxResult<()> {
        if max_size == 0 {
            return Err(TransxError::InvalidArgument(
                "max size must be greater than zero".into(),
            ));
        }
        if self.is_destroyed() {
            return Err(TransxError::PoolDestroyed);
        }

        let _resize = self.resize.write().await;
        let (old_max, plan, victims) = {
            let mut state = self.state.lock().await;
            let available = self.permits.lock().available_permits();
            let plan = ResizePlan::compute(
                state.max_size,
                state.min_size,
                available,
                state.connection_count,
                max_size,
            );
            *self.permits.lock() = Arc::new(Semaphore::new(plan.permits));
            let old_max = state.max_size;
            state.shrink_later = plan.shrink_later;
            state.min_size = plan.min_size;
            state.max_size = plan.max_size;

            let ids: Vec<ConnectionId> = state.idle.keys().take(plan.shrink_now).copied().collect();
            let victims: Vec<_> = ids.iter().filter_map(|id| state.idle.remove(id)).collect();
            state.connection_count = state.connection_count.saturating_sub(victims.len());
            (old_max, plan, victims)
        };

        info!(
            pool = %self.name,
            old_max,
            new_max = plan.max_size,
            destroyed_now = victims.len(),
            shrink_later = plan.shrink_later,
            "pool resized"
        );
        for mci in victims {
            self.next
                .return_connection(ConnectionInfo::new(mci), ReturnAction::Destroy)
                .await;
        }
        Ok(())
    }

    async fn remove_idle(&self, id: ConnectionId) -> bool {
        let victim = {
            let mut state = self.state.lock().await;
            let victim = state.idle.remove(&id);
            if victim.is_some() {
                state.connection_count = state.connection_count.saturating_sub(1);
            }
            victim
        };
        let Some(mci) = victim else {
            return false;
        };
        debug!(pool = %self.name, connection_id = %id, "removing failed idle connection");
        self.next
            .return_connection(ConnectionInfo::new(mci), ReturnAction::Destroy)
            .await;
        true
    }

    async fn evict_expired(&self) {
        let threshold = Instant::now().checked_sub(self.idle_timeout);
        self.evict_idle_before(threshold).await;
    }
}

/// Outcome of changing a pool's maximum size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResizePlan {
    /// Checked-out connections to destroy when they come back.
    shrink_later: usize,
    /// Idle connections to destroy right away.
    shrink_now: usize,
    min_size: usize,
    max_size: usize,
    /// Permits in the replacement semaphore.
    permits: usize,
}

impl ResizePlan {
    fn compute(old_max: usize, old_min: usize, available: usize, total: usize, new_max: usize) -> Self {
        let checked_out = old_max.saturating_sub(available);
        let shrink_later = checked_out.saturating_sub(new_max);
        let shrink_now = total.saturating_sub(new_max).saturating_sub(shrink_later);
        let transfer = checked_out - shrink_later;
        Self {
            shrink_later,
            shrink_now,
            min_size: old_min.min(new_max),
            max_size: new_max,
            permits: new_max - transfer,
        }
    }
}
