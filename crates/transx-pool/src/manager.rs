//! Connection manager: the façade resource adapters talk to.
//!
//! Owns the interceptor chain, tracks checked-out connections and turns
//! connection events into returns:
//!
//! ```text
//! borrow ──▶ handle ──▶ (lazy) chain.get_connection ──▶ checked_out
//! handle.close ──▶ Closed event ──▶ no handles left ──▶ chain.return_connection
//! physical failure ──▶ ErrorOccurred event ──▶ destroy (checked out or idle)
//! ```

use std::collections::HashMap;
use std::fmt::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace};

use transx_core::{
    PartitionStrategy, PoolConfig, RequestInfo, Subject, TransxError, TransxResult,
};

use crate::handle::{ConnectionHandle, LazyAssociator};
use crate::info::{ConnectionId, ConnectionInfo, ManagedConnectionInfo, ReturnAction};
use crate::interceptor::{
    ConnectionHandleInterceptor, ConnectionInterceptor, FactoryInterceptor,
    PartitionedPoolInterceptor, PoolingInterceptor, SinglePoolInterceptor,
    XaResourceInsertionInterceptor,
};
use crate::maintenance::MaintenanceTimer;
use crate::managed::{ConnectionEvent, ConnectionEventKind, ConnectionEventListener, ManagedConnection};
use crate::resource::ResourceFactory;

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub total: usize,
    pub checked_out: usize,
    pub partitions: usize,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    name: String,
    config: PoolConfig,
    factory: Arc<dyn ResourceFactory>,
    chain: Arc<dyn ConnectionInterceptor>,
    pool: Arc<dyn PoolingInterceptor>,
    checked_out: Mutex<HashMap<ConnectionId, ManagedConnectionInfo>>,
    timer: MaintenanceTimer,
    destroyed: AtomicBool,
}

impl ConnectionManager {
    /// Build a manager whose maintenance runs on the current tokio runtime.
    pub fn new(config: PoolConfig, factory: Arc<dyn ResourceFactory>) -> TransxResult<Self> {
        Self::with_timer(config, factory, MaintenanceTimer::current()?)
    }

    /// Build a manager on an explicit timer. The manager shuts the timer
    /// down in [`destroy_all`](Self::destroy_all).
    pub fn with_timer(
        config: PoolConfig,
        factory: Arc<dyn ResourceFactory>,
        timer: MaintenanceTimer,
    ) -> TransxResult<Self> {
        config
            .validate()
            .map_err(|e| TransxError::InvalidArgument(e.to_string()))?;
        let name = factory.name().to_string();

        let inner = Arc::new_cyclic(|this: &Weak<ManagerInner>| {
            let bridge: Arc<dyn ConnectionEventListener> = Arc::new(EventBridge {
                manager: this.clone(),
            });
            let leaf: Arc<dyn ConnectionInterceptor> = Arc::new(FactoryInterceptor::new(
                Arc::clone(&factory),
                config.lock_timeout,
                Some(bridge),
            ));
            let xa: Arc<dyn ConnectionInterceptor> =
                Arc::new(XaResourceInsertionInterceptor::new(leaf));
            let (pool, stage) = build_pool(xa, &factory, &config, &timer, &name);
            let chain: Arc<dyn ConnectionInterceptor> =
                Arc::new(ConnectionHandleInterceptor::new(stage));

            ManagerInner {
                name,
                config: config.clone(),
                factory: Arc::clone(&factory),
                chain,
                pool,
                checked_out: Mutex::new(HashMap::new()),
                timer,
                destroyed: AtomicBool::new(false),
            }
        });
        Ok(Self { inner })
    }

    /// Load the pool configuration from a TOML file and build a manager.
    pub fn from_config_file(path: &Path, factory: Arc<dyn ResourceFactory>) -> anyhow::Result<Self> {
        let config = PoolConfig::from_file(path)?;
        Self::new(config, factory)
            .with_context(|| format!("building connection manager from {}", path.display()))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Borrow a connection: a handle already associated with a managed
    /// connection.
    pub async fn borrow(
        &self,
        subject: Option<Subject>,
        request: Option<RequestInfo>,
    ) -> TransxResult<ConnectionHandle> {
        let handle = self.lazy_handle(subject, request);
        handle.managed_connection().await?;
        Ok(handle)
    }

    /// A handle that associates on its first operation.
    pub fn lazy_handle(&self, subject: Option<Subject>, request: Option<RequestInfo>) -> ConnectionHandle {
        let associator: Arc<dyn LazyAssociator> = self.inner.clone();
        ConnectionHandle::new(subject, request, Some(associator))
    }

    /// Associate `handle` with a managed connection now.
    pub async fn associate_connection(
        &self,
        handle: &ConnectionHandle,
    ) -> TransxResult<Arc<ManagedConnection>> {
        handle.associate_with(self.inner.as_ref()).await
    }

    /// Give a handle back. `Destroy` discards the physical connection even
    /// if other handles still share it.
    pub async fn return_connection(&self, handle: &ConnectionHandle, action: ReturnAction) {
        if action == ReturnAction::Destroy {
            if let Some(id) = handle.connection_id() {
                self.inner.release(id, ReturnAction::Destroy).await;
            }
        }
        handle.close().await;
    }

    /// Lower (or raise) the maximum pool size at runtime.
    pub async fn shrink_to(&self, max_size: usize) -> TransxResult<()> {
        self.inner.pool.set_max_size(max_size).await
    }

    /// Run one idle-eviction sweep now.
    pub async fn evict_idle(&self) {
        self.inner.pool.evict_expired().await;
    }

    /// Destroy the pool. Idle connections close now, checked-out ones
    /// when they come back; further borrows fail with `PoolDestroyed`.
    pub async fn destroy_all(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.chain.destroy().await;
        self.inner.timer.shutdown();
        info!(
            manager = %self.inner.name,
            checked_out = self.inner.checked_out.lock().len(),
            "connection manager destroyed"
        );
    }

    pub async fn stats(&self) -> PoolStats {
        let counts = self.inner.pool.counts().await;
        PoolStats {
            idle: counts.idle,
            total: counts.total,
            checked_out: self.inner.checked_out.lock().len(),
            partitions: counts.partitions,
        }
    }

    /// Human-readable description of the whole chain.
    pub fn info(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "ConnectionManager: name={} partition={:?}",
            self.inner.name, self.inner.config.partition
        );
        self.inner.chain.info(&mut out);
        out
    }
}

fn build_pool(
    next: Arc<dyn ConnectionInterceptor>,
    factory: &Arc<dyn ResourceFactory>,
    config: &PoolConfig,
    timer: &MaintenanceTimer,
    name: &str,
) -> (Arc<dyn PoolingInterceptor>, Arc<dyn ConnectionInterceptor>) {
    if config.partition == PartitionStrategy::None {
        let pool = SinglePoolInterceptor::new(next, Arc::clone(factory), config, timer.clone(), name);
        let stage: Arc<dyn ConnectionInterceptor> = pool.clone();
        (pool, stage)
    } else {
        let pool = Arc::new(PartitionedPoolInterceptor::new(
            next,
            Arc::clone(factory),
            config,
            timer.clone(),
            name,
        ));
        let stage: Arc<dyn ConnectionInterceptor> = pool.clone();
        (pool, stage)
    }
}

impl ManagerInner {
    /// Hand a checked-out connection back to the chain.
    ///
    /// `ReturnToPool` is ignored while other handles still use the
    /// connection. Returns whether the connection was checked out.
    async fn release(&self, id: ConnectionId, action: ReturnAction) -> bool {
        let mci = {
            let mut checked_out = self.checked_out.lock();
            let shared = action == ReturnAction::ReturnToPool
                && checked_out
                    .get(&id)
                    .and_then(|mci| mci.connection())
                    .is_some_and(|mc| mc.has_handles());
            if shared {
                return true;
            }
            checked_out.remove(&id)
        };
        match mci {
            Some(mci) => {
                trace!(manager = %self.name, connection_id = %id, ?action, "releasing connection");
                self.chain.return_connection(ConnectionInfo::new(mci), action).await;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl LazyAssociator for ManagerInner {
    async fn associate(&self, handle: &ConnectionHandle) -> TransxResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(TransxError::PoolDestroyed);
        }
        let mci = ManagedConnectionInfo::new(
            Arc::clone(&self.factory),
            handle.subject().cloned(),
            handle.request_info().cloned(),
        );
        let mut info = ConnectionInfo::with_handle(mci, handle.clone());
        self.chain.get_connection(&mut info).await?;

        let (mci, _) = info.into_parts();
        let id = mci
            .id()
            .ok_or_else(|| TransxError::IllegalState("chain returned no managed connection".into()))?;
        self.checked_out.lock().insert(id, mci);
        debug!(manager = %self.name, connection_id = %id, handle = %handle.id(), "handle associated");
        Ok(())
    }
}

/// Listener registered on every connection the manager creates.
struct EventBridge {
    manager: Weak<ManagerInner>,
}

#[async_trait]
impl ConnectionEventListener for EventBridge {
    async fn connection_event(&self, event: &ConnectionEvent) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let id = event.connection.id();
        match &event.kind {
            ConnectionEventKind::Closed { handle } => {
                trace!(connection_id = %id, %handle, "handle closed");
                if !event.connection.has_handles() {
                    manager.release(id, ReturnAction::ReturnToPool).await;
                }
            }
            // A connection mid-return is in neither place; its broken flag
            // turns the return into a destroy.
            ConnectionEventKind::ErrorOccurred { error } => {
                debug!(connection_id = %id, error = %error, "connection error, destroying");
                if !manager.release(id, ReturnAction::Destroy).await {
                    manager.pool.remove_idle(id).await;
                }
            }
            other => trace!(connection_id = %id, event = ?other, "local transaction event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::testing::MockFactory;

    fn manager(factory: &Arc<MockFactory>, config: PoolConfig) -> ConnectionManager {
        ConnectionManager::new(config, factory.clone()).unwrap()
    }

    #[tokio::test]
    async fn borrow_and_close_returns_to_pool() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager(&factory, PoolConfig::default());

        let handle = manager.borrow(None, None).await.unwrap();
        assert_eq!(
            manager.stats().await,
            PoolStats { idle: 0, total: 1, checked_out: 1, partitions: 1 }
        );

        handle.close().await;
        assert_eq!(
            manager.stats().await,
            PoolStats { idle: 1, total: 1, checked_out: 0, partitions: 1 }
        );

        let again = manager.borrow(None, None).await.unwrap();
        assert_eq!(factory.created(), 1);
        manager.return_connection(&again, ReturnAction::ReturnToPool).await;
        assert!(again.is_closed());
    }

    #[tokio::test]
    async fn lazy_handle_borrows_on_first_use() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager(&factory, PoolConfig::default());

        let handle = manager.lazy_handle(None, None);
        assert_eq!(manager.stats().await.total, 0);
        handle.execute(|_conn| async { Ok(()) }).await.unwrap();
        assert_eq!(manager.stats().await.checked_out, 1);
    }

    #[tokio::test]
    async fn explicit_association_of_unmanaged_handle() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager(&factory, PoolConfig::default());

        let handle = ConnectionHandle::new(None, None, None);
        let mc = manager.associate_connection(&handle).await.unwrap();
        assert_eq!(handle.connection_id(), Some(mc.id()));
        assert_eq!(manager.stats().await.checked_out, 1);
    }

    #[tokio::test]
    async fn destroy_action_discards_connection() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager(&factory, PoolConfig::default());

        let handle = manager.borrow(None, None).await.unwrap();
        manager.return_connection(&handle, ReturnAction::Destroy).await;
        assert!(handle.is_closed());
        assert_eq!(factory.closed(), 1);
        assert_eq!(manager.stats().await, PoolStats { partitions: 1, ..PoolStats::default() });
    }

    #[tokio::test]
    async fn fatal_operation_error_evicts_checked_out_connection() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager(&factory, PoolConfig::default());

        let handle = manager.borrow(None, None).await.unwrap();
        let result = handle
            .execute(|_conn| async { Err::<(), _>(TransxError::ConnectionError("broken pipe".into())) })
            .await;
        assert!(result.is_err());
        assert!(handle.is_closed());
        assert_eq!(factory.closed(), 1);
        assert_eq!(manager.stats().await.total, 0);
    }

    #[tokio::test]
    async fn asynchronous_failure_of_idle_connection_removes_it_at_once() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager(&factory, PoolConfig::default());

        let handle = manager.borrow(None, None).await.unwrap();
        handle.close().await;
        assert_eq!(manager.stats().await.idle, 1);

        factory.last_physical().unwrap().fail("broker went away");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(factory.closed(), 1);
        assert_eq!(manager.stats().await, PoolStats { partitions: 1, ..PoolStats::default() });

        let fresh = manager.borrow(None, None).await.unwrap();
        assert_eq!(factory.created(), 2);
        fresh.close().await;
    }

    #[tokio::test]
    async fn asynchronous_failure_of_idle_partitioned_connection_removes_it() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager(
            &factory,
            PoolConfig::default().with_partition(PartitionStrategy::BySubject),
        );

        let alice = manager.borrow(Some(Subject::new("alice")), None).await.unwrap();
        let alice_physical = factory.last_physical().unwrap();
        let bob = manager.borrow(Some(Subject::new("bob")), None).await.unwrap();
        alice.close().await;
        bob.close().await;

        alice_physical.fail("broker went away");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(factory.closed(), 1);
        assert_eq!(
            manager.stats().await,
            PoolStats { idle: 1, total: 1, checked_out: 0, partitions: 2 }
        );
    }

    #[tokio::test]
    async fn destroy_all_refuses_new_borrows() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager(&factory, PoolConfig::default());
        let idle = manager.borrow(None, None).await.unwrap();
        idle.close().await;

        manager.destroy_all().await;
        assert!(manager.is_destroyed());
        assert_eq!(factory.closed(), 1);
        assert!(matches!(
            manager.borrow(None, None).await,
            Err(TransxError::PoolDestroyed)
        ));
    }

    #[tokio::test]
    async fn destroy_all_closes_the_rest_when_one_close_fails() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager(&factory, PoolConfig::default());

        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(manager.borrow(None, None).await.unwrap());
        }
        for handle in &handles {
            handle.close().await;
        }
        factory.physicals()[0].set_fail_close(true);

        manager.destroy_all().await;
        assert_eq!(factory.closed(), 2);
        assert_eq!(manager.stats().await, PoolStats { partitions: 1, ..PoolStats::default() });
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let factory = Arc::new(MockFactory::new());
        let config = PoolConfig::default().with_sizes(5, 2);
        assert!(matches!(
            ConnectionManager::new(config, factory),
            Err(TransxError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn info_lists_every_stage() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager(&factory, PoolConfig::default());
        let info = manager.info();
        let stages: Vec<&str> = info
            .lines()
            .map(|line| line.split(':').next().unwrap_or_default())
            .collect();
        assert_eq!(
            stages,
            [
                "ConnectionManager",
                "ConnectionHandleInterceptor",
                "SinglePoolInterceptor",
                "XaResourceInsertionInterceptor",
                "FactoryInterceptor",
            ]
        );
    }
}
