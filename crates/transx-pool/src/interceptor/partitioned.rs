//! Partitioned pool stage: one match-all pool per partition key, created
//! on first use. Connections never cross partitions.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use transx_core::{PartitionStrategy, PoolConfig, RequestInfo, Subject, TransxError, TransxResult};

use crate::info::{ConnectionId, ConnectionInfo, ReturnAction};
use crate::maintenance::MaintenanceTimer;
use crate::resource::ResourceFactory;

use super::{ConnectionInterceptor, PoolCounts, PoolingInterceptor, SinglePoolInterceptor};

/// Which partition a request belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartitionKey {
    Unpartitioned,
    Subject(Option<Subject>),
    RequestInfo(Option<RequestInfo>),
    Both(Option<Subject>, Option<RequestInfo>),
}

impl PartitionKey {
    pub fn for_request(
        strategy: PartitionStrategy,
        subject: Option<&Subject>,
        request: Option<&RequestInfo>,
    ) -> Self {
        match strategy {
            PartitionStrategy::None => PartitionKey::Unpartitioned,
            PartitionStrategy::BySubject => PartitionKey::Subject(subject.cloned()),
            PartitionStrategy::ByRequestInfo => PartitionKey::RequestInfo(request.cloned()),
            PartitionStrategy::BySubjectAndRequestInfo => {
                PartitionKey::Both(subject.cloned(), request.cloned())
            }
        }
    }
}

pub struct PartitionedPoolInterceptor {
    name: String,
    strategy: PartitionStrategy,
    next: Arc<dyn ConnectionInterceptor>,
    factory: Arc<dyn ResourceFactory>,
    config: Mutex<PoolConfig>,
    timer: MaintenanceTimer,
    partitions: Mutex<HashMap<PartitionKey, Arc<SinglePoolInterceptor>>>,
    destroyed: AtomicBool,
}

impl PartitionedPoolInterceptor {
    pub fn new(
        next: Arc<dyn ConnectionInterceptor>,
        factory: Arc<dyn ResourceFactory>,
        config: &PoolConfig,
        timer: MaintenanceTimer,
        name: impl Into<String>,
    ) -> Self {
        let name = name.into();
        info!(pool = %name, strategy = ?config.partition, "partitioned connection pool created");
        Self {
            name,
            strategy: config.partition,
            next,
            factory,
            config: Mutex::new(config.clone()),
            timer,
            partitions: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn strategy(&self) -> PartitionStrategy {
        self.strategy
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.lock().len()
    }

    fn partition(&self, key: PartitionKey) -> TransxResult<Arc<SinglePoolInterceptor>> {
        let mut partitions = self.partitions.lock();
        if self.destroyed.load(Ordering::Acquire) {
            return Err(TransxError::PoolDestroyed);
        }
        let index = partitions.len();
        let pool = partitions.entry(key).or_insert_with(|| {
            let config = self.config.lock().clone();
            debug!(pool = %self.name, partition = index, "creating partition");
            SinglePoolInterceptor::new(
                Arc::clone(&self.next),
                Arc::clone(&self.factory),
                &config,
                self.timer.clone(),
                format!("{}#{}", self.name, index),
            )
        });
        Ok(Arc::clone(pool))
    }

    fn snapshot(&self) -> Vec<Arc<SinglePoolInterceptor>> {
        self.partitions.lock().values().cloned().collect()
    }
}

#[async_trait]
impl ConnectionInterceptor for PartitionedPoolInterceptor {
    async fn get_connection(&self, info: &mut ConnectionInfo) -> TransxResult<()> {
        if info.mci.connection.is_some() {
            return Ok(());
        }
        let key = PartitionKey::for_request(self.strategy, info.mci.subject(), info.mci.request_info());
        let pool = self.partition(key)?;
        pool.get_connection(info).await
    }

    async fn return_connection(&self, info: ConnectionInfo, action: ReturnAction) {
        let key = PartitionKey::for_request(self.strategy, info.mci.subject(), info.mci.request_info());
        let pool = self.partitions.lock().get(&key).cloned();
        match pool {
            Some(pool) => pool.return_connection(info, action).await,
            None => self.next.return_connection(info, ReturnAction::Destroy).await,
        }
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let partitions: Vec<_> = self.partitions.lock().drain().map(|(_, pool)| pool).collect();
        for pool in &partitions {
            pool.shutdown().await;
        }
        info!(pool = %self.name, partitions = partitions.len(), "partitioned connection pool destroyed");
        self.next.destroy().await;
    }

    fn info(&self, out: &mut String) {
        let max_size = self.config.lock().max_size;
        let _ = writeln!(
            out,
            "PartitionedPoolInterceptor: pool={} strategy={:?} partitions={} max_per_partition={}",
            self.name,
            self.strategy,
            self.partition_count(),
            max_size
        );
        self.next.info(out);
    }
}

#[async_trait]
impl PoolingInterceptor for PartitionedPoolInterceptor {
    async fn counts(&self) -> PoolCounts {
        let partitions = self.snapshot();
        let mut counts = PoolCounts {
            partitions: partitions.len(),
            ..PoolCounts::default()
        };
        for pool in partitions {
            let c = pool.counts().await;
            counts.idle += c.idle;
            counts.total += c.total;
        }
        counts
    }

    async fn set_max_size(&self, max_size: usize) -> TransxResult<()> {
        if max_size == 0 {
            return Err(TransxError::InvalidArgument(
                "max size must be greater than zero".into(),
            ));
        }
        if self.destroyed.load(Ordering::Acquire) {
            return Err(TransxError::PoolDestroyed);
        }
        {
            let mut config = self.config.lock();
            config.max_size = max_size;
            config.min_size = config.min_size.min(max_size);
        }
        for pool in self.snapshot() {
            pool.set_max_size(max_size).await?;
        }
        Ok(())
    }

    async fn remove_idle(&self, id: ConnectionId) -> bool {
        for pool in self.snapshot() {
            if pool.remove_idle(id).await {
                return true;
            }
        }
        false
    }

    async fn evict_expired(&self) {
        for pool in self.snapshot() {
            pool.evict_expired().await;
        }
    }
}
