//! The connection interceptor chain.
//!
//! Each stage wraps the next. Borrow requests flow from the top stage
//! towards the factory leaf; returns and destroys flow back down the same
//! line. The stages, top to bottom:
//!
//! ```text
//! ConnectionHandleInterceptor   binds the application handle
//!   SinglePoolInterceptor       match-all idle storage, sizing, eviction
//!   | PartitionedPoolInterceptor  one single pool per partition key
//!     XaResourceInsertionInterceptor  records the branch interface
//!       FactoryInterceptor      opens and destroys physical connections
//! ```

mod factory;
mod handle;
mod partitioned;
mod single_pool;
mod xa_insertion;

use async_trait::async_trait;
use serde::Serialize;

use transx_core::TransxResult;

use crate::info::{ConnectionId, ConnectionInfo, ReturnAction};

pub use factory::FactoryInterceptor;
pub use handle::ConnectionHandleInterceptor;
pub use partitioned::{PartitionKey, PartitionedPoolInterceptor};
pub use single_pool::SinglePoolInterceptor;
pub use xa_insertion::XaResourceInsertionInterceptor;

/// One policy stage of the chain.
#[async_trait]
pub trait ConnectionInterceptor: Send + Sync {
    /// Make sure `info` carries a managed connection when this returns `Ok`.
    async fn get_connection(&self, info: &mut ConnectionInfo) -> TransxResult<()>;

    /// Take back a connection. Never fails: problems are logged and the
    /// connection destroyed.
    async fn return_connection(&self, info: ConnectionInfo, action: ReturnAction);

    /// Release everything this stage (and those below it) holds.
    async fn destroy(&self);

    /// Append a description of this stage and the ones below it.
    fn info(&self, out: &mut String);
}

/// Connection counts of a pool stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub idle: usize,
    pub total: usize,
    pub partitions: usize,
}

/// A pool stage: sizing and introspection on top of the chain contract.
#[async_trait]
pub trait PoolingInterceptor: ConnectionInterceptor {
    async fn counts(&self) -> PoolCounts;

    /// Change the maximum size at runtime, shrinking if necessary.
    async fn set_max_size(&self, max_size: usize) -> TransxResult<()>;

    /// Destroy the idle connection `id` now. `false` if it is not idle here.
    async fn remove_idle(&self, id: ConnectionId) -> bool;

    /// Run one idle-eviction sweep now.
    async fn evict_expired(&self);
}
