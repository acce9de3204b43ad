//! transx-pool: transactional connection pooling.
//!
//! Borrowers get a [`ConnectionHandle`] from a [`ConnectionManager`]; the
//! handle binds lazily to a pooled [`ManagedConnection`] through an
//! interceptor chain:
//! - **handle**: lazy-association handles and the [`LazyAssociator`] seam
//! - **managed**: per-connection lifecycle, events and the exclusion lock
//! - **xa_proxy**: transaction-boundary tracking and local-transaction XA
//! - **interceptor**: the chain stages (handle binding, match-all and
//!   partitioned pools, XA insertion, factory leaf)
//! - **maintenance**: background eviction, validation and fill tasks
//! - **manager**: the inbound API (`borrow`, `return_connection`,
//!   `shrink_to`, `destroy_all`, `stats`)
//! - **resource**: what a resource adapter implements

pub mod handle;
pub mod info;
pub mod interceptor;
pub mod maintenance;
pub mod managed;
pub mod manager;
pub mod resource;
pub mod xa_proxy;

#[cfg(test)]
mod testing;

pub use handle::{ConnectionHandle, HandleId, LazyAssociator};
pub use info::{ConnectionId, ConnectionInfo, ManagedConnectionInfo, ReturnAction};
pub use interceptor::{ConnectionInterceptor, PoolCounts, PoolingInterceptor};
pub use maintenance::MaintenanceTimer;
pub use managed::{ConnectionEvent, ConnectionEventKind, ConnectionEventListener, ManagedConnection};
pub use manager::{ConnectionManager, PoolStats};
pub use resource::{ErrorListener, PhysicalConnection, ResourceFactory};
pub use xa_proxy::{LocalTransaction, LocalXaResource, XaResourceProxy};

pub use transx_core::{
    Credential, PartitionStrategy, PoolConfig, RequestInfo, Subject, TransxError, TransxResult,
};
