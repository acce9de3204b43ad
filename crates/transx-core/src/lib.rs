//! transx-core: shared vocabulary for the transactional connection pool.
//!
//! Leaf types with no pooling behavior of their own:
//! - **error**: the [`TransxError`] taxonomy surfaced to borrowers
//! - **xa**: transaction branch identifiers, flags, return codes and the
//!   [`XaResource`] contract an external transaction manager drives
//! - **security**: [`Subject`], [`RequestInfo`] and [`Credential`] resolution
//! - **config**: [`PoolConfig`] parsing and validation

pub mod config;
pub mod error;
pub mod security;
pub mod xa;

pub use config::{ConfigError, PartitionStrategy, PoolConfig};
pub use error::{TransxError, TransxResult};
pub use security::{Credential, RequestInfo, Subject};
pub use xa::{XaError, XaFlags, XaResource, XaResult, Xid};
