//! Bookkeeping values passed along the interceptor chain.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

use transx_core::{RequestInfo, Subject, XaResource};

use crate::handle::ConnectionHandle;
use crate::managed::ManagedConnection;
use crate::resource::ResourceFactory;

/// Unique token identifying one physical connection for its whole life.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mc-{}", self.0)
    }
}

/// What the pool should do with a connection coming back down the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnAction {
    /// Keep the physical connection for reuse.
    ReturnToPool,
    /// Discard the physical connection.
    Destroy,
}

/// Everything the pool knows about one physical connection.
///
/// Owned by exactly one place at a time: the idle map of a pool, the
/// manager's checked-out map, or a [`ConnectionInfo`] in flight.
pub struct ManagedConnectionInfo {
    pub(crate) factory: Arc<dyn ResourceFactory>,
    pub(crate) subject: Option<Subject>,
    pub(crate) request: Option<RequestInfo>,
    pub(crate) connection: Option<Arc<ManagedConnection>>,
    pub(crate) last_used: Instant,
    pub(crate) xa_resource: Option<Arc<dyn XaResource>>,
}

impl ManagedConnectionInfo {
    /// A request for a connection; the pool fills in `connection`.
    pub fn new(
        factory: Arc<dyn ResourceFactory>,
        subject: Option<Subject>,
        request: Option<RequestInfo>,
    ) -> Self {
        Self {
            factory,
            subject,
            request,
            connection: None,
            last_used: Instant::now(),
            xa_resource: None,
        }
    }

    pub fn factory(&self) -> &Arc<dyn ResourceFactory> {
        &self.factory
    }

    pub fn subject(&self) -> Option<&Subject> {
        self.subject.as_ref()
    }

    pub fn request_info(&self) -> Option<&RequestInfo> {
        self.request.as_ref()
    }

    pub fn connection(&self) -> Option<&Arc<ManagedConnection>> {
        self.connection.as_ref()
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn xa_resource(&self) -> Option<&Arc<dyn XaResource>> {
        self.xa_resource.as_ref()
    }

    pub(crate) fn id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(|mc| mc.id())
    }
}

impl fmt::Debug for ManagedConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnectionInfo")
            .field("factory", &self.factory.name())
            .field("subject", &self.subject)
            .field("request", &self.request)
            .field("connection", &self.id())
            .field("enlisted", &self.xa_resource.is_some())
            .finish()
    }
}

/// One borrow request travelling down (and back up) the chain.
#[derive(Debug)]
pub struct ConnectionInfo {
    pub(crate) mci: ManagedConnectionInfo,
    pub(crate) handle: Option<ConnectionHandle>,
}

impl ConnectionInfo {
    pub fn new(mci: ManagedConnectionInfo) -> Self {
        Self { mci, handle: None }
    }

    pub fn with_handle(mci: ManagedConnectionInfo, handle: ConnectionHandle) -> Self {
        Self {
            mci,
            handle: Some(handle),
        }
    }

    pub fn managed_connection_info(&self) -> &ManagedConnectionInfo {
        &self.mci
    }

    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    /// Move the bound connection out, leaving a fresh request behind.
    pub(crate) fn take_connection(&mut self) -> ManagedConnectionInfo {
        let request = ManagedConnectionInfo::new(
            Arc::clone(&self.mci.factory),
            self.mci.subject.clone(),
            self.mci.request.clone(),
        );
        std::mem::replace(&mut self.mci, request)
    }

    pub(crate) fn into_parts(self) -> (ManagedConnectionInfo, Option<ConnectionHandle>) {
        (self.mci, self.handle)
    }
}

impl From<ManagedConnectionInfo> for ConnectionInfo {
    fn from(mci: ManagedConnectionInfo) -> Self {
        ConnectionInfo::new(mci)
    }
}
