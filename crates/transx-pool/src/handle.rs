//! Application-facing connection handle with lazy association.
//!
//! A handle starts unassociated (or is detached when its connection goes
//! back to the pool) and binds to a managed connection on the first
//! operation that needs one. Closing is idempotent; a closed handle
//! refuses every further operation with [`TransxError::AlreadyClosed`].

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use transx_core::{RequestInfo, Subject, TransxError, TransxResult};

use crate::info::ConnectionId;
use crate::managed::ManagedConnection;
use crate::resource::PhysicalConnection;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl HandleId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        HandleId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}

/// Binds an unassociated handle to a managed connection.
#[async_trait]
pub trait LazyAssociator: Send + Sync {
    async fn associate(&self, handle: &ConnectionHandle) -> TransxResult<()>;
}

pub(crate) struct HandleShared {
    id: HandleId,
    associator: Option<Arc<dyn LazyAssociator>>,
    subject: Option<Subject>,
    request: Option<RequestInfo>,
    connection: Mutex<Option<Arc<ManagedConnection>>>,
    closed: AtomicBool,
    // Serializes close against association.
    close_lock: tokio::sync::Mutex<()>,
}

impl HandleShared {
    /// Drop the association if it still points at `from`.
    pub(crate) fn detach(&self, from: ConnectionId, close: bool) {
        let mut connection = self.connection.lock();
        if connection.as_ref().is_some_and(|mc| mc.id() == from) {
            *connection = None;
        }
        if close {
            self.closed.store(true, Ordering::Release);
        }
    }
}

#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<HandleShared>,
}

impl ConnectionHandle {
    /// A handle that associates through `associator` on first use.
    pub fn new(
        subject: Option<Subject>,
        request: Option<RequestInfo>,
        associator: Option<Arc<dyn LazyAssociator>>,
    ) -> Self {
        Self {
            shared: Arc::new(HandleShared {
                id: HandleId::next(),
                associator,
                subject,
                request,
                connection: Mutex::new(None),
                closed: AtomicBool::new(false),
                close_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.shared.id
    }

    pub fn subject(&self) -> Option<&Subject> {
        self.shared.subject.as_ref()
    }

    pub fn request_info(&self) -> Option<&RequestInfo> {
        self.shared.request.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn is_associated(&self) -> bool {
        self.shared.connection.lock().is_some()
    }

    /// Id of the managed connection currently bound, if any.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.shared.connection.lock().as_ref().map(|mc| mc.id())
    }

    /// The bound managed connection, associating lazily if needed.
    pub async fn managed_connection(&self) -> TransxResult<Arc<ManagedConnection>> {
        if self.is_closed() {
            return Err(TransxError::AlreadyClosed);
        }
        if let Some(mc) = self.current() {
            return Ok(mc);
        }
        let associator = self.shared.associator.clone().ok_or_else(|| {
            TransxError::IllegalState("handle has no connection manager to associate with".into())
        })?;
        self.associate_with(associator.as_ref()).await
    }

    /// Bind the handle through `associator` unless it is already bound.
    pub async fn associate_with(
        &self,
        associator: &dyn LazyAssociator,
    ) -> TransxResult<Arc<ManagedConnection>> {
        let _guard = self.shared.close_lock.lock().await;
        if self.is_closed() {
            return Err(TransxError::AlreadyClosed);
        }
        if let Some(mc) = self.current() {
            return Ok(mc);
        }
        associator.associate(self).await?;
        self.current().ok_or_else(|| {
            TransxError::IllegalState("failed lazy association with a managed connection".into())
        })
    }

    /// Run `op` against the physical connection under the connection lock.
    ///
    /// A fatal error from `op` is reported to the managed connection so the
    /// pool evicts it; the error is returned to the caller either way.
    pub async fn execute<F, Fut, T>(&self, op: F) -> TransxResult<T>
    where
        F: FnOnce(Arc<dyn PhysicalConnection>) -> Fut,
        Fut: Future<Output = TransxResult<T>>,
    {
        let mc = self.managed_connection().await?;
        let guard = mc.exclusion().try_lock().await?;
        if self.is_closed() {
            return Err(TransxError::AlreadyClosed);
        }
        let result = op(Arc::clone(mc.physical())).await;
        drop(guard);

        if let Err(error) = &result {
            mc.connection_error(error).await;
        }
        result
    }

    /// Close the handle. Only the first call notifies the connection.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        let _guard = self.shared.close_lock.lock().await;
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mc = self.shared.connection.lock().take();
        if let Some(mc) = mc {
            mc.connection_closed(self.id()).await;
        }
    }

    /// Release the managed connection but keep the handle usable.
    ///
    /// The next operation associates again, possibly with a different
    /// managed connection.
    pub async fn dissociate(&self) -> TransxResult<()> {
        let _guard = self.shared.close_lock.lock().await;
        if self.is_closed() {
            return Err(TransxError::AlreadyClosed);
        }
        let mc = self.shared.connection.lock().take();
        if let Some(mc) = mc {
            mc.connection_closed(self.id()).await;
        }
        Ok(())
    }

    fn current(&self) -> Option<Arc<ManagedConnection>> {
        self.shared.connection.lock().clone()
    }

    pub(crate) fn attach(&self, mc: Arc<ManagedConnection>) {
        *self.shared.connection.lock() = Some(mc);
    }

    pub(crate) fn detach(&self, from: ConnectionId, close: bool) {
        self.shared.detach(from, close);
    }

    pub(crate) fn downgrade(&self) -> Weak<HandleShared> {
        Arc::downgrade(&self.shared)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("connection", &self.connection_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
