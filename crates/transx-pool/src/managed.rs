//! Managed connection: one physical connection plus its pooling and
//! transactional state.
//!
//! Lifecycle: created by the factory stage, then alternating between
//! checked out and idle in a pool, until destroyed. `destroy` is
//! idempotent. `cleanup` runs on every return to the pool and replaces
//! the exclusion lock, so a borrower that was detached mid-operation can
//! never leave the next borrower waiting on a stuck lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use transx_core::{Credential, RequestInfo, Subject, TransxError, TransxResult, XaResource};

use crate::handle::{ConnectionHandle, HandleId, HandleShared};
use crate::info::ConnectionId;
use crate::resource::{PhysicalConnection, ResourceFactory};
use crate::xa_proxy::{LocalTransaction, LocalXaResource, XaResourceProxy};

/// Per-connection lock serializing transaction-boundary calls against
/// application calls, plus the "inside a managed transaction" flag.
pub struct Exclusion {
    lock: Mutex<Arc<tokio::sync::Mutex<()>>>,
    in_managed_tx: AtomicBool,
    timeout: Option<Duration>,
}

impl Exclusion {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            lock: Mutex::new(Arc::new(tokio::sync::Mutex::new(()))),
            in_managed_tx: AtomicBool::new(false),
            timeout,
        }
    }

    /// Wait for the lock without a bound.
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        let current = self.lock.lock().clone();
        current.lock_owned().await
    }

    /// Wait for the lock, bounded by the configured lock timeout.
    pub async fn try_lock(&self) -> TransxResult<OwnedMutexGuard<()>> {
        let current = self.lock.lock().clone();
        match self.timeout {
            None => Ok(current.lock_owned().await),
            Some(limit) => tokio::time::timeout(limit, current.lock_owned())
                .await
                .map_err(|_| {
                    TransxError::AllocationTimeout(format!("unable to obtain connection lock in {limit:?}"))
                }),
        }
    }

    pub fn in_managed_transaction(&self) -> bool {
        self.in_managed_tx.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_managed_transaction(&self, value: bool) {
        self.in_managed_tx.store(value, Ordering::Release);
    }

    /// Swap in a fresh lock and leave the managed transaction.
    pub(crate) fn reset(&self) {
        *self.lock.lock() = Arc::new(tokio::sync::Mutex::new(()));
        self.in_managed_tx.store(false, Ordering::Release);
    }
}

/// What happened to a managed connection.
#[derive(Debug, Clone)]
pub enum ConnectionEventKind {
    /// An application handle was closed or dissociated.
    Closed { handle: HandleId },
    /// The physical connection failed; the pool must not reuse it.
    ErrorOccurred { error: TransxError },
    LocalTransactionStarted,
    LocalTransactionCommitted,
    LocalTransactionRolledBack,
}

#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub connection: Arc<ManagedConnection>,
    pub kind: ConnectionEventKind,
}

#[async_trait]
pub trait ConnectionEventListener: Send + Sync {
    async fn connection_event(&self, event: &ConnectionEvent);
}

pub struct ManagedConnection {
    id: ConnectionId,
    factory_name: String,
    credential: Credential,
    default_credential: Option<Credential>,
    request: Option<RequestInfo>,
    physical: Arc<dyn PhysicalConnection>,
    exclusion: Arc<Exclusion>,
    handles: Mutex<HashMap<HandleId, Weak<HandleShared>>>,
    listeners: Mutex<Vec<Arc<dyn ConnectionEventListener>>>,
    destroyed: AtomicBool,
    broken: AtomicBool,
    xa_resource: OnceLock<Arc<dyn XaResource>>,
    this: Weak<ManagedConnection>,
}

impl ManagedConnection {
    /// Open a physical connection for the given subject and request.
    pub async fn open(
        factory: &Arc<dyn ResourceFactory>,
        subject: Option<&Subject>,
        request: Option<&RequestInfo>,
        lock_timeout: Option<Duration>,
    ) -> TransxResult<Arc<Self>> {
        let default_credential = factory.default_credential();
        let credential = Credential::resolve(subject, request, default_credential.as_ref());
        let physical = factory.create(&credential, request).await?;

        let mc = Arc::new_cyclic(|this| ManagedConnection {
            id: ConnectionId::next(),
            factory_name: factory.name().to_string(),
            credential,
            default_credential,
            request: request.cloned(),
            physical,
            exclusion: Arc::new(Exclusion::new(lock_timeout)),
            handles: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            xa_resource: OnceLock::new(),
            this: this.clone(),
        });
        mc.install_error_listener();

        debug!(
            connection_id = %mc.id,
            factory = %mc.factory_name,
            user = mc.credential.user_name().unwrap_or("<default>"),
            "opened physical connection"
        );
        Ok(mc)
    }

    fn install_error_listener(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let this = self.this.clone();
        self.physical.set_error_listener(Some(Arc::new(move |error: TransxError| {
            if let Some(mc) = this.upgrade() {
                runtime.spawn(async move {
                    mc.notify_error(error).await;
                });
            }
        })));
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn factory_name(&self) -> &str {
        &self.factory_name
    }

    /// Credential the physical connection was opened with.
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn request_info(&self) -> Option<&RequestInfo> {
        self.request.as_ref()
    }

    pub fn physical(&self) -> &Arc<dyn PhysicalConnection> {
        &self.physical
    }

    pub fn exclusion(&self) -> &Arc<Exclusion> {
        &self.exclusion
    }

    pub fn in_managed_transaction(&self) -> bool {
        self.exclusion.in_managed_transaction()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Whether the physical connection reported a fatal error.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub fn has_handles(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        self.listeners.lock().push(listener);
    }

    /// Bind an application handle to this connection.
    ///
    /// The handle's principal must resolve to the user this connection was
    /// opened for; pooled connections are never re-authenticated.
    pub(crate) fn associate_handle(&self, handle: &ConnectionHandle) -> TransxResult<()> {
        let requested = Credential::resolve(
            handle.subject(),
            handle.request_info(),
            self.default_credential.as_ref(),
        );
        self.credential.check_reuse(&requested)?;

        if self.is_destroyed() {
            return Err(TransxError::IllegalState(format!(
                "managed connection {} is already destroyed",
                self.id
            )));
        }
        let this = self.this.upgrade().ok_or_else(|| {
            TransxError::IllegalState(format!("managed connection {} is gone", self.id))
        })?;

        self.handles.lock().insert(handle.id(), handle.downgrade());
        handle.attach(this);
        Ok(())
    }

    /// Forget a handle without emitting an event.
    pub(crate) fn release_handle(&self, handle: &ConnectionHandle) {
        if self.handles.lock().remove(&handle.id()).is_some() {
            handle.detach(self.id, false);
        }
    }

    /// A handle let go of this connection.
    pub(crate) async fn connection_closed(&self, handle: HandleId) {
        let removed = self.handles.lock().remove(&handle).is_some();
        if removed {
            self.emit(ConnectionEventKind::Closed { handle }).await;
        }
    }

    /// Route an error raised while using the connection.
    ///
    /// Only errors the physical connection classifies as fatal evict it.
    pub async fn connection_error(&self, error: &TransxError) {
        if self.physical.is_fatal(error) {
            self.notify_error(error.clone()).await;
        }
    }

    /// Report a fatal physical failure to the listeners, once.
    pub async fn notify_error(&self, error: TransxError) {
        if self.broken.swap(true, Ordering::AcqRel) {
            return;
        }
        // Detach first so the physical layer cannot re-enter us.
        self.physical.set_error_listener(None);
        warn!(connection_id = %self.id, error = %error, "physical connection failed");
        self.emit(ConnectionEventKind::ErrorOccurred { error }).await;
    }

    pub(crate) async fn emit(&self, kind: ConnectionEventKind) {
        let Some(connection) = self.this.upgrade() else {
            return;
        };
        let listeners = self.listeners.lock().clone();
        let event = ConnectionEvent { connection, kind };
        for listener in listeners {
            listener.connection_event(&event).await;
        }
    }

    /// Prepare the connection for the next borrower.
    pub async fn cleanup(&self) -> TransxResult<()> {
        if self.is_destroyed() {
            return Ok(());
        }
        self.detach_handles(false);
        let result = self.physical.cleanup().await;
        self.exclusion.reset();
        result
    }

    /// Close every handle and the physical connection.
    pub async fn destroy(&self) -> TransxResult<()> {
        if self
            .destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        self.physical.set_error_listener(None);
        self.detach_handles(true);
        self.listeners.lock().clear();
        debug!(connection_id = %self.id, "destroying physical connection");
        self.physical.close().await
    }

    fn detach_handles(&self, close: bool) {
        let handles: Vec<_> = self.handles.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Some(shared) = handle.upgrade() {
                shared.detach(self.id, close);
            }
        }
    }

    /// Transaction branch interface handed to an external transaction manager.
    ///
    /// Native branches are proxied; connections without one are driven
    /// through their local transaction.
    pub fn xa_resource(&self) -> Arc<dyn XaResource> {
        let resource = self.xa_resource.get_or_init(|| {
            let inner: Arc<dyn XaResource> = match self.physical.xa_resource() {
                Some(native) => native,
                None => Arc::new(LocalXaResource::new(
                    self.local_transaction(),
                    format!("{}/{}", self.factory_name, self.id),
                )),
            };
            Arc::new(XaResourceProxy::new(inner, Arc::clone(&self.exclusion)))
        });
        Arc::clone(resource)
    }

    pub fn local_transaction(&self) -> LocalTransaction {
        LocalTransaction::new(self.this.clone())
    }
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("factory", &self.factory_name)
            .field("credential", &self.credential)
            .field("handles", &self.handle_count())
            .field("destroyed", &self.is_destroyed())
            .field("broken", &self.is_broken())
            .finish()
    }
}
