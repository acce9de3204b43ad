//! Contracts the pool consumes from a resource adapter.
//!
//! A [`ResourceFactory`] opens [`PhysicalConnection`]s and decides which
//! pooled connections can serve a request. Everything protocol-specific
//! (driver sessions, broker sessions) lives behind these two traits.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use transx_core::{Credential, RequestInfo, Subject, TransxError, TransxResult, XaResource};

use crate::info::ConnectionId;
use crate::managed::ManagedConnection;

/// Callback a physical connection invokes when it detects an
/// asynchronous failure (broker disconnect, socket reset).
pub type ErrorListener = Arc<dyn Fn(TransxError) + Send + Sync>;

/// One physical connection to the external resource.
#[async_trait]
pub trait PhysicalConnection: Send + Sync {
    /// Native two-phase-commit branch interface, if the resource has one.
    ///
    /// Connections without one are enlisted through local transactions.
    fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        None
    }

    /// Whether the session runs in local-transaction mode.
    fn is_transacted(&self) -> bool {
        false
    }

    async fn begin(&self) -> TransxResult<()> {
        Ok(())
    }

    async fn commit(&self) -> TransxResult<()> {
        Ok(())
    }

    async fn rollback(&self) -> TransxResult<()> {
        Ok(())
    }

    /// Reset per-borrow state before the connection goes back to the pool.
    async fn cleanup(&self) -> TransxResult<()> {
        Ok(())
    }

    async fn close(&self) -> TransxResult<()>;

    /// Whether an error raised while using this connection means it can
    /// no longer be trusted and must leave the pool.
    fn is_fatal(&self, error: &TransxError) -> bool {
        matches!(error, TransxError::ConnectionError(_) | TransxError::Resource(_))
    }

    /// Install (or with `None`, remove) the asynchronous error callback.
    fn set_error_listener(&self, listener: Option<ErrorListener>);

    /// Downcast hook for adapters that need their concrete connection back.
    fn as_any(&self) -> &dyn Any;
}

/// Creates physical connections and owns the matching policy.
#[async_trait]
pub trait ResourceFactory: Send + Sync {
    /// Name used in log lines and pool descriptions.
    fn name(&self) -> &str;

    /// Credential used when neither subject nor request info names a user.
    fn default_credential(&self) -> Option<Credential> {
        None
    }

    async fn create(
        &self,
        credential: &Credential,
        request: Option<&RequestInfo>,
    ) -> TransxResult<Arc<dyn PhysicalConnection>>;

    /// Pick a pooled connection able to serve the request, if any.
    ///
    /// Called with the pool lock held, so it must not block. The default
    /// accepts a connection opened with the same resolved credential and
    /// an equal request info.
    fn match_existing(
        &self,
        candidates: &[Arc<ManagedConnection>],
        subject: Option<&Subject>,
        request: Option<&RequestInfo>,
    ) -> Option<ConnectionId> {
        let wanted = Credential::resolve(subject, request, self.default_credential().as_ref());
        candidates
            .iter()
            .find(|mc| mc.credential() == &wanted && mc.request_info() == request)
            .map(|mc| mc.id())
    }

    /// Check that a pooled connection is still usable.
    async fn validate(&self, _connection: &ManagedConnection) -> bool {
        true
    }

    /// Return the ids of the candidates that failed validation.
    async fn invalid_connections(&self, candidates: &[Arc<ManagedConnection>]) -> Vec<ConnectionId> {
        let mut invalid = Vec::new();
        for mc in candidates {
            if mc.is_broken() || !self.validate(mc).await {
                invalid.push(mc.id());
            }
        }
        invalid
    }
}
