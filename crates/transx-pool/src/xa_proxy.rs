//! Transaction branch adapters handed to an external transaction manager.
//!
//! [`XaResourceProxy`] wraps a connection's branch interface and keeps the
//! managed-transaction flag in step with `start`/`end`/`forget`, holding the
//! connection's exclusion lock so those calls never interleave with an
//! application call on the same connection. [`LocalXaResource`] presents a
//! connection that only has local transactions as a one-phase XA branch.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use transx_core::xa::{XAER_INVAL, XAER_NOTA, XAER_PROTO, XAER_RMERR};
use transx_core::{TransxError, TransxResult, XaError, XaFlags, XaResource, XaResult, Xid};

use crate::managed::{ConnectionEventKind, Exclusion, ManagedConnection};

pub struct XaResourceProxy {
    inner: Arc<dyn XaResource>,
    exclusion: Arc<Exclusion>,
}

impl XaResourceProxy {
    pub fn new(inner: Arc<dyn XaResource>, exclusion: Arc<Exclusion>) -> Self {
        Self { inner, exclusion }
    }
}

#[async_trait]
impl XaResource for XaResourceProxy {
    async fn start(&self, xid: &Xid, flags: XaFlags) -> XaResult<()> {
        let _guard = self.exclusion.lock().await;
        let result = self.inner.start(xid, flags).await;
        self.exclusion.set_in_managed_transaction(true);
        trace!(%xid, ok = result.is_ok(), "xa start");
        result
    }

    async fn end(&self, xid: &Xid, flags: XaFlags) -> XaResult<()> {
        let _guard = self.exclusion.lock().await;
        let result = self.inner.end(xid, flags).await;
        self.exclusion.set_in_managed_transaction(false);
        trace!(%xid, ok = result.is_ok(), "xa end");
        result
    }

    async fn prepare(&self, xid: &Xid) -> XaResult<i32> {
        self.inner.prepare(xid).await
    }

    async fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()> {
        self.inner.commit(xid, one_phase).await
    }

    async fn rollback(&self, xid: &Xid) -> XaResult<()> {
        self.inner.rollback(xid).await
    }

    async fn forget(&self, xid: &Xid) -> XaResult<()> {
        let _guard = self.exclusion.lock().await;
        let result = self.inner.forget(xid).await;
        self.exclusion.set_in_managed_transaction(false);
        result
    }

    async fn recover(&self, flags: XaFlags) -> XaResult<Vec<Xid>> {
        self.inner.recover(flags).await
    }

    fn resource_manager_name(&self) -> &str {
        self.inner.resource_manager_name()
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> XaResult<bool> {
        if std::ptr::addr_eq(self as *const Self, other as *const dyn XaResource) {
            return Ok(true);
        }
        self.inner.is_same_rm(other)
    }

    async fn transaction_timeout(&self) -> XaResult<u32> {
        self.inner.transaction_timeout().await
    }

    async fn set_transaction_timeout(&self, seconds: u32) -> XaResult<bool> {
        self.inner.set_transaction_timeout(seconds).await
    }
}

/// Local (single-resource) transaction control of a managed connection.
///
/// Commit and rollback hold the connection's exclusion lock and only reach
/// the session when it runs in transacted mode.
#[derive(Clone)]
pub struct LocalTransaction {
    connection: Weak<ManagedConnection>,
}

impl LocalTransaction {
    pub(crate) fn new(connection: Weak<ManagedConnection>) -> Self {
        Self { connection }
    }

    fn connection(&self) -> TransxResult<Arc<ManagedConnection>> {
        self.connection
            .upgrade()
            .ok_or_else(|| TransxError::IllegalState("managed connection is gone".into()))
    }

    pub async fn begin(&self) -> TransxResult<()> {
        let mc = self.connection()?;
        mc.physical().begin().await?;
        mc.emit(ConnectionEventKind::LocalTransactionStarted).await;
        Ok(())
    }

    pub async fn commit(&self) -> TransxResult<()> {
        let mc = self.connection()?;
        {
            let _guard = mc.exclusion().lock().await;
            if mc.physical().is_transacted() {
                mc.physical().commit().await.map_err(|e| {
                    TransxError::Resource(format!("could not commit local transaction: {e}"))
                })?;
            }
        }
        mc.emit(ConnectionEventKind::LocalTransactionCommitted).await;
        Ok(())
    }

    pub async fn rollback(&self) -> TransxResult<()> {
        let mc = self.connection()?;
        {
            let _guard = mc.exclusion().lock().await;
            if mc.physical().is_transacted() {
                mc.physical().rollback().await.map_err(|e| {
                    TransxError::Resource(format!("could not rollback local transaction: {e}"))
                })?;
            }
        }
        mc.emit(ConnectionEventKind::LocalTransactionRolledBack).await;
        Ok(())
    }
}

/// One-phase XA branch backed by a [`LocalTransaction`].
pub struct LocalXaResource {
    transaction: LocalTransaction,
    name: String,
    current: Mutex<Option<Xid>>,
}

impl LocalXaResource {
    pub fn new(transaction: LocalTransaction, name: String) -> Self {
        Self {
            transaction,
            name,
            current: Mutex::new(None),
        }
    }

    fn check_current(&self, xid: &Xid) -> XaResult<()> {
        if self.current.lock().as_ref() == Some(xid) {
            Ok(())
        } else {
            Err(XaError::new(XAER_NOTA, format!("{xid} is not the active branch")))
        }
    }
}

#[async_trait]
impl XaResource for LocalXaResource {
    async fn start(&self, xid: &Xid, flags: XaFlags) -> XaResult<()> {
        if flags == XaFlags::TMNOFLAGS {
            {
                let mut current = self.current.lock();
                if let Some(active) = current.as_ref() {
                    return Err(XaError::new(
                        XAER_PROTO,
                        format!("already enlisted in {active}"),
                    ));
                }
                *current = Some(xid.clone());
            }
            if let Err(e) = self.transaction.begin().await {
                *self.current.lock() = None;
                return Err(XaError::new(XAER_RMERR, format!("could not begin local transaction: {e}")));
            }
            Ok(())
        } else if flags.contains(XaFlags::TMJOIN) || flags.contains(XaFlags::TMRESUME) {
            self.check_current(xid)
        } else {
            Err(XaError::new(XAER_INVAL, format!("unsupported start flags {flags:?}")))
        }
    }

    async fn end(&self, xid: &Xid, _flags: XaFlags) -> XaResult<()> {
        self.check_current(xid)
    }

    async fn prepare(&self, _xid: &Xid) -> XaResult<i32> {
        Err(XaError::new(XAER_PROTO, "cannot prepare a local transaction"))
    }

    async fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()> {
        self.check_current(xid)?;
        if !one_phase {
            return Err(XaError::new(
                XAER_PROTO,
                "two-phase commit is not supported on a local transaction",
            ));
        }
        let result = self.transaction.commit().await;
        *self.current.lock() = None;
        result.map_err(|e| XaError::new(XAER_RMERR, e.to_string()))
    }

    async fn rollback(&self, xid: &Xid) -> XaResult<()> {
        self.check_current(xid)?;
        let result = self.transaction.rollback().await;
        *self.current.lock() = None;
        result.map_err(|e| XaError::new(XAER_RMERR, e.to_string()))
    }

    async fn forget(&self, _xid: &Xid) -> XaResult<()> {
        *self.current.lock() = None;
        Ok(())
    }

    async fn recover(&self, _flags: XaFlags) -> XaResult<Vec<Xid>> {
        Ok(Vec::new())
    }

    fn resource_manager_name(&self) -> &str {
        &self.name
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> XaResult<bool> {
        Ok(std::ptr::addr_eq(self as *const Self, other as *const dyn XaResource))
    }

    async fn transaction_timeout(&self) -> XaResult<u32> {
        Ok(0)
    }

    async fn set_transaction_timeout(&self, _seconds: u32) -> XaResult<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::resource::ResourceFactory;
    use crate::testing::{MockFactory, RecordingListener};

    fn xid(gtrid: &[u8]) -> Xid {
        Xid::new(1, gtrid.to_vec(), b"branch".to_vec()).unwrap()
    }

    async fn open(factory: Arc<MockFactory>) -> Arc<ManagedConnection> {
        let factory: Arc<dyn ResourceFactory> = factory;
        ManagedConnection::open(&factory, None, None, None).await.unwrap()
    }

    #[tokio::test]
    async fn start_and_end_track_managed_transaction() {
        let factory = Arc::new(MockFactory::new().with_xa());
        let mc = open(factory.clone()).await;
        let xa = mc.xa_resource();
        let tx = xid(b"tx-1");

        xa.start(&tx, XaFlags::TMNOFLAGS).await.unwrap();
        assert!(mc.in_managed_transaction());
        xa.end(&tx, XaFlags::TMSUCCESS).await.unwrap();
        assert!(!mc.in_managed_transaction());

        let native = factory.last_physical().unwrap().xa().unwrap();
        assert_eq!(native.calls(), vec!["start", "end"]);
    }

    #[tokio::test]
    async fn flag_is_set_even_when_start_fails() {
        let factory = Arc::new(MockFactory::new().with_xa());
        let mc = open(factory.clone()).await;
        factory.last_physical().unwrap().xa().unwrap().fail_next_start();

        let err = mc.xa_resource().start(&xid(b"tx"), XaFlags::TMNOFLAGS).await.unwrap_err();
        assert_eq!(err.code(), XAER_RMERR);
        assert!(mc.in_managed_transaction());
    }

    #[tokio::test]
    async fn forget_leaves_managed_transaction() {
        let factory = Arc::new(MockFactory::new().with_xa());
        let mc = open(factory).await;
        let xa = mc.xa_resource();
        xa.start(&xid(b"tx"), XaFlags::TMNOFLAGS).await.unwrap();
        xa.forget(&xid(b"tx")).await.unwrap();
        assert!(!mc.in_managed_transaction());
    }

    #[tokio::test]
    async fn start_waits_for_application_lock() {
        let factory = Arc::new(MockFactory::new().with_xa());
        let mc = open(factory).await;
        let xa = mc.xa_resource();

        let app_guard = mc.exclusion().try_lock().await.unwrap();
        let pending = tokio::spawn({
            let xa = Arc::clone(&xa);
            async move { xa.start(&xid(b"tx"), XaFlags::TMNOFLAGS).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!pending.is_finished());
        assert!(!mc.in_managed_transaction());

        drop(app_guard);
        pending.await.unwrap().unwrap();
        assert!(mc.in_managed_transaction());
    }

    #[tokio::test]
    async fn completion_calls_do_not_take_the_lock() {
        let factory = Arc::new(MockFactory::new().with_xa());
        let mc = open(factory).await;
        let xa = mc.xa_resource();
        let _held = mc.exclusion().lock().await;

        let vote = tokio::time::timeout(Duration::from_millis(100), xa.prepare(&xid(b"tx")))
            .await
            .expect("prepare must not wait for the connection lock")
            .unwrap();
        assert_eq!(vote, transx_core::xa::XA_OK);
        tokio::time::timeout(Duration::from_millis(100), xa.commit(&xid(b"tx"), false))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn proxy_is_same_rm_as_itself() {
        let factory = Arc::new(MockFactory::new());
        let a = open(factory.clone()).await.xa_resource();
        let b = open(factory).await.xa_resource();
        assert!(a.is_same_rm(a.as_ref()).unwrap());
        assert!(!a.is_same_rm(b.as_ref()).unwrap());
    }

    #[tokio::test]
    async fn local_branch_commits_one_phase() {
        let factory = Arc::new(MockFactory::new().transacted());
        let mc = open(factory.clone()).await;
        let listener = Arc::new(RecordingListener::default());
        mc.add_listener(listener.clone());
        let xa = mc.xa_resource();
        let tx = xid(b"local");

        xa.start(&tx, XaFlags::TMNOFLAGS).await.unwrap();
        xa.end(&tx, XaFlags::TMSUCCESS).await.unwrap();
        xa.commit(&tx, true).await.unwrap();

        let physical = factory.last_physical().unwrap();
        assert_eq!(physical.begins(), 1);
        assert_eq!(physical.commits(), 1);
        assert_eq!(listener.local_events(), 2);

        // branch is released, a new one may start
        xa.start(&xid(b"next"), XaFlags::TMNOFLAGS).await.unwrap();
    }

    #[tokio::test]
    async fn local_branch_rejects_protocol_violations() {
        let factory = Arc::new(MockFactory::new().transacted());
        let mc = open(factory).await;
        let xa = mc.xa_resource();
        let tx = xid(b"a");

        xa.start(&tx, XaFlags::TMNOFLAGS).await.unwrap();
        let code = |r: XaResult<()>| r.unwrap_err().code();

        assert_eq!(code(xa.start(&xid(b"b"), XaFlags::TMNOFLAGS).await), XAER_PROTO);
        assert_eq!(code(xa.start(&xid(b"b"), XaFlags::TMJOIN).await), XAER_NOTA);
        assert_eq!(code(xa.start(&xid(b"b"), XaFlags::TMRESUME).await), XAER_NOTA);
        assert_eq!(code(xa.start(&tx, XaFlags::TMSUSPEND).await), XAER_INVAL);
        assert_eq!(code(xa.end(&xid(b"b"), XaFlags::TMSUCCESS).await), XAER_NOTA);
        assert_eq!(xa.prepare(&tx).await.unwrap_err().code(), XAER_PROTO);
        assert_eq!(code(xa.commit(&tx, false).await), XAER_PROTO);

        xa.start(&tx, XaFlags::TMJOIN).await.unwrap();
        xa.rollback(&tx).await.unwrap();
        assert!(xa.recover(XaFlags::TMSTARTRSCAN).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_commit_skips_non_transacted_session() {
        let factory = Arc::new(MockFactory::new());
        let mc = open(factory.clone()).await;
        mc.local_transaction().commit().await.unwrap();
        mc.local_transaction().rollback().await.unwrap();
        let physical = factory.last_physical().unwrap();
        assert_eq!(physical.commits(), 0);
        assert_eq!(physical.rollbacks(), 0);
    }

    #[tokio::test]
    async fn failed_local_commit_maps_to_rmerr() {
        let factory = Arc::new(MockFactory::new().transacted());
        let mc = open(factory.clone()).await;
        let xa = mc.xa_resource();
        let tx = xid(b"tx");
        xa.start(&tx, XaFlags::TMNOFLAGS).await.unwrap();
        factory.last_physical().unwrap().fail_commits();

        assert_eq!(xa.commit(&tx, true).await.unwrap_err().code(), XAER_RMERR);
        // branch is cleared regardless
        assert_eq!(xa.end(&tx, XaFlags::TMSUCCESS).await.unwrap_err().code(), XAER_NOTA);
    }
}
