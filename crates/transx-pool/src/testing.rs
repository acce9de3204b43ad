//! Mock resource layer shared by the unit tests.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use transx_core::xa::{XA_OK, XAER_RMERR};
use transx_core::{
    Credential, RequestInfo, Subject, TransxError, TransxResult, XaError, XaFlags, XaResource,
    XaResult, Xid,
};

use crate::info::ConnectionId;
use crate::managed::{ConnectionEvent, ConnectionEventKind, ConnectionEventListener, ManagedConnection};
use crate::resource::{ErrorListener, PhysicalConnection, ResourceFactory};

// ── Mock XA branch ──────────────────────────────────────────────────

#[derive(Default)]
pub struct MockXa {
    calls: Mutex<Vec<&'static str>>,
    fail_start: AtomicBool,
}

impl MockXa {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl XaResource for MockXa {
    async fn start(&self, _xid: &Xid, _flags: XaFlags) -> XaResult<()> {
        self.record("start");
        if self.fail_start.swap(false, Ordering::SeqCst) {
            return Err(XaError::new(XAER_RMERR, "start refused"));
        }
        Ok(())
    }

    async fn end(&self, _xid: &Xid, _flags: XaFlags) -> XaResult<()> {
        self.record("end");
        Ok(())
    }

    async fn prepare(&self, _xid: &Xid) -> XaResult<i32> {
        self.record("prepare");
        Ok(XA_OK)
    }

    async fn commit(&self, _xid: &Xid, _one_phase: bool) -> XaResult<()> {
        self.record("commit");
        Ok(())
    }

    async fn rollback(&self, _xid: &Xid) -> XaResult<()> {
        self.record("rollback");
        Ok(())
    }

    async fn forget(&self, _xid: &Xid) -> XaResult<()> {
        self.record("forget");
        Ok(())
    }

    async fn recover(&self, _flags: XaFlags) -> XaResult<Vec<Xid>> {
        Ok(Vec::new())
    }

    fn resource_manager_name(&self) -> &str {
        "mock-rm"
    }

    async fn transaction_timeout(&self) -> XaResult<u32> {
        Ok(0)
    }

    async fn set_transaction_timeout(&self, _seconds: u32) -> XaResult<bool> {
        Ok(false)
    }
}

// ── Mock physical connection ────────────────────────────────────────

pub struct MockPhysical {
    transacted: bool,
    xa: Option<Arc<MockXa>>,
    closed: Arc<AtomicUsize>,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    fail_commits: AtomicBool,
    fail_close: AtomicBool,
    listener: Mutex<Option<ErrorListener>>,
}

impl MockPhysical {
    pub fn xa(&self) -> Option<Arc<MockXa>> {
        self.xa.clone()
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn fail_commits(&self) {
        self.fail_commits.store(true, Ordering::SeqCst);
    }

    /// Make `close` fail; a failed close is not counted as closed.
    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn has_error_listener(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Simulate an asynchronous failure reported by the driver.
    pub fn fail(&self, message: &str) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(TransxError::ConnectionError(message.to_string()));
        }
    }
}

#[async_trait]
impl PhysicalConnection for MockPhysical {
    fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        self.xa.clone().map(|xa| xa as Arc<dyn XaResource>)
    }

    fn is_transacted(&self) -> bool {
        self.transacted
    }

    async fn begin(&self) -> TransxResult<()> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> TransxResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(TransxError::Resource("commit failed".into()));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> TransxResult<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> TransxResult<()> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(TransxError::Resource("close failed".into()));
        }
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_error_listener(&self, listener: Option<ErrorListener>) {
        *self.listener.lock() = listener;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── Mock factory ────────────────────────────────────────────────────

pub struct MockFactory {
    created: AtomicUsize,
    closed: Arc<AtomicUsize>,
    fail_create: AtomicBool,
    valid: AtomicBool,
    match_any: bool,
    transacted: bool,
    with_xa: bool,
    create_delay: Option<Duration>,
    physicals: Mutex<Vec<Arc<MockPhysical>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            created: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            fail_create: AtomicBool::new(false),
            valid: AtomicBool::new(true),
            match_any: false,
            transacted: false,
            with_xa: false,
            create_delay: None,
            physicals: Mutex::new(Vec::new()),
        }
    }

    /// Physical connections expose a native XA branch.
    pub fn with_xa(mut self) -> Self {
        self.with_xa = true;
        self
    }

    pub fn transacted(mut self) -> Self {
        self.transacted = true;
        self
    }

    /// Opening a connection takes `delay`.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Match any idle connection regardless of credentials.
    pub fn match_any(mut self) -> Self {
        self.match_any = true;
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    pub fn last_physical(&self) -> Option<Arc<MockPhysical>> {
        self.physicals.lock().last().cloned()
    }

    pub fn physicals(&self) -> Vec<Arc<MockPhysical>> {
        self.physicals.lock().clone()
    }
}

#[async_trait]
impl ResourceFactory for MockFactory {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create(
        &self,
        _credential: &Credential,
        _request: Option<&RequestInfo>,
    ) -> TransxResult<Arc<dyn PhysicalConnection>> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TransxError::Resource("connection refused".into()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let physical = Arc::new(MockPhysical {
            transacted: self.transacted,
            xa: self.with_xa.then(|| Arc::new(MockXa::default())),
            closed: Arc::clone(&self.closed),
            begins: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            fail_commits: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            listener: Mutex::new(None),
        });
        self.physicals.lock().push(Arc::clone(&physical));
        Ok(physical)
    }

    fn match_existing(
        &self,
        candidates: &[Arc<ManagedConnection>],
        subject: Option<&Subject>,
        request: Option<&RequestInfo>,
    ) -> Option<ConnectionId> {
        if self.match_any {
            return candidates.first().map(|mc| mc.id());
        }
        let wanted = Credential::resolve(subject, request, None);
        candidates
            .iter()
            .find(|mc| mc.credential() == &wanted && mc.request_info() == request)
            .map(|mc| mc.id())
    }

    async fn validate(&self, _connection: &ManagedConnection) -> bool {
        self.valid.load(Ordering::SeqCst)
    }
}

// ── Recording listener ──────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingListener {
    closed: AtomicUsize,
    errors: AtomicUsize,
    local: AtomicUsize,
}

impl RecordingListener {
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn local_events(&self) -> usize {
        self.local.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionEventListener for RecordingListener {
    async fn connection_event(&self, event: &ConnectionEvent) {
        let counter = match event.kind {
            ConnectionEventKind::Closed { .. } => &self.closed,
            ConnectionEventKind::ErrorOccurred { .. } => &self.errors,
            _ => &self.local,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}
