//! Leaf stage: opens physical connections and destroys them.

use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{trace, warn};

use transx_core::TransxResult;

use crate::info::{ConnectionInfo, ReturnAction};
use crate::managed::{ConnectionEventListener, ManagedConnection};
use crate::resource::ResourceFactory;

use super::ConnectionInterceptor;

pub struct FactoryInterceptor {
    factory: Arc<dyn ResourceFactory>,
    lock_timeout: Option<Duration>,
    listener: Option<Arc<dyn ConnectionEventListener>>,
}

impl FactoryInterceptor {
    /// `listener` is registered on every connection this stage opens.
    pub fn new(
        factory: Arc<dyn ResourceFactory>,
        lock_timeout: Option<Duration>,
        listener: Option<Arc<dyn ConnectionEventListener>>,
    ) -> Self {
        Self {
            factory,
            lock_timeout,
            listener,
        }
    }
}

#[async_trait]
impl ConnectionInterceptor for FactoryInterceptor {
    async fn get_connection(&self, info: &mut ConnectionInfo) -> TransxResult<()> {
        if info.mci.connection.is_some() {
            return Ok(());
        }
        let mc = ManagedConnection::open(
            &self.factory,
            info.mci.subject(),
            info.mci.request_info(),
            self.lock_timeout,
        )
        .await?;
        if let Some(listener) = &self.listener {
            mc.add_listener(Arc::clone(listener));
        }
        info.mci.connection = Some(mc);
        Ok(())
    }

    async fn return_connection(&self, info: ConnectionInfo, action: ReturnAction) {
        if action != ReturnAction::Destroy {
            return;
        }
        let Some(mc) = info.mci.connection() else {
            return;
        };
        // Teardown errors never stop the caller from cleaning up the rest.
        if let Err(e) = mc.destroy().await {
            warn!(connection_id = %mc.id(), error = %e, "error destroying physical connection");
        } else {
            trace!(connection_id = %mc.id(), "physical connection destroyed");
        }
    }

    async fn destroy(&self) {}

    fn info(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "FactoryInterceptor: factory={} lock_timeout={:?}",
            self.factory.name(),
            self.lock_timeout
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::ManagedConnectionInfo;
    use crate::testing::MockFactory;

    fn stage(factory: &Arc<MockFactory>) -> FactoryInterceptor {
        FactoryInterceptor::new(factory.clone(), None, None)
    }

    #[tokio::test]
    async fn opens_only_when_missing() {
        let factory = Arc::new(MockFactory::new());
        let leaf = stage(&factory);
        let mut info = ConnectionInfo::new(ManagedConnectionInfo::new(factory.clone(), None, None));

        leaf.get_connection(&mut info).await.unwrap();
        leaf.get_connection(&mut info).await.unwrap();
        assert_eq!(factory.created(), 1);
        assert!(info.managed_connection_info().connection().is_some());
    }

    #[tokio::test]
    async fn destroys_on_destroy_action_only() {
        let factory = Arc::new(MockFactory::new());
        let leaf = stage(&factory);

        let mut kept = ConnectionInfo::new(ManagedConnectionInfo::new(factory.clone(), None, None));
        leaf.get_connection(&mut kept).await.unwrap();
        leaf.return_connection(kept, ReturnAction::ReturnToPool).await;
        assert_eq!(factory.closed(), 0);

        let mut gone = ConnectionInfo::new(ManagedConnectionInfo::new(factory.clone(), None, None));
        leaf.get_connection(&mut gone).await.unwrap();
        let mc = Arc::clone(gone.managed_connection_info().connection().unwrap());
        leaf.return_connection(gone, ReturnAction::Destroy).await;
        assert_eq!(factory.closed(), 1);
        assert!(mc.is_destroyed());
    }

    #[tokio::test]
    async fn creation_failure_surfaces() {
        let factory = Arc::new(MockFactory::new());
        factory.set_fail_create(true);
        let leaf = stage(&factory);
        let mut info = ConnectionInfo::new(ManagedConnectionInfo::new(factory.clone(), None, None));
        assert!(leaf.get_connection(&mut info).await.is_err());
        assert!(info.managed_connection_info().connection().is_none());
    }
}
