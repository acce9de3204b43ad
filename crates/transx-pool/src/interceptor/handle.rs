//! Top stage: binds the application handle to the connection the pool
//! supplied, enforcing the no-reauthentication rule.

use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use transx_core::{TransxError, TransxResult};

use crate::info::{ConnectionInfo, ReturnAction};

use super::ConnectionInterceptor;

pub struct ConnectionHandleInterceptor {
    next: Arc<dyn ConnectionInterceptor>,
}

impl ConnectionHandleInterceptor {
    pub fn new(next: Arc<dyn ConnectionInterceptor>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl ConnectionInterceptor for ConnectionHandleInterceptor {
    async fn get_connection(&self, info: &mut ConnectionInfo) -> TransxResult<()> {
        self.next.get_connection(info).await?;
        let Some(handle) = info.handle.clone() else {
            return Ok(());
        };
        let mc = info
            .mci
            .connection
            .clone()
            .ok_or_else(|| TransxError::IllegalState("pool supplied no managed connection".into()))?;

        if let Err(e) = mc.associate_handle(&handle) {
            debug!(connection_id = %mc.id(), handle = %handle.id(), error = %e, "handle association refused");
            let refused = info.take_connection();
            self.next
                .return_connection(ConnectionInfo::new(refused), ReturnAction::ReturnToPool)
                .await;
            return Err(e);
        }
        Ok(())
    }

    async fn return_connection(&self, info: ConnectionInfo, action: ReturnAction) {
        if let (Some(handle), Some(mc)) = (&info.handle, &info.mci.connection) {
            mc.release_handle(handle);
        }
        self.next.return_connection(info, action).await;
    }

    async fn destroy(&self) {
        self.next.destroy().await;
    }

    fn info(&self, out: &mut String) {
        let _ = writeln!(out, "ConnectionHandleInterceptor");
        self.next.info(out);
    }
}
