//! Records the connection's transaction branch interface on the way up.

use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;

use transx_core::TransxResult;

use crate::info::{ConnectionInfo, ReturnAction};

use super::ConnectionInterceptor;

pub struct XaResourceInsertionInterceptor {
    next: Arc<dyn ConnectionInterceptor>,
}

impl XaResourceInsertionInterceptor {
    pub fn new(next: Arc<dyn ConnectionInterceptor>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl ConnectionInterceptor for XaResourceInsertionInterceptor {
    async fn get_connection(&self, info: &mut ConnectionInfo) -> TransxResult<()> {
        self.next.get_connection(info).await?;
        if info.mci.xa_resource.is_none() {
            if let Some(mc) = &info.mci.connection {
                info.mci.xa_resource = Some(mc.xa_resource());
            }
        }
        Ok(())
    }

    async fn return_connection(&self, info: ConnectionInfo, action: ReturnAction) {
        self.next.return_connection(info, action).await;
    }

    async fn destroy(&self) {
        self.next.destroy().await;
    }

    fn info(&self, out: &mut String) {
        let _ = writeln!(out, "XaResourceInsertionInterceptor");
        self.next.info(out);
    }
}
