use std::sync::Arc;

use async_trait::async_trait;
use serde_yaml::Value as YamlValue;

use super::BuildContext;
use crate::cluster::bind_meeting_frontend;
use crate::core::{GatewayResult, Next, RequestContext, RequestMiddleware};
use crate::protocol::{Request, Response};
use crate::store::Store;

pub const MIDDLEWARE_NAME: &str = "bind_meeting_frontend";

pub fn create_bind_frontend_middleware(
    ctx: &BuildContext,
    _: &YamlValue,
) -> GatewayResult<Arc<dyn RequestMiddleware>> {
    Ok(Arc::new(BindMeetingFrontend {
        store: ctx.router.cluster().store().clone(),
    }))
}

/// Binds the meetings a request names to the requesting frontend.
/// A meeting owned by another frontend fails the request.
pub struct BindMeetingFrontend {
    store: Arc<dyn Store>,
}

#[async_trait]
impl RequestMiddleware for BindMeetingFrontend {
    fn name(&self) -> &'static str {
        MIDDLEWARE_NAME
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        req: Request,
        next: Next<'_>,
    ) -> GatewayResult<Response> {
        let Some(meeting_ids) = req.params.meeting_ids() else {
            return next.run(ctx, req).await;
        };
        let frontend = ctx.frontend()?;
        for meeting_id in &meeting_ids {
            bind_meeting_frontend(self.store.as_ref(), meeting_id, frontend).await?;
        }
        next.run(ctx, req).await
    }
}
