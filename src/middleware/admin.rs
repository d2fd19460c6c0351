use std::sync::Arc;

use async_trait::async_trait;
use serde_yaml::Value as YamlValue;

use super::BuildContext;
use crate::cluster::{dispatch::dispatch_one, Router};
use crate::core::{GatewayResult, Next, RequestContext, RequestMiddleware};
use crate::protocol::{Envelope, Request, Resource, Response, ResponseBody};

pub const MIDDLEWARE_NAME: &str = "admin_handler";

/// Protocol version reported on the index resource.
pub const API_VERSION: &str = "2.0";

pub fn create_admin_handler(
    ctx: &BuildContext,
    _: &YamlValue,
) -> GatewayResult<Arc<dyn RequestMiddleware>> {
    Ok(Arc::new(AdminHandler {
        router: ctx.router.clone(),
    }))
}

/// Answers the version index and the client configuration resources.
pub struct AdminHandler {
    router: Arc<Router>,
}

impl AdminHandler {
    fn version() -> Response {
        Response::new(ResponseBody::Envelope(Envelope {
            version: Some(API_VERSION.to_string()),
            ..Envelope::success()
        }))
    }

    async fn config_xml(&self, ctx: &RequestContext, req: Request) -> GatewayResult<Response> {
        match self.router.lookup_backend(&req).await? {
            Some(backend) => dispatch_one(ctx, backend, req).await,
            None => Ok(Response::unknown_meeting()),
        }
    }
}

#[async_trait]
impl RequestMiddleware for AdminHandler {
    fn name(&self) -> &'static str {
        MIDDLEWARE_NAME
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        req: Request,
        next: Next<'_>,
    ) -> GatewayResult<Response> {
        match req.resource {
            Resource::Index => Ok(Self::version()),
            Resource::GetDefaultConfigXml | Resource::SetConfigXml => {
                self.config_xml(ctx, req).await
            }
            _ => next.run(ctx, req).await,
        }
    }
}
