use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use serde_yaml::Value as YamlValue;

use super::BuildContext;
use crate::core::{GatewayResult, Next, RequestContext, RequestMiddleware};
use crate::protocol::{Envelope, JoinResponse, Request, Resource, Response, ResponseBody};
use crate::store::{MeetingQuery, Store};
use crate::utils::templates;

pub const MIDDLEWARE_NAME: &str = "attendees_limit";

pub fn create_attendees_limit_middleware(
    ctx: &BuildContext,
    _: &YamlValue,
) -> GatewayResult<Arc<dyn RequestMiddleware>> {
    Ok(Arc::new(AttendeesLimit {
        store: ctx.router.cluster().store().clone(),
    }))
}

/// Rejects joins once the meetings of a frontend hold as many attendees
/// as the frontend is allowed.
pub struct AttendeesLimit {
    store: Arc<dyn Store>,
}

fn limit_reached() -> Response {
    let join = JoinResponse {
        envelope: Envelope::failed(
            "attendeesLimitReached",
            "The maximum number of participants allowed for this frontend has been reached.",
        ),
        raw: Some(templates::attendees_limit_reached().into()),
        ..Default::default()
    };
    Response::new(ResponseBody::Join(join)).with_status(StatusCode::FORBIDDEN)
}

#[async_trait]
impl RequestMiddleware for AttendeesLimit {
    fn name(&self) -> &'static str {
        MIDDLEWARE_NAME
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        req: Request,
        next: Next<'_>,
    ) -> GatewayResult<Response> {
        if req.resource != Resource::Join {
            return next.run(ctx, req).await;
        }
        let Some(frontend) = ctx.frontend.as_ref() else {
            return next.run(ctx, req).await;
        };
        let limit = match frontend.settings.limit_attendees {
            Some(limit) if limit > 0 => limit,
            _ => return next.run(ctx, req).await,
        };

        let current: u32 = self
            .store
            .find_meetings(&MeetingQuery::frontend(&frontend.id))
            .await?
            .iter()
            .map(|m| m.attendees_count())
            .sum();
        if current >= limit {
            log::info!(
                frontend = frontend.key.as_str(), limit = limit, current = current;
                "attendees limit reached"
            );
            return Ok(limit_reached());
        }
        next.run(ctx, req).await
    }
}
