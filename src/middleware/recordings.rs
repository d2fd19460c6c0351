use std::sync::Arc;

use async_trait::async_trait;
use serde_yaml::Value as YamlValue;

use super::BuildContext;
use crate::cluster::{
    dispatch::{backend_call, dispatch_merge, dispatch_one},
    Router,
};
use crate::core::{GatewayResult, Next, RequestContext, RequestMiddleware};
use crate::protocol::{Envelope, Request, Resource, Response, ResponseBody};

pub const MIDDLEWARE_NAME: &str = "recordings_handler";

pub fn create_recordings_handler(
    ctx: &BuildContext,
    _: &YamlValue,
) -> GatewayResult<Arc<dyn RequestMiddleware>> {
    Ok(Arc::new(RecordingsHandler {
        router: ctx.router.clone(),
    }))
}

fn no_recordings() -> Response {
    let envelope = Envelope {
        message_key: Some("noRecordings".to_string()),
        message: Some("There are no recordings for the meeting(s).".to_string()),
        ..Envelope::success()
    };
    Response::new(ResponseBody::GetRecordings(envelope, Vec::new()))
}

fn unknown_recording() -> Response {
    Response::failed("notFound", "We could not find recordings")
}

/// Recordings live on whichever backend hosted the meeting, so listing
/// and bulk changes go to every eligible backend and are merged.
pub struct RecordingsHandler {
    router: Arc<Router>,
}

impl RecordingsHandler {
    async fn fan_out(&self, ctx: &RequestContext, req: Request) -> GatewayResult<Response> {
        let backends = self.router.select_backends(ctx, &req).await?;
        if backends.is_empty() {
            return Ok(match req.resource {
                Resource::GetRecordings => no_recordings(),
                _ => unknown_recording(),
            });
        }
        dispatch_merge(ctx, &backends, req, backend_call()).await
    }

    async fn single(&self, ctx: &RequestContext, req: Request) -> GatewayResult<Response> {
        match self.router.select_backend(ctx, &req).await? {
            Some(backend) => dispatch_one(ctx, backend, req).await,
            None => Ok(unknown_recording()),
        }
    }
}

#[async_trait]
impl RequestMiddleware for RecordingsHandler {
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
            Resource::GetRecordings | Resource::PublishRecordings | Resource::DeleteRecordings => {
                self.fan_out(ctx, req).await
            }
            Resource::UpdateRecordings
            | Resource::GetRecordingTextTracks
            | Resource::PutRecordingTextTrack => self.single(ctx, req).await,
            _ => next.run(ctx, req).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Gateway;
    use crate::protocol::{Params, PARAM_RECORD_ID};
    use crate::testing::{self, Fixture};

    fn handler(fixture: &Fixture) -> Vec<Arc<dyn RequestMiddleware>> {
        vec![Arc::new(RecordingsHandler {
            router: fixture.router(),
        })]
    }

    #[tokio::test]
    async fn test_get_recordings_merges_all_backends() {
        let fixture = Fixture::new(&[testing::backend("b1"), testing::backend("b2")]).await;
        fixture.client.recordings("b1", &["m1", "m2"]);
        fixture.client.recordings("b2", &["m3"]);
        let chain = handler(&fixture);

        let res = Next::new(&chain)
            .run(&RequestContext::new(), Request::new(Resource::GetRecordings, Params::new()))
            .await
            .unwrap();
        let ResponseBody::GetRecordings(env, recordings) = res.body() else {
            panic!("unexpected body");
        };
        assert!(env.is_success());
        assert_eq!(recordings.len(), 3);
        assert_eq!(fixture.client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_publish_fans_out() {
        let fixture = Fixture::new(&[testing::backend("b1"), testing::backend("b2")]).await;
        let chain = handler(&fixture);
        let params: Params = [(PARAM_RECORD_ID, "r1"), ("publish", "true")].into_iter().collect();

        let res = Next::new(&chain)
            .run(&RequestContext::new(), Request::new(Resource::PublishRecordings, params))
            .await
            .unwrap();
        assert!(matches!(res.body(), ResponseBody::PublishRecordings(_, true)));
        assert_eq!(fixture.client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_update_goes_to_one_backend() {
        let fixture = Fixture::new(&[testing::backend("b1"), testing::backend("b2")]).await;
        let chain = handler(&fixture);
        let params: Params = [(PARAM_RECORD_ID, "r1")].into_iter().collect();

        Next::new(&chain)
            .run(&RequestContext::new(), Request::new(Resource::UpdateRecordings, params))
            .await
            .unwrap();
        assert_eq!(fixture.client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_the_listing() {
        let fixture = Fixture::new(&[testing::backend("b1"), testing::backend("b2")]).await;
        fixture.client.recordings("b1", &["m1"]);
        fixture.client.down("b2");
        let gateway = Gateway::builder()
            .use_middleware(Arc::new(RecordingsHandler {
                router: fixture.router(),
            }))
            .build();

        let res = gateway
            .dispatch(&RequestContext::new(), Request::new(Resource::GetRecordings, Params::new()))
            .await;
        assert!(!res.is_success());
        assert_eq!(res.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!matches!(res.body(), ResponseBody::GetRecordings(..)));
    }

    #[tokio::test]
    async fn test_no_backends() {
        let fixture = Fixture::new(&[]).await;
        let chain = handler(&fixture);

        let res = Next::new(&chain)
            .run(&RequestContext::new(), Request::new(Resource::GetRecordings, Params::new()))
            .await
            .unwrap();
        assert!(res.is_success());

        let res = Next::new(&chain)
            .run(&RequestContext::new(), Request::new(Resource::DeleteRecordings, Params::new()))
            .await
            .unwrap();
        assert!(!res.is_success());
    }
}
