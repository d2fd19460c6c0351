//! Meeting resources
//!
//! Joins are only dispatched to a backend that is bound and ready.
//! Until then the attendee is parked on a waiting page that retries the
//! unchanged request.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use http::{header, HeaderValue, StatusCode};
use serde_yaml::Value as YamlValue;

use super::BuildContext;
use crate::cluster::{bind_meeting_frontend, dispatch::dispatch_one, Router};
use crate::core::{GatewayError, GatewayResult, Next, RequestContext, RequestMiddleware};
use crate::protocol::{Envelope, JoinResponse, Request, Resource, Response, ResponseBody};
use crate::store::{MeetingQuery, NodeState};
use crate::utils::templates;

pub const MIDDLEWARE_NAME: &str = "meetings_handler";

/// Path prefix of the waiting page, followed by the encoded request.
pub const RETRY_JOIN_PATH: &str = "/_b3scale/retry-join/";

pub fn create_meetings_handler(
    ctx: &BuildContext,
    _: &YamlValue,
) -> GatewayResult<Arc<dyn RequestMiddleware>> {
    Ok(Arc::new(MeetingsHandler {
        router: ctx.router.clone(),
    }))
}

/// Why a join was not dispatched yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStall {
    MeetingUnknown,
    BackendUnassigned,
    BackendNotReady,
}

impl fmt::Display for JoinStall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinStall::MeetingUnknown => "meeting unknown",
            JoinStall::BackendUnassigned => "backend unassigned",
            JoinStall::BackendNotReady => "backend not ready",
        })
    }
}

/// Redirect to the waiting page, carrying the whole request.
pub fn retry_join_response(req: &Request) -> GatewayResult<Response> {
    let retry_url = format!("{RETRY_JOIN_PATH}{}", req.marshal_url_safe()?);
    let location = HeaderValue::from_str(&retry_url)
        .map_err(|e| GatewayError::Internal(format!("retry url: {e}")))?;
    let body = templates::redirect(&retry_url);
    Ok(Response::new(ResponseBody::Join(JoinResponse::raw(body)))
        .with_status(StatusCode::FOUND)
        .with_header(header::LOCATION, location))
}

fn stall(req: &Request, meeting_id: &str, reason: JoinStall) -> GatewayResult<Response> {
    log::info!(meeting_id = meeting_id; "join stalled: {reason}");
    retry_join_response(req)
}

pub struct MeetingsHandler {
    router: Arc<Router>,
}

impl MeetingsHandler {
    async fn join(&self, ctx: &RequestContext, req: Request) -> GatewayResult<Response> {
        let Some(meeting_id) = req.params.meeting_id().map(str::to_string) else {
            return Ok(Response::unknown_meeting());
        };
        let cluster = self.router.cluster();

        let meeting = cluster.store().get_meeting(&meeting_id).await?;
        let backend = match meeting.as_ref().and_then(|m| m.backend_id.as_deref()) {
            Some(backend_id) => cluster.get_backend(backend_id).await?,
            None => None,
        };
        let backend = match (meeting, backend) {
            (None, _) => return stall(&req, &meeting_id, JoinStall::MeetingUnknown),
            (Some(_), None) => return stall(&req, &meeting_id, JoinStall::BackendUnassigned),
            (Some(_), Some(b)) if b.state.node_state != NodeState::Ready => {
                return stall(&req, &meeting_id, JoinStall::BackendNotReady)
            }
            (Some(_), Some(b)) => b,
        };

        if let Some(frontend) = ctx.frontend.as_ref() {
            bind_meeting_frontend(cluster.store().as_ref(), &meeting_id, frontend).await?;
        }
        log::debug!(meeting_id = meeting_id.as_str(), backend = backend.id(); "join dispatched");
        dispatch_one(ctx, backend, req).await
    }

    async fn create(&self, ctx: &RequestContext, req: Request) -> GatewayResult<Response> {
        let backend = match self.router.lookup_backend(&req).await? {
            Some(backend) => backend,
            None => match self.router.select_backend(ctx, &req).await? {
                Some(backend) => backend,
                None => {
                    log::warn!("no backend available for create");
                    return Ok(Response::failed(
                        "noBackendAvailable",
                        "There is currently no server available to host the meeting",
                    ));
                }
            },
        };
        dispatch_one(ctx, backend, req).await
    }

    async fn is_meeting_running(
        &self,
        ctx: &RequestContext,
        req: Request,
    ) -> GatewayResult<Response> {
        match self.router.lookup_backend(&req).await? {
            Some(backend) => dispatch_one(ctx, backend, req).await,
            None => Ok(Response::new(ResponseBody::IsMeetingRunning(
                Envelope::success(),
                false,
            ))),
        }
    }

    /// End and getMeetingInfo go to the bound backend only.
    async fn bound(&self, ctx: &RequestContext, req: Request) -> GatewayResult<Response> {
        match self.router.lookup_backend(&req).await? {
            Some(backend) => dispatch_one(ctx, backend, req).await,
            None => Err(GatewayError::NoBackendForMeeting(
                req.params.meeting_id().unwrap_or_default().to_string(),
            )),
        }
    }

    /// Answered from the store: the meetings of the frontend that run
    /// on a backend.
    async fn get_meetings(&self, ctx: &RequestContext) -> GatewayResult<Response> {
        let frontend = ctx.frontend()?;
        let meetings: Vec<_> = self
            .router
            .cluster()
            .store()
            .find_meetings(&MeetingQuery::frontend(&frontend.id).bound())
            .await?
            .into_iter()
            .map(|state| state.meeting)
            .collect();

        let mut envelope = Envelope::success();
        if meetings.is_empty() {
            envelope.message_key = Some("noMeetings".to_string());
            envelope.message = Some("no meetings were found on this server".to_string());
        }
        Ok(Response::new(ResponseBody::GetMeetings(envelope, meetings)))
    }
}

#[async_trait]
impl RequestMiddleware for MeetingsHandler {
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
            Resource::Join => self.join(ctx, req).await,
            Resource::Create => self.create(ctx, req).await,
            Resource::IsMeetingRunning => self.is_meeting_running(ctx, req).await,
            Resource::End | Resource::GetMeetingInfo => self.bound(ctx, req).await,
            Resource::GetMeetings => self.get_meetings(ctx).await,
            _ => next.run(ctx, req).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Params, PARAM_MEETING_ID};
    use crate::store::{MeetingState, Store};
    use crate::testing::{self, Fixture};

    fn request(resource: Resource, meeting_id: &str) -> Request {
        let params: Params = [(PARAM_MEETING_ID, meeting_id)].into_iter().collect();
        let mut req = Request::new(resource, params);
        req.url = format!("/bbb/fe1-key/api/{resource}?meetingID={meeting_id}&checksum=abc");
        req
    }

    fn handler(fixture: &Fixture) -> Vec<Arc<dyn RequestMiddleware>> {
        vec![Arc::new(MeetingsHandler {
            router: fixture.router(),
        })]
    }

    async fn bind(fixture: &Fixture, meeting_id: &str, backend_id: Option<&str>) {
        let mut state = MeetingState::new(testing::meeting(meeting_id, 0));
        state.backend_id = backend_id.map(String::from);
        fixture.store.compare_and_swap_meeting(&state).await.unwrap();
    }

    fn is_stall(res: &Response) -> bool {
        res.status() == StatusCode::FOUND
            && res.header()[header::LOCATION]
                .to_str()
                .unwrap()
                .starts_with(RETRY_JOIN_PATH)
    }

    #[tokio::test]
    async fn test_join_stalls_until_ready() {
        let mut b1 = testing::backend("b1");
        b1.set_node_state(NodeState::Error);
        let fixture = Fixture::new(&[b1.clone()]).await;
        let chain = handler(&fixture);
        let ctx = RequestContext::new().with_frontend(testing::frontend("fe1"));

        // Unknown meeting.
        let res = Next::new(&chain).run(&ctx, request(Resource::Join, "m1")).await.unwrap();
        assert!(is_stall(&res));

        // Known, but unassigned.
        bind(&fixture, "m1", None).await;
        let res = Next::new(&chain).run(&ctx, request(Resource::Join, "m1")).await.unwrap();
        assert!(is_stall(&res));

        // Bound to a backend that is not ready.
        let mut state = fixture.store.get_meeting("m1").await.unwrap().unwrap();
        state.backend_id = Some("b1".into());
        fixture.store.compare_and_swap_meeting(&state).await.unwrap();
        let res = Next::new(&chain).run(&ctx, request(Resource::Join, "m1")).await.unwrap();
        assert!(is_stall(&res));

        b1.set_node_state(NodeState::Ready);
        fixture.store.save_backend(&b1).await.unwrap();
        let res = Next::new(&chain).run(&ctx, request(Resource::Join, "m1")).await.unwrap();
        assert_eq!(res.status(), StatusCode::FOUND);
        let location = res.header()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("https://b1.example/bigbluebutton/api/join?"));

        // The join bound the frontend, and no join was sent to the backend.
        let state = fixture.store.get_meeting("m1").await.unwrap().unwrap();
        assert_eq!(state.frontend_id.as_deref(), Some("fe1"));
        assert_eq!(fixture.client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_payload_is_the_request() {
        let req = request(Resource::Join, "m1");
        let res = retry_join_response(&req).unwrap();
        let location = res.header()[header::LOCATION].to_str().unwrap();
        let payload = location.strip_prefix(RETRY_JOIN_PATH).unwrap();
        let decoded = Request::unmarshal_url_safe(payload).unwrap();
        assert_eq!(decoded.resource, Resource::Join);
        assert_eq!(decoded.params, req.params);
        assert_eq!(decoded.url, req.url);
    }

    #[tokio::test]
    async fn test_create_picks_least_loaded() {
        let mut busy = testing::backend("busy");
        busy.meetings_count = 10;
        let fixture = Fixture::new(&[busy, testing::backend("idle")]).await;
        let chain = handler(&fixture);
        let ctx = RequestContext::new().with_frontend(testing::frontend("fe1"));

        let res = Next::new(&chain).run(&ctx, request(Resource::Create, "m1")).await.unwrap();
        assert!(res.is_success());
        let state = fixture.store.get_meeting("m1").await.unwrap().unwrap();
        assert_eq!(state.backend_id.as_deref(), Some("idle"));
        assert_eq!(state.frontend_id.as_deref(), Some("fe1"));
    }

    #[tokio::test]
    async fn test_create_without_backends() {
        let fixture = Fixture::new(&[]).await;
        let chain = handler(&fixture);
        let ctx = RequestContext::new().with_frontend(testing::frontend("fe1"));
        let res = Next::new(&chain).run(&ctx, request(Resource::Create, "m1")).await.unwrap();
        assert!(!res.is_success());
    }

    #[tokio::test]
    async fn test_is_meeting_running_without_backend() {
        let fixture = Fixture::new(&[testing::backend("b1")]).await;
        let chain = handler(&fixture);
        let res = Next::new(&chain)
            .run(&RequestContext::new(), request(Resource::IsMeetingRunning, "m1"))
            .await
            .unwrap();
        assert!(matches!(res.body(), ResponseBody::IsMeetingRunning(env, false) if env.is_success()));
        assert_eq!(fixture.client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_end_unknown_meeting() {
        let fixture = Fixture::new(&[testing::backend("b1")]).await;
        let chain = handler(&fixture);
        let err = Next::new(&chain)
            .run(&RequestContext::new(), request(Resource::End, "m1"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_meetings_from_store() {
        let fixture = Fixture::new(&[testing::backend("b1")]).await;
        for (id, frontend, backend) in [
            ("m1", "fe1", Some("b1")),
            ("m2", "fe1", None),
            ("m3", "fe2", Some("b1")),
        ] {
            let mut state = MeetingState::new(testing::meeting(id, 0));
            state.frontend_id = Some(frontend.into());
            state.backend_id = backend.map(String::from);
            fixture.store.compare_and_swap_meeting(&state).await.unwrap();
        }
        let chain = handler(&fixture);
        let ctx = RequestContext::new().with_frontend(testing::frontend("fe1"));
        let res = Next::new(&chain)
            .run(&ctx, Request::new(Resource::GetMeetings, Params::new()))
            .await
            .unwrap();
        let ResponseBody::GetMeetings(_, meetings) = res.body() else {
            panic!("unexpected body");
        };
        assert_eq!(meetings.len(), 1);
        assert_eq!(meetings[0].meeting_id, "m1");
    }
}
