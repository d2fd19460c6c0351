//! Pipeline scenarios across routing, binding and the command queue.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use http::{header, StatusCode};
use serde_json::json;
use uuid::Uuid;

use super::*;
use crate::cluster::{
    controller::{end_all_meetings, Controller},
    CommandQueue, Gateway,
};
use crate::config::{self, GatewayConfig, MiddlewareConfig};
use crate::middleware::{build_gateway, unique_meeting_id, BuildContext};
use crate::protocol::{Params, Request, Resource, ResponseBody, PARAM_MEETING_ID};
use crate::store::{BackendState, Command, CommandState, FrontendState, MeetingQuery, Store};
use crate::testing::{self, Fixture};

fn gateway(fixture: &Fixture, names: Option<&[&str]>) -> Gateway {
    let pipeline = match names {
        Some(names) => names
            .iter()
            .map(|name| MiddlewareConfig {
                name: name.to_string(),
                config: serde_yaml::Value::Null,
            })
            .collect(),
        None => GatewayConfig::default().pipeline(),
    };
    let build = BuildContext {
        router: fixture.router(),
        server: config::Server::default(),
    };
    build_gateway(&pipeline, &build).unwrap()
}

fn request(resource: Resource, meeting_id: &str) -> Request {
    let params: Params = [(PARAM_MEETING_ID, meeting_id)].into_iter().collect();
    Request::new(resource, params)
}

fn create(meeting_id: &str) -> Request {
    let params: Params = [(PARAM_MEETING_ID, meeting_id)].into_iter().collect();
    Request::create(params, None)
}

fn ctx_for(frontend: FrontendState) -> RequestContext {
    RequestContext::new().with_frontend(frontend)
}

fn loaded(id: &str, meetings: u32, attendees: u32) -> BackendState {
    let mut state = testing::backend(id);
    state.meetings_count = meetings;
    state.attendees_count = attendees;
    state
}

async fn backend_of(
    fixture: &Fixture,
    frontend: &FrontendState,
    meeting_id: &str,
) -> Option<String> {
    let internal = unique_meeting_id::encode(&frontend.key, meeting_id);
    fixture
        .store
        .get_meeting(&internal)
        .await
        .unwrap()
        .and_then(|m| m.backend_id)
}

#[tokio::test]
async fn test_meeting_bindings_are_immutable() {
    let fixture = Fixture::new(&[testing::backend("b1")]).await;
    let gateway = gateway(&fixture, Some(&["bind_meeting_frontend", "meetings_handler"]));
    let fe1 = testing::frontend("fe1");
    let fe2 = testing::frontend("fe2");

    let res = gateway.dispatch(&ctx_for(fe1.clone()), create("m1")).await;
    assert!(res.is_success());
    let meeting = fixture.store.get_meeting("m1").await.unwrap().unwrap();
    assert_eq!(meeting.backend_id.as_deref(), Some("b1"));
    assert_eq!(meeting.frontend_id.as_deref(), Some("fe1"));

    let res = gateway
        .dispatch(&ctx_for(fe2), request(Resource::IsMeetingRunning, "m1"))
        .await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert_eq!(fixture.client.call_count(), 1);

    let res = gateway
        .dispatch(&ctx_for(fe1), request(Resource::IsMeetingRunning, "m1"))
        .await;
    assert!(matches!(res.body(), ResponseBody::IsMeetingRunning(_, true)));
}

#[tokio::test]
async fn test_create_goes_to_least_stressed_backend() {
    let fixture = Fixture::new(&[
        loaded("b1", 5, 0),
        loaded("b2", 0, 10),
        loaded("b3", 1, 0),
    ])
    .await;
    let gateway = gateway(&fixture, None);
    let fe1 = testing::frontend("fe1");

    let res = gateway.dispatch(&ctx_for(fe1.clone()), create("m1")).await;
    assert!(res.is_success());
    assert_eq!(backend_of(&fixture, &fe1, "m1").await.as_deref(), Some("b3"));

    // A second create of the same meeting follows the binding.
    gateway.dispatch(&ctx_for(fe1.clone()), create("m1")).await;
    let calls = fixture.client.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(backend, _)| backend == "b3"));
}

#[tokio::test]
async fn test_required_tags_restrict_backends() {
    let mut tagged = loaded("b1", 9, 0);
    tagged.tags = vec!["sip".into()];
    let fixture = Fixture::new(&[tagged, loaded("b2", 0, 0)]).await;
    let gateway = gateway(&fixture, None);

    let mut sip = testing::frontend("fe1");
    sip.settings.required_tags = vec!["sip".into()];
    gateway.dispatch(&ctx_for(sip.clone()), create("m1")).await;
    assert_eq!(backend_of(&fixture, &sip, "m1").await.as_deref(), Some("b1"));

    let mut gpu = testing::frontend("fe2");
    gpu.settings.required_tags = vec!["gpu".into()];
    let res = gateway.dispatch(&ctx_for(gpu), create("m2")).await;
    assert!(!res.is_success());
    let ResponseBody::Envelope(env) = res.body() else {
        panic!("unexpected body");
    };
    assert_eq!(env.message_key.as_deref(), Some("noBackendAvailable"));
}

#[tokio::test]
async fn test_join_stalls_then_succeeds() {
    let fixture = Fixture::new(&[testing::backend("b1")]).await;
    let gateway = gateway(&fixture, None);
    let ctx = ctx_for(testing::frontend("fe1"));

    let mut join = request(Resource::Join, "m1");
    join.params.insert("fullName", "Ada");
    join.url = "/bbb/fe1-key/api/join?fullName=Ada&meetingID=m1".into();

    let res = gateway.dispatch(&ctx, join).await;
    assert_eq!(res.status(), StatusCode::FOUND);
    let location = res.header()[header::LOCATION].to_str().unwrap().to_string();
    let payload = location
        .strip_prefix(crate::middleware::meetings::RETRY_JOIN_PATH)
        .unwrap();
    assert_eq!(fixture.client.call_count(), 0);

    gateway.dispatch(&ctx, create("m1")).await;

    let retried = Request::unmarshal_url_safe(payload).unwrap();
    let res = gateway.dispatch(&ctx, retried).await;
    assert_eq!(res.status(), StatusCode::FOUND);
    let location = res.header()[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with("https://b1.example/bigbluebutton/api/join?"));
    assert!(location.contains("fullName=Ada"));
}

#[tokio::test]
async fn test_orphan_pruning_is_idempotent() {
    let fixture = Fixture::new(&[testing::backend("b1")]).await;
    fixture.client.set_meetings(
        "b1",
        vec![testing::meeting("m1", 3), testing::meeting("m2", 4)],
    );
    let backend = fixture.cluster.get_backend("b1").await.unwrap().unwrap();
    backend.load_node_state().await.unwrap();
    let state = fixture.store.get_backend("b1").await.unwrap().unwrap();
    assert_eq!((state.meetings_count, state.attendees_count), (2, 7));

    fixture.client.set_meetings("b1", vec![testing::meeting("m1", 3)]);
    for _ in 0..2 {
        backend.load_node_state().await.unwrap();
        let ids: Vec<String> = fixture
            .store
            .find_meetings(&MeetingQuery::backend("b1"))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m1".to_string()]);
    }
    let state = fixture.store.get_backend("b1").await.unwrap().unwrap();
    assert_eq!((state.meetings_count, state.attendees_count), (1, 3));
}

#[tokio::test]
async fn test_unreachable_backend_is_marked_not_removed() {
    let fixture = Fixture::new(&[testing::backend("b1")]).await;
    fixture.client.meetings("b1", &["m1"]);
    let backend = fixture.cluster.get_backend("b1").await.unwrap().unwrap();
    backend.load_node_state().await.unwrap();

    fixture.client.down("b1");
    assert!(backend.load_node_state().await.is_err());
    let state = fixture.store.get_backend("b1").await.unwrap().unwrap();
    assert_eq!(state.node_state, crate::store::NodeState::Error);
    assert!(state.last_error.is_some());
    assert!(fixture.store.get_meeting("m1").await.unwrap().is_some());
}

#[derive(Default)]
struct Recorder {
    runs: Mutex<HashMap<Uuid, usize>>,
}

#[async_trait]
impl CommandHandler for Recorder {
    async fn handle(&self, command: &Command) -> GatewayResult<serde_json::Value> {
        *self.runs.lock().unwrap().entry(command.id).or_default() += 1;
        tokio::task::yield_now().await;
        Ok(json!(null))
    }
}

#[tokio::test]
async fn test_each_command_runs_once_across_workers() {
    let fixture = Fixture::new(&[]).await;
    let queue = CommandQueue::new(fixture.store.clone(), Duration::from_millis(20));
    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(queue.queue(Command::new("noop", json!({}))).await.unwrap().id);
    }

    let recorder = Arc::new(Recorder::default());
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let queue = queue.clone();
            let recorder = recorder.clone();
            tokio::spawn(async move {
                while queue.receive(recorder.as_ref()).await.unwrap().is_some() {}
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }

    let runs = recorder.runs.lock().unwrap().clone();
    assert_eq!(runs.len(), 20);
    assert!(runs.values().all(|n| *n == 1));
    for id in ids {
        let command = fixture.store.get_command(&id).await.unwrap().unwrap();
        assert_eq!(command.state, CommandState::Done);
    }
}

#[tokio::test]
async fn test_empty_receive_is_bounded() {
    let fixture = Fixture::new(&[]).await;
    let queue = CommandQueue::new(fixture.store.clone(), Duration::from_millis(30));
    let received = tokio::time::timeout(
        Duration::from_secs(2),
        queue.receive(&Recorder::default()),
    )
    .await
    .expect("receive waits a bounded time");
    assert!(received.unwrap().is_none());
}

#[tokio::test]
async fn test_end_all_meetings_command() {
    let fixture = Fixture::new(&[testing::backend("b1")]).await;
    let gateway = gateway(&fixture, None);
    let fe1 = testing::frontend("fe1");
    for id in ["m1", "m2"] {
        let res = gateway.dispatch(&ctx_for(fe1.clone()), create(id)).await;
        assert!(res.is_success());
    }
    assert_eq!(fixture.client.running("b1").len(), 2);

    let queue = CommandQueue::new(fixture.store.clone(), Duration::from_millis(20));
    let controller = Controller::new(fixture.cluster.clone(), queue.clone());
    let queued = queue.queue(end_all_meetings("b1")).await.unwrap();
    queue.receive(&controller).await.unwrap().unwrap();

    let command = fixture.store.get_command(&queued.id).await.unwrap().unwrap();
    assert_eq!(command.state, CommandState::Done);
    assert_eq!(command.result, Some(json!({"ended": 2})));
    assert!(fixture.client.running("b1").is_empty());
    let left = fixture
        .store
        .find_meetings(&MeetingQuery::backend("b1"))
        .await
        .unwrap();
    assert!(left.is_empty());
}

#[tokio::test]
async fn test_cancelled_request_never_reaches_a_backend() {
    let fixture = Fixture::new(&[testing::backend("b1")]).await;
    let gateway = gateway(&fixture, None);
    let ctx = ctx_for(testing::frontend("fe1"));
    ctx.cancel();

    let res = gateway.dispatch(&ctx, create("m1")).await;
    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(fixture.client.call_count(), 0);
}

#[tokio::test]
async fn test_slow_backend_hits_deadline() {
    let fixture = Fixture::new(&[testing::backend("b1")]).await;
    fixture.client.delay(Duration::from_millis(500));
    let gateway = gateway(&fixture, None);
    let ctx = ctx_for(testing::frontend("fe1")).with_timeout(Duration::from_millis(30));

    let res = gateway
        .dispatch(&ctx, Request::new(Resource::GetRecordings, Params::new()))
        .await;
    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
}
