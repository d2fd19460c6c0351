//! Test doubles shared by the unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use crate::cluster::{Cluster, Router};
use crate::core::{ApiClient, GatewayError, GatewayResult};
use crate::protocol::{Envelope, Meeting, Recording, Request, Resource, Response, ResponseBody};
use crate::store::{BackendState, FrontendState, MemoryStore, NodeState, Store};

#[derive(Default)]
struct Script {
    meetings: HashMap<String, Vec<Meeting>>,
    recordings: HashMap<String, Vec<Recording>>,
    down: HashSet<String>,
    delay: Option<Duration>,
    calls: Vec<(String, Resource)>,
}

/// A fleet of fake room servers, keyed by backend id. Tracks the
/// meetings each one runs and records every call.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<Script>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the meetings a backend runs.
    pub fn meetings(&self, backend_id: &str, ids: &[&str]) {
        let meetings = ids.iter().map(|id| meeting(id, 0)).collect();
        self.set_meetings(backend_id, meetings);
    }

    pub fn set_meetings(&self, backend_id: &str, meetings: Vec<Meeting>) {
        let mut script = self.script.lock().unwrap();
        script.meetings.insert(backend_id.to_string(), meetings);
    }

    pub fn recordings(&self, backend_id: &str, meeting_ids: &[&str]) {
        let recordings = meeting_ids
            .iter()
            .map(|id| Recording {
                record_id: format!("{backend_id}-{id}"),
                meeting_id: id.to_string(),
                ..Default::default()
            })
            .collect();
        let mut script = self.script.lock().unwrap();
        script.recordings.insert(backend_id.to_string(), recordings);
    }

    /// Make a backend unreachable.
    pub fn down(&self, backend_id: &str) {
        self.script.lock().unwrap().down.insert(backend_id.to_string());
    }

    pub fn up(&self, backend_id: &str) {
        self.script.lock().unwrap().down.remove(backend_id);
    }

    pub fn delay(&self, delay: Duration) {
        self.script.lock().unwrap().delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<(String, Resource)> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.script.lock().unwrap().calls.len()
    }

    pub fn running(&self, backend_id: &str) -> Vec<String> {
        let script = self.script.lock().unwrap();
        script
            .meetings
            .get(backend_id)
            .map(|m| m.iter().map(|m| m.meeting_id.clone()).collect())
            .unwrap_or_default()
    }

    fn answer(&self, backend_id: &str, req: &Request) -> GatewayResult<Response> {
        let mut guard = self.script.lock().unwrap();
        let script = &mut *guard;
        script.calls.push((backend_id.to_string(), req.resource));
        if script.down.contains(backend_id) {
            return Err(GatewayError::transport(backend_id, "connection refused"));
        }

        let meeting_id = req.params.meeting_id().unwrap_or_default().to_string();
        let meetings = script.meetings.entry(backend_id.to_string()).or_default();
        let found = meetings.iter().position(|m| m.meeting_id == meeting_id);

        let body = match req.resource {
            Resource::Create => {
                let meeting = match found {
                    Some(idx) => meetings[idx].clone(),
                    None => {
                        let mut created = meeting(&meeting_id, 0);
                        created.meeting_name =
                            req.params.get("name").unwrap_or_default().to_string();
                        meetings.push(created.clone());
                        created
                    }
                };
                ResponseBody::Create(Envelope::success(), meeting)
            }
            Resource::IsMeetingRunning => match found {
                Some(_) => ResponseBody::IsMeetingRunning(Envelope::success(), true),
                None => return Ok(Response::unknown_meeting()),
            },
            Resource::End => match found {
                Some(idx) => {
                    meetings.remove(idx);
                    ResponseBody::End(Envelope::success())
                }
                None => return Ok(Response::unknown_meeting()),
            },
            Resource::GetMeetingInfo => match found {
                Some(idx) => ResponseBody::GetMeetingInfo(Envelope::success(), meetings[idx].clone()),
                None => return Ok(Response::unknown_meeting()),
            },
            Resource::GetMeetings => ResponseBody::GetMeetings(Envelope::success(), meetings.clone()),
            Resource::GetRecordings => {
                let recordings = script
                    .recordings
                    .get(backend_id)
                    .cloned()
                    .unwrap_or_default();
                ResponseBody::GetRecordings(Envelope::success(), recordings)
            }
            Resource::PublishRecordings => {
                ResponseBody::PublishRecordings(Envelope::success(), true)
            }
            Resource::DeleteRecordings => ResponseBody::DeleteRecordings(Envelope::success(), true),
            Resource::UpdateRecordings => ResponseBody::UpdateRecordings(Envelope::success(), true),
            Resource::Index => ResponseBody::Envelope(Envelope {
                version: Some("2.0".into()),
                ..Envelope::success()
            }),
            Resource::GetDefaultConfigXml => {
                ResponseBody::GetDefaultConfigXml(format!("<config>{backend_id}</config>").into())
            }
            Resource::SetConfigXml => {
                ResponseBody::SetConfigXml(Envelope::success(), format!("{backend_id}-token"))
            }
            Resource::Join
            | Resource::GetRecordingTextTracks
            | Resource::PutRecordingTextTrack => {
                return Ok(Response::failed("unsupported", "not scripted"))
            }
        };
        Ok(Response::new(body))
    }
}

#[async_trait]
impl ApiClient for ScriptedClient {
    async fn send(&self, backend: &BackendState, req: &Request) -> GatewayResult<Response> {
        let delay = self.script.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.answer(&backend.id, req)
    }
}

pub fn meeting(id: &str, participants: u32) -> Meeting {
    Meeting {
        meeting_id: id.to_string(),
        internal_meeting_id: format!("internal-{id}"),
        participant_count: participants,
        running: true,
        ..Default::default()
    }
}

/// A ready backend with the given id.
pub fn backend(id: &str) -> BackendState {
    let mut state = BackendState::new(id, format!("https://{id}.example/bigbluebutton/api/"), "backend-secret");
    state.set_node_state(NodeState::Ready);
    state
}

pub fn frontend(id: &str) -> FrontendState {
    FrontendState::new(id, format!("{id}-key"), format!("{id}-secret"))
}

/// A store, a scripted fleet and a cluster wired together.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub client: Arc<ScriptedClient>,
    pub cluster: Cluster,
}

impl Fixture {
    pub async fn new(backends: &[BackendState]) -> Self {
        let store = Arc::new(MemoryStore::new());
        for state in backends {
            store.save_backend(state).await.unwrap();
        }
        let client = Arc::new(ScriptedClient::new());
        let cluster = Cluster::new(store.clone(), client.clone());
        Self {
            store,
            client,
            cluster,
        }
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::new(Router::with_default_filters(self.cluster.clone()))
    }
}
