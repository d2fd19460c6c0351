use std::{fmt, sync::Arc, time::Instant};

use chrono::Utc;
use http::{header, HeaderValue, StatusCode};

use super::binding::{claim, BindingField, MAX_WRITE_ATTEMPTS};
use crate::core::{ApiClient, GatewayError, GatewayResult, RequestContext};
use crate::protocol::{
    JoinResponse, Meeting, Params, Request, Resource, Response, ResponseBody, PARAM_MEETING_ID,
};
use crate::store::{BackendState, MeetingQuery, MeetingState, NodeState, Store};
use crate::utils::templates;

/// Handle on one room server. Executes protocol operations and writes
/// what it learns back into the store.
#[derive(Clone)]
pub struct Backend {
    pub state: BackendState,
    client: Arc<dyn ApiClient>,
    store: Arc<dyn Store>,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.state.id)
            .field("host", &self.state.host)
            .field("node_state", &self.state.node_state)
            .finish()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Backend {} {}]", self.state.id, self.state.host)
    }
}

impl Backend {
    pub fn new(state: BackendState, client: Arc<dyn ApiClient>, store: Arc<dyn Store>) -> Self {
        Self {
            state,
            client,
            store,
        }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn stress(&self) -> f64 {
        self.state.stress()
    }

    async fn send(&self, req: &Request) -> GatewayResult<Response> {
        self.client.send(&self.state, req).await
    }

    /// Execute a request on this backend.
    pub async fn dispatch(&self, ctx: &RequestContext, req: &Request) -> GatewayResult<Response> {
        match req.resource {
            Resource::Create => self.create(ctx, req).await,
            Resource::Join => self.join(req),
            Resource::IsMeetingRunning => self.is_meeting_running(req).await,
            Resource::End => self.end(req).await,
            Resource::GetMeetingInfo => self.get_meeting_info(req).await,
            Resource::Index
            | Resource::GetMeetings
            | Resource::GetRecordings
            | Resource::PublishRecordings
            | Resource::DeleteRecordings
            | Resource::UpdateRecordings
            | Resource::GetDefaultConfigXml
            | Resource::SetConfigXml
            | Resource::GetRecordingTextTracks
            | Resource::PutRecordingTextTrack => self.send(req).await,
        }
    }

    /// Create a meeting and bind it to this backend and the
    /// requesting frontend.
    pub async fn create(&self, ctx: &RequestContext, req: &Request) -> GatewayResult<Response> {
        let mut req = req.clone();
        if req.has_body() {
            req.set_content_type("application/xml");
        }
        let res = self.send(&req).await?;
        if !res.is_success() {
            return Ok(res);
        }
        let ResponseBody::Create(_, meeting) = res.body() else {
            return Err(GatewayError::transport(
                self.id(),
                "create returned without a meeting",
            ));
        };

        let frontend_id = ctx.frontend.as_ref().map(|f| f.id.as_str());
        self.store_meeting(meeting.clone(), frontend_id).await?;
        Ok(res)
    }

    /// Joins are not sent to the backend. The attendee is redirected
    /// to the signed join url and talks to the backend directly.
    pub fn join(&self, req: &Request) -> GatewayResult<Response> {
        let url = req.url_for(&self.state.host, &self.state.secret);
        let location = HeaderValue::from_str(&url)
            .map_err(|e| GatewayError::Internal(format!("join url: {e}")))?;
        let body = templates::redirect(&url);
        Ok(Response::new(ResponseBody::Join(JoinResponse::raw(body)))
            .with_status(StatusCode::FOUND)
            .with_header(header::LOCATION, location))
    }

    /// The backend is authoritative for liveness, a failed check
    /// removes the meeting.
    pub async fn is_meeting_running(&self, req: &Request) -> GatewayResult<Response> {
        let res = self.send(req).await?;
        if !res.is_success() {
            if let Some(meeting_id) = req.params.meeting_id() {
                self.forget_meeting(meeting_id).await?;
            }
        }
        Ok(res)
    }

    pub async fn end(&self, req: &Request) -> GatewayResult<Response> {
        let res = self.send(req).await?;
        if res.is_success() {
            if let Some(meeting_id) = req.params.meeting_id() {
                self.forget_meeting(meeting_id).await?;
            }
        }
        Ok(res)
    }

    pub async fn get_meeting_info(&self, req: &Request) -> GatewayResult<Response> {
        let res = self.send(req).await?;
        if let ResponseBody::GetMeetingInfo(env, meeting) = res.body() {
            if env.is_success() {
                // The answer is already good, a failed cache update is not fatal.
                if let Err(err) = self.store_meeting(meeting.clone(), None).await {
                    log::error!(backend = self.id(); "could not update meeting {}: {err}", meeting.meeting_id);
                }
            }
        }
        Ok(res)
    }

    async fn forget_meeting(&self, meeting_id: &str) -> GatewayResult<()> {
        if self.store.delete_meeting(meeting_id).await? {
            log::info!(backend = self.id(), meeting_id = meeting_id; "removed meeting state");
        }
        Ok(())
    }

    /// Upsert a meeting reported by this backend. Binds the backend
    /// (and the frontend, if given) when unset; an existing binding to
    /// someone else is a conflict.
    pub async fn store_meeting(
        &self,
        meeting: Meeting,
        frontend_id: Option<&str>,
    ) -> GatewayResult<MeetingState> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut state = match self.store.get_meeting(&meeting.meeting_id).await? {
                Some(mut state) => {
                    state.update_meeting(meeting.clone());
                    state
                }
                None => {
                    let mut state = MeetingState::new(meeting.clone());
                    state.mark_synced();
                    state
                }
            };
            claim(&mut state, BindingField::Backend, self.id())?;
            if let Some(frontend_id) = frontend_id {
                claim(&mut state, BindingField::Frontend, frontend_id)?;
            }

            if let Some(revision) = self.store.compare_and_swap_meeting(&state).await? {
                state.revision = revision;
                return Ok(state);
            }
        }
        Err(GatewayError::Store(format!(
            "meeting {} is too contended to update",
            meeting.meeting_id
        )))
    }

    /// Reload a single meeting from the backend.
    pub async fn refresh_meeting_state(&self, state: &MeetingState) -> GatewayResult<()> {
        let params: Params = [(PARAM_MEETING_ID, state.id.as_str())].into_iter().collect();
        let req = Request::new(Resource::GetMeetingInfo, params);
        let res = self.send(&req).await?;
        match res.body() {
            ResponseBody::GetMeetingInfo(env, meeting) if env.is_success() => {
                self.store_meeting(meeting.clone(), None).await?;
            }
            _ => self.forget_meeting(&state.id).await?,
        }
        Ok(())
    }

    /// Reconcile the store with the meetings the backend reports:
    /// upsert every listed meeting, prune the ones it no longer has and
    /// recompute the load counters. Unreachable backends are marked as
    /// failed, never removed.
    pub async fn load_node_state(&self) -> GatewayResult<()> {
        log::debug!(backend = self.id(); "processing backend meetings");

        let started = Instant::now();
        let req = Request::new(Resource::GetMeetings, Params::new());
        let result = self.send(&req).await;
        let latency = started.elapsed();

        if self.store.get_backend(self.id()).await?.is_none() {
            log::warn!(backend = self.id(); "backend is gone, skipping reconciliation");
            return Ok(());
        }

        let meetings = match result {
            Ok(res) => match res.body() {
                ResponseBody::GetMeetings(env, meetings) if env.is_success() => meetings.clone(),
                ResponseBody::GetMeetings(env, _) => {
                    let message = format!(
                        "{}: {}",
                        env.message_key.as_deref().unwrap_or_default(),
                        env.message.as_deref().unwrap_or_default()
                    );
                    return self.mark_failed(message).await;
                }
                body => {
                    let message = format!("unexpected {} response", body.kind());
                    return self.mark_failed(message).await;
                }
            },
            Err(err) => return self.mark_failed(err.to_string()).await,
        };

        let mut keep = Vec::with_capacity(meetings.len());
        let mut attendees = 0;
        for meeting in meetings {
            let meeting_id = meeting.meeting_id.clone();
            let participants = meeting.participant_count;
            match self.store_meeting(meeting, None).await {
                Ok(_) => {
                    attendees += participants;
                    keep.push(meeting_id);
                }
                Err(err @ GatewayError::BindingConflict { .. }) => {
                    log::warn!(backend = self.id(), meeting_id = meeting_id.as_str(); "skipping meeting: {err}");
                }
                Err(err) => {
                    log::error!(backend = self.id(), meeting_id = meeting_id.as_str(); "could not save meeting state: {err}");
                    keep.push(meeting_id);
                }
            }
        }

        let orphans = self.store.delete_orphan_meetings(self.id(), &keep).await?;
        if orphans > 0 {
            log::info!(backend = self.id(); "removed {orphans} orphan meetings");
        }

        let meetings_count = keep.len() as u32;
        self.update_state(|state| {
            let previous = state.node_state;
            state.meetings_count = meetings_count;
            state.attendees_count = attendees;
            state.latency = latency.as_millis() as u64;
            state.last_error = None;
            state.synced_at = Some(Utc::now());
            state.set_node_state(NodeState::Ready);
            if previous != state.node_state {
                log::info!(backend = state.id.as_str(); "node state {previous} -> {}", state.node_state);
            }
        })
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, message: String) -> GatewayResult<()> {
        log::warn!(backend = self.id(); "backend failed: {message}");
        self.update_state(|state| {
            state.set_node_state(NodeState::Error);
            state.last_error = Some(message.clone());
        })
        .await?;
        Err(GatewayError::Transport {
            backend: self.id().to_string(),
            message,
        })
    }

    /// Apply `update` to the current backend record with a conditional
    /// write, rereading on conflict. Operator changes made meanwhile are
    /// kept. Returns false when the backend is gone.
    pub(crate) async fn update_state<F>(&self, mut update: F) -> GatewayResult<bool>
    where
        F: FnMut(&mut BackendState),
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(mut state) = self.store.get_backend(self.id()).await? else {
                return Ok(false);
            };
            update(&mut state);
            state.updated_at = Utc::now();
            if self.store.compare_and_swap_backend(&state).await?.is_some() {
                return Ok(true);
            }
            log::debug!(backend = self.id(); "backend changed while updating, retrying");
        }
        Err(GatewayError::Store(format!(
            "backend {} is too contended to update",
            self.id()
        )))
    }

    /// End every meeting bound to this backend. Returns how many ended.
    pub async fn end_all_meetings(&self) -> GatewayResult<usize> {
        let meetings = self
            .store
            .find_meetings(&MeetingQuery::backend(self.id()))
            .await?;
        let mut ended = 0;
        for meeting in meetings {
            let params: Params = [(PARAM_MEETING_ID, meeting.id.as_str())].into_iter().collect();
            let req = Request::new(Resource::End, params);
            match self.end(&req).await {
                Ok(res) if res.is_success() => ended += 1,
                Ok(_) => {
                    log::warn!(backend = self.id(), meeting_id = meeting.id.as_str(); "backend refused to end meeting");
                    self.forget_meeting(&meeting.id).await?;
                }
                Err(err) => {
                    log::error!(backend = self.id(), meeting_id = meeting.id.as_str(); "could not end meeting: {err}");
                }
            }
        }
        Ok(ended)
    }
}
