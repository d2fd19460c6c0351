use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{Meeting, Params};

/// Observed health of a backend node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Init,
    Ready,
    Error,
    Stopped,
    Decommissioned,
}

/// Operator intent for a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminState {
    Init,
    #[default]
    Ready,
    Stopped,
    Decommissioned,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Init => "init",
            NodeState::Ready => "ready",
            NodeState::Error => "error",
            NodeState::Stopped => "stopped",
            NodeState::Decommissioned => "decommissioned",
        };
        f.write_str(s)
    }
}

fn default_load_factor() -> f64 {
    1.0
}

/// Shared record of one room server node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendState {
    pub id: String,
    pub host: String,
    pub secret: String,

    #[serde(default)]
    pub node_state: NodeState,
    #[serde(default)]
    pub admin_state: AdminState,

    #[serde(default)]
    pub last_error: Option<String>,
    /// Round trip of the last reconciliation, in milliseconds.
    #[serde(default)]
    pub latency: u64,
    #[serde(default)]
    pub meetings_count: u32,
    #[serde(default)]
    pub attendees_count: u32,
    #[serde(default = "default_load_factor")]
    pub load_factor: f64,
    #[serde(default)]
    pub tags: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,

    /// Store revision this record was read at, 0 when not persisted.
    #[serde(skip)]
    pub revision: i64,
}

impl BackendState {
    pub fn new(id: impl Into<String>, host: impl Into<String>, secret: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            host: host.into(),
            secret: secret.into(),
            node_state: NodeState::Init,
            admin_state: AdminState::Ready,
            last_error: None,
            latency: 0,
            meetings_count: 0,
            attendees_count: 0,
            load_factor: default_load_factor(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            synced_at: None,
            revision: 0,
        }
    }

    /// Load score used for ranking only.
    pub fn stress(&self) -> f64 {
        self.meetings_count as f64 + self.attendees_count as f64 * self.load_factor
    }

    /// Eligible for new work.
    pub fn is_available(&self) -> bool {
        self.node_state == NodeState::Ready && self.admin_state == AdminState::Ready
    }

    pub fn has_tags(&self, required: &[String]) -> bool {
        required.iter().all(|tag| self.tags.contains(tag))
    }

    /// Record an observed node state. The result never exceeds
    /// what the admin state permits.
    pub fn set_node_state(&mut self, observed: NodeState) {
        self.node_state = match (observed, self.admin_state) {
            (NodeState::Ready, AdminState::Init) => NodeState::Init,
            (NodeState::Ready, AdminState::Stopped) => NodeState::Stopped,
            (NodeState::Ready, AdminState::Decommissioned) => NodeState::Decommissioned,
            (state, _) => state,
        };
        self.updated_at = Utc::now();
    }
}

/// Presentation injected into create calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultPresentation {
    pub url: String,
    #[serde(default)]
    pub force: bool,
}

/// Per tenant behavior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendSettings {
    pub required_tags: Vec<String>,
    pub default_presentation: Option<DefaultPresentation>,
    pub create_default_params: Params,
    pub create_override_params: Params,
    pub join_default_params: Params,
    pub join_override_params: Params,
    pub limit_attendees: Option<u32>,
}

fn default_active() -> bool {
    true
}

/// Shared record of one tenant application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontendState {
    pub id: String,
    pub key: String,
    pub secret: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub settings: FrontendSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FrontendState {
    pub fn new(id: impl Into<String>, key: impl Into<String>, secret: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            key: key.into(),
            secret: secret.into(),
            active: true,
            settings: FrontendSettings::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Shared record of one meeting and its bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingState {
    /// Meeting id as known to the backends
    pub id: String,
    pub internal_id: String,
    pub meeting: Meeting,
    #[serde(default)]
    pub backend_id: Option<String>,
    #[serde(default)]
    pub frontend_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,

    /// Store revision this record was read at, 0 when not persisted.
    #[serde(skip)]
    pub revision: i64,
}

impl MeetingState {
    pub fn new(meeting: Meeting) -> Self {
        let now = Utc::now();
        Self {
            id: meeting.meeting_id.clone(),
            internal_id: meeting.internal_meeting_id.clone(),
            meeting,
            backend_id: None,
            frontend_id: None,
            created_at: now,
            updated_at: now,
            synced_at: None,
            revision: 0,
        }
    }

    /// Replace the cached attributes with a fresh backend report.
    pub fn update_meeting(&mut self, meeting: Meeting) {
        if !meeting.internal_meeting_id.is_empty() {
            self.internal_id = meeting.internal_meeting_id.clone();
        }
        self.meeting = meeting;
        self.mark_synced();
    }

    pub fn mark_synced(&mut self) {
        let now = Utc::now();
        self.synced_at = Some(now);
        self.updated_at = now;
    }

    pub fn attendees_count(&self) -> u32 {
        self.meeting.participant_count
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    #[default]
    Requested,
    Running,
    Done,
    Failed,
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandState::Requested => "requested",
            CommandState::Running => "running",
            CommandState::Done => "done",
            CommandState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Deadline used when the enqueuer sets none.
pub fn default_queue_deadline() -> ChronoDuration {
    ChronoDuration::minutes(2)
}

/// A queued administrative operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub state: CommandState,
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,

    /// Queue position, assigned by the store.
    #[serde(skip)]
    pub seq: i64,
    #[serde(skip)]
    pub revision: i64,
}

impl Command {
    pub fn new(action: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            action: action.into(),
            params,
            result: None,
            state: CommandState::Requested,
            deadline: None,
            started_at: None,
            stopped_at: None,
            created_at: Utc::now(),
            seq: 0,
            revision: 0,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| deadline < now)
    }

    pub fn start(&mut self) {
        self.state = CommandState::Running;
        self.started_at = Some(Utc::now());
    }

    /// Done or failed, and stopped no later than `before`.
    pub fn finished_before(&self, before: DateTime<Utc>) -> bool {
        matches!(self.state, CommandState::Done | CommandState::Failed)
            && self.stopped_at.is_some_and(|stopped| stopped <= before)
    }

    pub fn finish(&mut self, state: CommandState, result: serde_json::Value) {
        self.state = state;
        self.result = Some(result);
        self.stopped_at = Some(Utc::now());
    }
}
