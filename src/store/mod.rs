//! Shared cluster state
//!
//! Backends, frontends, meetings and the command queue live in a shared
//! store. Every gateway process resolves membership and bindings through
//! it, nothing authoritative is cached in process.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::GatewayResult;

pub mod etcd;
pub mod memory;
pub mod state;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use state::{
    default_queue_deadline, AdminState, BackendState, Command, CommandState,
    DefaultPresentation, FrontendSettings, FrontendState, MeetingState, NodeState,
};

/// Change notification channel shared by enqueuers and workers.
pub const COMMAND_CHANNEL: &str = "commands_queue";

/// Exact match filter for meeting lookups.
#[derive(Debug, Clone, Default)]
pub struct MeetingQuery {
    pub backend_id: Option<String>,
    pub frontend_id: Option<String>,
    pub internal_id: Option<String>,
    /// Only meetings bound to some backend
    pub bound: bool,
}

impl MeetingQuery {
    pub fn backend(id: &str) -> Self {
        Self {
            backend_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn frontend(id: &str) -> Self {
        Self {
            frontend_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn internal(id: &str) -> Self {
        Self {
            internal_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn bound(mut self) -> Self {
        self.bound = true;
        self
    }

    pub fn matches(&self, m: &MeetingState) -> bool {
        if let Some(id) = &self.backend_id {
            if m.backend_id.as_ref() != Some(id) {
                return false;
            }
        }
        if let Some(id) = &self.frontend_id {
            if m.frontend_id.as_ref() != Some(id) {
                return false;
            }
        }
        if let Some(id) = &self.internal_id {
            if &m.internal_id != id {
                return false;
            }
        }
        !self.bound || m.backend_id.is_some()
    }
}

/// Persistence for the cluster state.
///
/// Conditional writes take the `revision` the record was read at; a
/// revision of 0 means the record must not exist yet. They return the
/// new revision, or `None` when another writer won.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_backend(&self, id: &str) -> GatewayResult<Option<BackendState>>;
    async fn list_backends(&self) -> GatewayResult<Vec<BackendState>>;
    async fn save_backend(&self, backend: &BackendState) -> GatewayResult<()>;
    async fn compare_and_swap_backend(&self, backend: &BackendState) -> GatewayResult<Option<i64>>;
    async fn delete_backend(&self, id: &str) -> GatewayResult<()>;

    async fn get_frontend(&self, id: &str) -> GatewayResult<Option<FrontendState>>;
    async fn list_frontends(&self) -> GatewayResult<Vec<FrontendState>>;
    async fn save_frontend(&self, frontend: &FrontendState) -> GatewayResult<()>;
    async fn delete_frontend(&self, id: &str) -> GatewayResult<()>;

    async fn get_frontend_by_key(&self, key: &str) -> GatewayResult<Option<FrontendState>> {
        Ok(self
            .list_frontends()
            .await?
            .into_iter()
            .find(|f| f.key == key))
    }

    async fn get_meeting(&self, id: &str) -> GatewayResult<Option<MeetingState>>;
    async fn find_meetings(&self, query: &MeetingQuery) -> GatewayResult<Vec<MeetingState>>;
    async fn compare_and_swap_meeting(&self, meeting: &MeetingState) -> GatewayResult<Option<i64>>;
    async fn delete_meeting(&self, id: &str) -> GatewayResult<bool>;

    /// Delete meetings bound to the backend that are not in `keep`.
    async fn delete_orphan_meetings(&self, backend_id: &str, keep: &[String])
        -> GatewayResult<usize>;

    /// Append a command and wake waiting workers.
    async fn queue_command(&self, command: &Command) -> GatewayResult<Command>;
    async fn get_command(&self, id: &Uuid) -> GatewayResult<Option<Command>>;
    /// Commands in `requested` state, oldest first.
    async fn requested_commands(&self) -> GatewayResult<Vec<Command>>;
    async fn compare_and_swap_command(&self, command: &Command) -> GatewayResult<Option<i64>>;
    /// Delete done and failed commands that stopped no later than `before`.
    async fn delete_finished_commands(&self, before: DateTime<Utc>) -> GatewayResult<usize>;

    /// Wait for a queue notification. Returns false on timeout.
    async fn wait_for_command(&self, timeout: Duration) -> GatewayResult<bool>;

    async fn find_meeting_by_internal_id(&self, internal_id: &str) -> GatewayResult<Option<MeetingState>> {
        Ok(self
            .find_meetings(&MeetingQuery::internal(internal_id))
            .await?
            .into_iter()
            .next())
    }
}
