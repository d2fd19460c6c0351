//! Cluster controller
//!
//! Executes administrative commands taken from the queue and keeps the
//! backend state fresh by enqueueing a reconciliation for every backend
//! on a fixed interval. Any number of nodes may run a controller.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use serde_json::{json, Value};

use super::{Cluster, CommandQueue};
use crate::core::{CommandHandler, GatewayError, GatewayResult};
use crate::store::{AdminState, Command, MeetingQuery};

pub const CMD_END_ALL_MEETINGS: &str = "end_all_meetings";
pub const CMD_UPDATE_NODE_STATE: &str = "update_node_state";
pub const CMD_LOAD_BACKEND_STATE: &str = "load_backend_state";
pub const CMD_REMOVE_BACKEND: &str = "remove_backend";
pub const CMD_UPDATE_MEETING_STATE: &str = "update_meeting_state";

/// Minutes a command built here may wait in the queue.
const COMMAND_DEADLINE_MINUTES: i64 = 10;

fn command(action: &str, params: Value) -> Command {
    Command::new(action, params)
        .with_deadline(Utc::now() + ChronoDuration::minutes(COMMAND_DEADLINE_MINUTES))
}

/// End every meeting on a backend.
pub fn end_all_meetings(backend_id: &str) -> Command {
    command(CMD_END_ALL_MEETINGS, json!({ "backend_id": backend_id }))
}

/// Reconcile a backend with the meetings it reports.
pub fn update_node_state(backend_id: &str) -> Command {
    command(CMD_UPDATE_NODE_STATE, json!({ "id": backend_id }))
}

pub fn load_backend_state(backend_id: &str) -> Command {
    command(CMD_LOAD_BACKEND_STATE, json!({ "id": backend_id }))
}

/// Decommission a backend and delete it once it is empty.
pub fn remove_backend(backend_id: &str) -> Command {
    command(CMD_REMOVE_BACKEND, json!({ "id": backend_id }))
}

pub fn update_meeting_state(meeting_id: &str) -> Command {
    command(CMD_UPDATE_MEETING_STATE, json!({ "id": meeting_id }))
}

fn param<'a>(command: &'a Command, key: &str) -> GatewayResult<&'a str> {
    command
        .params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            GatewayError::Validation(format!("{} requires the parameter {key}", command.action))
        })
}

pub struct Controller {
    cluster: Cluster,
    queue: CommandQueue,
    refresh_interval: Duration,
    command_deadline: ChronoDuration,
    command_retention: ChronoDuration,
}

impl Controller {
    pub fn new(cluster: Cluster, queue: CommandQueue) -> Self {
        Self {
            cluster,
            queue,
            refresh_interval: Duration::from_secs(60),
            command_deadline: ChronoDuration::minutes(COMMAND_DEADLINE_MINUTES),
            command_retention: ChronoDuration::hours(1),
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_command_deadline(mut self, deadline: ChronoDuration) -> Self {
        self.command_deadline = deadline;
        self
    }

    pub fn with_command_retention(mut self, retention: ChronoDuration) -> Self {
        self.command_retention = retention;
        self
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Enqueue a reconciliation of every backend. Decommissioned backends
    /// get a removal attempt instead. Returns the number of commands.
    pub async fn refresh_backends(&self) -> GatewayResult<usize> {
        let backends = self.cluster.backends().await?;
        let deadline = Utc::now() + self.command_deadline;
        for backend in &backends {
            let command = match backend.state.admin_state {
                AdminState::Decommissioned => remove_backend(backend.id()),
                _ => update_node_state(backend.id()),
            };
            self.queue.queue(command.with_deadline(deadline)).await?;
        }
        Ok(backends.len())
    }

    async fn end_all_meetings(&self, command: &Command) -> GatewayResult<Value> {
        let backend_id = param(command, "backend_id")?;
        let backend = self
            .cluster
            .get_backend(backend_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("backend {backend_id}")))?;
        let ended = backend.end_all_meetings().await?;
        log::info!(backend = backend_id; "ended {ended} meetings");
        Ok(json!({ "ended": ended }))
    }

    async fn update_node_state(&self, command: &Command) -> GatewayResult<Value> {
        let id = param(command, "id")?;
        let Some(backend) = self.cluster.get_backend(id).await? else {
            log::warn!(backend = id; "backend is gone, nothing to refresh");
            return Ok(Value::Null);
        };
        backend.load_node_state().await?;
        Ok(Value::Null)
    }

    async fn remove_backend(&self, command: &Command) -> GatewayResult<Value> {
        let id = param(command, "id")?;
        let store = self.cluster.store();
        let Some(backend) = self.cluster.get_backend(id).await? else {
            return Ok(json!({ "removed": true }));
        };
        if backend.state.admin_state != AdminState::Decommissioned {
            backend
                .update_state(|state| state.admin_state = AdminState::Decommissioned)
                .await?;
            log::info!(backend = id; "backend decommissioned");
        }

        // Prune what the backend no longer runs before deciding.
        if let Err(err) = backend.load_node_state().await {
            log::warn!(backend = id; "could not refresh before removal: {err}");
        }

        let remaining = store.find_meetings(&MeetingQuery::backend(id)).await?.len();
        if remaining > 0 {
            log::info!(backend = id; "{remaining} meetings left, keeping backend");
            return Ok(json!({ "removed": false, "meetings": remaining }));
        }
        store.delete_backend(id).await?;
        log::info!(backend = id; "backend removed");
        Ok(json!({ "removed": true }))
    }

    async fn update_meeting_state(&self, command: &Command) -> GatewayResult<Value> {
        let id = param(command, "id")?;
        let Some(meeting) = self.cluster.store().get_meeting(id).await? else {
            return Ok(Value::Null);
        };
        let Some(backend_id) = meeting.backend_id.as_deref() else {
            return Ok(Value::Null);
        };
        match self.cluster.get_backend(backend_id).await? {
            Some(backend) => backend.refresh_meeting_state(&meeting).await?,
            None => {
                log::warn!(meeting_id = id, backend = backend_id; "backend of meeting is gone");
                self.cluster.store().delete_meeting(id).await?;
            }
        }
        Ok(Value::Null)
    }

    async fn refresh_loop(&self, mut shutdown: ShutdownWatch) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    match self.refresh_backends().await {
                        Ok(count) => log::debug!("requested refresh of {count} backends"),
                        Err(err) => log::error!("could not request backend refresh: {err}"),
                    }
                    if let Err(err) = self.queue.sweep(self.command_retention).await {
                        log::error!("could not sweep finished commands: {err}");
                    }
                }
            }
        }
    }

    async fn worker_loop(&self, shutdown: ShutdownWatch) {
        // Receive waits a bounded time, so shutdown is noticed promptly
        // and a running command is never abandoned halfway.
        while !*shutdown.borrow() {
            if let Err(err) = self.queue.receive(self).await {
                log::error!("command worker: {err}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[async_trait]
impl CommandHandler for Controller {
    async fn handle(&self, command: &Command) -> GatewayResult<Value> {
        match command.action.as_str() {
            CMD_END_ALL_MEETINGS => self.end_all_meetings(command).await,
            CMD_UPDATE_NODE_STATE | CMD_LOAD_BACKEND_STATE => self.update_node_state(command).await,
            CMD_REMOVE_BACKEND => self.remove_backend(command).await,
            CMD_UPDATE_MEETING_STATE => self.update_meeting_state(command).await,
            other => Err(GatewayError::UnknownCommand(other.to_string())),
        }
    }
}

#[async_trait]
impl BackgroundService for Controller {
    async fn start(&self, shutdown: ShutdownWatch) {
        log::info!("controller started");
        tokio::join!(self.refresh_loop(shutdown.clone()), self.worker_loop(shutdown));
        log::info!("controller stopped");
    }
}
