use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use super::{BackendState, Command, CommandState, FrontendState, MeetingQuery, MeetingState, Store};
use crate::core::GatewayResult;

#[derive(Default)]
struct Tables {
    revision: i64,
    backends: HashMap<String, BackendState>,
    frontends: HashMap<String, FrontendState>,
    meetings: HashMap<String, MeetingState>,
    commands: HashMap<Uuid, Command>,
}

impl Tables {
    fn next_revision(&mut self) -> i64 {
        self.revision += 1;
        self.revision
    }
}

/// In process store for single node deployments and tests.
/// Every table shares one revision counter.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    notify: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_backend(&self, id: &str) -> GatewayResult<Option<BackendState>> {
        Ok(self.tables.lock().await.backends.get(id).cloned())
    }

    async fn list_backends(&self) -> GatewayResult<Vec<BackendState>> {
        let tables = self.tables.lock().await;
        let mut backends: Vec<_> = tables.backends.values().cloned().collect();
        backends.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(backends)
    }

    async fn save_backend(&self, backend: &BackendState) -> GatewayResult<()> {
        let mut tables = self.tables.lock().await;
        let mut stored = backend.clone();
        stored.revision = tables.next_revision();
        tables.backends.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn compare_and_swap_backend(&self, backend: &BackendState) -> GatewayResult<Option<i64>> {
        let mut tables = self.tables.lock().await;
        let current = tables.backends.get(&backend.id).map(|b| b.revision).unwrap_or(0);
        if current != backend.revision {
            return Ok(None);
        }
        let revision = tables.next_revision();
        let mut stored = backend.clone();
        stored.revision = revision;
        tables.backends.insert(stored.id.clone(), stored);
        Ok(Some(revision))
    }

    async fn delete_backend(&self, id: &str) -> GatewayResult<()> {
        let mut tables = self.tables.lock().await;
        tables.next_revision();
        tables.backends.remove(id);
        Ok(())
    }

    async fn get_frontend(&self, id: &str) -> GatewayResult<Option<FrontendState>> {
        Ok(self.tables.lock().await.frontends.get(id).cloned())
    }

    async fn list_frontends(&self) -> GatewayResult<Vec<FrontendState>> {
        let tables = self.tables.lock().await;
        let mut frontends: Vec<_> = tables.frontends.values().cloned().collect();
        frontends.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(frontends)
    }

    async fn save_frontend(&self, frontend: &FrontendState) -> GatewayResult<()> {
        let mut tables = self.tables.lock().await;
        tables.next_revision();
        tables.frontends.insert(frontend.id.clone(), frontend.clone());
        Ok(())
    }

    async fn delete_frontend(&self, id: &str) -> GatewayResult<()> {
        let mut tables = self.tables.lock().await;
        tables.next_revision();
        tables.frontends.remove(id);
        Ok(())
    }

    async fn get_meeting(&self, id: &str) -> GatewayResult<Option<MeetingState>> {
        Ok(self.tables.lock().await.meetings.get(id).cloned())
    }

    async fn find_meetings(&self, query: &MeetingQuery) -> GatewayResult<Vec<MeetingState>> {
        let tables = self.tables.lock().await;
        let mut meetings: Vec<_> = tables
            .meetings
            .values()
            .filter(|m| query.matches(m))
            .cloned()
            .collect();
        meetings.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(meetings)
    }

    async fn compare_and_swap_meeting(&self, meeting: &MeetingState) -> GatewayResult<Option<i64>> {
        let mut tables = self.tables.lock().await;
        let current = tables.meetings.get(&meeting.id).map(|m| m.revision).unwrap_or(0);
        if current != meeting.revision {
            return Ok(None);
        }
        let revision = tables.next_revision();
        let mut stored = meeting.clone();
        stored.revision = revision;
        tables.meetings.insert(stored.id.clone(), stored);
        Ok(Some(revision))
    }

    async fn delete_meeting(&self, id: &str) -> GatewayResult<bool> {
        let mut tables = self.tables.lock().await;
        tables.next_revision();
        Ok(tables.meetings.remove(id).is_some())
    }

    async fn delete_orphan_meetings(
        &self,
        backend_id: &str,
        keep: &[String],
    ) -> GatewayResult<usize> {
        let mut tables = self.tables.lock().await;
        let before = tables.meetings.len();
        tables.meetings.retain(|id, m| {
            m.backend_id.as_deref() != Some(backend_id) || keep.contains(id)
        });
        let removed = before - tables.meetings.len();
        if removed > 0 {
            tables.next_revision();
        }
        Ok(removed)
    }

    async fn queue_command(&self, command: &Command) -> GatewayResult<Command> {
        let stored = {
            let mut tables = self.tables.lock().await;
            let revision = tables.next_revision();
            let mut stored = command.clone();
            stored.seq = revision;
            stored.revision = revision;
            tables.commands.insert(stored.id, stored.clone());
            stored
        };
        self.notify.notify_waiters();
        Ok(stored)
    }

    async fn get_command(&self, id: &Uuid) -> GatewayResult<Option<Command>> {
        Ok(self.tables.lock().await.commands.get(id).cloned())
    }

    async fn requested_commands(&self) -> GatewayResult<Vec<Command>> {
        let tables = self.tables.lock().await;
        let mut commands: Vec<_> = tables
            .commands
            .values()
            .filter(|c| c.state == CommandState::Requested)
            .cloned()
            .collect();
        commands.sort_by_key(|c| c.seq);
        Ok(commands)
    }

    async fn compare_and_swap_command(&self, command: &Command) -> GatewayResult<Option<i64>> {
        let mut tables = self.tables.lock().await;
        let Some(current) = tables.commands.get(&command.id).map(|c| c.revision) else {
            return Ok(None);
        };
        if current != command.revision {
            return Ok(None);
        }
        let revision = tables.next_revision();
        let mut stored = command.clone();
        stored.revision = revision;
        tables.commands.insert(stored.id, stored);
        Ok(Some(revision))
    }

    async fn delete_finished_commands(&self, before: DateTime<Utc>) -> GatewayResult<usize> {
        let mut tables = self.tables.lock().await;
        let count = tables.commands.len();
        tables.commands.retain(|_, c| !c.finished_before(before));
        let removed = count - tables.commands.len();
        if removed > 0 {
            tables.next_revision();
        }
        Ok(removed)
    }

    async fn wait_for_command(&self, timeout: Duration) -> GatewayResult<bool> {
        Ok(tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Meeting;

    fn meeting(id: &str, backend: Option<&str>) -> MeetingState {
        let mut m = MeetingState::new(Meeting {
            meeting_id: id.to_string(),
            internal_meeting_id: format!("{id}-int"),
            ..Default::default()
        });
        m.backend_id = backend.map(String::from);
        m
    }

    #[tokio::test]
    async fn test_meeting_compare_and_swap() {
        let store = MemoryStore::new();
        let m = meeting("m1", None);
        let rev = store.compare_and_swap_meeting(&m).await.unwrap().unwrap();

        // stale create is rejected
        assert!(store.compare_and_swap_meeting(&m).await.unwrap().is_none());

        let mut current = store.get_meeting("m1").await.unwrap().unwrap();
        assert_eq!(current.revision, rev);
        current.backend_id = Some("b1".into());
        assert!(store.compare_and_swap_meeting(&current).await.unwrap().is_some());
        // second write with the old revision loses
        assert!(store.compare_and_swap_meeting(&current).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_and_prune_meetings() {
        let store = MemoryStore::new();
        for m in [
            meeting("m1", Some("b1")),
            meeting("m2", Some("b1")),
            meeting("m3", Some("b2")),
            meeting("m4", None),
        ] {
            store.compare_and_swap_meeting(&m).await.unwrap();
        }

        let b1 = store.find_meetings(&MeetingQuery::backend("b1")).await.unwrap();
        assert_eq!(b1.len(), 2);
        let bound = store
            .find_meetings(&MeetingQuery::default().bound())
            .await
            .unwrap();
        assert_eq!(bound.len(), 3);
        let by_internal = store.find_meeting_by_internal_id("m3-int").await.unwrap();
        assert_eq!(by_internal.unwrap().id, "m3");

        let removed = store
            .delete_orphan_meetings("b1", &["m1".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_meeting("m2").await.unwrap().is_none());
        assert!(store.get_meeting("m3").await.unwrap().is_some());
        assert!(store.get_meeting("m4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_command_queue_order() {
        let store = MemoryStore::new();
        let first = store
            .queue_command(&Command::new("a", serde_json::Value::Null))
            .await
            .unwrap();
        let second = store
            .queue_command(&Command::new("b", serde_json::Value::Null))
            .await
            .unwrap();
        assert!(first.seq < second.seq);

        let requested = store.requested_commands().await.unwrap();
        assert_eq!(requested.len(), 2);
        assert_eq!(requested[0].action, "a");
    }

    #[tokio::test]
    async fn test_wait_for_command_times_out() {
        let store = MemoryStore::new();
        let woken = store
            .wait_for_command(Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!woken);
    }
}
