use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, KeyValue, KvClient, Txn, TxnOp,
    WatchClient, WatchOptions,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{sync::Notify, time::sleep};
use uuid::Uuid;

use super::{
    BackendState, Command, CommandState, FrontendState, MeetingQuery, MeetingState, Store,
    COMMAND_CHANNEL,
};
use crate::config::Etcd;
use crate::core::{GatewayError, GatewayResult};

const BACKENDS: &str = "backends";
const FRONTENDS: &str = "frontends";
const MEETINGS: &str = "meetings";
const COMMANDS: &str = "commands";

/// Store backed by etcd. Records are json values under
/// `<prefix>/<table>/<id>`, revisions are etcd mod revisions.
pub struct EtcdStore {
    kv: KvClient,
    prefix: String,
    notify: Arc<Notify>,
}

impl EtcdStore {
    /// Connect and start watching the command queue.
    pub async fn connect(config: &Etcd) -> GatewayResult<Self> {
        let client = create_client(config).await?;
        let store = Self {
            kv: client.kv_client(),
            prefix: config.prefix.trim_end_matches('/').to_string(),
            notify: Arc::new(Notify::new()),
        };

        tokio::spawn(watch_commands(
            client.watch_client(),
            store.table_prefix(COMMANDS),
            store.notify.clone(),
        ));

        Ok(store)
    }

    fn table_prefix(&self, table: &str) -> String {
        format!("{}/{table}/", self.prefix)
    }

    fn key(&self, table: &str, id: &str) -> String {
        format!("{}/{table}/{id}", self.prefix)
    }

    async fn get_one<T: DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
    ) -> GatewayResult<Option<(T, KeyValue)>> {
        let response = self.kv.clone().get(self.key(table, id), None).await?;
        match response.kvs().first() {
            Some(kv) => Ok(Some((serde_json::from_slice(kv.value())?, kv.clone()))),
            None => Ok(None),
        }
    }

    async fn list<T: DeserializeOwned>(&self, table: &str) -> GatewayResult<Vec<(T, KeyValue)>> {
        let options = GetOptions::new().with_prefix();
        let response = self
            .kv
            .clone()
            .get(self.table_prefix(table), Some(options))
            .await?;
        let mut values = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            match serde_json::from_slice(kv.value()) {
                Ok(value) => values.push((value, kv.clone())),
                Err(e) => log::warn!(
                    "Skipping malformed record {}: {e}",
                    String::from_utf8_lossy(kv.key())
                ),
            }
        }
        Ok(values)
    }

    async fn put<T: Serialize>(&self, table: &str, id: &str, value: &T) -> GatewayResult<()> {
        let data = serde_json::to_vec(value)?;
        self.kv.clone().put(self.key(table, id), data, None).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> GatewayResult<bool> {
        let response = self.kv.clone().delete(self.key(table, id), None).await?;
        Ok(response.deleted() > 0)
    }

    /// Write only if the key is still at `revision`, 0 meaning absent.
    async fn compare_and_put<T: Serialize>(
        &self,
        table: &str,
        id: &str,
        revision: i64,
        value: &T,
    ) -> GatewayResult<Option<i64>> {
        let key = self.key(table, id);
        let data = serde_json::to_vec(value)?;
        let guard = if revision == 0 {
            Compare::version(key.clone(), CompareOp::Equal, 0)
        } else {
            Compare::mod_revision(key.clone(), CompareOp::Equal, revision)
        };
        let txn = Txn::new()
            .when([guard])
            .and_then([TxnOp::put(key, data, None)]);
        let response = self.kv.clone().txn(txn).await?;
        if !response.succeeded() {
            return Ok(None);
        }
        let revision = response
            .header()
            .map(|h| h.revision())
            .ok_or_else(|| GatewayError::Store("txn response without header".to_string()))?;
        Ok(Some(revision))
    }

    async fn compare_and_delete(&self, table: &str, id: &str, revision: i64) -> GatewayResult<bool> {
        let key = self.key(table, id);
        let txn = Txn::new()
            .when([Compare::mod_revision(key.clone(), CompareOp::Equal, revision)])
            .and_then([TxnOp::delete(key, None)]);
        Ok(self.kv.clone().txn(txn).await?.succeeded())
    }
}

async fn create_client(config: &Etcd) -> GatewayResult<Client> {
    let mut options = ConnectOptions::default();
    if let Some(timeout) = config.timeout {
        options = options.with_timeout(Duration::from_secs(timeout as u64));
    };
    if let Some(connect_timeout) = config.connect_timeout {
        options = options.with_connect_timeout(Duration::from_secs(connect_timeout as u64));
    };
    if let (Some(user), Some(password)) = (&config.user, &config.password) {
        options = options.with_user(user.clone(), password.clone());
    };

    let client = Client::connect(config.host.clone(), Some(options)).await?;
    Ok(client)
}

/// Wake waiting workers whenever a command is written. The stream is
/// reopened after failures; workers poll on timeout so a gap only
/// delays them.
async fn watch_commands(mut client: WatchClient, prefix: String, notify: Arc<Notify>) {
    loop {
        let options = WatchOptions::new().with_prefix();
        match client.watch(prefix.as_bytes(), Some(options)).await {
            Ok((_watcher, mut stream)) => {
                log::info!("Watching {COMMAND_CHANNEL} at {prefix}");
                loop {
                    match stream.message().await {
                        Ok(Some(response)) => {
                            if response.canceled() {
                                break;
                            }
                            if !response.events().is_empty() {
                                notify.notify_waiters();
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            log::error!("Watch on {COMMAND_CHANNEL} failed: {err}");
                            break;
                        }
                    }
                }
            }
            Err(err) => log::error!("Failed to watch {COMMAND_CHANNEL}: {err}"),
        }
        sleep(Duration::from_secs(1)).await;
    }
}

fn backend_from(mut backend: BackendState, kv: &KeyValue) -> BackendState {
    backend.revision = kv.mod_revision();
    backend
}

fn with_revision(mut meeting: MeetingState, kv: &KeyValue) -> MeetingState {
    meeting.revision = kv.mod_revision();
    meeting
}

fn command_from(mut command: Command, kv: &KeyValue) -> Command {
    command.revision = kv.mod_revision();
    command.seq = kv.create_revision();
    command
}

#[async_trait]
impl Store for EtcdStore {
    async fn get_backend(&self, id: &str) -> GatewayResult<Option<BackendState>> {
        Ok(self
            .get_one(BACKENDS, id)
            .await?
            .map(|(b, kv)| backend_from(b, &kv)))
    }

    async fn list_backends(&self) -> GatewayResult<Vec<BackendState>> {
        Ok(self
            .list(BACKENDS)
            .await?
            .into_iter()
            .map(|(b, kv)| backend_from(b, &kv))
            .collect())
    }

    async fn save_backend(&self, backend: &BackendState) -> GatewayResult<()> {
        self.put(BACKENDS, &backend.id, backend).await
    }

    async fn compare_and_swap_backend(&self, backend: &BackendState) -> GatewayResult<Option<i64>> {
        self.compare_and_put(BACKENDS, &backend.id, backend.revision, backend)
            .await
    }

    async fn delete_backend(&self, id: &str) -> GatewayResult<()> {
        self.delete(BACKENDS, id).await.map(|_| ())
    }

    async fn get_frontend(&self, id: &str) -> GatewayResult<Option<FrontendState>> {
        Ok(self.get_one(FRONTENDS, id).await?.map(|(f, _)| f))
    }

    async fn list_frontends(&self) -> GatewayResult<Vec<FrontendState>> {
        Ok(self
            .list(FRONTENDS)
            .await?
            .into_iter()
            .map(|(f, _)| f)
            .collect())
    }

    async fn save_frontend(&self, frontend: &FrontendState) -> GatewayResult<()> {
        self.put(FRONTENDS, &frontend.id, frontend).await
    }

    async fn delete_frontend(&self, id: &str) -> GatewayResult<()> {
        self.delete(FRONTENDS, id).await.map(|_| ())
    }

    async fn get_meeting(&self, id: &str) -> GatewayResult<Option<MeetingState>> {
        Ok(self
            .get_one(MEETINGS, id)
            .await?
            .map(|(m, kv)| with_revision(m, &kv)))
    }

    async fn find_meetings(&self, query: &MeetingQuery) -> GatewayResult<Vec<MeetingState>> {
        Ok(self
            .list::<MeetingState>(MEETINGS)
            .await?
            .into_iter()
            .map(|(m, kv)| with_revision(m, &kv))
            .filter(|m| query.matches(m))
            .collect())
    }

    async fn compare_and_swap_meeting(&self, meeting: &MeetingState) -> GatewayResult<Option<i64>> {
        self.compare_and_put(MEETINGS, &meeting.id, meeting.revision, meeting)
            .await
    }

    async fn delete_meeting(&self, id: &str) -> GatewayResult<bool> {
        self.delete(MEETINGS, id).await
    }

    async fn delete_orphan_meetings(
        &self,
        backend_id: &str,
        keep: &[String],
    ) -> GatewayResult<usize> {
        let mut removed = 0;
        for meeting in self.find_meetings(&MeetingQuery::backend(backend_id)).await? {
            if keep.contains(&meeting.id) {
                continue;
            }
            // A concurrent rebind or refresh wins over the prune.
            if self
                .compare_and_delete(MEETINGS, &meeting.id, meeting.revision)
                .await?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn queue_command(&self, command: &Command) -> GatewayResult<Command> {
        let id = command.id.to_string();
        let revision = self
            .compare_and_put(COMMANDS, &id, 0, command)
            .await?
            .ok_or_else(|| GatewayError::Store(format!("command {id} already queued")))?;
        let mut stored = command.clone();
        stored.seq = revision;
        stored.revision = revision;
        Ok(stored)
    }

    async fn get_command(&self, id: &Uuid) -> GatewayResult<Option<Command>> {
        Ok(self
            .get_one(COMMANDS, &id.to_string())
            .await?
            .map(|(c, kv)| command_from(c, &kv)))
    }

    async fn requested_commands(&self) -> GatewayResult<Vec<Command>> {
        let mut commands: Vec<Command> = self
            .list::<Command>(COMMANDS)
            .await?
            .into_iter()
            .map(|(c, kv)| command_from(c, &kv))
            .filter(|c| c.state == CommandState::Requested)
            .collect();
        commands.sort_by_key(|c| c.seq);
        Ok(commands)
    }

    async fn compare_and_swap_command(&self, command: &Command) -> GatewayResult<Option<i64>> {
        if command.revision == 0 {
            return Ok(None);
        }
        self.compare_and_put(COMMANDS, &command.id.to_string(), command.revision, command)
            .await
    }

    async fn delete_finished_commands(&self, before: DateTime<Utc>) -> GatewayResult<usize> {
        let mut removed = 0;
        for (command, kv) in self.list::<Command>(COMMANDS).await? {
            if !command.finished_before(before) {
                continue;
            }
            if self
                .compare_and_delete(COMMANDS, &command.id.to_string(), kv.mod_revision())
                .await?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn wait_for_command(&self, timeout: Duration) -> GatewayResult<bool> {
        Ok(tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok())
    }
}
