use std::{sync::Arc, time::Duration};

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use crate::core::{CommandHandler, GatewayResult};
use crate::store::{default_queue_deadline, Command, CommandState, Store};

/// Work queue for administrative commands shared by all nodes.
///
/// A command is claimed by moving it from `requested` to `running` with a
/// conditional write, so only one worker ever runs it. Failed commands
/// are recorded and left alone.
#[derive(Clone)]
pub struct CommandQueue {
    store: Arc<dyn Store>,
    wait: Duration,
}

impl CommandQueue {
    pub fn new(store: Arc<dyn Store>, wait: Duration) -> Self {
        Self { store, wait }
    }

    pub async fn queue(&self, command: Command) -> GatewayResult<Command> {
        let command = match command.deadline {
            Some(_) => command,
            None => command.with_deadline(Utc::now() + default_queue_deadline()),
        };
        let queued = self.store.queue_command(&command).await?;
        log::info!(command = queued.id.to_string().as_str(); "queued {}", queued.action);
        Ok(queued)
    }

    /// Delete finished commands older than `retention`.
    pub async fn sweep(&self, retention: ChronoDuration) -> GatewayResult<usize> {
        let removed = self
            .store
            .delete_finished_commands(Utc::now() - retention)
            .await?;
        if removed > 0 {
            log::info!("swept {removed} finished commands");
        }
        Ok(removed)
    }

    /// Claim the oldest requested command. Expired commands are failed
    /// on the way.
    async fn dequeue(&self) -> GatewayResult<Option<Command>> {
        for mut command in self.store.requested_commands().await? {
            let expired = command.is_expired(Utc::now());
            if expired {
                command.finish(CommandState::Failed, json!("timedout"));
            } else {
                command.start();
            }

            let Some(revision) = self.store.compare_and_swap_command(&command).await? else {
                // Claimed by another worker.
                continue;
            };
            command.revision = revision;
            if expired {
                log::warn!(command = command.id.to_string().as_str(); "{} timed out in queue", command.action);
                continue;
            }
            return Ok(Some(command));
        }
        Ok(None)
    }

    /// Run the next command with `handler`. Waits a bounded time for new
    /// commands and returns `None` when there was nothing to do.
    pub async fn receive(&self, handler: &dyn CommandHandler) -> GatewayResult<Option<Command>> {
        let command = match self.dequeue().await? {
            Some(command) => command,
            None => {
                self.store.wait_for_command(self.wait).await?;
                match self.dequeue().await? {
                    Some(command) => command,
                    None => return Ok(None),
                }
            }
        };
        self.run(handler, command).await.map(Some)
    }

    async fn run(&self, handler: &dyn CommandHandler, mut command: Command) -> GatewayResult<Command> {
        let id = command.id.to_string();
        log::info!(command = id.as_str(); "running {}", command.action);

        match handler.handle(&command).await {
            Ok(result) => command.finish(CommandState::Done, result),
            Err(err) => {
                log::error!(command = id.as_str(); "{} failed: {err}", command.action);
                command.finish(CommandState::Failed, json!(err.to_string()));
            }
        }

        match self.store.compare_and_swap_command(&command).await? {
            Some(revision) => command.revision = revision,
            None => log::error!(command = id.as_str(); "command changed while running"),
        }
        log::info!(command = id.as_str(); "{} is {}", command.action, command.state);
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::core::GatewayError;
    use crate::store::MemoryStore;

    #[derive(Default)]
    struct Counter {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler for Counter {
        async fn handle(&self, command: &Command) -> GatewayResult<serde_json::Value> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match command.action.as_str() {
                "noop" => Ok(json!("ok")),
                other => Err(GatewayError::UnknownCommand(other.to_string())),
            }
        }
    }

    fn queue() -> (Arc<MemoryStore>, CommandQueue) {
        let store = Arc::new(MemoryStore::new());
        let queue = CommandQueue::new(store.clone(), Duration::from_millis(20));
        (store, queue)
    }

    #[tokio::test]
    async fn test_queue_sets_default_deadline() {
        let (_, queue) = queue();
        let command = queue.queue(Command::new("noop", json!({}))).await.unwrap();
        let deadline = command.deadline.unwrap();
        assert!(deadline > Utc::now() + ChronoDuration::seconds(100));
    }

    #[tokio::test]
    async fn test_receive_runs_and_records() {
        let (store, queue) = queue();
        let handler = Counter::default();
        let queued = queue.queue(Command::new("noop", json!({}))).await.unwrap();

        let ran = queue.receive(&handler).await.unwrap().unwrap();
        assert_eq!(ran.id, queued.id);

        let stored = store.get_command(&queued.id).await.unwrap().unwrap();
        assert_eq!(stored.state, CommandState::Done);
        assert_eq!(stored.result, Some(json!("ok")));
        assert!(stored.started_at.is_some());
        assert!(stored.stopped_at.is_some());
    }

    #[tokio::test]
    async fn test_failure_is_recorded() {
        let (store, queue) = queue();
        let handler = Counter::default();
        let queued = queue.queue(Command::new("explode", json!({}))).await.unwrap();

        queue.receive(&handler).await.unwrap();
        let stored = store.get_command(&queued.id).await.unwrap().unwrap();
        assert_eq!(stored.state, CommandState::Failed);

        // Not retried.
        assert!(queue.receive(&handler).await.unwrap().is_none());
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_command_times_out() {
        let (store, queue) = queue();
        let handler = Counter::default();
        let expired = Command::new("noop", json!({}))
            .with_deadline(Utc::now() - ChronoDuration::seconds(1));
        let queued = queue.queue(expired).await.unwrap();

        assert!(queue.receive(&handler).await.unwrap().is_none());
        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);

        let stored = store.get_command(&queued.id).await.unwrap().unwrap();
        assert_eq!(stored.state, CommandState::Failed);
        assert_eq!(stored.result, Some(json!("timedout")));
    }

    #[tokio::test]
    async fn test_sweep_keeps_history_bounded() {
        let (store, queue) = queue();
        let handler = Counter::default();
        let mut ids = Vec::new();
        for _ in 0..25 {
            let queued = queue.queue(Command::new("noop", json!({}))).await.unwrap();
            queue.receive(&handler).await.unwrap();
            ids.push(queued.id);
            queue.sweep(ChronoDuration::zero()).await.unwrap();
        }
        assert_eq!(handler.runs.load(Ordering::SeqCst), 25);
        for id in &ids {
            assert!(store.get_command(id).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_sweep_spares_recent_and_pending() {
        let (store, queue) = queue();
        let handler = Counter::default();
        let done = queue.queue(Command::new("noop", json!({}))).await.unwrap();
        queue.receive(&handler).await.unwrap();
        let pending = queue.queue(Command::new("noop", json!({}))).await.unwrap();

        assert_eq!(queue.sweep(ChronoDuration::hours(1)).await.unwrap(), 0);
        assert!(store.get_command(&done.id).await.unwrap().is_some());

        assert_eq!(queue.sweep(ChronoDuration::zero()).await.unwrap(), 1);
        assert!(store.get_command(&done.id).await.unwrap().is_none());
        let pending = store.get_command(&pending.id).await.unwrap().unwrap();
        assert_eq!(pending.state, CommandState::Requested);
    }

    #[tokio::test]
    async fn test_receive_wakes_on_new_command() {
        let (_, queue) = queue();
        let queue = CommandQueue {
            wait: Duration::from_secs(5),
            ..queue
        };
        let handler = Counter::default();

        let producer = queue.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.queue(Command::new("noop", json!({}))).await
        });

        let ran = queue.receive(&handler).await.unwrap();
        task.await.unwrap().unwrap();
        assert!(ran.is_some());
    }
}
