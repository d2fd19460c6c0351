//! Routing, dispatch and binding
//!
//! Backend handles are built per request from the shared store and hold
//! no authoritative state of their own.

use std::sync::Arc;

use crate::core::{ApiClient, GatewayResult};
use crate::store::Store;

pub mod backend;
pub mod binding;
pub mod commands;
pub mod controller;
pub mod dispatch;
pub mod gateway;
pub mod router;

pub use backend::Backend;
pub use binding::{bind_meeting_backend, bind_meeting_frontend};
pub use commands::CommandQueue;
pub use controller::Controller;
pub use dispatch::dispatch_merge;
pub use gateway::{Gateway, GatewayBuilder};
pub use router::Router;

/// Access to the cluster members through the store.
#[derive(Clone)]
pub struct Cluster {
    store: Arc<dyn Store>,
    client: Arc<dyn ApiClient>,
}

impl Cluster {
    pub fn new(store: Arc<dyn Store>, client: Arc<dyn ApiClient>) -> Self {
        Self { store, client }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn get_backend(&self, id: &str) -> GatewayResult<Option<Backend>> {
        Ok(self
            .store
            .get_backend(id)
            .await?
            .map(|state| Backend::new(state, self.client.clone(), self.store.clone())))
    }

    pub async fn backends(&self) -> GatewayResult<Vec<Backend>> {
        Ok(self
            .store
            .list_backends()
            .await?
            .into_iter()
            .map(|state| Backend::new(state, self.client.clone(), self.store.clone()))
            .collect())
    }

    /// Backends eligible for new work.
    pub async fn available_backends(&self) -> GatewayResult<Vec<Backend>> {
        Ok(self
            .backends()
            .await?
            .into_iter()
            .filter(|b| b.state.is_available())
            .collect())
    }

    /// The backend a meeting is bound to, if it still exists.
    pub async fn meeting_backend(&self, meeting_id: &str) -> GatewayResult<Option<Backend>> {
        let Some(meeting) = self.store.get_meeting(meeting_id).await? else {
            return Ok(None);
        };
        match meeting.backend_id {
            Some(id) => self.get_backend(&id).await,
            None => Ok(None),
        }
    }
}
