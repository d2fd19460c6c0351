//! Core traits for roomscale components
//!
//! This module defines the interfaces at the seams between the
//! pipeline, the router, the protocol client and the command queue.

use std::sync::Arc;

use async_trait::async_trait;

use super::{context::RequestContext, error::GatewayResult, GatewayError};
use crate::cluster::Backend;
use crate::protocol::{Request, Response};
use crate::store::{BackendState, Command};

/// Trait for talking the room server protocol to one backend
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Sign the request with the backend secret, send it and decode the answer
    async fn send(&self, backend: &BackendState, req: &Request) -> GatewayResult<Response>;
}

/// Trait for request pipeline stages
#[async_trait]
pub trait RequestMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handle the request or pass it on through `next`
    async fn handle(
        &self,
        ctx: &RequestContext,
        req: Request,
        next: Next<'_>,
    ) -> GatewayResult<Response>;
}

/// The remaining stages of a pipeline.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn RequestMiddleware>],
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn RequestMiddleware>]) -> Self {
        Self { chain }
    }

    pub async fn run(self, ctx: &RequestContext, req: Request) -> GatewayResult<Response> {
        match self.chain.split_first() {
            Some((stage, rest)) => stage.handle(ctx, req, Next { chain: rest }).await,
            None => Err(GatewayError::Unhandled(req.resource)),
        }
    }
}

/// Trait for narrowing the backend candidates of a request
#[async_trait]
pub trait RouterFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Return the narrowed candidates, never modifying the input
    async fn filter(
        &self,
        ctx: &RequestContext,
        backends: &[Backend],
        req: &Request,
    ) -> GatewayResult<Vec<Backend>>;
}

/// Trait for executing queued commands
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command and return its result document
    async fn handle(&self, command: &Command) -> GatewayResult<serde_json::Value>;
}
