//! Request context management
//!
//! This module provides the RequestContext that carries per-request state
//! down the middleware pipeline. Stages that narrow the request (frontend
//! identified, backend picked) hand a derived context to the next stage.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::time::Instant;

use super::error::{GatewayError, GatewayResult};
use crate::cluster::Backend;
use crate::store::FrontendState;

/// Context that holds per-request state
#[derive(Clone, Default)]
pub struct RequestContext {
    /// The tenant that issued the request
    pub frontend: Option<FrontendState>,

    /// The backend selected for the request, set by dispatch
    pub backend: Option<Backend>,

    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frontend(mut self, frontend: FrontendState) -> Self {
        self.frontend = Some(frontend);
        self
    }

    /// Derive a context tagged with a backend. Cancellation is shared.
    pub fn with_backend(&self, backend: Backend) -> Self {
        let mut ctx = self.clone();
        ctx.backend = Some(backend);
        ctx
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn frontend(&self) -> GatewayResult<&FrontendState> {
        self.frontend.as_ref().ok_or(GatewayError::NoFrontend)
    }

    pub fn backend(&self) -> GatewayResult<&Backend> {
        self.backend.as_ref().ok_or(GatewayError::NoBackendAvailable)
    }

    /// Cancel this request and every context derived from it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail fast when the request can no longer be answered in time.
    pub fn check(&self) -> GatewayResult<()> {
        if self.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Err(GatewayError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}
