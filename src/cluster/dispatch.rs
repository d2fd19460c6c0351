use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use once_cell::sync::Lazy;

use super::Backend;
use crate::core::{GatewayError, GatewayResult, Next, RequestContext, RequestMiddleware};
use crate::protocol::{Request, Response};

/// Final stage: execute the request on the backend in context.
struct BackendCall;

#[async_trait]
impl RequestMiddleware for BackendCall {
    fn name(&self) -> &'static str {
        "backend_call"
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        req: Request,
        _next: Next<'_>,
    ) -> GatewayResult<Response> {
        ctx.check()?;
        ctx.backend()?.dispatch(ctx, &req).await
    }
}

static BACKEND_CALL: Lazy<Vec<Arc<dyn RequestMiddleware>>> =
    Lazy::new(|| vec![Arc::new(BackendCall) as Arc<dyn RequestMiddleware>]);

/// A chain that sends the request to the backend in context.
pub fn backend_call() -> Next<'static> {
    Next::new(&BACKEND_CALL)
}

/// Run `next` once per backend, concurrently, each with its own backend
/// in context, and merge the responses. The first failure fails the
/// whole operation.
pub async fn dispatch_merge(
    ctx: &RequestContext,
    backends: &[Backend],
    req: Request,
    next: Next<'_>,
) -> GatewayResult<Response> {
    if backends.is_empty() {
        return Err(GatewayError::NoBackendAvailable);
    }
    if backends.len() > 1 && !req.resource.is_mergeable() {
        return Err(GatewayError::CantBeMerged(req.resource.as_str()));
    }

    let calls = backends.iter().map(|backend| {
        let ctx = ctx.with_backend(backend.clone());
        let req = req.clone();
        async move { next.run(&ctx, req).await }
    });
    let mut responses = try_join_all(calls).await?.into_iter();

    let mut merged = responses.next().ok_or(GatewayError::NoBackendAvailable)?;
    for response in responses {
        merged.merge(response)?;
    }
    Ok(merged)
}

/// Send the request to a single backend.
pub async fn dispatch_one(
    ctx: &RequestContext,
    backend: Backend,
    req: Request,
) -> GatewayResult<Response> {
    let ctx = ctx.with_backend(backend);
    backend_call().run(&ctx, req).await
}
