use std::sync::Arc;

use http::StatusCode;

use crate::core::{GatewayError, GatewayResult, Next, RequestContext, RequestMiddleware};
use crate::protocol::{Request, Response};

/// Entry point for protocol requests. The pipeline is fixed once built.
pub struct Gateway {
    middlewares: Vec<Arc<dyn RequestMiddleware>>,
}

#[derive(Default)]
pub struct GatewayBuilder {
    middlewares: Vec<Arc<dyn RequestMiddleware>>,
}

impl GatewayBuilder {
    /// Append a stage to the pipeline.
    pub fn use_middleware(mut self, middleware: Arc<dyn RequestMiddleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn build(self) -> Gateway {
        Gateway {
            middlewares: self.middlewares,
        }
    }
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    pub fn middleware_names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    /// Run a request through the pipeline. Failures are answered with
    /// protocol level error responses.
    pub async fn dispatch(&self, ctx: &RequestContext, req: Request) -> Response {
        match self.try_dispatch(ctx, req).await {
            Ok(res) => res,
            Err(err) => error_response(&err),
        }
    }

    async fn try_dispatch(&self, ctx: &RequestContext, req: Request) -> GatewayResult<Response> {
        // Never contact a backend for an abandoned request.
        ctx.check()?;

        log::debug!("dispatching {req}");
        let chain = Next::new(&self.middlewares);
        match ctx.deadline() {
            Some(deadline) => tokio::time::timeout_at(deadline, chain.run(ctx, req))
                .await
                .map_err(|_| GatewayError::DeadlineExceeded)?,
            None => chain.run(ctx, req).await,
        }
    }
}

/// Map an error onto the response a tenant sees.
pub fn error_response(err: &GatewayError) -> Response {
    if err.is_not_found() {
        log::debug!("{err}");
        return Response::unknown_meeting();
    }
    match err {
        GatewayError::Unauthorized(_) => {
            log::warn!("{err}");
            Response::failed(
                "checksumError",
                "You did not pass the checksum security check",
            )
        }
        GatewayError::Unhandled(resource) => {
            log::warn!("{err}");
            Response::failed(
                "unsupportedRequest",
                &format!("The request {resource} is not supported"),
            )
        }
        GatewayError::BindingConflict { .. } => {
            log::error!("{err}");
            Response::failed("bindingConflict", &err.to_string()).with_status(StatusCode::CONFLICT)
        }
        GatewayError::Cancelled | GatewayError::DeadlineExceeded => {
            log::warn!("{err}");
            Response::failed("requestTimeout", &err.to_string())
                .with_status(StatusCode::GATEWAY_TIMEOUT)
        }
        _ => {
            log::error!("request failed: {err}");
            Response::failed("gatewayError", "The request could not be processed")
                .with_status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
