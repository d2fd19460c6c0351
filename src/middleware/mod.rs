//! Request middlewares
//!
//! Every stage of the gateway pipeline is built by name from the
//! configuration. Rewriting stages come first, the resource handlers
//! last; a handler answers the resources it knows and passes the rest on.

pub mod admin;
pub mod attendees_limit;
pub mod bind_frontend;
pub mod meetings;
pub mod meta;
pub mod params;
pub mod presentation;
pub mod recordings;
pub mod unique_meeting_id;

use std::{collections::HashMap, sync::Arc};

use once_cell::sync::Lazy;
use serde_yaml::Value as YamlValue;

use crate::cluster::{Gateway, Router};
use crate::config::{self, MiddlewareConfig};
use crate::config_error;
use crate::core::{GatewayResult, RequestMiddleware};

/// What a stage may depend on when it is built.
#[derive(Clone)]
pub struct BuildContext {
    pub router: Arc<Router>,
    pub server: config::Server,
}

pub type MiddlewareCreateFn = fn(&BuildContext, &YamlValue) -> GatewayResult<Arc<dyn RequestMiddleware>>;

static MIDDLEWARE_BUILDER_REGISTRY: Lazy<HashMap<&'static str, MiddlewareCreateFn>> =
    Lazy::new(|| {
        let arr: Vec<(&str, MiddlewareCreateFn)> = vec![
            (
                unique_meeting_id::MIDDLEWARE_NAME,
                unique_meeting_id::create_unique_meeting_id_middleware,
            ),
            (
                attendees_limit::MIDDLEWARE_NAME,
                attendees_limit::create_attendees_limit_middleware,
            ),
            (
                presentation::MIDDLEWARE_NAME,
                presentation::create_default_presentation_middleware,
            ),
            (
                params::CREATE_MIDDLEWARE_NAME,
                params::create_set_create_params_middleware,
            ),
            (
                params::JOIN_MIDDLEWARE_NAME,
                params::create_set_join_params_middleware,
            ),
            (
                meta::FRONTEND_MIDDLEWARE_NAME,
                meta::create_set_meta_frontend_middleware,
            ),
            (
                meta::CALLBACKS_MIDDLEWARE_NAME,
                meta::create_rewrite_callbacks_middleware,
            ),
            (
                bind_frontend::MIDDLEWARE_NAME,
                bind_frontend::create_bind_frontend_middleware,
            ),
            (admin::MIDDLEWARE_NAME, admin::create_admin_handler),
            (meetings::MIDDLEWARE_NAME, meetings::create_meetings_handler),
            (recordings::MIDDLEWARE_NAME, recordings::create_recordings_handler),
        ];
        arr.into_iter().collect()
    });

/// Build one stage by name. Unknown names are configuration errors.
pub fn build_middleware(
    name: &str,
    ctx: &BuildContext,
    cfg: &YamlValue,
) -> GatewayResult<Arc<dyn RequestMiddleware>> {
    let builder = MIDDLEWARE_BUILDER_REGISTRY
        .get(name)
        .ok_or_else(|| config_error!("Unknown middleware: {}", name))?;
    builder(ctx, cfg)
}

/// Build the gateway with the configured stages, in order.
pub fn build_gateway(stages: &[MiddlewareConfig], ctx: &BuildContext) -> GatewayResult<Gateway> {
    let mut builder = Gateway::builder();
    for stage in stages {
        builder = builder.use_middleware(build_middleware(&stage.name, ctx, &stage.config)?);
    }
    let gateway = builder.build();
    log::info!("gateway pipeline: {}", gateway.middleware_names().join(", "));
    Ok(gateway)
}
