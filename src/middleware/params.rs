//! Per frontend default and override parameters for create and join.

use std::sync::Arc;

use async_trait::async_trait;
use serde_yaml::Value as YamlValue;

use super::BuildContext;
use crate::core::{GatewayResult, Next, RequestContext, RequestMiddleware};
use crate::protocol::{Params, Request, Resource, Response, PARAM_DISABLED_FEATURES};
use crate::store::FrontendSettings;

pub const CREATE_MIDDLEWARE_NAME: &str = "set_create_params";
pub const JOIN_MIDDLEWARE_NAME: &str = "set_join_params";

pub fn create_set_create_params_middleware(
    _: &BuildContext,
    _: &YamlValue,
) -> GatewayResult<Arc<dyn RequestMiddleware>> {
    Ok(Arc::new(SetParams {
        name: CREATE_MIDDLEWARE_NAME,
        resource: Resource::Create,
        select: create_params,
    }))
}

pub fn create_set_join_params_middleware(
    _: &BuildContext,
    _: &YamlValue,
) -> GatewayResult<Arc<dyn RequestMiddleware>> {
    Ok(Arc::new(SetParams {
        name: JOIN_MIDDLEWARE_NAME,
        resource: Resource::Join,
        select: join_params,
    }))
}

type SelectParams = fn(&FrontendSettings) -> (&Params, &Params);

fn create_params(settings: &FrontendSettings) -> (&Params, &Params) {
    (&settings.create_default_params, &settings.create_override_params)
}

fn join_params(settings: &FrontendSettings) -> (&Params, &Params) {
    (&settings.join_default_params, &settings.join_override_params)
}

pub struct SetParams {
    name: &'static str,
    resource: Resource,
    /// Defaults and overrides for the resource.
    select: SelectParams,
}

/// Overrides win, defaults fill gaps. Disabled features are merged.
pub fn apply_params(params: &mut Params, defaults: &Params, overrides: &Params) {
    for (key, value) in overrides.iter() {
        params.insert(key.as_str(), value.as_str());
    }
    for (key, value) in defaults.iter() {
        if key != PARAM_DISABLED_FEATURES && !params.contains(key) {
            params.insert(key.as_str(), value.as_str());
        }
    }

    let Some(default_features) = defaults.get(PARAM_DISABLED_FEATURES) else {
        return;
    };
    let requested = params.get(PARAM_DISABLED_FEATURES).unwrap_or_default();
    let mut features: Vec<&str> = Vec::new();
    for feature in requested.split(',').chain(default_features.split(',')) {
        if !feature.is_empty() && !features.contains(&feature) {
            features.push(feature);
        }
    }
    let merged = features.join(",");
    params.insert(PARAM_DISABLED_FEATURES, merged);
}

#[async_trait]
impl RequestMiddleware for SetParams {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        mut req: Request,
        next: Next<'_>,
    ) -> GatewayResult<Response> {
        if req.resource == self.resource {
            if let Some(frontend) = ctx.frontend.as_ref() {
                let (defaults, overrides) = (self.select)(&frontend.settings);
                apply_params(&mut req.params, defaults, overrides);
            }
        }
        next.run(ctx, req).await
    }
}
