//! Meta parameters: tag meetings with their frontend and route callbacks
//! through the gateway.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;

use super::BuildContext;
use crate::config_error;
use crate::core::{GatewayResult, Next, RequestContext, RequestMiddleware};
use crate::protocol::{Request, Resource, Response, PARAM_META_FRONTEND};

pub const FRONTEND_MIDDLEWARE_NAME: &str = "set_meta_frontend";
pub const CALLBACKS_MIDDLEWARE_NAME: &str = "rewrite_meta_callback_urls";

/// Parameters carrying urls the room server calls back.
const CALLBACK_PARAMS: [&str; 4] = [
    "meta_bbb-recording-ready-url",
    "meta_analytics-callback-url",
    "meta_endCallbackUrl",
    "meetingEndedURL",
];

const SCOPE_CALLBACK: &str = "callback";

pub fn create_set_meta_frontend_middleware(
    _: &BuildContext,
    _: &YamlValue,
) -> GatewayResult<Arc<dyn RequestMiddleware>> {
    Ok(Arc::new(SetMetaFrontend))
}

pub fn create_rewrite_callbacks_middleware(
    ctx: &BuildContext,
    _: &YamlValue,
) -> GatewayResult<Arc<dyn RequestMiddleware>> {
    let api_url = ctx
        .server
        .api_url
        .as_deref()
        .ok_or_else(|| config_error!("{} requires server.api_url", CALLBACKS_MIDDLEWARE_NAME))?;
    let secret = ctx
        .server
        .jwt_secret
        .as_deref()
        .ok_or_else(|| config_error!("{} requires server.jwt_secret", CALLBACKS_MIDDLEWARE_NAME))?;
    Ok(Arc::new(RewriteCallbackUrls {
        api_url: api_url.trim_end_matches('/').to_string(),
        key: EncodingKey::from_secret(secret.as_bytes()),
    }))
}

/// Records the frontend key in the meeting metadata on create.
pub struct SetMetaFrontend;

#[async_trait]
impl RequestMiddleware for SetMetaFrontend {
    fn name(&self) -> &'static str {
        FRONTEND_MIDDLEWARE_NAME
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        mut req: Request,
        next: Next<'_>,
    ) -> GatewayResult<Response> {
        if let (Resource::Create, Some(frontend)) = (req.resource, ctx.frontend.as_ref()) {
            req.params.insert(PARAM_META_FRONTEND, frontend.key.as_str());
        }
        next.run(ctx, req).await
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallbackClaims {
    /// Frontend id
    pub sub: String,
    /// The original callback url
    pub aud: String,
    pub scope: String,
    pub iat: i64,
}

/// Replaces callback urls with a signed url of the callback proxy.
pub struct RewriteCallbackUrls {
    api_url: String,
    key: EncodingKey,
}

impl RewriteCallbackUrls {
    fn proxy_url(&self, frontend_id: &str, callback: &str) -> GatewayResult<String> {
        let claims = CallbackClaims {
            sub: frontend_id.to_string(),
            aud: callback.to_string(),
            scope: SCOPE_CALLBACK.to_string(),
            iat: Utc::now().timestamp(),
        };
        let token = encode(&Header::default(), &claims, &self.key)?;
        Ok(format!("{}/api/v1/callbacks/proxy/{token}", self.api_url))
    }
}

#[async_trait]
impl RequestMiddleware for RewriteCallbackUrls {
    fn name(&self) -> &'static str {
        CALLBACKS_MIDDLEWARE_NAME
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        mut req: Request,
        next: Next<'_>,
    ) -> GatewayResult<Response> {
        if let Some(frontend) = ctx.frontend.as_ref() {
            for param in CALLBACK_PARAMS {
                let Some(callback) = req.params.get(param) else {
                    continue;
                };
                let proxied = self.proxy_url(&frontend.id, callback)?;
                req.params.insert(param, proxied);
            }
        }
        next.run(ctx, req).await
    }
}
