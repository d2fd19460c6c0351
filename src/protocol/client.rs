use std::time::Duration;

use async_trait::async_trait;
use http::{header, Method};

use super::{Request, Response};
use crate::core::{ApiClient, GatewayError, GatewayResult};
use crate::store::BackendState;

/// Protocol client talking to room servers over HTTP.
pub struct HttpApiClient {
    client: reqwest::Client,
}

impl HttpApiClient {
    pub fn new(timeout: Duration) -> GatewayResult<Self> {
        // Redirects are part of the protocol (join) and go back to the caller.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Configuration(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn send(&self, backend: &BackendState, req: &Request) -> GatewayResult<Response> {
        let url = req.url_for(&backend.host, &backend.secret);
        let method = if req.has_body() {
            Method::POST
        } else {
            req.method.clone()
        };

        let mut builder = self.client.request(method, &url);
        if let Some(body) = req.body.as_ref().filter(|b| !b.is_empty()) {
            builder = builder
                .header(header::CONTENT_TYPE, "application/xml")
                .body(body.clone());
        }

        let res = builder
            .send()
            .await
            .map_err(|e| GatewayError::transport(&backend.id, e))?;

        let status = res.status();
        let mut headers = Vec::new();
        for name in [header::CONTENT_TYPE, header::LOCATION] {
            if let Some(value) = res.headers().get(&name) {
                headers.push((name, value.clone()));
            }
        }
        let data = res
            .bytes()
            .await
            .map_err(|e| GatewayError::transport(&backend.id, e))?;

        let mut response = Response::unmarshal(req.resource, &data).map_err(|e| {
            GatewayError::transport(&backend.id, format!("{} response: {e}", req.resource))
        })?;
        for (name, value) in headers {
            response = response.with_header(name, value);
        }
        Ok(response.with_status(status))
    }
}
