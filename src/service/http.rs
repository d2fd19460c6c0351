use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use matchit::{Match, Router};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};

use crate::cluster::{gateway::error_response, Gateway};
use crate::config;
use crate::core::{GatewayError, GatewayResult, RequestContext};
use crate::middleware::meetings::RETRY_JOIN_PATH;
use crate::protocol::{Params, Request, Resource, Response};
use crate::store::Store;
use crate::utils::templates;

/// Mount point of the room server API.
pub const API_PREFIX: &str = "/bbb/";

#[derive(Debug, Clone, Copy)]
enum Route {
    Api,
    ApiIndex,
    RetryJoin,
    Health,
}

/// An inbound HTTP request, detached from the server session.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub method: Method,
    /// Path and query
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Inbound {
    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            uri: uri.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn path(&self) -> &str {
        self.uri.split_once('?').map_or(&self.uri, |(path, _)| path)
    }

    fn query(&self) -> &str {
        self.uri.split_once('?').map_or("", |(_, query)| query)
    }
}

pub struct ApiHttpApp {
    router: Router<Route>,
    store: Arc<dyn Store>,
    gateway: Arc<Gateway>,
    request_timeout: Duration,
    max_body_size: usize,
}

impl ApiHttpApp {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<Gateway>,
        server: &config::Server,
    ) -> GatewayResult<Self> {
        let mut router = Router::new();
        for (path, route) in [
            ("/bbb/{key}/api", Route::ApiIndex),
            ("/bbb/{key}/api/{*resource}", Route::Api),
            ("/_b3scale/retry-join/{payload}", Route::RetryJoin),
            ("/health", Route::Health),
        ] {
            router
                .insert(path, route)
                .map_err(|e| GatewayError::Configuration(format!("route {path}: {e}")))?;
        }
        Ok(Self {
            router,
            store,
            gateway,
            request_timeout: Duration::from_secs(server.request_timeout),
            max_body_size: server.max_body_size,
        })
    }

    pub fn api_http_service(app: Self, server: &config::Server) -> Service<Self> {
        let mut service = Service::new("Room API HTTP".to_string(), app);
        service.add_tcp(&server.listen.to_string());
        service.threads = server.threads;
        service
    }

    /// Answer an inbound request.
    pub async fn serve(&self, inbound: Inbound) -> http::Response<Vec<u8>> {
        let path = match inbound.path().trim_end_matches('/') {
            "" => "/",
            path => path,
        };
        let (route, params) = match self.router.at(path) {
            Ok(Match { value, params }) => (
                *value,
                params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<Vec<_>>(),
            ),
            Err(_) => return plain(StatusCode::NOT_FOUND, "Not Found"),
        };
        let param = |name: &str| {
            params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };

        match route {
            Route::Health => plain(StatusCode::OK, "OK"),
            Route::RetryJoin if inbound.method == Method::GET => retry_join(&param("payload")),
            Route::Api | Route::ApiIndex
                if inbound.method == Method::GET || inbound.method == Method::POST =>
            {
                let resource = param("resource");
                write_response(&self.api(&param("key"), &resource, inbound).await)
            }
            _ => plain(StatusCode::METHOD_NOT_ALLOWED, ""),
        }
    }

    async fn api(&self, key: &str, resource: &str, inbound: Inbound) -> Response {
        let frontend = match self.store.get_frontend_by_key(key).await {
            Ok(Some(frontend)) => frontend,
            Ok(None) => {
                log::warn!(key = key; "request for unknown frontend");
                return Response::failed("unknownFrontend", "No such frontend for key")
                    .with_status(StatusCode::NOT_FOUND);
            }
            Err(e) => return error_response(&e),
        };
        if !frontend.active {
            log::warn!(frontend = frontend.id.as_str(); "request for inactive frontend");
            return Response::failed("frontendInactive", "The frontend is not active")
                .with_status(StatusCode::FORBIDDEN);
        }

        let resource: Resource = match resource.parse() {
            Ok(resource) => resource,
            Err(_) => {
                return Response::failed(
                    "unsupportedRequest",
                    &format!("The request {resource} is not supported"),
                )
            }
        };

        let req = decode_request(resource, inbound);
        // The version index is public, like on a room server.
        if resource != Resource::Index {
            if let Err(e) = req.verify(&frontend.secret) {
                return error_response(&e);
            }
        }

        let ctx = RequestContext::new()
            .with_frontend(frontend)
            .with_timeout(self.request_timeout);
        self.gateway.dispatch(&ctx, req).await
    }
}

/// Decode the protocol request. Only the content type travels
/// with it to the backends.
fn decode_request(resource: Resource, inbound: Inbound) -> Request {
    let mut req = Request::new(resource, Params::from_query(inbound.query()));
    req.method = inbound.method.clone();
    if let Some(content_type) = inbound.headers.get(header::CONTENT_TYPE) {
        req.headers.insert(header::CONTENT_TYPE, content_type.clone());
    }
    if !inbound.body.is_empty() {
        req.body = Some(inbound.body.clone());
    }
    req.url = inbound.uri;
    req
}

fn retry_join(payload: &str) -> http::Response<Vec<u8>> {
    let req = match Request::unmarshal_url_safe(payload) {
        Ok(req) => req,
        Err(e) => {
            log::debug!("undecodable retry join payload: {e}");
            return plain(StatusCode::BAD_REQUEST, "invalid join request");
        }
    };
    if !req.url.starts_with(API_PREFIX) {
        return plain(StatusCode::BAD_REQUEST, "invalid join url");
    }
    html(StatusCode::OK, templates::retry_join(&req.url))
}

fn write_response(res: &Response) -> http::Response<Vec<u8>> {
    let body = match res.marshal() {
        Ok(body) => body.to_vec(),
        Err(e) => {
            log::error!("unable to encode response: {e}");
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };
    let mut out = http::Response::new(body);
    *out.status_mut() = res.status();
    *out.headers_mut() = res.header().clone();
    out
}

fn html(status: StatusCode, body: String) -> http::Response<Vec<u8>> {
    let mut out = http::Response::new(body.into_bytes());
    *out.status_mut() = status;
    out.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    out
}

fn plain(status: StatusCode, body: &str) -> http::Response<Vec<u8>> {
    let mut out = http::Response::new(body.as_bytes().to_vec());
    *out.status_mut() = status;
    out.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    out
}

/// Append a body chunk unless the body would grow past `limit`.
fn append_chunk(body: &mut Vec<u8>, chunk: &[u8], limit: usize) -> bool {
    if body.len() + chunk.len() > limit {
        return false;
    }
    body.extend_from_slice(chunk);
    true
}

async fn read_request_body(
    http_session: &mut ServerSession,
    limit: usize,
) -> Result<Bytes, http::Response<Vec<u8>>> {
    let mut body = Vec::new();
    loop {
        let chunk = match http_session.read_request_body().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                let message = format!("unable to read request body: {e}");
                return Err(plain(StatusCode::BAD_REQUEST, &message));
            }
        };
        if !append_chunk(&mut body, &chunk, limit) {
            log::warn!("request body exceeds {limit} bytes");
            return Err(plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"));
        }
    }
    Ok(Bytes::from(body))
}

#[async_trait]
impl ServeHttp for ApiHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> http::Response<Vec<u8>> {
        let (method, uri, headers) = {
            let req_header = http_session.req_header();
            let uri = req_header
                .uri
                .path_and_query()
                .map_or_else(|| req_header.uri.path().to_string(), |pq| pq.to_string());
            (req_header.method.clone(), uri, req_header.headers.clone())
        };
        let body = match read_request_body(http_session, self.max_body_size).await {
            Ok(body) => body,
            Err(res) => return res,
        };

        let res = self
            .serve(Inbound {
                method,
                uri,
                headers,
                body,
            })
            .await;
        log::debug!(status = res.status().as_u16(); "served request");
        res
    }
}
