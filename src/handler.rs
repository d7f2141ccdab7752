//! The seam between routing and the handlers a route can dispatch to.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, HOST, HeaderName};
use hyper::{HeaderMap, Method, Response, StatusCode, Uri};
use serde_json::{Value, json};

use crate::routes::{HandlerKind, RouteMatch};

pub type GatewayResponse = Response<Full<Bytes>>;

/// An inbound request with its body already collected.
#[derive(Clone, Debug)]
pub struct GatewayRequest {
    pub method: Method,
    pub uri: Uri,
    /// Path relative to the API mount point; this is what routes match against.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
}

impl GatewayRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        let path = uri.path().to_string();
        let query = collect_queries(uri.query());
        Self {
            method,
            uri,
            path,
            query,
            headers,
            body,
            remote_addr: None,
        }
    }

    pub fn with_remote_addr(mut self, remote_addr: SocketAddr) -> Self {
        self.remote_addr = Some(remote_addr);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE.as_str())
    }

    /// Host header without the port.
    pub fn hostname(&self) -> String {
        let host = self
            .header(HOST.as_str())
            .or_else(|| self.uri.host())
            .unwrap_or_default();
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
            _ => host.to_string(),
        }
    }

    pub fn ip(&self) -> String {
        self.remote_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default()
    }

    /// Original URL as the caller sent it, path and query.
    pub fn original_url(&self) -> String {
        self.uri
            .path_and_query()
            .map(|value| value.as_str().to_string())
            .unwrap_or_else(|| self.uri.path().to_string())
    }

    pub fn query_string(&self) -> Option<&str> {
        self.uri.query()
    }
}

/// Split a query string into decoded key/value pairs, keeping repeated keys.
pub fn collect_queries(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|value| {
            url::form_urlencoded::parse(value.as_bytes())
                .filter(|(key, _)| !key.trim().is_empty())
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: GatewayRequest, route: RouteMatch) -> GatewayResponse;
}

/// One handler per [`HandlerKind`], so every routable kind is wired at construction.
#[derive(Clone)]
pub struct HandlerRegistry {
    pub message_queue: Arc<dyn RequestHandler>,
    pub reverse_proxy: Arc<dyn RequestHandler>,
}

impl HandlerRegistry {
    pub fn handler_for(&self, kind: HandlerKind) -> &Arc<dyn RequestHandler> {
        match kind {
            HandlerKind::MessageQueue => &self.message_queue,
            HandlerKind::ReverseProxy => &self.reverse_proxy,
        }
    }
}

pub fn error_response(status: StatusCode, message: impl Into<String>) -> GatewayResponse {
    let body = json!({
        "success": false,
        "message": message.into()
    });
    json_response(status, body)
}

pub fn json_response(status: StatusCode, value: Value) -> GatewayResponse {
    let body = serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string());
    let mut response = bytes_response(status, Bytes::from(body));
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

pub fn empty_response(status: StatusCode) -> GatewayResponse {
    bytes_response(status, Bytes::new())
}

pub fn bytes_response(status: StatusCode, body: Bytes) -> GatewayResponse {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
}

/// Buffer an upstream response and copy its status, headers and body. Hop-by-hop and framing
/// headers are dropped; hyper recomputes the length.
pub async fn relay_response(response: Response<Incoming>) -> Result<GatewayResponse, hyper::Error> {
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await?.to_bytes();
    let mut relayed = bytes_response(parts.status, bytes);
    for (name, value) in parts.headers.iter() {
        if !is_hop_by_hop(name) {
            relayed.headers_mut().append(name.clone(), value.clone());
        }
    }
    Ok(relayed)
}

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "te"
            | "trailer"
            | "upgrade"
            | "content-length"
    )
}
