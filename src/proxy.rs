//! Reverse-proxy handler: forwards a routed request and relays the upstream answer unchanged.

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::HOST;
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::gateway_log;
use crate::handler::{
    GatewayRequest, GatewayResponse, RequestHandler, error_response, is_hop_by_hop,
    relay_response,
};
use crate::routes::{RouteMatch, RouteTarget};

pub struct ReverseProxyHandler {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Default for ReverseProxyHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ReverseProxyHandler {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

/// Upstream URL for a request. Unless `ignore_path` is set, the request's route-relative path
/// and query are appended to the redirect target.
pub fn build_target(redirect: &str, ignore_path: bool, request: &GatewayRequest) -> String {
    if ignore_path {
        return redirect.to_string();
    }
    let mut target = redirect.trim_end_matches('/').to_string();
    if !request.path.starts_with('/') {
        target.push('/');
    }
    target.push_str(&request.path);
    if let Some(query) = request.query_string().filter(|query| !query.is_empty()) {
        target.push('?');
        target.push_str(query);
    }
    target
}

#[async_trait]
impl RequestHandler for ReverseProxyHandler {
    async fn handle(&self, request: GatewayRequest, route: RouteMatch) -> GatewayResponse {
        let RouteTarget::ReverseProxy { ignore_path, .. } = &route.rule.target else {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "route is not bound to a proxy target",
            );
        };
        let Some(redirect) = route.redirect_target() else {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "missing redirect target");
        };
        let target = build_target(&redirect, *ignore_path, &request);
        gateway_log::debug(
            module_path!(),
            format!("proxying {} {} to {target}", request.method, request.path),
        );

        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(target.as_str());
        for (name, value) in request.headers.iter() {
            if *name != HOST && !is_hop_by_hop(name) {
                builder = builder.header(name, value);
            }
        }
        let upstream = match builder.body(Full::new(request.body.clone())) {
            Ok(upstream) => upstream,
            Err(err) => {
                gateway_log::warn(module_path!(), format!("invalid proxy target {target}: {err}"));
                return error_response(StatusCode::BAD_GATEWAY, "invalid proxy target");
            }
        };
        let response = match self.client.request(upstream).await {
            Ok(response) => response,
            Err(err) => {
                gateway_log::error(module_path!(), format!("proxy to {target} failed: {err}"));
                return error_response(StatusCode::BAD_GATEWAY, "upstream unavailable");
            }
        };
        match relay_response(response).await {
            Ok(response) => response,
            Err(err) => {
                gateway_log::error(
                    module_path!(),
                    format!("reading upstream response from {target} failed: {err}"),
                );
                error_response(StatusCode::BAD_GATEWAY, "upstream response failed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{RawRouteRule, RouteTable};
    use hyper::{HeaderMap, Method};
    use serde_json::json;

    fn request(uri: &str, path: &str) -> GatewayRequest {
        GatewayRequest::new(Method::GET, uri.parse().unwrap(), HeaderMap::new(), Bytes::new())
            .with_path(path)
    }

    #[test]
    fn appends_path_and_query_unless_ignored() {
        let req = request("/api/v1/items?id=3", "/v1/items");
        assert_eq!(
            build_target("http://backend:9000/", false, &req),
            "http://backend:9000/v1/items?id=3"
        );
        assert_eq!(
            build_target("http://backend:9000/fixed", true, &req),
            "http://backend:9000/fixed"
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_is_502() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let raw: RawRouteRule = serde_json::from_value(json!({
            "path": "/down",
            "handler": "reverse_proxy",
            "redirect_path": format!("http://127.0.0.1:{port}/"),
            "ignore_path": true
        }))
        .unwrap();
        let route = RouteTable::compile(&[raw])
            .unwrap()
            .match_request("GET", "/down")
            .unwrap();
        let response = ReverseProxyHandler::new()
            .handle(request("/api/down", "/down"), route)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
