//! Single-host reverse proxy.
//!
//! Used for the transparent fallback when a profile has a backend but no
//! matching route, and for script `pass()` hand-offs. The target is always
//! passed in by the caller; nothing here mutates profile state.

use crate::body::{build_response, ResponseBody};
use crate::session::{HEADER_STATUS, STATUS_PROXY};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::convert::Infallible;
use tracing::{debug, error};

/// Hop-by-hop headers are stripped before forwarding, per the usual
/// reverse-proxy conventions.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

type UpstreamBody = BoxBody<Bytes, hyper::Error>;

/// Shared upstream client; connection pooling lives in `hyper_util`.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, UpstreamBody>,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("load native TLS roots")
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);
        Self { client }
    }

    /// Forward a request to `backend`, rewriting `Host` to the backend
    /// authority and streaming both bodies. Upstream failures become 502.
    pub async fn forward(
        &self,
        method: Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: UpstreamBody,
        backend: &str,
        debug: bool,
    ) -> Response<ResponseBody> {
        let backend_uri: Uri = match backend.parse() {
            Ok(uri) => uri,
            Err(e) => {
                error!(backend, "invalid backend url: {e}");
                return bad_gateway(debug);
            }
        };
        let authority = match backend_uri.authority() {
            Some(authority) => authority.clone(),
            None => {
                error!(backend, "backend url has no authority");
                return bad_gateway(debug);
            }
        };
        let scheme = backend_uri.scheme_str().unwrap_or("http");
        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let upstream_uri = format!("{scheme}://{authority}{path}");

        debug!("forwarding to {upstream_uri}");

        let mut upstream_req = Request::builder().method(method).uri(&upstream_uri);
        for (name, value) in headers.iter() {
            if name == HOST || is_hop_by_hop(name) {
                continue;
            }
            upstream_req = upstream_req.header(name, value);
        }
        upstream_req = upstream_req.header(
            HOST,
            HeaderValue::from_str(authority.as_str()).expect("authority is a valid header value"),
        );

        let upstream_req = match upstream_req.body(body) {
            Ok(req) => req,
            Err(e) => {
                error!("failed to build upstream request: {e}");
                return bad_gateway(debug);
            }
        };

        match self.client.request(upstream_req).await {
            Ok(upstream_response) => {
                let (mut parts, body) = upstream_response.into_parts();
                for name in HOP_BY_HOP {
                    parts.headers.remove(*name);
                }
                if debug {
                    parts
                        .headers
                        .insert(HEADER_STATUS, HeaderValue::from_static(STATUS_PROXY));
                }
                Response::from_parts(parts, BoxBody::new(body))
            }
            Err(e) => {
                error!("failed to forward request to upstream: {e}");
                bad_gateway(debug)
            }
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn bad_gateway(debug: bool) -> Response<ResponseBody> {
    let mut response = build_response(StatusCode::BAD_GATEWAY, "502 Bad Gateway");
    if debug {
        response
            .headers_mut()
            .insert(HEADER_STATUS, HeaderValue::from_static(STATUS_PROXY));
    }
    response
}

/// Convert cached bytes into an upstream-compatible body.
pub fn buffered_body(bytes: Bytes) -> UpstreamBody {
    BoxBody::new(http_body_util::Full::new(bytes).map_err(|never: Infallible| match never {}))
}

/// Pass an unread inbound body straight through.
pub fn streaming_body(incoming: hyper::body::Incoming) -> UpstreamBody {
    BoxBody::new(incoming)
}
