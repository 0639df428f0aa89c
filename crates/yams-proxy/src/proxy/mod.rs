//! Request dispatcher and proxy listener.
//!
//! Per request: profile match by host, route match by method and path,
//! adapter dispatch, reverse-proxy fallback. Configuration is re-read from
//! the store on every request; nothing user-editable is cached in process.

pub mod error;
pub mod reverse;

use crate::body::ResponseBody;
use crate::matcher;
use crate::model::{Profile, Route};
use crate::scripting::{self, BodyState, ScriptOutcome, ScriptRequest};
use crate::session::{
    self, HEADER_ROUTE_ID, HEADER_SESSION_ID, HEADER_STATUS, STATUS_INTERCEPTED,
};
use crate::store::Storage;
use bytes::Bytes;
use error::{ErrorContext, RouteErrorInfo};
use futures::FutureExt;
use hyper::header::{HeaderValue, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use reverse::UpstreamClient;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct ProxyServer {
    store: Arc<dyn Storage>,
    upstream: UpstreamClient,
    /// Global debug mode (`--mode debug`): error pages include the panic
    /// source location.
    global_debug: bool,
}

impl ProxyServer {
    pub fn new(store: Arc<dyn Storage>, global_debug: bool) -> Self {
        Self {
            store,
            upstream: UpstreamClient::new(),
            global_debug,
        }
    }

    pub async fn run(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("proxy listening on {addr}");
        self.serve(listener).await
    }

    /// Accept loop; one spawned task per connection. A connection whose
    /// request hits a `timeout == 0` route is dropped before any response
    /// bytes are written (the hijack path).
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let server = Arc::new(self);
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = Arc::clone(&server);

            tokio::spawn(async move {
                let hijack = CancellationToken::new();
                let io = TokioIo::new(stream);
                let service_token = hijack.clone();
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    let token = service_token.clone();
                    async move { Ok::<_, Infallible>(server.handle(req, remote_addr, token).await) }
                });

                tokio::select! {
                    biased;
                    _ = hijack.cancelled() => {
                        debug!("connection from {remote_addr} hijacked, closing");
                    }
                    result = http1::Builder::new().serve_connection(io, service) => {
                        if let Err(err) = result {
                            debug!("error serving connection from {remote_addr}: {err}");
                        }
                    }
                }
            });
        }
    }

    /// Top-level recovery point: anything that unwinds below lands on the
    /// error page instead of killing the connection task.
    async fn handle(
        &self,
        req: Request<hyper::body::Incoming>,
        remote_addr: SocketAddr,
        hijack: CancellationToken,
    ) -> Response<ResponseBody> {
        let result = AssertUnwindSafe(self.dispatch(req, remote_addr, &hijack))
            .catch_unwind()
            .await;
        match result {
            Ok(response) => response,
            Err(panic) => {
                let mut ctx = ErrorContext::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    panic_message(panic),
                );
                ctx.location = error::take_panic_location();
                error::render(ctx, self.global_debug)
            }
        }
    }

    async fn dispatch(
        &self,
        req: Request<hyper::body::Incoming>,
        remote_addr: SocketAddr,
        hijack: &CancellationToken,
    ) -> Response<ResponseBody> {
        match self.dispatch_inner(req, remote_addr, hijack).await {
            Ok(response) => response,
            Err(ctx) => error::render(ctx, self.global_debug),
        }
    }

    async fn dispatch_inner(
        &self,
        req: Request<hyper::body::Incoming>,
        remote_addr: SocketAddr,
        hijack: &CancellationToken,
    ) -> Result<Response<ResponseBody>, ErrorContext> {
        let host_raw = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().host().map(str::to_string))
            .unwrap_or_default();
        let host = matcher::normalize_host(&host_raw).to_string();

        let profile = self
            .store
            .profile_by_host(&host)
            .await
            .map_err(internal)?
            .ok_or_else(|| {
                ErrorContext::new(
                    StatusCode::NOT_FOUND,
                    format!("yams: no profile configured for host \"{host_raw}\""),
                )
            })?;

        let path = req.uri().path().to_string();
        let method = req.method().to_string();
        let routes = self
            .store
            .routes_for_profile(profile.id)
            .await
            .map_err(internal)?;
        let matched = matcher::match_route(&routes, &method, &path)
            .map(|m| (m.route.clone(), m.args))
            .filter(|(route, _)| route.is_enabled);

        let (route, args) = match matched {
            Some(matched) => matched,
            None => {
                return match &profile.backend {
                    Some(backend) => Ok(self.forward_transparent(req, backend, &profile).await),
                    None => Err(ErrorContext::new(
                        StatusCode::NOT_FOUND,
                        format!("yams: no route found for path \"{path}\""),
                    )),
                };
            }
        };

        let sid = session::derive_sid(req.headers());

        // Black-hole behaviour for disconnection testing: take over the
        // connection and close it without an HTTP response.
        if route.timeout == 0 {
            hijack.cancel();
            futures::future::pending::<()>().await;
            unreachable!("hijacked connection is dropped by the accept loop");
        }

        let (parts, body) = req.into_parts();
        let script_req = ScriptRequest {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            remote_addr,
            body: BodyState::Pending(body),
        };

        let mut response = match scripting::execute(
            &route,
            &args,
            &profile,
            script_req,
            &sid,
            Arc::clone(&self.store),
        )
        .await
        {
            Ok(ScriptOutcome::Response(response)) => response,
            Ok(ScriptOutcome::Pass { target, request }) => {
                let body = match request.body {
                    BodyState::Pending(incoming) => reverse::streaming_body(incoming),
                    BodyState::Buffered(bytes) => reverse::buffered_body(bytes),
                    BodyState::Empty => reverse::buffered_body(Bytes::new()),
                };
                self.upstream
                    .forward(
                        request.method,
                        &request.uri,
                        &request.headers,
                        body,
                        &target,
                        profile.is_debug,
                    )
                    .await
            }
            Err(err) => error::render(
                ErrorContext::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).with_route(
                    RouteErrorInfo {
                        rows: route.debug_info(&method),
                        profile_debug: profile.is_debug,
                    },
                ),
                self.global_debug,
            ),
        };

        decorate(&mut response, &profile, &route, &sid);
        Ok(response)
    }

    async fn forward_transparent(
        &self,
        req: Request<hyper::body::Incoming>,
        backend: &str,
        profile: &Profile,
    ) -> Response<ResponseBody> {
        let (parts, body) = req.into_parts();
        self.upstream
            .forward(
                parts.method,
                &parts.uri,
                &parts.headers,
                reverse::streaming_body(body),
                backend,
                profile.is_debug,
            )
            .await
    }
}

/// Debug header protocol: route and session ids always, status
/// `intercepted` unless the response already claimed `proxy` or `error`.
fn decorate(response: &mut Response<ResponseBody>, profile: &Profile, route: &Route, sid: &str) {
    if !profile.is_debug {
        return;
    }
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&route.uuid) {
        headers.insert(HEADER_ROUTE_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(sid) {
        headers.insert(HEADER_SESSION_ID, value);
    }
    if !headers.contains_key(HEADER_STATUS) {
        headers.insert(HEADER_STATUS, HeaderValue::from_static(STATUS_INTERCEPTED));
    }
}

fn internal(err: crate::store::StoreError) -> ErrorContext {
    ErrorContext::new(StatusCode::INTERNAL_SERVER_ERROR, format!("yams: {err}"))
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unexpected panic".to_string()
    }
}
