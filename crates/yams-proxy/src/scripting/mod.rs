//! Script adapters.
//!
//! A route names its adapter by tag; `lua` is the built-in. Each execution
//! owns a fresh, isolated interpreter for the duration of one request and
//! reports back either a finished response or a hand-off to the reverse
//! proxy.

pub mod lua;
pub mod marshal;

use crate::body::ResponseBody;
use crate::model::{Profile, Route, ADAPTER_LUA};
use crate::store::{Storage, StoreError};
use bytes::Bytes;
use hyper::body::Incoming;
use hyper::{HeaderMap, Method, Response, Uri, Version};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    /// Compile error, runtime error or argument validation failure.
    #[error("{0}")]
    Runtime(String),
    #[error("script execution exceeded route timeout [{0}]")]
    Timeout(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Request material handed to an adapter. The body is consumed lazily so
/// untouched bodies can still stream through a later `pass()`.
pub struct ScriptRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_addr: SocketAddr,
    pub body: BodyState,
}

impl std::fmt::Debug for ScriptRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRequest")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("remote_addr", &self.remote_addr)
            .field("body", &self.body)
            .finish()
    }
}

pub enum BodyState {
    /// Not yet read from the wire.
    Pending(Incoming),
    /// Fully read and cached by `getbody`/`parseform`/`dump`.
    Buffered(Bytes),
    /// No body at all (tests, synthesized requests).
    Empty,
}

impl std::fmt::Debug for BodyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodyState::Pending(_) => f.write_str("BodyState::Pending(..)"),
            BodyState::Buffered(b) => f.debug_tuple("BodyState::Buffered").field(b).finish(),
            BodyState::Empty => f.write_str("BodyState::Empty"),
        }
    }
}

/// What a script run produced.
#[derive(Debug)]
pub enum ScriptOutcome {
    /// A finished response: synthesized writes, a `dump`, or an error page
    /// input further up.
    Response(Response<ResponseBody>),
    /// `pass(target)`: the dispatcher forwards the (possibly re-buffered)
    /// request to the target through the reverse proxy.
    Pass {
        target: String,
        request: ScriptRequest,
    },
}

/// Dispatch a matched route to its adapter.
pub async fn execute(
    route: &Route,
    path_args: &HashMap<String, String>,
    profile: &Profile,
    request: ScriptRequest,
    sid: &str,
    store: Arc<dyn Storage>,
) -> Result<ScriptOutcome, ScriptError> {
    match route.adapter.as_str() {
        ADAPTER_LUA => lua::LuaScript::new(route, path_args, profile, request, sid, store)
            .execute()
            .await,
        other => Err(ScriptError::Runtime(format!(
            "yams: unknown adapter \"{other}\""
        ))),
    }
}
