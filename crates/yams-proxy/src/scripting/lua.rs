//! The `lua` adapter.
//!
//! Each request gets a fresh interpreter with the `json`, `base64` and
//! `yams` modules preloaded. Response-writing calls are staged in a write
//! buffer so a late `setstatus` still precedes the body, and `wbclean`,
//! `pass` and `dump` can rewind. The route timeout bounds the whole run:
//! host suspension points (sleep, store calls, body reads, flush-time asset
//! loads) sit under `timeout_at`, and an instruction-count hook catches
//! CPU-bound loops.

use super::marshal;
use super::{BodyState, ScriptError, ScriptOutcome, ScriptRequest};
use crate::body::build_response;
use crate::model::{AssetMeta, Profile, Route};
use crate::session;
use crate::store::Storage;
use crate::template;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, SET_COOKIE};
use hyper::{HeaderMap, StatusCode};
use mlua::{
    Lua, LuaOptions, MetaMethod, StdLib, Table, UserData, UserDataMethods, Value as LuaValue,
    Variadic, VmState,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::time::{Duration, Instant};

/// Interpreter memory cap.
const SCRIPT_MEMORY_LIMIT: usize = 64 << 20;

/// Ceiling for `parseform` buffering.
const FORM_MAX_MEMORY: i64 = 64 << 20;

/// Instructions between deadline checks in the interpreter hook.
const HOOK_INSTRUCTION_INTERVAL: u32 = 4096;

/// Raised by capability functions to unwind the script on `exit`/`dump`/
/// `pass`. The recorded outcome, not the error, decides what happens next.
#[derive(Debug)]
struct Terminate;

impl fmt::Display for Terminate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("script terminated")
    }
}

impl std::error::Error for Terminate {}

/// Raised by the interpreter hook once the route deadline has passed.
#[derive(Debug)]
struct DeadlineExceeded;

impl fmt::Display for DeadlineExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("route timeout exceeded")
    }
}

impl std::error::Error for DeadlineExceeded {}

fn raised<T: std::error::Error + 'static>(err: &mlua::Error) -> bool {
    match err {
        mlua::Error::CallbackError { cause, .. } => raised::<T>(cause),
        mlua::Error::WithContext { cause, .. } => raised::<T>(cause),
        mlua::Error::ExternalError(e) => {
            (&**e as &(dyn std::error::Error)).downcast_ref::<T>().is_some()
        }
        _ => false,
    }
}

fn runtime_err(msg: impl Into<String>) -> mlua::Error {
    mlua::Error::RuntimeError(msg.into())
}

enum WriteOp {
    Chunk(Vec<u8>),
    /// Asset bytes are fetched at flush time, once per write.
    Asset(AssetMeta),
}

enum Terminal {
    Exit,
    Dump(Vec<u8>),
    Pass(String),
}

#[derive(Default)]
struct ScriptState {
    status: Option<StatusCode>,
    headers: HeaderMap,
    wbuf: Vec<WriteOp>,
    outcome: Option<Terminal>,
    post_form: HashMap<String, Vec<String>>,
    form_parsed: bool,
}

struct BodyCell {
    incoming: Option<hyper::body::Incoming>,
    cached: Option<Bytes>,
}

struct ScriptCtx {
    route: Route,
    path_args: HashMap<String, String>,
    profile: Profile,
    sid: String,
    method: hyper::Method,
    uri: hyper::Uri,
    version: hyper::Version,
    req_headers: HeaderMap,
    remote_addr: std::net::SocketAddr,
    query: HashMap<String, Vec<String>>,
    store: Arc<dyn Storage>,
    state: Mutex<ScriptState>,
    body: tokio::sync::Mutex<BodyCell>,
    deadline: Instant,
}

impl ScriptCtx {
    /// Read and cache the request body. Idempotent.
    async fn read_body(&self) -> mlua::Result<Bytes> {
        let mut cell = self.body.lock().await;
        if let Some(cached) = &cell.cached {
            return Ok(cached.clone());
        }
        let bytes = match cell.incoming.take() {
            Some(incoming) => incoming
                .collect()
                .await
                .map_err(|e| runtime_err(format!("failed to read request body: {e}")))?
                .to_bytes(),
            None => Bytes::new(),
        };
        cell.cached = Some(bytes.clone());
        Ok(bytes)
    }

    fn terminate(&self, outcome: Terminal) -> mlua::Error {
        let mut state = self.state.lock();
        state.outcome = Some(outcome);
        mlua::Error::external(Terminate)
    }

    /// Capability calls after a terminal outcome just unwind again; a
    /// script that catches the unwind in `pcall` cannot keep acting.
    fn check_live(&self) -> mlua::Result<()> {
        if self.state.lock().outcome.is_some() {
            return Err(mlua::Error::external(Terminate));
        }
        Ok(())
    }
}

pub struct LuaScript {
    ctx: Arc<ScriptCtx>,
}

impl LuaScript {
    pub fn new(
        route: &Route,
        path_args: &HashMap<String, String>,
        profile: &Profile,
        request: ScriptRequest,
        sid: &str,
        store: Arc<dyn Storage>,
    ) -> Self {
        let query = parse_multi_query(request.uri.query());
        let (incoming, cached) = match request.body {
            BodyState::Pending(incoming) => (Some(incoming), None),
            BodyState::Buffered(bytes) => (None, Some(bytes)),
            BodyState::Empty => (None, None),
        };
        let ctx = ScriptCtx {
            route: route.clone(),
            path_args: path_args.clone(),
            profile: profile.clone(),
            sid: sid.to_string(),
            method: request.method,
            uri: request.uri,
            version: request.version,
            req_headers: request.headers,
            remote_addr: request.remote_addr,
            query,
            store,
            state: Mutex::new(ScriptState::default()),
            body: tokio::sync::Mutex::new(BodyCell { incoming, cached }),
            deadline: Instant::now() + Duration::from_secs(route.timeout.max(0) as u64),
        };
        Self { ctx: Arc::new(ctx) }
    }

    pub async fn execute(self) -> Result<ScriptOutcome, ScriptError> {
        let deadline = self.ctx.deadline;
        let timeout = self.ctx.route.timeout;
        let fut = async {
            self.run_interpreter().await?;
            self.finish().await
        };
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(ScriptError::Timeout(timeout)),
        }
    }

    async fn run_interpreter(&self) -> Result<(), ScriptError> {
        let lua = Lua::new_with(
            StdLib::COROUTINE | StdLib::TABLE | StdLib::STRING | StdLib::UTF8 | StdLib::MATH
                | StdLib::PACKAGE,
            LuaOptions::default(),
        )
        .map_err(|e| ScriptError::Runtime(e.to_string()))?;
        lua.set_memory_limit(SCRIPT_MEMORY_LIMIT)
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;

        self.preload(&lua)
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;

        let deadline = self.ctx.deadline;
        lua.set_hook(
            mlua::HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
            move |_, _| {
                if Instant::now() >= deadline {
                    Err(mlua::Error::external(DeadlineExceeded))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        let result = lua
            .load(&self.ctx.route.script)
            .set_name(format!("route:{}", self.ctx.route.uuid))
            .exec_async()
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) if raised::<Terminate>(&err) => Ok(()),
            Err(err) if raised::<DeadlineExceeded>(&err) => {
                Err(ScriptError::Timeout(self.ctx.route.timeout))
            }
            Err(err) => Err(ScriptError::Runtime(err.to_string())),
        }
    }

    /// Turn the recorded state into the script product, flushing buffered
    /// writes unless a terminal `dump`/`pass` took over the response.
    async fn finish(&self) -> Result<ScriptOutcome, ScriptError> {
        let outcome = self.ctx.state.lock().outcome.take();
        match outcome {
            Some(Terminal::Pass(target)) => {
                let mut cell = self.ctx.body.lock().await;
                let body = if let Some(cached) = cell.cached.take() {
                    BodyState::Buffered(cached)
                } else if let Some(incoming) = cell.incoming.take() {
                    BodyState::Pending(incoming)
                } else {
                    BodyState::Empty
                };
                Ok(ScriptOutcome::Pass {
                    target,
                    request: ScriptRequest {
                        method: self.ctx.method.clone(),
                        uri: self.ctx.uri.clone(),
                        version: self.ctx.version,
                        headers: self.ctx.req_headers.clone(),
                        remote_addr: self.ctx.remote_addr,
                        body,
                    },
                })
            }
            Some(Terminal::Dump(dump)) => {
                let state = self.ctx.state.lock();
                let mut response = build_response(StatusCode::OK, dump);
                response.headers_mut().extend(state.headers.clone());
                Ok(ScriptOutcome::Response(response))
            }
            Some(Terminal::Exit) | None => self.flush().await,
        }
    }

    async fn flush(&self) -> Result<ScriptOutcome, ScriptError> {
        let (status, headers, ops) = {
            let mut state = self.ctx.state.lock();
            (
                state.status.take(),
                std::mem::take(&mut state.headers),
                std::mem::take(&mut state.wbuf),
            )
        };

        let mut body = Vec::new();
        for op in ops {
            match op {
                WriteOp::Chunk(chunk) => body.extend_from_slice(&chunk),
                WriteOp::Asset(meta) => {
                    let bytes = self.ctx.store.asset_bytes(meta.id).await?;
                    body.extend_from_slice(&bytes);
                }
            }
        }

        let mut response = build_response(status.unwrap_or(StatusCode::OK), body);
        response.headers_mut().extend(headers);
        Ok(ScriptOutcome::Response(response))
    }

    /// Register the `json`, `base64` and `yams` modules.
    fn preload(&self, lua: &Lua) -> mlua::Result<()> {
        let preload: Table = lua.globals().get::<Table>("package")?.get("preload")?;

        preload.set("json", lua.create_function(json_loader)?)?;
        preload.set("base64", lua.create_function(base64_loader)?)?;

        let ctx = Arc::clone(&self.ctx);
        preload.set(
            "yams",
            lua.create_function(move |lua, ()| build_module(lua, &ctx))?,
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// `yams` module

fn build_module(lua: &Lua, ctx: &Arc<ScriptCtx>) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    module.set("routeid", ctx.route.uuid.as_str())?;
    module.set("method", ctx.method.as_str())?;
    module.set("host", header_str(&ctx.req_headers, "host"))?;
    module.set("uri", ctx.uri.path())?;
    module.set("ip", session::client_ip(&ctx.req_headers, ctx.remote_addr))?;
    module.set("sessionid", ctx.sid.as_str())?;

    let path = lua.create_table()?;
    for (k, v) in &ctx.path_args {
        path.set(k.as_str(), v.as_str())?;
    }
    module.set("path", path)?;

    let headers = lua.create_table()?;
    let mut grouped: HashMap<String, Vec<&[u8]>> = HashMap::new();
    for (name, value) in ctx.req_headers.iter() {
        grouped
            .entry(header_title_case(name.as_str()))
            .or_default()
            .push(value.as_bytes());
    }
    for (name, values) in grouped {
        let list = lua.create_table()?;
        for (i, v) in values.iter().enumerate() {
            list.set(i + 1, lua.create_string(v)?)?;
        }
        headers.set(name, list)?;
    }
    module.set("headers", headers)?;

    let query = lua.create_table()?;
    for (k, vv) in &ctx.query {
        let list = lua.create_table()?;
        for (i, v) in vv.iter().enumerate() {
            list.set(i + 1, v.as_str())?;
        }
        query.set(k.as_str(), list)?;
    }
    module.set("query", query)?;

    let cookies = lua.create_table()?;
    for value in ctx.req_headers.get_all(hyper::header::COOKIE) {
        if let Ok(raw) = value.to_str() {
            for parsed in cookie::Cookie::split_parse(raw.to_string()).flatten() {
                cookies.set(parsed.name().to_string(), parsed.value().to_string())?;
            }
        }
    }
    module.set("cookies", cookies)?;

    let form = lua.create_table()?;
    module.set("form", form.clone())?;

    register_functions(lua, &module, form, ctx)?;
    Ok(module)
}

fn register_functions(
    lua: &Lua,
    module: &Table,
    form: Table,
    ctx: &Arc<ScriptCtx>,
) -> mlua::Result<()> {
    // setstatus
    let c = Arc::clone(ctx);
    module.set(
        "setstatus",
        lua.create_function(move |_, n: i64| {
            c.check_live()?;
            let code = u16::try_from(n)
                .ok()
                .and_then(|n| StatusCode::from_u16(n).ok())
                .ok_or_else(|| runtime_err(format!("invalid status code [{n}]")))?;
            c.state.lock().status = Some(code);
            Ok(())
        })?,
    )?;

    // getheader
    let c = Arc::clone(ctx);
    module.set(
        "getheader",
        lua.create_function(move |_, name: String| {
            c.check_live()?;
            Ok(header_str(&c.req_headers, &name))
        })?,
    )?;

    // setheader
    let c = Arc::clone(ctx);
    module.set(
        "setheader",
        lua.create_function(move |_, (name, values): (String, Variadic<String>)| {
            c.check_live()?;
            if values.is_empty() {
                return Err(runtime_err("setheader requires at least one value"));
            }
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| runtime_err(format!("invalid header name {name:?}")))?;
            let mut state = c.state.lock();
            state.headers.remove(&header);
            for value in values.iter() {
                let value = HeaderValue::from_str(value)
                    .map_err(|_| runtime_err(format!("invalid header value for {name:?}")))?;
                state.headers.append(header.clone(), value);
            }
            Ok(())
        })?,
    )?;

    // setcookie
    let c = Arc::clone(ctx);
    module.set(
        "setcookie",
        lua.create_function(
            move |_,
                  (name, value, expires, path, max_age, secure, http_only): (
                String,
                String,
                Option<i64>,
                Option<String>,
                Option<i64>,
                Option<bool>,
                Option<bool>,
            )| {
                c.check_live()?;
                let mut builder = cookie::Cookie::build((name, value))
                    .secure(secure.unwrap_or(false))
                    .http_only(http_only.unwrap_or(false));
                if let Some(path) = path.filter(|p| !p.is_empty()) {
                    builder = builder.path(path);
                }
                if let Some(age) = max_age.filter(|a| *a != 0) {
                    builder = builder.max_age(time::Duration::seconds(age));
                }
                if let Some(secs) = expires.filter(|e| *e != 0) {
                    builder = builder.expires(
                        time::OffsetDateTime::now_utc() + time::Duration::seconds(secs),
                    );
                }
                let rendered = builder.build().to_string();
                let value = HeaderValue::from_str(&rendered)
                    .map_err(|_| runtime_err("invalid cookie value"))?;
                c.state.lock().headers.append(SET_COOKIE, value);
                Ok(())
            },
        )?,
    )?;

    // parseform
    let c = Arc::clone(ctx);
    let form_table = form.clone();
    module.set(
        "parseform",
        lua.create_async_function(move |lua, maxmem: Option<i64>| {
            let c = Arc::clone(&c);
            let form_table = form_table.clone();
            async move {
                c.check_live()?;
                let maxmem = maxmem.unwrap_or(FORM_MAX_MEMORY);
                if maxmem > FORM_MAX_MEMORY {
                    return Err(runtime_err(format!(
                        "maxmemory value must be not higher than {FORM_MAX_MEMORY}"
                    )));
                }
                let bytes = c.read_body().await?;
                let content_type = header_str(&c.req_headers, CONTENT_TYPE.as_str());
                let parsed = parse_form(&content_type, bytes, maxmem as u64).await?;
                for (name, values) in &parsed {
                    let list = lua.create_table()?;
                    for (i, v) in values.iter().enumerate() {
                        list.set(i + 1, v.as_str())?;
                    }
                    form_table.set(name.as_str(), list)?;
                }
                let mut state = c.state.lock();
                state.post_form = parsed;
                state.form_parsed = true;
                Ok(())
            }
        })?,
    )?;

    // getparam
    let c = Arc::clone(ctx);
    module.set(
        "getparam",
        lua.create_function(move |lua, key: String| {
            c.check_live()?;
            if let Some(values) = c.query.get(&key) {
                if let Some(first) = values.first() {
                    return Ok(LuaValue::String(lua.create_string(first)?));
                }
            }
            if let Some(value) = c.path_args.get(&key) {
                return Ok(LuaValue::String(lua.create_string(value)?));
            }
            if let Some(values) = c.state.lock().post_form.get(&key) {
                if let Some(first) = values.first() {
                    return Ok(LuaValue::String(lua.create_string(first)?));
                }
            }
            Ok(LuaValue::Nil)
        })?,
    )?;

    // getbody
    let c = Arc::clone(ctx);
    module.set(
        "getbody",
        lua.create_async_function(move |lua, ()| {
            let c = Arc::clone(&c);
            async move {
                c.check_live()?;
                if c.state.lock().form_parsed {
                    return Err(runtime_err("request body was already parsed"));
                }
                let bytes = c.read_body().await?;
                if bytes.is_empty() {
                    return Ok(LuaValue::Nil);
                }
                Ok(LuaValue::String(lua.create_string(&bytes)?))
            }
        })?,
    )?;

    // asset
    let c = Arc::clone(ctx);
    module.set(
        "asset",
        lua.create_async_function(move |_, path: String| {
            let c = Arc::clone(&c);
            async move {
                c.check_live()?;
                let meta = c
                    .store
                    .asset_meta(c.profile.id, &path)
                    .await
                    .map_err(|e| runtime_err(e.to_string()))?;
                Ok(meta.map(|meta| LuaAsset {
                    meta,
                    store: Arc::clone(&c.store),
                }))
            }
        })?,
    )?;

    // sleep
    let c = Arc::clone(ctx);
    module.set(
        "sleep",
        lua.create_async_function(move |_, secs: f64| {
            let c = Arc::clone(&c);
            async move {
                c.check_live()?;
                if !secs.is_finite() || secs < 0.0 {
                    return Err(runtime_err("duration must be a non-negative number"));
                }
                if secs >= c.route.timeout as f64 {
                    return Err(runtime_err(format!(
                        "duration must be lower than route timeout [{}]",
                        c.route.timeout
                    )));
                }
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                Ok(())
            }
        })?,
    )?;

    // write
    let c = Arc::clone(ctx);
    module.set(
        "write",
        lua.create_function(move |_, values: Variadic<LuaValue>| {
            c.check_live()?;
            let mut state = c.state.lock();
            for value in values.iter() {
                if let LuaValue::UserData(ud) = value {
                    if let Ok(asset) = ud.borrow::<LuaAsset>() {
                        state.wbuf.push(WriteOp::Asset(asset.meta.clone()));
                        continue;
                    }
                }
                state.wbuf.push(WriteOp::Chunk(lua_display_bytes(value)));
            }
            Ok(())
        })?,
    )?;

    // wbclean
    let c = Arc::clone(ctx);
    module.set(
        "wbclean",
        lua.create_function(move |_, ()| {
            c.check_live()?;
            c.state.lock().wbuf.clear();
            Ok(())
        })?,
    )?;

    // getvar
    let c = Arc::clone(ctx);
    module.set(
        "getvar",
        lua.create_async_function(move |lua, (key, session): (String, Option<bool>)| {
            let c = Arc::clone(&c);
            async move {
                c.check_live()?;
                let sid = session.unwrap_or(false).then_some(c.sid.as_str());
                let value = c
                    .store
                    .get_var(c.profile.id, sid, &key)
                    .await
                    .map_err(|e| runtime_err(e.to_string()))?;
                match value {
                    Some(value) => json_to_lua(&lua, &value),
                    None => Ok(LuaValue::Nil),
                }
            }
        })?,
    )?;

    // setvar
    let c = Arc::clone(ctx);
    module.set(
        "setvar",
        lua.create_async_function(
            move |_, (key, value, session, lifetime): (String, LuaValue, Option<bool>, Option<i64>)| {
                let c = Arc::clone(&c);
                async move {
                    c.check_live()?;
                    let key = key.trim().to_string();
                    if key.is_empty() || key.len() > 255 {
                        return Err(runtime_err("key must be a string of valid length [1:255]"));
                    }
                    let sid = session.unwrap_or(false).then_some(c.sid.as_str());
                    if let LuaValue::Nil = value {
                        c.store
                            .delete_var(c.profile.id, sid, &key)
                            .await
                            .map_err(|e| runtime_err(e.to_string()))?;
                        return Ok(());
                    }
                    let lifetime = lifetime.unwrap_or(c.profile.vars_lifetime);
                    if lifetime > c.profile.vars_lifetime {
                        return Err(runtime_err(format!(
                            "lifetime must not exceed profile setting [{}]",
                            c.profile.vars_lifetime
                        )));
                    }
                    let encoded = marshal::lua_to_value(&value)
                        .map_err(|e| runtime_err(e.to_string()))?;
                    c.store
                        .set_var(c.profile.id, sid, &key, &encoded, lifetime)
                        .await
                        .map_err(|e| runtime_err(e.to_string()))?;
                    Ok(())
                }
            },
        )?,
    )?;

    // dump
    let c = Arc::clone(ctx);
    module.set(
        "dump",
        lua.create_async_function(move |_, with_body: Option<bool>| {
            let c = Arc::clone(&c);
            async move {
                c.check_live()?;
                let body = if with_body.unwrap_or(false) {
                    Some(c.read_body().await?)
                } else {
                    None
                };
                let dump = dump_request(&c, body.as_deref());
                {
                    let mut state = c.state.lock();
                    state.status = None;
                    state.wbuf.clear();
                }
                Err::<(), _>(c.terminate(Terminal::Dump(dump)))
            }
        })?,
    )?;

    // pass
    let c = Arc::clone(ctx);
    module.set(
        "pass",
        lua.create_function(move |_, target: Option<String>| {
            c.check_live()?;
            let target = match target.filter(|t| !t.is_empty()) {
                Some(target) => target,
                None => c.profile.backend.clone().ok_or_else(|| {
                    runtime_err("pass() requires a target when the profile has no backend")
                })?,
            };
            {
                let mut state = c.state.lock();
                state.status = None;
                state.wbuf.clear();
            }
            Err::<(), _>(c.terminate(Terminal::Pass(target)))
        })?,
    )?;

    // exit
    let c = Arc::clone(ctx);
    module.set(
        "exit",
        lua.create_function(move |_, ()| {
            c.check_live()?;
            Err::<(), _>(c.terminate(Terminal::Exit))
        })?,
    )?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Asset handles

/// Opaque asset value handed to scripts. Bytes stay in the store until a
/// `write`, `template` or `tostring` needs them.
#[derive(Clone)]
struct LuaAsset {
    meta: AssetMeta,
    store: Arc<dyn Storage>,
}

impl UserData for LuaAsset {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("getmimetype", |_, this, ()| Ok(this.meta.mime_type.clone()));

        methods.add_method("getsize", |_, this, ()| Ok(this.meta.size));

        methods.add_async_method("template", |lua, this, data: Table| async move {
            let bytes = this
                .store
                .asset_bytes(this.meta.id)
                .await
                .map_err(|e| runtime_err(e.to_string()))?;
            let text = String::from_utf8_lossy(&bytes);
            if template::is_binary_string(&text) {
                return Err(runtime_err(template::ERR_BINARY_ASSET));
            }
            let tree = marshal::lua_to_value(&LuaValue::Table(data))
                .map_err(|e| runtime_err(e.to_string()))?;
            let rendered = template::render(&text, &tree)
                .map_err(|e| runtime_err(e.to_string()))?;
            lua.create_string(rendered)
        });

        // __tostring is synchronous in Lua; bridge to the async store.
        methods.add_meta_method(MetaMethod::ToString, |lua, this, ()| {
            let store = Arc::clone(&this.store);
            let id = this.meta.id;
            let bytes = block_on_store(async move { store.asset_bytes(id).await })
                .map_err(|e| runtime_err(e.to_string()))?;
            lua.create_string(&bytes)
        });
    }
}

fn block_on_store<F, T>(fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(fut))
        }
        _ => futures::executor::block_on(fut),
    }
}

// ---------------------------------------------------------------------------
// Helper modules and conversions

fn json_loader(lua: &Lua, (): ()) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "encode",
        lua.create_function(|_, value: LuaValue| {
            let tree = marshal::lua_to_value(&value).map_err(|e| runtime_err(e.to_string()))?;
            serde_json::to_string(&tree).map_err(|e| runtime_err(e.to_string()))
        })?,
    )?;
    module.set(
        "decode",
        lua.create_function(|lua, text: mlua::String| {
            let value: Value = serde_json::from_slice(&text.as_bytes()[..])
                .map_err(|e| runtime_err(e.to_string()))?;
            json_to_lua(lua, &value)
        })?,
    )?;
    Ok(module)
}

fn base64_loader(lua: &Lua, (): ()) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "encode",
        lua.create_function(|_, data: mlua::String| Ok(BASE64.encode(&data.as_bytes()[..])))?,
    )?;
    module.set(
        "decode",
        lua.create_function(|lua, text: String| {
            let bytes = BASE64
                .decode(text.trim())
                .map_err(|e| runtime_err(e.to_string()))?;
            lua.create_string(&bytes)
        })?,
    )?;
    Ok(module)
}

/// Convert a JSON value to a Lua value.
fn json_to_lua(lua: &Lua, value: &Value) -> mlua::Result<LuaValue> {
    match value {
        Value::Null => Ok(LuaValue::Nil),
        Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(LuaValue::Number(f))
            } else {
                Ok(LuaValue::Nil)
            }
        }
        Value::String(s) => Ok(LuaValue::String(lua.create_string(s)?)),
        Value::Array(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.set(i + 1, json_to_lua(lua, item)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Stringify a Lua value the way `write` does.
fn lua_display_bytes(value: &LuaValue) -> Vec<u8> {
    match value {
        LuaValue::Nil => b"nil".to_vec(),
        LuaValue::Boolean(b) => b.to_string().into_bytes(),
        LuaValue::Integer(i) => i.to_string().into_bytes(),
        LuaValue::Number(n) => marshal::format_number(*n).into_bytes(),
        LuaValue::String(s) => s.as_bytes().to_vec(),
        other => format!("{}: {:p}", other.type_name(), other.to_pointer()).into_bytes(),
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// `x-yams-session-id` -> `X-Yams-Session-Id`, matching what scripts index.
fn header_title_case(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn parse_multi_query(query: Option<&str>) -> HashMap<String, Vec<String>> {
    let mut params: HashMap<String, Vec<String>> = HashMap::new();
    if let Some(q) = query {
        for pair in q.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(key).unwrap_or_default().into_owned();
            let value = urlencoding::decode(&value.replace('+', " "))
                .unwrap_or_default()
                .into_owned();
            params.entry(key).or_default().push(value);
        }
    }
    params
}

async fn parse_form(
    content_type: &str,
    bytes: Bytes,
    max_memory: u64,
) -> mlua::Result<HashMap<String, Vec<String>>> {
    let mut parsed: HashMap<String, Vec<String>> = HashMap::new();
    if let Ok(boundary) = multer::parse_boundary(content_type) {
        let stream = futures::stream::once(async move {
            Ok::<Bytes, std::convert::Infallible>(bytes)
        });
        let constraints = multer::Constraints::new()
            .size_limit(multer::SizeLimit::new().whole_stream(max_memory));
        let mut multipart = multer::Multipart::with_constraints(stream, boundary, constraints);
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| runtime_err(e.to_string()))?
        {
            let name = match field.name() {
                Some(name) => name.to_string(),
                None => continue,
            };
            let text = field.text().await.map_err(|e| runtime_err(e.to_string()))?;
            parsed.entry(name).or_default().push(text);
        }
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        for pair in String::from_utf8_lossy(&bytes).split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(&key.replace('+', " "))
                .unwrap_or_default()
                .into_owned();
            let value = urlencoding::decode(&value.replace('+', " "))
                .unwrap_or_default()
                .into_owned();
            parsed.entry(key).or_default().push(value);
        }
    }
    Ok(parsed)
}

/// Plain-text request dump in wire order: request line, Host, remaining
/// headers sorted by name, then the body when requested.
fn dump_request(ctx: &ScriptCtx, body: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    let path = ctx
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    out.extend_from_slice(
        format!("{} {} {:?}\r\n", ctx.method, path, ctx.version).as_bytes(),
    );
    out.extend_from_slice(format!("Host: {}\r\n", header_str(&ctx.req_headers, "host")).as_bytes());

    let mut names: Vec<String> = ctx
        .req_headers
        .keys()
        .map(|name| name.as_str().to_string())
        .filter(|name| name != "host")
        .collect();
    names.sort();
    names.dedup();
    for name in names {
        for value in ctx.req_headers.get_all(name.as_str()) {
            out.extend_from_slice(
                format!(
                    "{}: {}\r\n",
                    header_title_case(&name),
                    String::from_utf8_lossy(value.as_bytes())
                )
                .as_bytes(),
            );
        }
    }
    out.extend_from_slice(b"\r\n");
    if let Some(body) = body {
        out.extend_from_slice(body);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ADAPTER_LUA;
    use crate::scripting::{execute, testutil, ScriptOutcome};
    use crate::store::MemoryStorage;
    use hyper::Response;
    use serde_json::json;

    fn profile() -> Profile {
        Profile {
            id: 1,
            backend: None,
            is_debug: true,
            vars_lifetime: 3600,
        }
    }

    fn route(script: &str) -> Route {
        Route {
            id: 1,
            uuid: "11111111-2222-3333-4444-555555555555".to_string(),
            profile_id: 1,
            position: 0,
            methods: vec!["*".to_string()],
            path: "/hi/:n".to_string(),
            path_re: "^/hi/(?P<n>[^/]+)$".to_string(),
            path_args: vec!["n".to_string()],
            adapter: ADAPTER_LUA.to_string(),
            script: script.to_string(),
            timeout: 5,
            hint: None,
            is_enabled: true,
        }
    }

    async fn run(
        script: &str,
        store: Arc<dyn Storage>,
        request: ScriptRequest,
    ) -> Result<ScriptOutcome, ScriptError> {
        let route = route(script);
        let mut args = HashMap::new();
        args.insert("n".to_string(), "world".to_string());
        execute(&route, &args, &profile(), request, "sid123", store).await
    }

    async fn run_response(script: &str) -> Response<crate::body::ResponseBody> {
        let store = Arc::new(MemoryStorage::new());
        let request = testutil::request("GET", "/hi/world?q=1", &[("host", "a.test")], b"");
        match run(script, store, request).await.unwrap() {
            ScriptOutcome::Response(response) => response,
            ScriptOutcome::Pass { .. } => panic!("unexpected pass"),
        }
    }

    async fn body_bytes(response: Response<crate::body::ResponseBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn status_precedes_buffered_writes() {
        let response = run_response(
            r#"local y = require("yams")
               y.write("hello ")
               y.write("world")
               y.setstatus(201)"#,
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_bytes(response).await, Bytes::from("hello world"));
    }

    #[tokio::test]
    async fn constants_and_tables() {
        let response = run_response(
            r#"local y = require("yams")
               y.write(y.method, " ", y.uri, " ", y.path.n, " ", y.sessionid)
               y.write(" q=", y.query.q[1])
               y.write(" host=", y.headers["Host"][1])"#,
        )
        .await;
        assert_eq!(
            body_bytes(response).await,
            Bytes::from("GET /hi/world world sid123 q=1 host=a.test")
        );
    }

    #[tokio::test]
    async fn write_stringifies_values() {
        let response = run_response(
            r#"local y = require("yams")
               y.write(1, " ", 2.5, " ", true, " ", nil)"#,
        )
        .await;
        assert_eq!(body_bytes(response).await, Bytes::from("1 2.5 true nil"));
    }

    #[tokio::test]
    async fn wbclean_discards_pending_writes() {
        let response = run_response(
            r#"local y = require("yams")
               y.write("discarded")
               y.wbclean()
               y.write("kept")"#,
        )
        .await;
        assert_eq!(body_bytes(response).await, Bytes::from("kept"));
    }

    #[tokio::test]
    async fn exit_flushes_buffered_writes() {
        let response = run_response(
            r#"local y = require("yams")
               y.setstatus(202)
               y.write("before")
               y.exit()
               y.write("after")"#,
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_bytes(response).await, Bytes::from("before"));
    }

    #[tokio::test]
    async fn pcall_cannot_outlive_exit() {
        let response = run_response(
            r#"local y = require("yams")
               y.write("before")
               pcall(y.exit)
               pcall(function() y.write("after") end)"#,
        )
        .await;
        assert_eq!(body_bytes(response).await, Bytes::from("before"));
    }

    #[tokio::test]
    async fn getparam_prefers_query_then_path_then_form() {
        let store = Arc::new(MemoryStorage::new());
        let request = testutil::request(
            "POST",
            "/hi/world?n=fromquery",
            &[
                ("host", "a.test"),
                ("content-type", "application/x-www-form-urlencoded"),
            ],
            b"n=fromform&extra=1",
        );
        let outcome = run(
            r#"local y = require("yams")
               y.write(y.getparam("n"))
               y.parseform()
               y.write(" ", y.getparam("extra"))
               y.write(" ", tostring(y.getparam("missing")))"#,
            store,
            request,
        )
        .await
        .unwrap();
        let ScriptOutcome::Response(response) = outcome else {
            panic!("unexpected pass");
        };
        assert_eq!(body_bytes(response).await, Bytes::from("fromquery 1 nil"));
    }

    #[tokio::test]
    async fn path_arg_wins_over_form() {
        let store = Arc::new(MemoryStorage::new());
        let request = testutil::request(
            "POST",
            "/hi/world",
            &[
                ("host", "a.test"),
                ("content-type", "application/x-www-form-urlencoded"),
            ],
            b"n=fromform",
        );
        let outcome = run(
            r#"local y = require("yams")
               y.parseform()
               y.write(y.getparam("n"), " ", y.form.n[1])"#,
            store,
            request,
        )
        .await
        .unwrap();
        let ScriptOutcome::Response(response) = outcome else {
            panic!("unexpected pass");
        };
        assert_eq!(body_bytes(response).await, Bytes::from("world fromform"));
    }

    #[tokio::test]
    async fn setheader_and_setcookie() {
        let response = run_response(
            r#"local y = require("yams")
               y.setheader("X-One", "a", "b")
               y.setcookie("tok", "v", 60, "/", 0, true, true)"#,
        )
        .await;
        let values: Vec<_> = response.headers().get_all("x-one").iter().collect();
        assert_eq!(values.len(), 2);
        let cookie = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cookie.starts_with("tok=v"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("Expires="));
    }

    #[tokio::test]
    async fn sleep_must_stay_below_route_timeout() {
        let store = Arc::new(MemoryStorage::new());
        let request = testutil::request("GET", "/hi/world", &[("host", "a.test")], b"");
        let err = run(r#"require("yams").sleep(9)"#, store, request)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(
            msg.contains("duration must be lower than route timeout [5]"),
            "unexpected message: {msg}"
        );
    }

    #[tokio::test]
    async fn variables_roundtrip_with_session_scope() {
        let store = Arc::new(MemoryStorage::new());
        let request = testutil::request("GET", "/hi/world", &[("host", "a.test")], b"");
        let outcome = run(
            r#"local y = require("yams")
               y.setvar("g", {count = 2})
               y.setvar("s", "session-only", true)
               local g = y.getvar("g")
               y.write(g.count, " ", y.getvar("s", true), " ", tostring(y.getvar("s")))"#,
            Arc::clone(&store) as Arc<dyn Storage>,
            request,
        )
        .await
        .unwrap();
        let ScriptOutcome::Response(response) = outcome else {
            panic!("unexpected pass");
        };
        assert_eq!(
            body_bytes(response).await,
            Bytes::from("2 session-only nil")
        );
        // Session rows are keyed by the sid the dispatcher derived.
        assert_eq!(
            store.get_var(1, Some("sid123"), "s").await.unwrap(),
            Some(json!("session-only"))
        );
    }

    #[tokio::test]
    async fn setvar_nil_deletes() {
        let store = Arc::new(MemoryStorage::new());
        store.set_var(1, None, "k", &json!(1), 60).await.unwrap();
        let request = testutil::request("GET", "/hi/world", &[("host", "a.test")], b"");
        run(
            r#"require("yams").setvar("k", nil)"#,
            Arc::clone(&store) as Arc<dyn Storage>,
            request,
        )
        .await
        .unwrap();
        assert!(store.get_var(1, None, "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn setvar_lifetime_capped_by_profile() {
        let store = Arc::new(MemoryStorage::new());
        let request = testutil::request("GET", "/hi/world", &[("host", "a.test")], b"");
        let err = run(
            r#"require("yams").setvar("k", 1, false, 999999)"#,
            store,
            request,
        )
        .await
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("lifetime must not exceed profile setting [3600]"));
    }

    #[tokio::test]
    async fn setvar_validates_key_length() {
        let store = Arc::new(MemoryStorage::new());
        let request = testutil::request("GET", "/hi/world", &[("host", "a.test")], b"");
        let err = run(r#"require("yams").setvar("   ", 1)"#, store, request)
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("key must be a string of valid length [1:255]"));
    }

    #[tokio::test]
    async fn asset_handle_exposes_meta_and_bytes() {
        let store = Arc::new(MemoryStorage::new());
        store.add_asset(1, "greeting.txt", "text/plain", Bytes::from("hi there"));
        let request = testutil::request("GET", "/hi/world", &[("host", "a.test")], b"");
        let outcome = run(
            r#"local y = require("yams")
               local a = y.asset("greeting.txt")
               y.write(a:getmimetype(), " ", a:getsize(), " ")
               y.write(a)
               y.write(" missing=", tostring(y.asset("nope") == nil))"#,
            store,
            request,
        )
        .await
        .unwrap();
        let ScriptOutcome::Response(response) = outcome else {
            panic!("unexpected pass");
        };
        assert_eq!(
            body_bytes(response).await,
            Bytes::from("text/plain 8 hi there missing=true")
        );
    }

    #[tokio::test]
    async fn asset_template_renders_with_data() {
        let store = Arc::new(MemoryStorage::new());
        store.add_asset(
            1,
            "page.tmpl",
            "text/plain",
            Bytes::from("hello {{.who}}, {{.nums.2}}"),
        );
        let request = testutil::request("GET", "/hi/world", &[("host", "a.test")], b"");
        let outcome = run(
            r#"local y = require("yams")
               y.write(y.asset("page.tmpl"):template({who = "ada", nums = {10, 20}}))"#,
            store,
            request,
        )
        .await
        .unwrap();
        let ScriptOutcome::Response(response) = outcome else {
            panic!("unexpected pass");
        };
        assert_eq!(body_bytes(response).await, Bytes::from("hello ada, 20"));
    }

    #[tokio::test]
    async fn asset_template_rejects_cycles_without_writing() {
        let store = Arc::new(MemoryStorage::new());
        store.add_asset(1, "a.tmpl", "text/plain", Bytes::from("{{.x}}"));
        let request = testutil::request("GET", "/hi/world", &[("host", "a.test")], b"");
        let err = run(
            r#"local y = require("yams")
               local t = {}
               t.x = t
               y.asset("a.tmpl"):template(t)"#,
            store,
            request,
        )
        .await
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("cannot marshal recursively nested tables"));
    }

    #[tokio::test]
    async fn asset_template_rejects_binary_assets() {
        let store = Arc::new(MemoryStorage::new());
        store.add_asset(1, "bin", "application/octet-stream", Bytes::from(vec![0u8, 159, 146]));
        let request = testutil::request("GET", "/hi/world", &[("host", "a.test")], b"");
        let err = run(
            r#"require("yams").asset("bin"):template({})"#,
            store,
            request,
        )
        .await
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("template() function is not available for binary assets"));
    }

    #[tokio::test]
    async fn getbody_caches_and_conflicts_with_parseform() {
        let store = Arc::new(MemoryStorage::new());
        let request = testutil::request("POST", "/hi/world", &[("host", "a.test")], b"payload");
        let outcome = run(
            r#"local y = require("yams")
               y.write(y.getbody(), "/", y.getbody())"#,
            Arc::clone(&store) as Arc<dyn Storage>,
            request,
        )
        .await
        .unwrap();
        let ScriptOutcome::Response(response) = outcome else {
            panic!("unexpected pass");
        };
        assert_eq!(body_bytes(response).await, Bytes::from("payload/payload"));

        let request = testutil::request(
            "POST",
            "/hi/world",
            &[
                ("host", "a.test"),
                ("content-type", "application/x-www-form-urlencoded"),
            ],
            b"a=1",
        );
        let err = run(
            r#"local y = require("yams")
               y.parseform()
               y.getbody()"#,
            store,
            request,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("request body was already parsed"));
    }

    #[tokio::test]
    async fn parseform_caps_maxmem() {
        let store = Arc::new(MemoryStorage::new());
        let request = testutil::request("POST", "/hi/world", &[("host", "a.test")], b"a=1");
        let err = run(
            r#"require("yams").parseform(1024 * 1024 * 1024)"#,
            store,
            request,
        )
        .await
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("maxmemory value must be not higher than 67108864"));
    }

    #[tokio::test]
    async fn dump_takes_over_response_and_suppresses_writes() {
        let store = Arc::new(MemoryStorage::new());
        let request = testutil::request(
            "POST",
            "/hi/world?x=1",
            &[("host", "a.test"), ("x-extra", "v")],
            b"the-body",
        );
        let outcome = run(
            r#"local y = require("yams")
               y.setstatus(503)
               y.write("suppressed")
               y.dump(true)"#,
            store,
            request,
        )
        .await
        .unwrap();
        let ScriptOutcome::Response(response) = outcome else {
            panic!("unexpected pass");
        };
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_bytes(response).await;
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("POST /hi/world?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: a.test\r\n"));
        assert!(text.contains("X-Extra: v\r\n"));
        assert!(text.ends_with("\r\n\r\nthe-body"));
        assert!(!text.contains("suppressed"));
    }

    #[tokio::test]
    async fn pass_hands_off_with_explicit_target() {
        let store = Arc::new(MemoryStorage::new());
        let request = testutil::request("GET", "/hi/world", &[("host", "a.test")], b"");
        let outcome = run(
            r#"local y = require("yams")
               y.setstatus(201)
               y.write("suppressed")
               y.pass("http://127.0.0.1:9999")"#,
            store,
            request,
        )
        .await
        .unwrap();
        match outcome {
            ScriptOutcome::Pass { target, .. } => {
                assert_eq!(target, "http://127.0.0.1:9999");
            }
            ScriptOutcome::Response(_) => panic!("expected pass"),
        }
    }

    #[tokio::test]
    async fn pass_requires_backend_or_target() {
        let store = Arc::new(MemoryStorage::new());
        let request = testutil::request("GET", "/hi/world", &[("host", "a.test")], b"");
        let err = run(r#"require("yams").pass()"#, store, request)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires a target"));
    }

    #[tokio::test]
    async fn cpu_loop_hits_route_deadline() {
        let store: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut r = route("while true do end");
        r.timeout = 1;
        let request = testutil::request("GET", "/hi/world", &[("host", "a.test")], b"");
        let err = execute(&r, &HashMap::new(), &profile(), request, "sid123", store)
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Timeout(1)));
    }

    #[tokio::test]
    async fn script_errors_surface_with_message() {
        let store = Arc::new(MemoryStorage::new());
        let request = testutil::request("GET", "/hi/world", &[("host", "a.test")], b"");
        let err = run(r#"error("boom")"#, store, request).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn json_and_base64_modules_preloaded() {
        let response = run_response(
            r#"local y = require("yams")
               local json = require("json")
               local base64 = require("base64")
               local obj = json.decode('{"a": [1, 2]}')
               y.write(json.encode({sum = obj.a[1] + obj.a[2]}))
               y.write(" ", base64.decode(base64.encode("roundtrip")))"#,
        )
        .await;
        assert_eq!(
            body_bytes(response).await,
            Bytes::from(r#"{"sum":3} roundtrip"#)
        );
    }

    #[tokio::test]
    async fn unknown_adapter_is_rejected() {
        let store: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut r = route("");
        r.adapter = "tcl".to_string();
        let request = testutil::request("GET", "/hi/world", &[("host", "a.test")], b"");
        let err = execute(&r, &HashMap::new(), &profile(), request, "sid", store)
            .await
            .unwrap_err();
        assert!(err.to_string().contains(r#"unknown adapter "tcl""#));
    }

    #[tokio::test]
    async fn cookies_table_parses_request_cookies() {
        let store = Arc::new(MemoryStorage::new());
        let request = testutil::request(
            "GET",
            "/hi/world",
            &[("host", "a.test"), ("cookie", "a=1; b=two")],
            b"",
        );
        let outcome = run(
            r#"local y = require("yams")
               y.write(y.cookies.a, " ", y.cookies.b)"#,
            store,
            request,
        )
        .await
        .unwrap();
        let ScriptOutcome::Response(response) = outcome else {
            panic!("unexpected pass");
        };
        assert_eq!(body_bytes(response).await, Bytes::from("1 two"));
    }
}
