//! Fatal error rendering.
//!
//! Two modes: a bare `status reason` text response when the matched route's
//! profile has debug disabled, and an HTML page (status, message, route
//! metadata, and the panic source location in global debug mode) otherwise.

use crate::body::{build_response, ResponseBody};
use crate::session::{HEADER_STATUS, STATUS_ERROR};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use std::cell::RefCell;

/// Route metadata carried onto the debug error page.
#[derive(Debug, Clone)]
pub struct RouteErrorInfo {
    pub rows: Vec<(String, String)>,
    pub profile_debug: bool,
}

#[derive(Debug)]
pub struct ErrorContext {
    pub status: StatusCode,
    pub message: String,
    pub route: Option<RouteErrorInfo>,
    /// `file:line` of a captured panic, shown in global debug mode.
    pub location: Option<String>,
}

impl ErrorContext {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            route: None,
            location: None,
        }
    }

    pub fn with_route(mut self, info: RouteErrorInfo) -> Self {
        self.route = Some(info);
        self
    }
}

thread_local! {
    static LAST_PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Record panic locations so the dispatcher's unwind handler can surface
/// them on the debug page. Chains onto any previously installed hook.
pub fn install_panic_capture() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()));
        LAST_PANIC_LOCATION.with(|slot| *slot.borrow_mut() = location);
        previous(info);
    }));
}

/// Take the location recorded by the most recent panic on this thread.
pub fn take_panic_location() -> Option<String> {
    LAST_PANIC_LOCATION.with(|slot| slot.borrow_mut().take())
}

pub fn render(ctx: ErrorContext, global_debug: bool) -> Response<ResponseBody> {
    let reason = ctx.status.canonical_reason().unwrap_or("Unknown");

    if let Some(route) = &ctx.route {
        if !route.profile_debug {
            let mut response =
                build_response(ctx.status, format!("{} {}\n", ctx.status.as_u16(), reason));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            return response;
        }
    }

    let mut rows = String::new();
    if let Some(route) = &ctx.route {
        for (name, value) in &route.rows {
            rows.push_str(&format!(
                "<tr><th>{}</th><td>{}</td></tr>\n",
                escape(name),
                escape(value)
            ));
        }
    }
    let location = if global_debug {
        ctx.location
            .as_deref()
            .map(|l| format!("<p class=\"loc\">{}</p>\n", escape(l)))
            .unwrap_or_default()
    } else {
        String::new()
    };

    let html = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{status} {reason}</title></head>\n<body>\n\
         <h1>{status} {reason}</h1>\n\
         <pre>{message}</pre>\n\
         <table>\n{rows}</table>\n\
         {location}\
         </body>\n</html>\n",
        status = ctx.status.as_u16(),
        reason = escape(reason),
        message = escape(&ctx.message),
    );

    let mut response = build_response(ctx.status, html);
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers.insert(HEADER_STATUS, HeaderValue::from_static(STATUS_ERROR));
    response
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
