//! Response body helpers shared by the dispatcher, the reverse proxy and
//! the script runtime. Everything downstream speaks `BoxBody` so buffered
//! and streamed bodies mix freely.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::{Response, StatusCode};
use std::convert::Infallible;

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

pub fn full(bytes: impl Into<Bytes>) -> ResponseBody {
    BoxBody::new(Full::new(bytes.into()).map_err(|never: Infallible| match never {}))
}

pub fn empty() -> ResponseBody {
    BoxBody::new(Empty::new().map_err(|never: Infallible| match never {}))
}

/// Build an HTTP response with the given status and body.
///
/// This function handles the unlikely case where Response::builder() fails
/// by returning a minimal error response.
pub fn build_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .body(full(body.into()))
        .unwrap_or_else(|_| {
            // This should never happen with valid StatusCode, but handle gracefully
            Response::new(full("Internal Server Error"))
        })
}
