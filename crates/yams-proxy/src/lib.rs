//! YAMS: a programmable HTTP interception proxy.
//!
//! Requests are matched to a profile by Host header and to a route by
//! method and path; the route's Lua script synthesises the response or
//! hands off to the profile backend through the reverse proxy.

pub mod body;
pub mod config;
pub mod matcher;
pub mod model;
pub mod pattern;
pub mod proxy;
pub mod scripting;
pub mod session;
pub mod store;
pub mod template;
