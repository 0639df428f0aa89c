//! Profile and route matching.
//!
//! Route rows arrive pre-ordered by `(position, id)` from the store; the
//! matcher walks them in order and returns the first rule whose method set
//! and path regex accept the request. Captures are paired positionally with
//! the route's `path_args`.

use crate::model::Route;
use crate::pattern;
use std::collections::HashMap;

/// Strip a default port so http and https host headers match symmetrically.
pub fn normalize_host(host: &str) -> &str {
    host.strip_suffix(":80")
        .or_else(|| host.strip_suffix(":443"))
        .unwrap_or(host)
}

/// A matched route together with its captured path arguments.
#[derive(Debug, Clone)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub args: HashMap<String, String>,
}

fn method_matches(route: &Route, method: &str) -> bool {
    route
        .methods
        .iter()
        .any(|m| m == "*" || m.eq_ignore_ascii_case(method))
}

/// Select the first route matching `(method, path)`.
///
/// Disabled routes still match here; the dispatcher treats a disabled match
/// as "no route" rather than falling through to lower-priority rules.
pub fn match_route<'a>(routes: &'a [Route], method: &str, path: &str) -> Option<RouteMatch<'a>> {
    for route in routes {
        if !method_matches(route, method) {
            continue;
        }
        let re = match pattern::cached_regex(&route.path_re) {
            Ok(re) => re,
            // A malformed stored regex never matches; the console validates
            // patterns on write, so this only happens on manual table edits.
            Err(_) => continue,
        };
        if let Some(caps) = re.captures(path) {
            let mut args = HashMap::with_capacity(route.path_args.len());
            for (i, name) in route.path_args.iter().enumerate() {
                if let Some(m) = caps.get(i + 1) {
                    args.insert(name.clone(), m.as_str().to_string());
                }
            }
            return Some(RouteMatch { route, args });
        }
    }
    None
}
