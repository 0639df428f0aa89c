//! Persistent records consumed by the dispatcher.
//!
//! The admin console owns the write side of these tables; the proxy only
//! ever reads them (and writes `storage` rows through the variable API).

use serde::{Deserialize, Serialize};

/// Upper bound on user-supplied asset paths.
pub const MAX_ASSET_PATH_LEN: usize = 72;

/// Upper bound on a route script body.
pub const MAX_SCRIPT_SIZE: usize = 1 << 20;

/// Script preinstalled on newly created routes by the console.
pub const DEFAULT_SCRIPT: &str = r#"local yams = require("yams")

yams.write("YAMS Route: " .. yams.routeid)"#;

/// Host-scoped configuration container.
///
/// Hostnames are globally unique, so a request host resolves to at most one
/// profile. `vars_lifetime` caps the TTL any script may grant a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: i32,
    pub backend: Option<String>,
    pub is_debug: bool,
    pub vars_lifetime: i64,
}

/// A (methods, path-pattern) -> (adapter, script) rule owned by a profile.
///
/// Within one profile the `(position, id)` order is total and matching
/// prefers the lowest position. `timeout == 0` is the hijack sentinel: the
/// dispatcher takes over the connection and closes it without a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: i32,
    pub uuid: String,
    pub profile_id: i32,
    pub position: i32,
    /// HTTP method set; the literal `*` wildcards all methods.
    pub methods: Vec<String>,
    pub path: String,
    /// Regex derived from `path` by the console, anchored, one group per arg.
    pub path_re: String,
    /// Capture names in group order.
    pub path_args: Vec<String>,
    pub adapter: String,
    pub script: String,
    /// Seconds; 0 means hijack-and-close.
    pub timeout: i64,
    pub hint: Option<String>,
    pub is_enabled: bool,
}

impl Route {
    /// Metadata rows shown on the debug error page.
    pub fn debug_info(&self, method: &str) -> Vec<(String, String)> {
        vec![
            ("ID".to_string(), self.uuid.clone()),
            ("Request".to_string(), format!("{} {}", method, self.path)),
            ("Timeout".to_string(), self.timeout.to_string()),
        ]
    }
}

/// Asset descriptor without the payload; bytes are fetched separately so
/// handles stay cheap until a write or template call needs the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMeta {
    pub id: i32,
    pub profile_id: i32,
    pub path: String,
    pub mime_type: String,
    pub size: i64,
}

/// Built-in adapter tag.
pub const ADAPTER_LUA: &str = "lua";

/// Script content type -> adapter tag, as validated by the console.
pub fn adapter_for_content_type(content_type: &str) -> Option<&'static str> {
    match content_type {
        "application/x-lua" => Some(ADAPTER_LUA),
        _ => None,
    }
}
