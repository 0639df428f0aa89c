//! Path pattern compilation.
//!
//! Patterns are literal segments interleaved with `:name` captures, where a
//! capture consumes exactly one path segment. The console stores the derived
//! regex and the ordered capture names alongside the route; the matcher
//! compiles the stored regex on demand and caches it by source text.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PatternError {
    #[error("path pattern must start with '/'")]
    NoLeadingSlash,
    #[error("path pattern must not exceed 255 characters")]
    TooLong,
    #[error("invalid capture name {0:?}")]
    BadCaptureName(String),
    #[error("invalid pattern regex: {0}")]
    BadRegex(String),
}

/// A pattern compiled to its regex and ordered capture names.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub regex: Regex,
    pub args: Vec<String>,
}

fn is_valid_capture_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Derive `(path_re, path_args)` from a route pattern.
///
/// The result is deterministic: the same pattern always yields the same
/// regex text, so stored and recompiled forms agree.
pub fn compile(pattern: &str) -> Result<CompiledPattern, PatternError> {
    if !pattern.starts_with('/') {
        return Err(PatternError::NoLeadingSlash);
    }
    if pattern.len() > 255 {
        return Err(PatternError::TooLong);
    }

    let mut args = Vec::new();
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for segment in pattern.split('/').skip(1) {
        re.push('/');
        if let Some(name) = segment.strip_prefix(':') {
            if !is_valid_capture_name(name) {
                return Err(PatternError::BadCaptureName(name.to_string()));
            }
            re.push_str(&format!("(?P<{name}>[^/]+)"));
            args.push(name.to_string());
        } else {
            re.push_str(&regex::escape(segment));
        }
    }
    re.push('$');

    let regex = Regex::new(&re).map_err(|e| PatternError::BadRegex(e.to_string()))?;
    Ok(CompiledPattern { regex, args })
}

static REGEX_CACHE: Lazy<RwLock<HashMap<String, Arc<Regex>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Compile a stored `path_re`, memoising by source text.
///
/// Route rows are re-read from the store on every request; only the regex
/// compilation is cached, keyed by the regex source, so edits to a route's
/// pattern take effect immediately.
pub fn cached_regex(path_re: &str) -> Result<Arc<Regex>, PatternError> {
    if let Some(re) = REGEX_CACHE.read().get(path_re) {
        return Ok(Arc::clone(re));
    }
    let compiled =
        Arc::new(Regex::new(path_re).map_err(|e| PatternError::BadRegex(e.to_string()))?);
    REGEX_CACHE
        .write()
        .insert(path_re.to_string(), Arc::clone(&compiled));
    Ok(compiled)
}
