//! Text asset templating.
//!
//! Templates use `{{.path.to.field}}` actions resolved against the
//! marshalled data tree. `{{.}}` renders the root. Missing paths render as
//! `<no value>`; arrays are indexed with 1-based numeric segments.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

pub const ERR_BINARY_ASSET: &str = "template() function is not available for binary assets";

const NO_VALUE: &str = "<no value>";

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("{ERR_BINARY_ASSET}")]
    BinaryAsset,
}

static ACTION_RE: OnceCell<Regex> = OnceCell::new();

fn action_re() -> &'static Regex {
    ACTION_RE.get_or_init(|| {
        Regex::new(r"\{\{\s*\.((?:[A-Za-z0-9_]+)(?:\.[A-Za-z0-9_]+)*)?\s*\}\}").unwrap()
    })
}

/// A string is binary iff any character is neither whitespace nor printable.
pub fn is_binary_string(s: &str) -> bool {
    s.chars().any(|c| !c.is_whitespace() && c.is_control())
}

fn resolve<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(data);
    }
    let mut current = data;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index.checked_sub(1)?)?
            }
            _ => return None,
        };
    }
    Some(current)
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => NO_VALUE.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| NO_VALUE.to_string()),
    }
}

/// Expand a text template with the given data tree.
///
/// The caller is responsible for rejecting binary sources first (see
/// [`is_binary_string`]); rendering itself cannot fail beyond that.
pub fn render(source: &str, data: &Value) -> Result<String, TemplateError> {
    if is_binary_string(source) {
        return Err(TemplateError::BinaryAsset);
    }
    let out = action_re().replace_all(source, |caps: &regex::Captures| {
        let path = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        match resolve(data, path) {
            Some(value) => display(value),
            None => NO_VALUE.to_string(),
        }
    });
    Ok(out.into_owned())
}
