//! Lua value marshalling for template data.
//!
//! Dynamic Lua tables become a tagged tree (`serde_json::Value`): a table
//! with contiguous 1-based integer keys is an array; anything else is an
//! object with stringified keys. When an in-progress array meets a
//! non-contiguous or non-numeric key, the collected prefix is rewritten as
//! an object under keys `"1"`, `"2"`, ... and traversal continues.

use mlua::{Table, Value as LuaValue};
use serde_json::{Map, Number, Value};
use std::ffi::c_void;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum MarshalError {
    #[error("cannot marshal function")]
    Function,
    #[error("cannot marshal thread")]
    Thread,
    #[error("cannot marshal userdata")]
    UserData,
    #[error("cannot marshal number")]
    Number,
    #[error("cannot marshal recursively nested tables")]
    Nested,
}

/// Marshal an arbitrary Lua value.
///
/// Tables visited twice along the current path are a failure; sharing a
/// subtree across sibling branches is allowed.
pub fn lua_to_value(value: &LuaValue) -> Result<Value, MarshalError> {
    let mut path = Vec::new();
    marshal(value, &mut path)
}

fn key_to_string(key: &LuaValue) -> String {
    match key {
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => format_number(*n),
        LuaValue::String(s) => s.to_string_lossy().to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        other => format!("{}: {:p}", other.type_name(), other.to_pointer()),
    }
}

pub(crate) fn format_number(n: f64) -> String {
    if n == n.trunc() && n.is_finite() {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn marshal(value: &LuaValue, path: &mut Vec<*const c_void>) -> Result<Value, MarshalError> {
    match value {
        LuaValue::Nil => Ok(Value::Null),
        LuaValue::Boolean(b) => Ok(Value::Bool(*b)),
        LuaValue::Integer(i) => Ok(Value::Number((*i).into())),
        LuaValue::Number(n) => Number::from_f64(*n)
            .map(Value::Number)
            .ok_or(MarshalError::Number),
        LuaValue::String(s) => Ok(Value::String(s.to_string_lossy().to_string())),
        LuaValue::Table(t) => marshal_table(t, path),
        LuaValue::Function(_) => Err(MarshalError::Function),
        LuaValue::Thread(_) => Err(MarshalError::Thread),
        _ => Err(MarshalError::UserData),
    }
}

fn marshal_table(table: &Table, path: &mut Vec<*const c_void>) -> Result<Value, MarshalError> {
    let ptr = table.to_pointer();
    if path.contains(&ptr) {
        return Err(MarshalError::Nested);
    }
    path.push(ptr);
    let result = marshal_table_inner(table, path);
    path.pop();
    result
}

fn marshal_table_inner(table: &Table, path: &mut Vec<*const c_void>) -> Result<Value, MarshalError> {
    let mut arr: Vec<Value> = Vec::new();
    let mut obj: Option<Map<String, Value>> = None;

    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
        let (key, value) = pair.map_err(|_| MarshalError::UserData)?;
        let marshalled = marshal(&value, path)?;

        if obj.is_none() {
            if let LuaValue::Integer(i) = key {
                let index = i - 1;
                if index == arr.len() as i64 {
                    arr.push(marshalled);
                    continue;
                }
                // Out-of-order numeric key; demote the array to an object.
                let mut map = demote(&mut arr);
                map.insert(i.to_string(), marshalled);
                obj = Some(map);
                continue;
            }
            obj = Some(demote(&mut arr));
        }

        obj.as_mut()
            .expect("object initialised above")
            .insert(key_to_string(&key), marshalled);
    }

    match obj {
        Some(map) => Ok(Value::Object(map)),
        None => Ok(Value::Array(arr)),
    }
}

fn demote(arr: &mut Vec<Value>) -> Map<String, Value> {
    let mut map = Map::new();
    for (i, value) in arr.drain(..).enumerate() {
        map.insert((i + 1).to_string(), value);
    }
    map
}
