//! Property tests for route selection, path capture and template
//! marshalling.

use mlua::{Lua, Value as LuaValue};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use yams_proxy::matcher;
use yams_proxy::model::{Route, ADAPTER_LUA};
use yams_proxy::pattern;
use yams_proxy::scripting::marshal;

fn make_route(id: i32, position: i32, path: &str) -> Route {
    let compiled = pattern::compile(path).unwrap();
    Route {
        id,
        uuid: format!("00000000-0000-4000-8000-{id:012}"),
        profile_id: 1,
        position,
        methods: vec!["GET".to_string()],
        path: path.to_string(),
        path_re: compiled.regex.as_str().to_string(),
        path_args: compiled.args,
        adapter: ADAPTER_LUA.to_string(),
        script: String::new(),
        timeout: 30,
        hint: None,
        is_enabled: true,
    }
}

proptest! {
    /// Among identical rules the lowest `(position, id)` pair always wins.
    #[test]
    fn route_ordering_prefers_lowest_position_then_id(
        positions in prop::collection::vec(0i32..6, 1..12)
    ) {
        let mut routes: Vec<Route> = positions
            .iter()
            .enumerate()
            .map(|(id, position)| make_route(id as i32, *position, "/x"))
            .collect();
        // The store hands the matcher rows ordered by (position, id).
        routes.sort_by_key(|r| (r.position, r.id));

        let expected = routes
            .iter()
            .map(|r| (r.position, r.id))
            .min()
            .unwrap();
        let matched = matcher::match_route(&routes, "GET", "/x").unwrap();
        prop_assert_eq!((matched.route.position, matched.route.id), expected);
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Capture { name: String, value: String },
}

fn segment_strategy() -> impl Strategy<Value = Segment> {
    prop_oneof![
        "[a-z0-9]{1,8}".prop_map(Segment::Literal),
        ("[a-z][a-z0-9_]{0,6}", "[A-Za-z0-9]{1,8}")
            .prop_map(|(name, value)| Segment::Capture { name, value }),
    ]
}

proptest! {
    /// For every pattern and accepted path, the capture map carries exactly
    /// the pattern's argument names with the path's segment values.
    #[test]
    fn path_capture_yields_exactly_the_pattern_args(
        segments in prop::collection::vec(segment_strategy(), 1..6)
    ) {
        // Capture names must be unique within one pattern.
        let segments: Vec<Segment> = segments
            .into_iter()
            .enumerate()
            .map(|(i, segment)| match segment {
                Segment::Capture { name, value } => Segment::Capture {
                    name: format!("{name}_{i}"),
                    value,
                },
                literal => literal,
            })
            .collect();

        let mut pattern_text = String::new();
        let mut path = String::new();
        let mut expected: HashMap<String, String> = HashMap::new();
        for segment in &segments {
            match segment {
                Segment::Literal(text) => {
                    pattern_text.push('/');
                    pattern_text.push_str(text);
                    path.push('/');
                    path.push_str(text);
                }
                Segment::Capture { name, value } => {
                    pattern_text.push_str("/:");
                    pattern_text.push_str(name);
                    path.push('/');
                    path.push_str(value);
                    expected.insert(name.clone(), value.clone());
                }
            }
        }

        let compiled = pattern::compile(&pattern_text).unwrap();
        prop_assert_eq!(compiled.args.len(), expected.len());

        let route = {
            let mut route = make_route(1, 0, "/placeholder");
            route.path = pattern_text.clone();
            route.path_re = compiled.regex.as_str().to_string();
            route.path_args = compiled.args.clone();
            route
        };
        let routes = vec![route];
        let matched = matcher::match_route(&routes, "GET", &path).unwrap();
        prop_assert_eq!(matched.args.len(), compiled.args.len());
        prop_assert_eq!(&matched.args, &expected);
    }
}

/// JSON-shaped trees that survive the Lua detour: no nulls (nil table
/// entries vanish), objects non-empty (an empty table reads as an array).
fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        (-1_000_000i64..1_000_000).prop_map(|n| json!(n)),
        "[a-z ]{0,10}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 5, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..5).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 1..5)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

fn build_lua_value(lua: &Lua, value: &Value) -> LuaValue {
    match value {
        Value::Null => LuaValue::Nil,
        Value::Bool(b) => LuaValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                LuaValue::Integer(i)
            } else {
                LuaValue::Number(n.as_f64().unwrap())
            }
        }
        Value::String(s) => LuaValue::String(lua.create_string(s).unwrap()),
        Value::Array(items) => {
            let table = lua.create_table().unwrap();
            for (i, item) in items.iter().enumerate() {
                table.set(i + 1, build_lua_value(lua, item)).unwrap();
            }
            LuaValue::Table(table)
        }
        Value::Object(map) => {
            let table = lua.create_table().unwrap();
            for (k, v) in map {
                table.set(k.as_str(), build_lua_value(lua, v)).unwrap();
            }
            LuaValue::Table(table)
        }
    }
}

proptest! {
    /// Marshalling a cycle-free tree of scalars and tables is lossless and
    /// deterministic.
    #[test]
    fn marshal_round_trips_cycle_free_trees(tree in value_strategy()) {
        let lua = Lua::new();
        let lua_value = build_lua_value(&lua, &tree);
        let first = marshal::lua_to_value(&lua_value).unwrap();
        let second = marshal::lua_to_value(&lua_value).unwrap();
        prop_assert_eq!(&first, &tree);
        prop_assert_eq!(&first, &second);
    }
}
