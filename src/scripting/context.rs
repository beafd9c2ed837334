/// `scripting/context.rs` — values passed into and out of script runs
///
/// A `Context` is the ordered set of named values a script sees as globals.
/// `Clone` is the deep copy the engine takes before every run: data variants
/// are copied structurally, while `ContentManager` and `Function` are shared
/// handles.
use std::fmt;

use indexmap::IndexMap;

use super::proxy::Proxy;
use crate::content::{ContentManagerHandle, ContentResult, ContentWrite};

/// Key under which the engine binds the content manager during a run.
pub const CONTENT_MANAGER_KEY: &str = "contentManager";

/// A value that can be stored in a `Context`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
    ContentWrite(ContentWrite),
    ContentResult(ContentResult),
    Context(Context),
    Proxy(Box<Proxy>),
    ContentManager(ContentManagerHandle),
    Function(ScriptFunction),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::ContentWrite(_) => "content write",
            Value::ContentResult(_) => "content result",
            Value::Context(_) => "context",
            Value::Proxy(_) => "proxy",
            Value::ContentManager(_) => "content manager",
            Value::Function(_) => "function",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integers, and floats with no fractional part that fit in an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        // 2^63 is exactly representable; i64::MAX is not.
        const LIMIT: f64 = 9_223_372_036_854_775_808.0;
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) if n.fract() == 0.0 && *n >= -LIMIT && *n < LIMIT => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_content_write(&self) -> Option<&ContentWrite> {
        match self.unwrap_proxy() {
            Value::ContentWrite(write) => Some(write),
            _ => None,
        }
    }

    pub fn as_context(&self) -> Option<&Context> {
        match self.unwrap_proxy() {
            Value::Context(context) => Some(context),
            _ => None,
        }
    }

    /// The wrapped value when `self` is a proxy, otherwise `self`.
    pub fn unwrap_proxy(&self) -> &Value {
        match self {
            Value::Proxy(proxy) => proxy.base(),
            other => other,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(map: IndexMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<ContentWrite> for Value {
    fn from(write: ContentWrite) -> Self {
        Value::ContentWrite(write)
    }
}

impl From<ContentResult> for Value {
    fn from(result: ContentResult) -> Self {
        Value::ContentResult(result)
    }
}

impl From<Context> for Value {
    fn from(context: Context) -> Self {
        Value::Context(context)
    }
}

impl From<Proxy> for Value {
    fn from(proxy: Proxy) -> Self {
        Value::Proxy(Box::new(proxy))
    }
}

impl From<ContentManagerHandle> for Value {
    fn from(handle: ContentManagerHandle) -> Self {
        Value::ContentManager(handle)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// Opaque handle to a function defined by a script.
///
/// Cloning shares the function. Handles are only meaningful to the engine
/// that produced them.
#[derive(Clone)]
pub struct ScriptFunction(pub(crate) mlua::Function);

impl PartialEq for ScriptFunction {
    fn eq(&self, other: &Self) -> bool {
        mlua::Value::Function(self.0.clone()).to_pointer()
            == mlua::Value::Function(other.0.clone()).to_pointer()
    }
}

impl fmt::Debug for ScriptFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ScriptFunction(..)")
    }
}

// ── Context ───────────────────────────────────────────────────────────────────

/// Insertion-ordered mapping of names to values shared with a script run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Context {
    entries: IndexMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect()
    }

    /// Reads `key`, returning the wrapped value when a proxy is stored there.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(Value::unwrap_proxy)
    }

    /// Reads `key` as stored.
    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, Value> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A structurally independent copy. Content manager and function handles
    /// are shared with the original.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }
}

impl FromIterator<(String, Value)> for Context {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Context {
    type Item = (&'a String, &'a Value);
    type IntoIter = indexmap::map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl From<IndexMap<String, Value>> for Context {
    fn from(entries: IndexMap<String, Value>) -> Self {
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{memory::InMemoryContentManager, ContentData};
    use serde_json::json;

    fn article() -> ContentWrite {
        ContentWrite::new(ContentData::new("atex.onecms.article", json!({ "headline": "New Article" })))
    }

    #[test]
    fn get_unwraps_proxies_and_get_raw_does_not() {
        let mut ctx = Context::new();
        ctx.insert("content", Proxy::content_write(article(), true));
        assert_eq!(ctx.get("content"), Some(&Value::ContentWrite(article())));
        assert!(matches!(ctx.get_raw("content"), Some(Value::Proxy(_))));
        assert_eq!(ctx.get("missing"), None);
    }

    #[test]
    fn keeps_insertion_order() {
        let mut ctx = Context::from_pairs([("b", 1), ("a", 2), ("c", 3)]);
        ctx.remove("a");
        ctx.insert("d", 4);
        let keys: Vec<&str> = ctx.keys().map(String::as_str).collect();
        assert_eq!(keys, ["b", "c", "d"]);
        assert_eq!(ctx.len(), 3);
    }

    #[test]
    fn deep_copy_is_independent_but_shares_handles() {
        let handle = ContentManagerHandle::new(InMemoryContentManager::new());
        let mut original = Context::new();
        original.insert("content", article());
        original.insert("cm", handle.clone());

        let mut copy = original.deep_copy();
        if let Some(Value::ContentWrite(write)) = copy.get_raw("content").cloned().as_mut() {
            write.content.data = json!({ "headline": "Changed" });
            copy.insert("content", write.clone());
        }
        assert_eq!(original.get("content"), Some(&Value::ContentWrite(article())));

        match (original.get("cm"), copy.get("cm")) {
            (Some(Value::ContentManager(a)), Some(Value::ContentManager(b))) => assert!(a.ptr_eq(b)),
            other => panic!("expected shared handles, got {other:?}"),
        }
    }

    #[test]
    fn json_numbers_keep_integers_integral() {
        assert_eq!(Value::from(json!(3)), Value::Integer(3));
        assert_eq!(Value::from(json!(2.5)), Value::Number(2.5));
        let map = Value::from(json!({ "a": [true, null] }));
        assert_eq!(
            map.as_map().and_then(|m| m.get("a")),
            Some(&Value::List(vec![Value::Bool(true), Value::Nil]))
        );
    }

    #[test]
    fn as_i64_rejects_floats_outside_the_range() {
        assert_eq!(Value::Number(42.0).as_i64(), Some(42));
        assert_eq!(Value::Number(-9_223_372_036_854_775_808.0).as_i64(), Some(i64::MIN));
        assert_eq!(Value::Number(9_223_372_036_854_775_808.0).as_i64(), None);
        assert_eq!(Value::Number(1e300).as_i64(), None);
        assert_eq!(Value::Number(f64::NAN).as_i64(), None);
        assert_eq!(Value::Number(1.5).as_i64(), None);
    }
}
